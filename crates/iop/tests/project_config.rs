//! Project file parsing against realistic configurations.

use iop::config::{ImageSource, ProjectConfig, parse_secrets};

const FULL: &str = r#"
name: demo
ssh:
  username: deploy
  port: 2222
  key_file: ~/.ssh/id_ed25519
docker:
  registry: ghcr.io
  username: octocat
proxy:
  image: elitan/iop-proxy:v2
apps:
  web:
    server: s1.example
    build:
      context: .
      dockerfile: Dockerfile.web
      args:
        RUBY_VERSION: "3.3"
    proxy:
      hosts:
        - demo.example
        - www.demo.example
      app_port: 3000
      health_path: /healthz
      ssl: true
    replicas: 2
    environment:
      plain:
        - RAILS_ENV=production
      secrets:
        - DATABASE_URL
  worker:
    server: s2.example
    build:
      context: .
    environment:
      secrets:
        - DATABASE_URL
services:
  db:
    server: s1.example
    image: postgres:17
    volumes:
      - ./postgres:/var/lib/postgresql/data
    ports:
      - "127.0.0.1:5432:5432"
    environment:
      secrets:
        - POSTGRES_PASSWORD
"#;

#[test]
fn full_configuration_parses() {
    let config = ProjectConfig::parse(FULL, "test").unwrap();
    assert_eq!(config.name, "demo");
    assert_eq!(config.ssh.username, "deploy");
    assert_eq!(config.ssh.port, 2222);
    assert_eq!(config.proxy_image, "elitan/iop-proxy:v2");
    assert_eq!(config.docker.as_ref().unwrap().registry, "ghcr.io");
    assert_eq!(config.services.len(), 3);

    let web = &config.services["web"];
    assert_eq!(web.replicas, 2);
    let ingress = web.ingress().expect("web has an ingress");
    assert_eq!(ingress.hosts, vec!["demo.example", "www.demo.example"]);
    assert_eq!(ingress.health_path, "/healthz");

    // An app without a proxy block deploys stop-start like a service.
    let worker = &config.services["worker"];
    assert!(worker.ingress().is_none());

    let db = &config.services["db"];
    assert!(matches!(db.source, ImageSource::Image(ref i) if i == "postgres:17"));
    assert_eq!(db.ports, vec!["127.0.0.1:5432:5432"]);
}

#[test]
fn servers_are_deduplicated_across_services() {
    let config = ProjectConfig::parse(FULL, "test").unwrap();
    let services: Vec<_> = config.services.values().collect();
    let servers = config.servers(&services);
    assert_eq!(servers, vec!["s1.example", "s2.example"]);
}

#[test]
fn secrets_check_covers_registry_password() {
    let config = ProjectConfig::parse(FULL, "test").unwrap();

    let complete = parse_secrets(
        "DATABASE_URL=postgres://x\nPOSTGRES_PASSWORD=pw\nDOCKER_REGISTRY_PASSWORD=tok\n",
    )
    .unwrap();
    config.check_secrets(&complete).unwrap();

    // The registry password is required because an external image is
    // in play.
    let missing_registry =
        parse_secrets("DATABASE_URL=postgres://x\nPOSTGRES_PASSWORD=pw\n").unwrap();
    let err = config.check_secrets(&missing_registry).unwrap_err();
    assert!(err.to_string().contains("DOCKER_REGISTRY_PASSWORD"));
}

#[test]
fn scenario_style_minimal_config() {
    // The section name is convention; the proxy block alone decides
    // that `web` takes the blue-green path.
    let yaml = r#"
name: demo
services:
  web:
    build: { context: . }
    server: s1
    proxy: { app_port: 3000, hosts: [demo.example] }
"#;
    let config = ProjectConfig::parse(yaml, "test").unwrap();
    let web = &config.services["web"];
    assert_eq!(web.ingress().unwrap().app_port, 3000);
    assert_eq!(web.ingress().unwrap().health_path, "/up");
    assert!(web.ingress().unwrap().ssl);
}

#[test]
fn hosts_are_lowercased_at_parse_time() {
    let yaml = r#"
name: demo
apps:
  web:
    build: { context: . }
    server: s1
    proxy: { app_port: 3000, hosts: [Demo.Example] }
"#;
    let config = ProjectConfig::parse(yaml, "test").unwrap();
    assert_eq!(
        config.services["web"].ingress().unwrap().hosts,
        vec!["demo.example"]
    );
}
