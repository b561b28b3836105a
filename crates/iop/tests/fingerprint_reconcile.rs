//! Fingerprint laws and the reconciler decision table, end to end:
//! parse a config, hash it, compare against container labels as docker
//! would report them.

use iop::config::{ProjectConfig, parse_secrets};
use iop::deploy::reconcile::{Decision, DeployReason, decide};
use iop::docker::ContainerDetails;
use iop::fingerprint::{self, Fingerprint};

fn project(env_plain: &str, ports: &str, volumes: &str) -> ProjectConfig {
    let yaml = format!(
        r#"
name: demo
apps:
  web:
    server: s1
    build: {{ context: . }}
    proxy: {{ app_port: 3000, hosts: [demo.example] }}
    environment:
      plain: {env_plain}
      secrets: [DATABASE_URL, API_KEY]
    ports: {ports}
    volumes: {volumes}
"#
    );
    ProjectConfig::parse(&yaml, "test").unwrap()
}

#[test]
fn fingerprint_is_stable_under_any_list_reordering() {
    let a = project(
        "[A=1, B=2]",
        "[\"8080:80\", \"9090:90\"]",
        "[./a:/a, ./b:/b]",
    );
    let b = project(
        "[B=2, A=1]",
        "[\"9090:90\", \"8080:80\"]",
        "[./b:/b, ./a:/a]",
    );
    assert_eq!(
        fingerprint::config_hash(&a.services["web"]),
        fingerprint::config_hash(&b.services["web"])
    );

    let secrets = parse_secrets("DATABASE_URL=x\nAPI_KEY=y\n").unwrap();
    assert_eq!(
        fingerprint::secrets_hash(&a.services["web"], &secrets),
        fingerprint::secrets_hash(&b.services["web"], &secrets)
    );
}

#[test]
fn fingerprint_tracks_every_config_dimension() {
    let base = project("[A=1]", "[]", "[]");
    let base_hash = fingerprint::config_hash(&base.services["web"]);

    let env_changed = project("[A=2]", "[]", "[]");
    assert_ne!(
        fingerprint::config_hash(&env_changed.services["web"]),
        base_hash
    );

    let ports_changed = project("[A=1]", "[\"8080:80\"]", "[]");
    assert_ne!(
        fingerprint::config_hash(&ports_changed.services["web"]),
        base_hash
    );

    let volumes_changed = project("[A=1]", "[]", "[./x:/x]");
    assert_ne!(
        fingerprint::config_hash(&volumes_changed.services["web"]),
        base_hash
    );
}

fn deployed_container(desired: &Fingerprint) -> ContainerDetails {
    // Labels exactly as the blue-green engine would have written them
    // for this fingerprint.
    let labels = desired
        .labels()
        .into_iter()
        .map(|(k, v)| format!("\"{k}\": \"{v}\""))
        .collect::<Vec<_>>()
        .join(", ");
    serde_json::from_str(&format!(
        r#"{{
            "Id": "abc",
            "Name": "/demo-web-blue-1",
            "State": {{"Running": true, "Status": "running"}},
            "Config": {{"Image": "demo-web:r1", "Labels": {{{labels}}}}}
        }}"#
    ))
    .unwrap()
}

#[test]
fn second_run_with_no_changes_skips() {
    let config = project("[A=1]", "[]", "[]");
    let secrets = parse_secrets("DATABASE_URL=x\nAPI_KEY=y\n").unwrap();
    let service = &config.services["web"];

    let desired = Fingerprint::Built {
        config_hash: fingerprint::config_hash(service),
        secrets_hash: fingerprint::secrets_hash(service, &secrets),
        local_image_hash: "sha256:unchanged".to_string(),
        server_image_hash: None,
    };

    // First run: nothing on the server.
    assert_eq!(
        decide(&desired, None),
        Decision::Deploy(DeployReason::Initial)
    );

    // Second run: the container the first run created is found.
    let current = deployed_container(&desired);
    assert_eq!(decide(&desired, Some(&current)), Decision::Skip);
}

#[test]
fn secret_rotation_forces_a_redeploy() {
    let config = project("[A=1]", "[]", "[]");
    let service = &config.services["web"];

    let old_secrets = parse_secrets("DATABASE_URL=old\nAPI_KEY=y\n").unwrap();
    let deployed = Fingerprint::Built {
        config_hash: fingerprint::config_hash(service),
        secrets_hash: fingerprint::secrets_hash(service, &old_secrets),
        local_image_hash: "sha256:same".to_string(),
        server_image_hash: None,
    };
    let current = deployed_container(&deployed);

    let new_secrets = parse_secrets("DATABASE_URL=new\nAPI_KEY=y\n").unwrap();
    let desired = Fingerprint::Built {
        config_hash: fingerprint::config_hash(service),
        secrets_hash: fingerprint::secrets_hash(service, &new_secrets),
        local_image_hash: "sha256:same".to_string(),
        server_image_hash: None,
    };

    assert_eq!(
        decide(&desired, Some(&current)),
        Decision::Deploy(DeployReason::SecretsChanged)
    );
}

#[test]
fn rebuilt_image_forces_a_redeploy_but_config_wins_first() {
    let config = project("[A=1]", "[]", "[]");
    let secrets = parse_secrets("DATABASE_URL=x\nAPI_KEY=y\n").unwrap();
    let service = &config.services["web"];

    let deployed = Fingerprint::Built {
        config_hash: fingerprint::config_hash(service),
        secrets_hash: fingerprint::secrets_hash(service, &secrets),
        local_image_hash: "sha256:v1".to_string(),
        server_image_hash: None,
    };
    let current = deployed_container(&deployed);

    let rebuilt = Fingerprint::Built {
        config_hash: fingerprint::config_hash(service),
        secrets_hash: fingerprint::secrets_hash(service, &secrets),
        local_image_hash: "sha256:v2".to_string(),
        server_image_hash: None,
    };
    assert_eq!(
        decide(&rebuilt, Some(&current)),
        Decision::Deploy(DeployReason::ImageChanged)
    );

    let reconfigured = project("[A=changed]", "[]", "[]");
    let desired = Fingerprint::Built {
        config_hash: fingerprint::config_hash(&reconfigured.services["web"]),
        secrets_hash: fingerprint::secrets_hash(service, &secrets),
        local_image_hash: "sha256:v2".to_string(),
        server_image_hash: None,
    };
    assert_eq!(
        decide(&desired, Some(&current)),
        Decision::Deploy(DeployReason::ConfigChanged)
    );
}
