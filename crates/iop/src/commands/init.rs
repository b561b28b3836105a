//! The `iop init` scaffold.
//!
//! Writes a commented starter project file and an empty secrets file.
//! Existing files are never overwritten.

use std::path::Path;

use anyhow::{Context, Result};

use crate::config::{DEFAULT_CONFIG_FILE, SECRETS_FILE};

const CONFIG_TEMPLATE: &str = r#"# iop project configuration
name: my-project

ssh:
  username: iop
  # port: 22
  # key_file: ~/.ssh/id_ed25519

apps:
  web:
    server: your.server.example
    build:
      context: .
    proxy:
      hosts:
        - app.example.com
      app_port: 3000
      # health_path: /up
      # ssl: true
    # replicas: 1
    # environment:
    #   plain:
    #     - NODE_ENV=production
    #   secrets:
    #     - DATABASE_URL

# services:
#   db:
#     server: your.server.example
#     image: postgres:17
#     volumes:
#       - ./postgres:/var/lib/postgresql/data
#     environment:
#       secrets:
#         - POSTGRES_PASSWORD
"#;

const SECRETS_TEMPLATE: &str = "# KEY=VALUE, one per line. Never commit this file.\n";

pub fn run(dir: &Path) -> Result<()> {
    let config_path = dir.join(DEFAULT_CONFIG_FILE);
    if config_path.exists() {
        println!("{} already exists, leaving it alone", config_path.display());
    } else {
        std::fs::write(&config_path, CONFIG_TEMPLATE)
            .with_context(|| format!("writing {}", config_path.display()))?;
        println!("created {}", config_path.display());
    }

    let secrets_file = dir.join(SECRETS_FILE);
    if secrets_file.exists() {
        println!("{} already exists, leaving it alone", secrets_file.display());
    } else {
        if let Some(parent) = secrets_file.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        std::fs::write(&secrets_file, SECRETS_TEMPLATE)
            .with_context(|| format!("writing {}", secrets_file.display()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&secrets_file, std::fs::Permissions::from_mode(0o600))
                .with_context(|| format!("restricting {}", secrets_file.display()))?;
        }
        println!("created {}", secrets_file.display());
    }

    println!("\nedit {} and run `iop deploy`", DEFAULT_CONFIG_FILE);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProjectConfig;

    #[test]
    fn scaffold_creates_both_files_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        run(dir.path()).unwrap();
        assert!(dir.path().join("iop.yml").exists());
        assert!(dir.path().join(".iop/secrets").exists());
        // Second run leaves files untouched.
        run(dir.path()).unwrap();
    }

    #[test]
    fn template_parses_as_a_valid_project() {
        let config = ProjectConfig::parse(CONFIG_TEMPLATE, "template").unwrap();
        assert_eq!(config.name, "my-project");
        assert!(config.services.contains_key("web"));
    }
}
