//! Secrets file parsing.
//!
//! `.iop/secrets` holds one `KEY=VALUE` per line. Values may be quoted;
//! quotes are trimmed. Lines starting with `#` and blank lines are
//! ignored. The file never leaves the workstation: secret values travel
//! only as environment variables of created containers.

use std::collections::BTreeMap;
use std::path::Path;

use crate::errors::ConfigError;

pub type Secrets = BTreeMap<String, String>;

pub const SECRETS_FILE: &str = ".iop/secrets";

/// Load the secrets file if it exists; an absent file is an empty set.
pub fn load_secrets(path: &Path) -> Result<Secrets, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(raw) => parse_secrets(&raw),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Secrets::new()),
        Err(source) => Err(ConfigError::Io {
            path: path.display().to_string(),
            source,
        }),
    }
}

pub fn parse_secrets(raw: &str) -> Result<Secrets, ConfigError> {
    let mut secrets = Secrets::new();
    for (idx, line) in raw.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (key, value) = line
            .split_once('=')
            .ok_or(ConfigError::MalformedSecret { line: idx + 1 })?;
        let key = key.trim();
        if key.is_empty() {
            return Err(ConfigError::MalformedSecret { line: idx + 1 });
        }
        secrets.insert(key.to_string(), unquote(value.trim()).to_string());
    }
    Ok(secrets)
}

fn unquote(value: &str) -> &str {
    let bytes = value.as_bytes();
    if bytes.len() >= 2 {
        let first = bytes[0];
        let last = bytes[bytes.len() - 1];
        if (first == b'"' && last == b'"') || (first == b'\'' && last == b'\'') {
            return &value[1..value.len() - 1];
        }
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_comments_blanks_and_quotes() {
        let raw = r#"
# database
DATABASE_URL="postgres://app:pw@db:5432/app"

API_KEY='abc123'
PLAIN=value with spaces
"#;
        let secrets = parse_secrets(raw).unwrap();
        assert_eq!(secrets["DATABASE_URL"], "postgres://app:pw@db:5432/app");
        assert_eq!(secrets["API_KEY"], "abc123");
        assert_eq!(secrets["PLAIN"], "value with spaces");
        assert_eq!(secrets.len(), 3);
    }

    #[test]
    fn equals_in_value_is_preserved() {
        let secrets = parse_secrets("TOKEN=a=b=c\n").unwrap();
        assert_eq!(secrets["TOKEN"], "a=b=c");
    }

    #[test]
    fn malformed_line_reports_its_number() {
        let err = parse_secrets("GOOD=1\nnot a secret\n").unwrap_err();
        match err {
            ConfigError::MalformedSecret { line } => assert_eq!(line, 2),
            other => panic!("unexpected: {other}"),
        }
    }

    #[test]
    fn missing_file_is_empty() {
        let secrets = load_secrets(Path::new("/nonexistent/.iop/secrets")).unwrap();
        assert!(secrets.is_empty());
    }
}
