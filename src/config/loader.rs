//! Configuration file loading.

use std::path::Path;

use tracing::info;

use super::{Config, ConfigError};

/// Reads, parses, and validates a YAML configuration file.
pub fn load(path: &Path) -> Result<Config, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    if contents.trim().is_empty() {
        return Err(ConfigError::Empty);
    }

    let config: Config = serde_yaml::from_str(&contents)?;
    config.validate()?;

    info!(path = %path.display(), "configuration loaded");
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_a_valid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.yaml");
        std::fs::write(
            &path,
            "server:\n  transport: stdio\nupstream:\n  url: \"http://localhost:3000\"\n",
        )
        .unwrap();

        let config = load(&path).unwrap();
        assert_eq!(config.upstream.url, "http://localhost:3000");
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = load(Path::new("/nonexistent/gateway.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }

    #[test]
    fn empty_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.yaml");
        std::fs::write(&path, "   \n").unwrap();
        assert!(matches!(load(&path).unwrap_err(), ConfigError::Empty));
    }

    #[test]
    fn invalid_yaml_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.yaml");
        std::fs::write(&path, "server: [unclosed\n").unwrap();
        assert!(matches!(load(&path).unwrap_err(), ConfigError::Parse(_)));
    }
}
