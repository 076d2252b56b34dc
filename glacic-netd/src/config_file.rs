//! TOML `ConfigSource` over a flat record list, minus the version
//! dispatch (config loading/migration is out of scope). Grounded on
//! `gnosis_vpn-lib/src/config/mod.rs`'s read path:
//! `tokio::fs::read_to_string` + `toml::from_str`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use glacic_core::config::{ConfigSource, Error, UplinkGroupConfig};
use serde::Deserialize;
use tokio::fs;

#[derive(Debug, Deserialize)]
struct FileFormat {
    #[serde(default)]
    group: Vec<UplinkGroupConfig>,
}

/// Reads `[[group]]` tables from a TOML file on every [`ConfigSource::load`]
/// call (no caching, no partial reload -- a reload re-reads and
/// re-validates the entire file).
pub struct TomlConfigSource {
    path: PathBuf,
}

impl TomlConfigSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ConfigSource for TomlConfigSource {
    async fn load(&self) -> Result<Vec<UplinkGroupConfig>, Error> {
        let content = fs::read_to_string(&self.path).await.map_err(|e| Error::Source(e.to_string()))?;
        let parsed: FileFormat = toml::from_str(&content).map_err(|e| Error::Source(e.to_string()))?;
        Ok(parsed.group)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn loads_groups_from_a_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("glacic.toml");
        tokio::fs::write(
            &path,
            r#"
            [[group]]
            name = "wan-group"

            [[group.uplinks]]
            name = "wan1"
            type = "wan"
            interface = "eth0"
            "#,
        )
        .await
        .unwrap();

        let source = TomlConfigSource::new(&path);
        let groups = source.load().await.unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].name, "wan-group");
        assert_eq!(groups[0].uplinks.len(), 1);
        assert_eq!(groups[0].uplinks[0].interface, "eth0");
    }

    #[tokio::test]
    async fn missing_file_surfaces_as_source_error() {
        let source = TomlConfigSource::new("/nonexistent/glacic.toml");
        assert!(source.load().await.is_err());
    }
}
