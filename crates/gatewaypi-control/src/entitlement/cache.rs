//! License cache
//!
//! A small JSON key/value file holding `licenseKey` and `licenseInfo`, so a
//! restart does not have to reach the billing provider before serving.

use super::License;
use crate::error::Result;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Key holding the customer identifier
pub const LICENSE_KEY: &str = "licenseKey";
/// Key holding the serialized license
pub const LICENSE_INFO: &str = "licenseInfo";

/// File-backed license cache
#[derive(Debug, Clone)]
pub struct LicenseCache {
    path: PathBuf,
}

impl LicenseCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persist `license` under `key`
    pub fn store(&self, key: &str, license: &License) -> Result<()> {
        let info = serde_json::to_string(license)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        let mut entries = self.read_entries();
        entries.insert(LICENSE_KEY.to_string(), key.to_string());
        entries.insert(LICENSE_INFO.to_string(), info);
        self.write_entries(&entries)
    }

    /// Cached `(key, license)`; a record that fails to parse is dropped
    pub fn load(&self) -> Option<(String, License)> {
        let mut entries = self.read_entries();
        let key = entries.get(LICENSE_KEY)?.clone();
        let info = entries.get(LICENSE_INFO)?;

        match serde_json::from_str::<License>(info) {
            Ok(license) => Some((key, license)),
            Err(e) => {
                warn!("Dropping unreadable cached license: {}", e);
                entries.remove(LICENSE_KEY);
                entries.remove(LICENSE_INFO);
                if let Err(e) = self.write_entries(&entries) {
                    warn!("Failed to rewrite license cache: {}", e);
                }
                None
            }
        }
    }

    /// Remove both keys
    pub fn clear(&self) -> Result<()> {
        let mut entries = self.read_entries();
        entries.remove(LICENSE_KEY);
        entries.remove(LICENSE_INFO);
        self.write_entries(&entries)
    }

    fn read_entries(&self) -> BTreeMap<String, String> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(_) => return BTreeMap::new(),
        };
        serde_json::from_str(&content).unwrap_or_else(|e| {
            warn!("License cache {} is corrupt: {}", self.path.display(), e);
            BTreeMap::new()
        })
    }

    fn write_entries(&self, entries: &BTreeMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(entries)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(&self.path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entitlement::tests::license;
    use crate::entitlement::Plan;

    #[test]
    fn test_store_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let cache = LicenseCache::new(dir.path().join("state").join("license.json"));
        let stored = license(Plan::Professional);

        cache.store("ops@example.com", &stored).unwrap();
        let (key, loaded) = cache.load().unwrap();
        assert_eq!(key, "ops@example.com");
        assert_eq!(loaded, stored);
    }

    #[test]
    fn test_unparseable_info_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("license.json");
        std::fs::write(
            &path,
            r#"{"licenseKey": "ops@example.com", "licenseInfo": "{not json", "theme": "dark"}"#,
        )
        .unwrap();

        let cache = LicenseCache::new(&path);
        assert!(cache.load().is_none());

        let remaining: BTreeMap<String, String> =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert!(!remaining.contains_key(LICENSE_KEY));
        assert!(!remaining.contains_key(LICENSE_INFO));
        assert_eq!(remaining.get("theme").map(String::as_str), Some("dark"));
    }

    #[test]
    fn test_clear_and_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let cache = LicenseCache::new(dir.path().join("license.json"));
        assert!(cache.load().is_none());

        cache.store("ops@example.com", &license(Plan::Starter)).unwrap();
        cache.clear().unwrap();
        assert!(cache.load().is_none());
    }
}
