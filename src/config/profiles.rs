use crate::error::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Connection parameters for one device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceProfile {
    pub name: String,
    pub hostname: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub key_file: Option<PathBuf>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_true")]
    pub verify_host_keys: bool,
    #[serde(default = "default_true")]
    pub compression: bool,
}

fn default_port() -> u16 {
    22
}

fn default_true() -> bool {
    true
}

impl DeviceProfile {
    pub fn new(name: impl Into<String>, hostname: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            hostname: hostname.into(),
            port: 22,
            username: username.into(),
            key_file: None,
            password: None,
            verify_host_keys: true,
            compression: true,
        }
    }
}

/// Profile file format
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfilesFile {
    #[serde(default)]
    pub devices: Vec<DeviceProfile>,
}

/// Named device profiles loaded from `devices.toml`.
///
/// The session layer only ever reads from the store; mutation belongs to the
/// profile-management commands.
pub struct ProfileStore {
    profiles: HashMap<String, DeviceProfile>,
    config_path: PathBuf,
}

impl ProfileStore {
    pub fn load(config_dir: &Path) -> AppResult<Self> {
        let config_path = config_dir.join("devices.toml");
        let profiles = if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            let file: ProfilesFile = toml::from_str(&content)?;
            file.devices
                .into_iter()
                .map(|p| (p.name.clone(), p))
                .collect()
        } else {
            HashMap::new()
        };

        Ok(Self {
            profiles,
            config_path,
        })
    }

    pub fn save(&self) -> AppResult<()> {
        let mut devices: Vec<_> = self.profiles.values().cloned().collect();
        devices.sort_by(|a, b| a.name.cmp(&b.name));
        let file = ProfilesFile { devices };
        let content = toml::to_string_pretty(&file)?;
        std::fs::write(&self.config_path, content)?;
        Ok(())
    }

    /// Immutable snapshot of one profile.
    pub fn get(&self, name: &str) -> Option<DeviceProfile> {
        self.profiles.get(name).cloned()
    }

    pub fn list(&self) -> Vec<DeviceProfile> {
        let mut devices: Vec<_> = self.profiles.values().cloned().collect();
        devices.sort_by(|a, b| a.name.cmp(&b.name));
        devices
    }

    pub fn add(&mut self, profile: DeviceProfile) {
        self.profiles.insert(profile.name.clone(), profile);
    }

    pub fn remove(&mut self, name: &str) -> AppResult<()> {
        self.profiles
            .remove(name)
            .ok_or_else(|| AppError::ProfileNotFound(name.to_string()))?;
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_defaults_from_toml() {
        let content = r#"
            [[devices]]
            name = "pi"
            hostname = "192.168.1.50"
            username = "pi"
        "#;
        let file: ProfilesFile = toml::from_str(content).unwrap();
        let profile = &file.devices[0];
        assert_eq!(profile.port, 22);
        assert!(profile.verify_host_keys);
        assert!(profile.compression);
        assert!(profile.key_file.is_none());
        assert!(profile.password.is_none());
    }

    #[test]
    fn test_store_get_missing_profile() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProfileStore::load(dir.path()).unwrap();
        assert!(store.is_empty());
        assert!(store.get("nas").is_none());
    }

    #[test]
    fn test_store_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = ProfileStore::load(dir.path()).unwrap();

        let mut profile = DeviceProfile::new("nas", "nas.local", "admin");
        profile.port = 2222;
        profile.verify_host_keys = false;
        store.add(profile);
        store.save().unwrap();

        let reloaded = ProfileStore::load(dir.path()).unwrap();
        let profile = reloaded.get("nas").unwrap();
        assert_eq!(profile.hostname, "nas.local");
        assert_eq!(profile.port, 2222);
        assert!(!profile.verify_host_keys);
    }

    #[test]
    fn test_store_remove_missing_profile() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = ProfileStore::load(dir.path()).unwrap();
        assert!(matches!(
            store.remove("ghost"),
            Err(AppError::ProfileNotFound(_))
        ));
    }
}
