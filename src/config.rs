//! TOML configuration shared by `fleetsync` and `fleetsyncd`

use serde::{Deserialize, Serialize};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{FleetError, Result};
use crate::url::DEFAULT_API_PORT;

pub fn config_dir() -> PathBuf {
    #[cfg(windows)]
    {
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata).join("Fleetsync");
        }
    }
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".config").join("fleetsync");
    }
    PathBuf::from(".fleetsync")
}

pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    pub api_port: u16,
    pub poll_interval_secs: u64,
    pub booting_poll_interval_secs: u64,
    /// Node registry and transfer log live here; defaults to the config dir
    pub state_dir: Option<PathBuf>,
    pub log_file: Option<PathBuf>,
    pub transfer_log: bool,
    pub verbose: bool,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            api_port: DEFAULT_API_PORT,
            poll_interval_secs: 20,
            booting_poll_interval_secs: 2,
            state_dir: None,
            log_file: None,
            transfer_log: true,
            verbose: false,
        }
    }
}

impl FleetConfig {
    pub fn state_dir(&self) -> PathBuf {
        self.state_dir.clone().unwrap_or_else(config_dir)
    }

    pub fn registry_path(&self) -> PathBuf {
        self.state_dir().join("nodes.json")
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn booting_poll_interval(&self) -> Duration {
        Duration::from_secs(self.booting_poll_interval_secs.max(1))
    }
}

/// Missing file means defaults
pub fn load_config(path: &Path) -> Result<FleetConfig> {
    match std::fs::read_to_string(path) {
        Ok(data) => toml::from_str(&data).map_err(|e| FleetError::Config(format!("{}: {e}", path.display()))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(FleetConfig::default()),
        Err(e) => Err(e.into()),
    }
}

pub fn save_config(cfg: &FleetConfig, path: &Path) -> Result<()> {
    let dir = path
        .parent()
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."));
    std::fs::create_dir_all(&dir)?;
    let data = toml::to_string(cfg).map_err(|e| FleetError::Config(e.to_string()))?;
    // atomic write
    let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
    tmp.write_all(data.as_bytes())?;
    tmp.flush()?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(tmp.path(), std::fs::Permissions::from_mode(0o600));
    }
    tmp.persist(path).map_err(|e| FleetError::Io(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = load_config(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(cfg, FleetConfig::default());
        assert_eq!(cfg.api_port, 1323);
        assert_eq!(cfg.poll_interval(), Duration::from_secs(20));
        assert_eq!(cfg.booting_poll_interval(), Duration::from_secs(2));
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "api_port = 8080\nstate_dir = \"/var/lib/fleetsync\"\n").unwrap();
        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.api_port, 8080);
        assert_eq!(cfg.poll_interval_secs, 20);
        assert_eq!(cfg.registry_path(), PathBuf::from("/var/lib/fleetsync/nodes.json"));
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/config.toml");
        let cfg = FleetConfig {
            verbose: true,
            booting_poll_interval_secs: 5,
            ..Default::default()
        };
        save_config(&cfg, &path).unwrap();
        assert_eq!(load_config(&path).unwrap(), cfg);
        std::fs::write(&path, "api_port = \"nope\"").unwrap();
        assert!(matches!(load_config(&path), Err(FleetError::Config(_))));
    }
}
