use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::FlowError;

pub const DEFAULT_SERVER: &str = "flow.spideroak.com";
pub const DEFAULT_PORT: u16 = 443;
pub const DEFAULT_BACKEND: &str = "flowappglue";
pub const DEFAULT_TERMINATE_TIMEOUT_SECS: u64 = 5;

const APP_DIR: &str = "flow";

/// Client settings: how to launch the backend and what to hand its `Config` call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct FlowConfig {
    pub username: Option<String>,
    pub server_uri: String,
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
    pub backend_path: PathBuf,
    pub db_dir: PathBuf,
    pub schema_dir: PathBuf,
    pub attachment_dir: PathBuf,
    pub backend_log: PathBuf,
    pub decrement_file: Option<PathBuf>,
    pub api_timeout_ms: Option<u64>,
    pub terminate_timeout_secs: u64,
}

impl Default for FlowConfig {
    fn default() -> Self {
        let data = data_root();
        Self {
            username: None,
            server_uri: DEFAULT_SERVER.into(),
            host: DEFAULT_SERVER.into(),
            port: DEFAULT_PORT,
            use_tls: true,
            backend_path: PathBuf::from(DEFAULT_BACKEND),
            db_dir: data.join("db"),
            schema_dir: data.join("schema"),
            attachment_dir: data.join("attachments"),
            backend_log: data.join("flowappglue.log"),
            decrement_file: None,
            api_timeout_ms: None,
            terminate_timeout_secs: DEFAULT_TERMINATE_TIMEOUT_SECS,
        }
    }
}

fn data_root() -> PathBuf {
    dirs::data_dir().unwrap_or_else(|| PathBuf::from(".")).join(APP_DIR)
}

impl FlowConfig {
    /// `<config dir>/flow/flow.toml`, honouring `FLOW_CONFIG` when set.
    pub fn default_path() -> Result<PathBuf, FlowError> {
        if let Ok(path) = std::env::var("FLOW_CONFIG") {
            if !path.trim().is_empty() {
                return Ok(PathBuf::from(path));
            }
        }
        let base = dirs::config_dir()
            .ok_or_else(|| FlowError::config("failed to resolve config directory"))?;
        Ok(base.join(APP_DIR).join("flow.toml"))
    }

    pub fn load(path: &Path) -> Result<Self, FlowError> {
        let raw = fs::read_to_string(path)
            .map_err(|err| FlowError::config(format!("failed to read {}: {err}", path.display())))?;
        toml::from_str(&raw)
            .map_err(|err| FlowError::config(format!("failed to parse {}: {err}", path.display())))
    }

    /// Loads `path` when it exists, otherwise falls back to defaults.
    pub fn load_or_default(path: &Path) -> Result<Self, FlowError> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), FlowError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| {
                FlowError::config(format!("failed to create {}: {err}", parent.display()))
            })?;
        }
        let encoded = toml::to_string_pretty(self)
            .map_err(|err| FlowError::config(format!("failed to encode config: {err}")))?;
        fs::write(path, encoded)
            .map_err(|err| FlowError::config(format!("failed to write {}: {err}", path.display())))
    }

    pub fn api_timeout(&self) -> Option<Duration> {
        self.api_timeout_ms.map(Duration::from_millis)
    }

    pub fn terminate_timeout(&self) -> Duration {
        Duration::from_secs(self.terminate_timeout_secs)
    }

    /// Checks the paths the backend needs before it is launched.
    ///
    /// The schema directory must already exist; database and attachment
    /// directories are created owner-only when missing.
    pub fn prepare_dirs(&self) -> Result<(), FlowError> {
        if !self.schema_dir.exists() {
            return Err(FlowError::config(format!(
                "cannot access '{}', no such file or directory",
                self.schema_dir.display()
            )));
        }
        ensure_private_dir(&self.db_dir)?;
        ensure_private_dir(&self.attachment_dir)?;
        if let Some(parent) = self.backend_log.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|err| {
                    FlowError::config(format!("failed to create {}: {err}", parent.display()))
                })?;
            }
        }
        Ok(())
    }

    /// A bare program name is left to `PATH`; anything with a directory must exist.
    pub fn check_backend_path(&self) -> Result<(), FlowError> {
        let has_dir = self.backend_path.components().count() > 1;
        if has_dir && !self.backend_path.exists() {
            return Err(FlowError::config(format!(
                "cannot access '{}', no such file or directory",
                self.backend_path.display()
            )));
        }
        Ok(())
    }
}

fn ensure_private_dir(path: &Path) -> Result<(), FlowError> {
    if path.exists() {
        return Ok(());
    }
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder
        .create(path)
        .map_err(|err| FlowError::config(format!("failed to create {}: {err}", path.display())))?;
    log::debug!("config: created {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config_in(dir: &TempDir) -> FlowConfig {
        FlowConfig {
            db_dir: dir.path().join("db"),
            schema_dir: dir.path().join("schema"),
            attachment_dir: dir.path().join("attachments"),
            backend_log: dir.path().join("logs").join("glue.log"),
            ..FlowConfig::default()
        }
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: FlowConfig = toml::from_str(
            r#"
username = "bot"
port = 8080
api_timeout_ms = 1500
"#,
        )
        .unwrap();
        assert_eq!(config.username.as_deref(), Some("bot"));
        assert_eq!(config.port, 8080);
        assert_eq!(config.api_timeout(), Some(Duration::from_millis(1500)));
        assert_eq!(config.host, DEFAULT_SERVER);
        assert!(config.use_tls);
        assert_eq!(config.terminate_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = toml::from_str::<FlowConfig>("usrname = \"typo\"").unwrap_err();
        assert!(err.to_string().contains("usrname"));
    }

    #[test]
    fn save_then_load_preserves_settings() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("flow.toml");
        let config = FlowConfig {
            username: Some("echo-bot".into()),
            decrement_file: Some(dir.path().join("decrement")),
            ..config_in(&dir)
        };
        config.save(&path).unwrap();
        assert_eq!(FlowConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = TempDir::new().unwrap();
        let loaded = FlowConfig::load_or_default(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(loaded, FlowConfig::default());
        assert!(FlowConfig::load(&dir.path().join("absent.toml")).is_err());
    }

    #[test]
    fn prepare_dirs_requires_schema_and_creates_the_rest() {
        let dir = TempDir::new().unwrap();
        let config = config_in(&dir);
        let err = config.prepare_dirs().unwrap_err();
        assert!(matches!(err, FlowError::Config { .. }));
        assert!(!config.db_dir.exists());

        fs::create_dir_all(&config.schema_dir).unwrap();
        config.prepare_dirs().unwrap();
        assert!(config.db_dir.is_dir());
        assert!(config.attachment_dir.is_dir());
        assert!(dir.path().join("logs").is_dir());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&config.db_dir).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o700);
        }
    }

    #[test]
    fn backend_path_lookup() {
        let dir = TempDir::new().unwrap();
        let bare = FlowConfig::default();
        bare.check_backend_path().unwrap();

        let missing = FlowConfig { backend_path: dir.path().join("nope"), ..FlowConfig::default() };
        assert!(missing.check_backend_path().is_err());
    }
}
