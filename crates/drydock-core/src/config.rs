use crate::CoreError;
use drydock_store::HomeLayout;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding `max_parallelism`.
pub const MAX_PARALLELISM_ENV: &str = "DRYDOCK_MAX_PARALLELISM";

const MIN_PARALLELISM: usize = 4;

/// Engine tuning, read from `<home>/config.toml`.
///
/// Every key is optional; missing keys take their defaults. Unknown keys are
/// rejected so typos do not silently fall back.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    #[serde(skip)]
    pub home: PathBuf,
    pub max_parallelism: usize,
    pub apply_deadline_secs: u64,
    pub destroy_deadline_secs: u64,
    pub retry_limit: u32,
    pub retry_backoff_ms: u64,
    pub event_buffer: usize,
    pub check_host_interfaces: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            home: PathBuf::new(),
            max_parallelism: default_parallelism(),
            apply_deadline_secs: 300,
            destroy_deadline_secs: 120,
            retry_limit: 2,
            retry_backoff_ms: 250,
            event_buffer: 256,
            check_host_interfaces: true,
        }
    }
}

fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map_or(MIN_PARALLELISM, std::num::NonZeroUsize::get)
        .max(MIN_PARALLELISM)
}

impl EngineConfig {
    /// Resolve the configuration: defaults, then `<home>/config.toml`, then
    /// the environment. `home` defaults to `$DRYDOCK_HOME` or
    /// `$HOME/.drydock`.
    pub fn load(home: Option<PathBuf>) -> Result<Self, CoreError> {
        let layout = match home {
            Some(root) => HomeLayout::new(root),
            None => HomeLayout::from_env()?,
        };
        let mut config = Self::load_file(&layout.config_file())?;
        config.home = layout.root().to_path_buf();
        config.apply_env(std::env::var(MAX_PARALLELISM_ENV).ok().as_deref())?;
        Ok(config)
    }

    /// Defaults rooted at `home`, ignoring any config file or environment.
    pub fn with_home(home: impl Into<PathBuf>) -> Self {
        Self {
            home: home.into(),
            ..Self::default()
        }
    }

    fn load_file(path: &Path) -> Result<Self, CoreError> {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(CoreError::Io(e)),
        };
        let config: Self = toml::from_str(&content)
            .map_err(|e| CoreError::Config(format!("invalid {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self, max_parallelism: Option<&str>) -> Result<(), CoreError> {
        if let Some(raw) = max_parallelism.filter(|v| !v.trim().is_empty()) {
            self.max_parallelism = raw.trim().parse().map_err(|_| {
                CoreError::Config(format!("{MAX_PARALLELISM_ENV} must be a number, got '{raw}'"))
            })?;
        }
        self.validate()
    }

    fn validate(&self) -> Result<(), CoreError> {
        if self.max_parallelism == 0 {
            return Err(CoreError::Config("max_parallelism must be at least 1".to_owned()));
        }
        if self.event_buffer == 0 {
            return Err(CoreError::Config("event_buffer must be at least 1".to_owned()));
        }
        Ok(())
    }

    pub fn layout(&self) -> HomeLayout {
        HomeLayout::new(&self.home)
    }

    pub fn apply_deadline(&self) -> Duration {
        Duration::from_secs(self.apply_deadline_secs)
    }

    pub fn destroy_deadline(&self) -> Duration {
        Duration::from_secs(self.destroy_deadline_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let c = EngineConfig::default();
        assert!(c.max_parallelism >= MIN_PARALLELISM);
        assert_eq!(c.apply_deadline(), Duration::from_secs(300));
        assert_eq!(c.destroy_deadline(), Duration::from_secs(120));
        assert_eq!(c.retry_limit, 2);
        assert!(c.check_host_interfaces);
    }

    #[test]
    fn missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let c = EngineConfig::load(Some(dir.path().to_path_buf())).unwrap();
        assert_eq!(c.home, dir.path());
        assert_eq!(c.event_buffer, 256);
    }

    #[test]
    fn file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.toml"),
            "retry_limit = 5\ncheck_host_interfaces = false\n",
        )
        .unwrap();
        let c = EngineConfig::load(Some(dir.path().to_path_buf())).unwrap();
        assert_eq!(c.retry_limit, 5);
        assert!(!c.check_host_interfaces);
        assert_eq!(c.retry_backoff_ms, 250);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.toml"), "retries = 5\n").unwrap();
        let err = EngineConfig::load(Some(dir.path().to_path_buf())).unwrap_err();
        assert!(matches!(err, CoreError::Config(_)));
        assert_eq!(err.exit_code(), crate::EXIT_INVALID_CONFIG);
    }

    #[test]
    fn env_parallelism_overrides() {
        let mut c = EngineConfig::default();
        c.apply_env(Some("2")).unwrap();
        assert_eq!(c.max_parallelism, 2);
        assert!(c.apply_env(Some("many")).is_err());
        assert!(c.apply_env(Some("0")).is_err());
        c.max_parallelism = 3;
        c.apply_env(None).unwrap();
        assert_eq!(c.max_parallelism, 3);
    }
}
