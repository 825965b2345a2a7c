use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use intake_worker::{RequestOptions, WorkerCommand};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::idempotency::{IdempotencyStore, DEFAULT_MAX_ENTRIES, DEFAULT_TTL};

pub const ENV_EXCEL_PATH: &str = "INTAKE_EXCEL_PATH";
pub const ENV_YEAR_SHEET: &str = "INTAKE_YEAR_SHEET";
pub const ENV_WORKER_PROGRAM: &str = "INTAKE_WORKER_PROGRAM";
pub const ENV_WORKER_TIMEOUT_MS: &str = "INTAKE_WORKER_TIMEOUT_MS";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriterBackend {
    /// Live workbook through the automation worker.
    #[default]
    Worker,
    /// Library-based editing of the closed workbook, supplied by the host.
    Direct,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WorkerConfig {
    pub program: Option<PathBuf>,
    pub args: Vec<String>,
    pub request_timeout_ms: u64,
    pub warmup_timeout_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            program: None,
            args: Vec::new(),
            request_timeout_ms: 20_000,
            warmup_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct IdempotencyConfig {
    pub ttl_secs: u64,
    pub max_entries: usize,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            ttl_secs: DEFAULT_TTL.as_secs(),
            max_entries: DEFAULT_MAX_ENTRIES,
        }
    }
}

/// Settings for the ledger core, read from the application's `config.json`.
///
/// Unknown keys are ignored so the same file can carry settings for other
/// parts of the application.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LedgerConfig {
    pub excel_path: PathBuf,
    /// Blank means "the sheet named after the current year".
    pub year_sheet_name: String,
    pub writer_backend: WriterBackend,
    pub snapshot_path: Option<PathBuf>,
    pub worker: WorkerConfig,
    pub idempotency: IdempotencyConfig,
}

impl LedgerConfig {
    /// Load from `path`, resolve relative paths against its directory and
    /// apply `INTAKE_*` environment overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: LedgerConfig =
            serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        if let Some(base) = path.parent() {
            config.resolve_relative_to(base);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        let lookup = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(path) = lookup(ENV_EXCEL_PATH) {
            self.excel_path = PathBuf::from(path.trim());
        }
        if let Some(sheet) = lookup(ENV_YEAR_SHEET) {
            self.year_sheet_name = sheet.trim().to_string();
        }
        if let Some(program) = lookup(ENV_WORKER_PROGRAM) {
            self.worker.program = Some(PathBuf::from(program.trim()));
        }
        if let Some(timeout) = lookup(ENV_WORKER_TIMEOUT_MS) {
            self.worker.request_timeout_ms = timeout.trim().parse().map_err(|_| {
                ConfigError::Invalid(format!("{ENV_WORKER_TIMEOUT_MS}={timeout:?} is not a number"))
            })?;
        }
        Ok(())
    }

    pub fn resolve_relative_to(&mut self, base: &Path) {
        if !self.excel_path.as_os_str().is_empty() && self.excel_path.is_relative() {
            self.excel_path = base.join(&self.excel_path);
        }
        if let Some(snapshot) = self.snapshot_path.as_mut().filter(|p| p.is_relative()) {
            *snapshot = base.join(&*snapshot);
        }
        // Bare program names are looked up on PATH.
        if let Some(program) = self
            .worker
            .program
            .as_mut()
            .filter(|p| p.is_relative() && p.components().count() > 1)
        {
            *program = base.join(&*program);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.excel_path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("excelPath is required".into()));
        }
        if self.worker.request_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "worker.requestTimeoutMs must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Command that starts the automation worker, if one is configured.
    pub fn worker_command(&self) -> Option<WorkerCommand> {
        let program = self.worker.program.as_ref()?;
        Some(WorkerCommand::new(program).args(&self.worker.args))
    }

    pub fn request_options(&self) -> RequestOptions {
        RequestOptions {
            timeout: Duration::from_millis(self.worker.request_timeout_ms),
            retry_on_failure: true,
        }
    }

    pub fn warmup_timeout(&self) -> Duration {
        Duration::from_millis(self.worker.warmup_timeout_ms)
    }

    pub fn idempotency_store(&self) -> IdempotencyStore {
        IdempotencyStore::new(
            Duration::from_secs(self.idempotency.ttl_secs),
            self.idempotency.max_entries,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    #[test]
    fn defaults_fill_missing_keys() {
        let config: LedgerConfig = serde_json::from_str(
            r#"{"excelPath": "Annahme.xlsx", "port": 3000, "worker": {"program": "powershell"}}"#,
        )
        .unwrap();
        assert_eq!(config.year_sheet_name, "");
        assert_eq!(config.writer_backend, WriterBackend::Worker);
        assert_eq!(config.worker.request_timeout_ms, 20_000);
        assert_eq!(config.worker.warmup_timeout_ms, 10_000);
        assert_eq!(config.idempotency.ttl_secs, 600);
        assert_eq!(config.idempotency.max_entries, 200);
        assert!(config.snapshot_path.is_none());
    }

    #[test]
    fn load_resolves_paths_against_the_config_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{
                "excelPath": "data/Annahme.xlsx",
                "yearSheetName": "2026",
                "writerBackend": "direct",
                "snapshotPath": "cache/ledger.json",
                "worker": {"program": "scripts/worker.ps1", "args": ["-NoProfile"]}
            }"#,
        )
        .unwrap();

        let config = LedgerConfig::load(&path).unwrap();
        assert_eq!(config.excel_path, dir.path().join("data/Annahme.xlsx"));
        assert_eq!(config.snapshot_path, Some(dir.path().join("cache/ledger.json")));
        assert_eq!(config.writer_backend, WriterBackend::Direct);
        let command = config.worker_command().unwrap();
        assert_eq!(command.program, dir.path().join("scripts/worker.ps1"));
        assert_eq!(command.args, vec!["-NoProfile"]);
    }

    #[test]
    fn bare_program_names_stay_on_path() {
        let mut config = LedgerConfig {
            excel_path: "Annahme.xlsx".into(),
            ..LedgerConfig::default()
        };
        config.worker.program = Some("powershell".into());
        config.resolve_relative_to(Path::new("/srv/intake"));
        assert_eq!(config.worker.program, Some(PathBuf::from("powershell")));
        assert_eq!(config.excel_path, PathBuf::from("/srv/intake/Annahme.xlsx"));
    }

    #[test]
    fn environment_overrides_win() {
        let env: HashMap<&str, &str> = [
            (ENV_EXCEL_PATH, "/mnt/share/Annahme.xlsx"),
            (ENV_YEAR_SHEET, " 2025 "),
            (ENV_WORKER_PROGRAM, ""),
            (ENV_WORKER_TIMEOUT_MS, "5000"),
        ]
        .into_iter()
        .collect();
        let mut config = LedgerConfig::default();
        config
            .apply_env_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.excel_path, PathBuf::from("/mnt/share/Annahme.xlsx"));
        assert_eq!(config.year_sheet_name, "2025");
        assert_eq!(config.worker.program, None);
        assert_eq!(config.request_options().timeout, Duration::from_secs(5));

        let err = config
            .apply_env_overrides(|key| (key == ENV_WORKER_TIMEOUT_MS).then(|| "soon".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn missing_excel_path_is_invalid() {
        assert!(LedgerConfig::default().validate().is_err());
    }
}
