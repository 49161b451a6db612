use std::{fs, path::PathBuf, str::FromStr};

use serde::Deserialize;

use crate::error::{ServiceError, ServiceResult};

/// Формат вывода событий.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Pretty,
    Json,
}

/// Настройки консольного вывода.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ConsoleConfig {
    pub enabled: bool,
    pub format: LogFormat,
    pub with_ansi: bool,
    pub with_target: bool,
    pub with_thread_ids: bool,
    pub with_line_numbers: bool,
}

/// Настройки файлового вывода (ежедневная ротация).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub enabled: bool,
    pub format: LogFormat,
    /// Префикс имени файла; к нему дописывается дата.
    pub filename: String,
}

/// Конфигурация логирования.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Уровень по умолчанию (`trace`..`error`), если не задан `RUST_LOG`.
    pub level: String,
    /// Дополнительные директивы вида `fleetgeo::network=debug`.
    pub directives: Vec<String>,
    pub log_dir: PathBuf,
    pub console: ConsoleConfig,
    pub file: FileConfig,
}

////////////////////////////////////////////////////////////////////////////////
// Собственные методы
////////////////////////////////////////////////////////////////////////////////

impl LoggingConfig {
    /// Проверяет уровень и директивы.
    pub fn validate(&self) -> ServiceResult<()> {
        if tracing::Level::from_str(&self.level).is_err() {
            return Err(ServiceError::invalid_setting(
                "logging.level",
                format!("unknown level '{}'", self.level),
            ));
        }
        if self.file.enabled && self.file.filename.trim().is_empty() {
            return Err(ServiceError::invalid_setting(
                "logging.file.filename",
                "must not be empty when file logging is enabled",
            ));
        }
        Ok(())
    }

    /// Директива фильтра: уровень крейта плюс пользовательские директивы.
    pub fn build_filter_directive(&self) -> String {
        let mut parts = vec![
            self.level.to_lowercase(),
            format!("{}={}", env!("CARGO_CRATE_NAME"), self.level.to_lowercase()),
        ];
        parts.extend(self.directives.iter().cloned());
        parts.join(",")
    }

    /// Создаёт каталог для файлов логов, если включён файловый вывод.
    pub fn ensure_log_dir(&self) -> ServiceResult<()> {
        if self.file.enabled {
            fs::create_dir_all(&self.log_dir)?;
        }
        Ok(())
    }
}

////////////////////////////////////////////////////////////////////////////////
// Общие реализации трейтов
////////////////////////////////////////////////////////////////////////////////

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            format: LogFormat::Compact,
            with_ansi: true,
            with_target: true,
            with_thread_ids: false,
            with_line_numbers: false,
        }
    }
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            format: LogFormat::Json,
            filename: "fleetgeo.log".to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            directives: Vec::new(),
            log_dir: PathBuf::from("logs"),
            console: ConsoleConfig::default(),
            file: FileConfig::default(),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Тесты
////////////////////////////////////////////////////////////////////////////////
