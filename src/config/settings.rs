use std::{net::SocketAddr, path::Path};

use config::{Config, Environment, File};
use serde::Deserialize;

use crate::{
    database::{GeoIndexConfig, MAX_SHARDS},
    engine::{EvictionConfig, QueryPolicy},
    error::{ServiceError, ServiceResult},
    logging::LoggingConfig,
    network::ConnectionConfig,
};

/// Имя файла конфигурации по умолчанию (без расширения).
pub const DEFAULT_CONFIG_FILE: &str = "fleetgeo";

/// Префикс переменных окружения.
pub const ENV_PREFIX: &str = "FLEETGEO";

/// Порт оригинального gRPC-сервиса.
pub const DEFAULT_LISTEN_ADDRESS: &str = "127.0.0.1:50052";

/// Допустимая точность geohash-сетки.
const CELL_PRECISION_RANGE: std::ops::RangeInclusive<usize> = 2..=8;

/// Настройки сервиса.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub listen_address: String,
    pub index: GeoIndexConfig,
    pub query: QueryPolicy,
    pub eviction: EvictionConfig,
    pub connection: ConnectionConfig,
    pub logging: LoggingConfig,
}

impl Settings {
    /// Загружает настройки: значения по умолчанию, затем необязательный
    /// `fleetgeo.toml` из текущего каталога, затем `FLEETGEO_*`.
    pub fn load() -> ServiceResult<Self> {
        Self::load_from(None)
    }

    /// То же, что [`Settings::load`], но с явным (обязательным) файлом.
    ///
    /// Вложенные ключи в переменных окружения разделяются `__`:
    /// `FLEETGEO_INDEX__SHARDS=128`.
    pub fn load_from(path: Option<&Path>) -> ServiceResult<Self> {
        let file = match path {
            Some(path) => File::from(path).required(true),
            None => File::with_name(DEFAULT_CONFIG_FILE).required(false),
        };

        let cfg = Config::builder()
            .add_source(file)
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("logging.directives"),
            )
            .build()?;

        let settings: Settings = cfg.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Проверяет согласованность значений.
    pub fn validate(&self) -> ServiceResult<()> {
        self.socket_addr()?;

        if !CELL_PRECISION_RANGE.contains(&self.index.cell_precision) {
            return Err(ServiceError::invalid_setting(
                "index.cell_precision",
                format!(
                    "must be in {}..={}, got {}",
                    CELL_PRECISION_RANGE.start(),
                    CELL_PRECISION_RANGE.end(),
                    self.index.cell_precision
                ),
            ));
        }
        if self.index.shards == 0 || self.index.shards > MAX_SHARDS {
            return Err(ServiceError::invalid_setting(
                "index.shards",
                format!("must be in 1..={MAX_SHARDS}, got {}", self.index.shards),
            ));
        }
        if self.index.max_agent_id_len == 0 {
            return Err(ServiceError::invalid_setting(
                "index.max_agent_id_len",
                "must be positive",
            ));
        }
        if !self.query.max_radius_km.is_finite() || self.query.max_radius_km <= 0.0 {
            return Err(ServiceError::invalid_setting(
                "query.max_radius_km",
                "must be a positive number",
            ));
        }
        if self.query.max_limit == 0 {
            return Err(ServiceError::invalid_setting(
                "query.max_limit",
                "must be positive",
            ));
        }
        if self.eviction.enabled {
            if self.eviction.max_age_secs == 0 {
                return Err(ServiceError::invalid_setting(
                    "eviction.max_age_secs",
                    "must be positive when eviction is enabled",
                ));
            }
            if self.eviction.sweep_interval_secs == 0 {
                return Err(ServiceError::invalid_setting(
                    "eviction.sweep_interval_secs",
                    "must be positive when eviction is enabled",
                ));
            }
        }

        self.connection.validate()?;
        self.logging.validate()
    }

    pub fn socket_addr(&self) -> ServiceResult<SocketAddr> {
        self.listen_address.parse().map_err(|e| {
            ServiceError::invalid_setting("listen_address", format!("{e}: {}", self.listen_address))
        })
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            listen_address: DEFAULT_LISTEN_ADDRESS.to_string(),
            index: GeoIndexConfig::default(),
            query: QueryPolicy::default(),
            eviction: EvictionConfig::default(),
            connection: ConnectionConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}
