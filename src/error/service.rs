use std::any::Any;

use fleetgeo_error::{ErrorExt, GeoError, ProtocolError, StatusCode};
use thiserror::Error;

/// Ошибки уровня сервиса: конфигурация, логирование, сеть.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid setting '{field}': {reason}")]
    InvalidSetting { field: &'static str, reason: String },

    #[error("Logging setup failed: {0}")]
    Logging(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection rejected: {0}")]
    ConnectionRejected(String),

    #[error("Shutdown timed out with {active} active connection(s)")]
    ShutdownTimeout { active: usize },

    #[error(transparent)]
    Geo(#[from] GeoError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

pub type ServiceResult<T> = Result<T, ServiceError>;

impl ServiceError {
    pub fn invalid_setting(
        field: &'static str,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidSetting {
            field,
            reason: reason.into(),
        }
    }
}

impl ErrorExt for ServiceError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::Config(_) | Self::InvalidSetting { .. } => StatusCode::InvalidConfig,
            Self::Logging(_) => StatusCode::Internal,
            Self::Io(_) => StatusCode::Io,
            Self::ConnectionRejected(_) => StatusCode::TooManyConnections,
            Self::ShutdownTimeout { .. } => StatusCode::Timeout,
            Self::Geo(err) => err.status_code(),
            Self::Protocol(err) => err.status_code(),
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_delegate() {
        let err: ServiceError = GeoError::not_found("d1").into();
        assert_eq!(err.status_code(), StatusCode::NotFound);
        assert_eq!(err.to_string(), "Agent not found: d1");

        let err: ServiceError = ProtocolError::EmptyCommand.into();
        assert_eq!(err.status_code(), StatusCode::InvalidCommand);

        let err = ServiceError::invalid_setting("index.shards", "must be positive");
        assert_eq!(err.status_code(), StatusCode::InvalidConfig);
        assert_eq!(
            err.to_string(),
            "Invalid setting 'index.shards': must be positive"
        );
    }
}
