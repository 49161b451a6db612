use std::any::Any;

use thiserror::Error;

use crate::{ErrorExt, StatusCode};

/// Ошибки гео-индекса и координатора запросов.
///
/// Все варианты описывают ошибки вызывающей стороны, обнаруживаются синхронно в
/// момент вызова и никогда не повторяются автоматически.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GeoError {
    /// Широта вне [-90, 90] или долгота вне [-180, 180] (включая NaN/inf).
    #[error("Invalid coordinate: latitude {latitude}, longitude {longitude}")]
    InvalidCoordinate { latitude: f64, longitude: f64 },
    /// Пустой или некорректный идентификатор агента.
    #[error("Invalid agent id: {reason}")]
    InvalidIdentifier { reason: String },
    /// Некорректные параметры поиска (радиус и т.п.).
    #[error("Invalid query: {reason}")]
    InvalidQuery { reason: String },
    /// Агент отсутствует в индексе.
    #[error("Agent not found: {agent_id}")]
    NotFound { agent_id: String },
}

impl GeoError {
    pub fn invalid_identifier(reason: impl Into<String>) -> Self {
        Self::InvalidIdentifier {
            reason: reason.into(),
        }
    }

    pub fn invalid_query(reason: impl Into<String>) -> Self {
        Self::InvalidQuery {
            reason: reason.into(),
        }
    }

    pub fn not_found(agent_id: impl Into<String>) -> Self {
        Self::NotFound {
            agent_id: agent_id.into(),
        }
    }
}

impl ErrorExt for GeoError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidCoordinate { .. } => StatusCode::InvalidCoordinate,
            Self::InvalidIdentifier { .. } => StatusCode::InvalidIdentifier,
            Self::InvalidQuery { .. } => StatusCode::InvalidQuery,
            Self::NotFound { .. } => StatusCode::NotFound,
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn metrics_tags(&self) -> Vec<(&'static str, String)> {
        let mut tags = vec![
            ("error_type", "geo".to_string()),
            ("status_code", self.status_code().to_string()),
        ];

        if let Self::InvalidCoordinate {
            latitude,
            longitude,
        } = self
        {
            let axis = if (-90.0..=90.0).contains(latitude) {
                "longitude"
            } else if (-180.0..=180.0).contains(longitude) {
                "latitude"
            } else {
                "both"
            };
            tags.push(("axis", axis.to_string()));
        }

        tags
    }
}
