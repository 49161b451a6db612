use std::any::Any;

use thiserror::Error;

use crate::{ErrorExt, StatusCode};

/// Ошибки разбора команд line-протокола.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Empty command")]
    EmptyCommand,

    #[error("Unknown command '{command}'")]
    UnknownCommand { command: String },

    #[error("{command} expects {expected} argument(s), got {actual}")]
    WrongArgCount {
        command: &'static str,
        expected: &'static str,
        actual: usize,
    },

    #[error("{field}: '{value}' is not a valid number")]
    InvalidFloat { field: &'static str, value: String },

    #[error("{field}: '{value}' is not a valid integer")]
    InvalidInteger { field: &'static str, value: String },

    #[error("Unknown option '{option}' for {command}")]
    UnknownOption {
        command: &'static str,
        option: String,
    },

    #[error("Command line exceeds {limit} bytes")]
    LineTooLong { limit: usize },
}

impl ErrorExt for ProtocolError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::EmptyCommand | Self::UnknownCommand { .. } => StatusCode::InvalidCommand,
            Self::WrongArgCount { .. } => StatusCode::WrongArgCount,
            Self::InvalidFloat { .. } => StatusCode::InvalidFloat,
            Self::InvalidInteger { .. } => StatusCode::InvalidInteger,
            Self::UnknownOption { .. } => StatusCode::ParseError,
            Self::LineTooLong { .. } => StatusCode::SizeLimit,
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn metrics_tags(&self) -> Vec<(&'static str, String)> {
        let mut tags = vec![
            ("error_type", "protocol".to_string()),
            ("status_code", self.status_code().to_string()),
        ];
        match self {
            Self::WrongArgCount { command, .. } | Self::UnknownOption { command, .. } => {
                tags.push(("command", command.to_string()));
            }
            Self::InvalidFloat { field, .. } | Self::InvalidInteger { field, .. } => {
                tags.push(("field", field.to_string()));
            }
            _ => {}
        }
        tags
    }
}
