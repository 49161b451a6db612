use std::fmt;

use num_enum::TryFromPrimitive;
#[cfg(feature = "serde_repr")]
use serde_repr::{Deserialize_repr, Serialize_repr};
#[cfg(feature = "strum")]
use strum_macros::{AsRefStr, EnumIter};

/// Коды статуса для категоризации ошибок.
///
/// # Диапазоны:
/// - 0xxx: Успех
/// - 1xxx: Общие ошибки
/// - 2xxx: Ошибки входных данных (координаты, идентификаторы, запросы)
/// - 4xxx: Ограничения (лимиты соединений)
/// - 6xxx: Сеть / IO
/// - 8xxx: Протокольные ошибки
/// - 9xxx: Конфигурация
///
/// # Реализация:
/// - `num_enum::TryFromPrimitive` даёт нативную реализацию `TryFrom<u32>`
///   (полезно для wire-protocol).
/// - опционально: `strum` для `AsRefStr`/`EnumIter` (feature = "strum").
/// - опционально: `serde_repr` для сериализации в виде числового значения
///   (feature = "serde_repr").
#[cfg_attr(feature = "strum", derive(AsRefStr, EnumIter))]
#[cfg_attr(feature = "serde_repr", derive(Serialize_repr, Deserialize_repr))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u32)]
#[non_exhaustive]
pub enum StatusCode {
    // === 0xxx: Успех ===
    Success = 0,

    // === 1xxx: Общие ошибки ===
    Unknown = 1000,
    Unsupported = 1001,
    Unexpected = 1002,
    Internal = 1003,
    InvalidArgs = 1004,
    NotImplemented = 1005,

    // === 2xxx: Ошибки входных данных ===
    NotFound = 2000,
    InvalidCoordinate = 2001,
    InvalidIdentifier = 2002,
    InvalidQuery = 2003,

    // === 4xxx: Ограничения ===
    RateLimited = 4000,
    TooManyConnections = 4001,

    // === 6xxx: Сеть/IO ===
    Io = 6000,
    ConnectionClosed = 6001,
    Timeout = 6002,
    ReadTimeout = 6003,
    WriteTimeout = 6004,

    // === 8xxx: Протокол ===
    InvalidCommand = 8000,
    WrongArgCount = 8001,
    InvalidInteger = 8002,
    InvalidFloat = 8003,
    SizeLimit = 8004,
    ParseError = 8005,

    // === 9xxx: Конфигурация ===
    InvalidConfig = 9000,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

////////////////////////////////////////////////////////////////////////////////
// Собственные методы
////////////////////////////////////////////////////////////////////////////////

impl StatusCode {
    /// Числовое представление кода статуса.
    pub const fn code(self) -> u32 {
        self as u32
    }

    /// Пытается получить вариант `StatusCode` из `u32`.
    ///
    /// Использует `TryFrom<u32>` из `num_enum`; возвращает `None`, если
    /// значение не соответствует ни одному варианту.
    pub fn from_u32(v: u32) -> Option<Self> {
        Self::try_from(v).ok()
    }

    /// Возвращает `true`, если операцию с этим кодом имеет смысл повторить.
    ///
    /// Ошибки валидации (2xxx) никогда не повторяются: ядро не выполняет IO,
    /// и повтор с теми же аргументами даст тот же результат.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout
                | Self::ReadTimeout
                | Self::WriteTimeout
                | Self::RateLimited
                | Self::TooManyConnections
        )
    }

    /// Рекомендуемый уровень логирования для данного кода.
    pub fn log_level(&self) -> LogLevel {
        match self {
            Self::Success => LogLevel::Trace,
            Self::NotFound
            | Self::InvalidArgs
            | Self::InvalidCoordinate
            | Self::InvalidIdentifier
            | Self::InvalidQuery
            | Self::InvalidCommand
            | Self::WrongArgCount
            | Self::InvalidInteger
            | Self::InvalidFloat
            | Self::ParseError => LogLevel::Debug,
            Self::Unsupported | Self::NotImplemented => LogLevel::Info,
            Self::RateLimited
            | Self::TooManyConnections
            | Self::Timeout
            | Self::ReadTimeout
            | Self::WriteTimeout
            | Self::ConnectionClosed
            | Self::SizeLimit => LogLevel::Warn,
            Self::Internal | Self::InvalidConfig => LogLevel::Error,
            _ => LogLevel::Warn,
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Общие реализации трейтов для StatusCode
////////////////////////////////////////////////////////////////////////////////

impl From<StatusCode> for u32 {
    fn from(c: StatusCode) -> Self {
        c.code()
    }
}

impl fmt::Display for StatusCode {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        #[cfg(feature = "strum")]
        {
            write!(f, "{} ({})", self.as_ref(), self.code())
        }
        #[cfg(not(feature = "strum"))]
        {
            write!(f, "{:?} ({})", self, self.code())
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Тесты
////////////////////////////////////////////////////////////////////////////////
