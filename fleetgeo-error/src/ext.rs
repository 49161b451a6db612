use std::{any::Any, error::Error};

use crate::StatusCode;

/// Расширение для ошибок fleetgeo (object-safe).
///
/// Транспортный слой не знает конкретных типов ошибок ядра: он получает
/// `&dyn ErrorExt` и по нему строит ответ клиенту, строку для логов и теги
/// для метрик.
pub trait ErrorExt: Error + Send + Sync + 'static {
    /// Протокольный статус.
    ///
    /// По умолчанию возвращает [`StatusCode::Internal`].
    fn status_code(&self) -> StatusCode {
        StatusCode::Internal
    }

    /// Возвращает ошибку как [`Any`](std::any::Any) для downcast.
    fn as_any(&self) -> &dyn Any;

    /// Безопасное сообщение для клиента.
    ///
    /// Для внутренних ошибок возвращает `"Internal server error"`, чтобы не
    /// раскрывать детали реализации.
    fn client_message(&self) -> String {
        match self.status_code() {
            StatusCode::Unknown | StatusCode::Internal | StatusCode::Unexpected => {
                "Internal server error".to_string()
            }
            _ => self.to_string(),
        }
    }

    /// Детализированное сообщение для логов.
    fn log_message(&self) -> String {
        format!("{self:?}")
    }

    /// Строка ответа для line-протокола: `-ERR <code> <message>\r\n`.
    fn wire_reply(&self) -> String {
        let message = self.client_message().replace(['\r', '\n'], " ");
        format!("-ERR {} {}\r\n", self.status_code().code(), message)
    }

    /// Набор тегов для систем наблюдаемости.
    fn metrics_tags(&self) -> Vec<(&'static str, String)> {
        vec![
            ("error_type", self.type_name()),
            ("status_code", self.status_code().to_string()),
        ]
    }

    /// Имя типа ошибки (без пути модулей).
    fn type_name(&self) -> String {
        std::any::type_name::<Self>()
            .split("::")
            .last()
            .unwrap_or("Unknown")
            .to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::{any::Any, error::Error, fmt};

    use super::*;

    // Ошибка без переопределения status_code (default = Internal).
    #[derive(Debug)]
    struct OpaqueError(pub &'static str);

    impl fmt::Display for OpaqueError {
        fn fmt(
            &self,
            f: &mut fmt::Formatter<'_>,
        ) -> fmt::Result {
            write!(f, "bucket state broken: {}", self.0)
        }
    }

    impl Error for OpaqueError {}

    impl ErrorExt for OpaqueError {
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[derive(Debug)]
    struct MissingAgent(pub &'static str);

    impl fmt::Display for MissingAgent {
        fn fmt(
            &self,
            f: &mut fmt::Formatter<'_>,
        ) -> fmt::Result {
            write!(f, "agent {} not found", self.0)
        }
    }

    impl Error for MissingAgent {}

    impl ErrorExt for MissingAgent {
        fn status_code(&self) -> StatusCode {
            StatusCode::NotFound
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    /// Тест проверяет, что по умолчанию статус ошибки `Internal`, а клиент
    /// не видит деталей.
    #[test]
    fn test_default_status_code_hides_details() {
        let e = OpaqueError("cell 9q8yy");
        assert_eq!(e.status_code(), StatusCode::Internal);
        assert_eq!(e.client_message(), "Internal server error");
        assert!(e.log_message().contains("cell 9q8yy"));
    }

    /// Тест проверяет, что для клиентских кодов `client_message` совпадает с
    /// `Display`.
    #[test]
    fn test_client_message_non_internal() {
        let e = MissingAgent("D1");
        assert_eq!(e.client_message(), e.to_string());
    }

    #[test]
    fn test_wire_reply_format() {
        let e = MissingAgent("D1");
        assert_eq!(e.wire_reply(), "-ERR 2000 agent D1 not found\r\n");
    }

    #[test]
    fn test_as_any_downcast() {
        let e = MissingAgent("x");
        let down = e.as_any().downcast_ref::<MissingAgent>();
        assert_eq!(down.map(|d| d.0), Some("x"));
    }

    /// Тест проверяет, что `metrics_tags` содержит `error_type` и
    /// `status_code`.
    #[test]
    fn test_metrics_tags_contains_expected_pairs() {
        let e = MissingAgent("t");
        let tags = e.metrics_tags();
        assert!(tags
            .iter()
            .any(|(k, v)| *k == "error_type" && v == "MissingAgent"));
        assert!(tags
            .iter()
            .any(|(k, v)| *k == "status_code" && v == &StatusCode::NotFound.to_string()));
    }
}
