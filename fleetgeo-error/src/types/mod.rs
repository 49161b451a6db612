pub mod geo;
pub mod protocol;

// Публичный экспорт всех типов ошибок из вложенных модулей, чтобы упростить
// доступ к ним из внешнего кода.
pub use geo::*;
pub use protocol::*;
