//! Сетевой слой fleetgeo.
//!
//! ## Подмодули
//!
//! - `protocol`: разбор строковых команд и кодирование ответов.
//! - `connection`: лимиты, таймауты и цикл обработки одного клиента.
//! - `server`: приём соединений и graceful shutdown.

pub mod connection;
pub mod protocol;
pub mod server;

pub use connection::{execute_command, ConnectionConfig, ConnectionManager};
pub use protocol::{Command, Reply};
pub use server::Server;
