//! Слой над гео-индексом.
//!
//! - `coordinator`: проверка параметров запросов по политике и вызов индекса.
//! - `eviction`: фоновая очистка агентов без свежих обновлений.

pub mod coordinator;
pub mod eviction;

pub use coordinator::*;
pub use eviction::*;
