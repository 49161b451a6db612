pub mod service;

pub use service::{ServiceError, ServiceResult};
