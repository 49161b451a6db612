pub mod settings;

pub use settings::{Settings, DEFAULT_CONFIG_FILE, DEFAULT_LISTEN_ADDRESS, ENV_PREFIX};
