pub mod settings;

pub use settings::{BurrowConfig, SecretBackend, CONFIG_FILE};
