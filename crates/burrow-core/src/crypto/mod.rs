pub mod cipher;
pub mod key_manager;
pub mod secret_store;

pub use cipher::{DataKey, Sealed};
pub use key_manager::{KeyManager, DEFAULT_SECRET_NAME};
pub use secret_store::{FileSecretStore, KeyringSecretStore, MemorySecretStore, SecretStore};
