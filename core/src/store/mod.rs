// Store module: persistence and outbound queueing

pub mod backend;
pub mod keys;
pub mod log;
pub mod outbox;
pub mod settings;

pub use backend::{MemoryStorage, SledStorage, StorageBackend};
pub use keys::KeyStore;
pub use log::{LogEntry, PeripheralLog};
pub use outbox::{Outbox, OutboxEntry};
pub use settings::{SettingDescriptor, SettingEntry, SettingsStore, SETTINGS_CATALOGUE};
