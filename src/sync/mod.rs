pub mod bundle;
pub mod reload;
pub mod snapshot;
pub mod store;

pub use bundle::ConfigBundle;
pub use reload::{ReloadSignal, Synchronizer};
pub use store::{ConfigStore, ConfigTransport, JsonFileTransport, MemoryTransport};
