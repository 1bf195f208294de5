pub mod blocked_entry;
pub mod device;
pub mod time_limit;

pub use blocked_entry::BlockedEntry;
pub use device::Device;
pub use time_limit::{QuietHours, TimeLimit};
