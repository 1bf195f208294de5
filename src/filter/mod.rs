pub mod categories;
pub mod engine;
pub mod matcher;
pub mod quiet_hours;
pub mod time_budget;
