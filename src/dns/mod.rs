pub mod listener;
pub mod query;
