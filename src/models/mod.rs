pub mod log;

pub use log::{EntryType, FetchResponse, LogEntry};
