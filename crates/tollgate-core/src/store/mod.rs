//! Run history persistence.

pub mod history;
pub mod schema;

pub use history::{
    CheckStats, HistoryRecorder, HistoryStore, MemoryHistoryStore, SqliteHistoryStore,
};
