pub mod catalog;
pub mod guards;
pub mod selector;

pub use catalog::{
    ActivationPredicate, Backoff, ChangeThreshold, CheckSpec, ConcurrencyStrategy, ExpectedExit,
    FilePattern, GateCatalog, GateLevel,
};
pub use selector::{select, select_index, HistoryHint, LevelSelector};
