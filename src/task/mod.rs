//! Task definitions and the read-only task store.

pub mod selector;
pub mod store;
pub mod types;

pub use selector::TaskSelector;
pub use store::TaskStore;
pub use types::{
    Expectation, FileTree, HarnessSpec, PatternCheckSpec, PolicyKind, Sanitizer, ScoringSpec,
    StrategyKind, Task, TaskManifest, DEFAULT_PASS_MARKER,
};
