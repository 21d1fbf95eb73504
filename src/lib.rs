//! greplens: a local code-intelligence indexer.
//!
//! Watches a source tree, parses files into symbols, references, and trigram
//! postings, and serves grep-like and symbol-aware queries while indexing
//! continues. The architecture is a map/reduce pipeline (parallel processors,
//! one integrator) over copy-on-write snapshots and per-index-type locks, so
//! the read path stays lock-free beyond a bounded-timeout lease.

pub mod cancel;
pub mod config;
pub mod coordinate;
pub mod error;
pub mod index;
pub mod logging;
pub mod master;
pub mod parse;
pub mod pipeline;
pub mod scan;
pub mod search;
pub mod store;
pub mod watch;

pub use cancel::CancelToken;
pub use config::{Config, PriorityMode};
pub use coordinate::{
    IndexCoordinator, IndexType, OperationPriority, OperationQueue, OperationsManager,
    QueueProcessor, QueuedOperation,
};
pub use error::CoordinationError;
pub use index::{DeletedFileTracker, FileSnapshot, IndexSet, TrigramIndex};
pub use master::{HealthReport, HealthStatus, IndexStats, MasterIndex};
pub use parse::{Language, Parser, ParserPool, ScopeInfo, Symbol, SymbolKind};
pub use pipeline::{FileIntegrator, FileProcessor, IndexingProgress, ProgressTracker};
pub use scan::{FileScanner, FileTask, TaskPriority};
pub use search::{SearchMatch, SearchOptions, Searcher};
pub use store::{FileId, FileService};
pub use watch::{EventDebouncer, FileWatcher, WatchBatch, WatchKind};
