pub mod locks;
pub mod operations;
pub mod queue;

pub use locks::{IndexCoordinator, IndexStatus, IndexType, LockManager, ReleaseHandle};
pub use operations::{
    default_max_concurrent_ops, ActiveOperation, OperationInfo, OperationKind, OperationStatus,
    OperationsManager, DEFAULT_OPERATION_TIMEOUT, MAX_OPERATIONS_PER_INDEX_TYPE,
};
pub use queue::{
    OperationPriority, OperationQueue, QueueFullBehavior, QueueProcessor, QueuedOperation,
    STALENESS_THRESHOLD,
};
