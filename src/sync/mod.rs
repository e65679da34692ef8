pub mod auth;
pub mod batch;
pub mod compression;
pub mod conflict;
pub mod delta;
pub mod events;
pub mod locks;
pub mod merge;
pub mod orchestrator;
pub mod queue;
pub mod registry;
pub mod retry;
pub mod scheduler;

pub use auth::{AuthState, TokenManager};
pub use batch::{BatchOptimizer, BatchPlan, BatchStrategy};
pub use compression::{Algorithm, CompressedPayload, CompressionPriority, Compressor};
pub use conflict::{ConflictEngine, ConflictHistory, ConflictKind, Resolution, SyncConflict};
pub use delta::{DeltaCalculator, DeltaPatch};
pub use events::{EventBus, EventSubscription, SyncEvent};
pub use locks::{RecordGuard, RecordLocks};
pub use orchestrator::{OrchestratorConfig, SyncOrchestrator};
pub use queue::{DeadLetter, OperationQueue, QueueEntry};
pub use registry::{EntityRegistry, LocalEntry, LocalStore};
pub use retry::{RetryPolicy, Transition};
pub use scheduler::{MemoryPressure, NetworkCondition, SchedulerConfig, SmartScheduler, SystemConditions};
