pub mod engine;
pub mod operation_session;
pub mod target_lock;

pub use engine::{EngineHooks, OperationContext, PatchEngine};
pub use operation_session::{OperationSession, SessionBuilder, SessionState};
pub use target_lock::{TargetGuard, TargetLocks};
