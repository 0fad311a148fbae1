//! The five turn stages, in execution order.

pub mod acquire_lock;
pub mod check_context;
pub mod finalize;
pub mod inject_context;
pub mod stream_response;

pub use acquire_lock::AcquireLockStage;
pub use check_context::CheckContextInjectionStage;
pub use finalize::FinalizeStage;
pub use inject_context::InjectContextStage;
pub use stream_response::StreamResponseStage;

use super::stage::Stage;

/// Default stage order for a turn.
pub fn default_stages() -> Vec<Box<dyn Stage>> {
    vec![
        Box::new(AcquireLockStage),
        Box::new(CheckContextInjectionStage),
        Box::new(InjectContextStage),
        Box::new(StreamResponseStage),
        Box::new(FinalizeStage),
    ]
}
