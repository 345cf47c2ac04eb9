// =============================================================================
// Scheduler Module
// =============================================================================
//
// The control loop of the pipeline:
// - Per-task durable state with eligibility and jittered backoff (task.rs)
// - The single-authority dispatch loop with bounded per-tier worker pools
//   (engine.rs)

pub mod engine;
pub mod task;

pub use engine::{Scheduler, SchedulerConfig, TaskSnapshot, TierSpec};
pub use task::{TaskState, TaskStatus};
