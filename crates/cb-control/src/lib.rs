//! # cb-control
//!
//! Per-device optimization control for CoolBack.
//!
//! [`DeviceController`] owns a device's history and its Idle/Running/
//! Resetting state machine. [`OptimizationSession`] runs one search strategy
//! on a worker thread with a bounded wait, recording workers that ignore
//! cancellation in a [`ZombieRegistry`]. [`ControlPlan`] is the structural
//! check applied to every site-wide command before it is written.

pub mod controller;
pub mod plan;
pub mod session;
pub mod task;

pub use controller::{ControllerState, DeviceController};
pub use plan::{ControlPlan, PlanMetadata};
pub use session::{OptimizationSession, SessionConfig, ZombieRecord, ZombieRegistry};
pub use task::{TaskHandle, TaskId, TaskInfo};
