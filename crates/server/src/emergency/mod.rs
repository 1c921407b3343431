//! Emergency broadcasting: lifecycle, delivery tracking, acknowledgments,
//! escalation and forced resends.

pub mod acknowledgments;
pub mod controller;
pub mod dispatcher;
pub mod escalation;
pub mod evaluation;
pub mod profiles;
pub mod resend;
pub mod scheduler;
pub mod state_machine;
pub mod task_manager;
pub mod tracker;
pub mod types;

pub use controller::{AckOutcome, AcknowledgmentRequest, Actor, EmergencyController, InitiateEmergency};
pub use dispatcher::PriorityDispatcher;
pub use evaluation::EvaluationReport;
pub use task_manager::EvaluationTaskManager;
