//! Background polling jobs: checkers turn external state into triggers,
//! triggers turn into freshly launched, bridged sessions.

pub mod checkers;
pub mod scheduler;
pub mod store;
pub mod types;

pub use checkers::{CheckerRegistry, TriggerChecker};
pub use scheduler::CronScheduler;
pub use store::CronStore;
