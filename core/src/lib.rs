pub mod error;
pub mod plan;
pub mod recovery;
pub mod repair;
pub mod schedule;
pub mod weekdays;
