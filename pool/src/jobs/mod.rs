//! Job lifecycle: identity, validity window and duplicate-submission tracking

pub mod job;
pub mod manager;

pub use job::Job;
pub use manager::{JobManager, NextJob};
