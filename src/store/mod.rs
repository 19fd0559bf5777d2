//! Persistence layer: libSQL-backed storage for recipients, emails and series state.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{
    Database, DueEnrollment, EmailRecord, Enrollment, NextStep, Recipient, StepExecution,
    UnsubscribeEvent,
};
