//! Task validation.
//!
//! Checks that each task's harness discriminates: the reference patch passes
//! and the unpatched baseline fails.

pub mod task_validator;

pub use task_validator::{
    check_task, CheckResult, TaskValidationResult, TaskValidator, ValidationReport,
};
