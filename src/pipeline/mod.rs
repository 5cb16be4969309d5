//! Per-job evaluation pipeline.
//!
//! # Pipeline Flow
//!
//! 1. **Plan**: each task is resolved once into a [`TaskPlan`] (strategy,
//!    reference structure, limits, scoring policy). Malformed tasks fail here,
//!    before any job runs.
//! 2. **Prepare**: the candidate's diff is applied to the starting tree and
//!    materialized with the harness files in a fresh working tree. A rejected
//!    patch scores 0.0 and nothing runs.
//! 3. **Verify**: the task's strategy runs against the working tree.
//! 4. **Score**: the verdict is scored under the task's policy.
//! 5. **Persist**: full output and the applied diff go to the blob store.
//!
//! # Example
//!
//! ```rust,ignore
//! use fixbench::pipeline::{Evaluator, TaskPlan};
//!
//! let plan = TaskPlan::new(task, &config)?;
//! let evaluator = Evaluator::new(executor, store, &config);
//! let evaluation = evaluator.evaluate(&plan, Some(&candidate), &cancel).await?;
//! println!("score {}", evaluation.score.value);
//! ```

pub mod evaluator;

pub use evaluator::{AttemptError, Evaluation, Evaluator, TaskPlan};
