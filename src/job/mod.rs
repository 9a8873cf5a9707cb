//! Build jobs: models, the shared job table, the pipeline that drives a job
//! through its stages, and the bounded queue that schedules them.

pub mod executor;
pub mod history;
pub mod models;
pub mod pipeline;
pub mod queue;
pub mod table;

#[cfg(all(test, unix))]
pub(crate) mod testing;
