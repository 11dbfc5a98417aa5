pub mod cleanup;
pub mod runner;

pub use cleanup::spawn_cleanup_task;
pub use runner::{
    spawn_workers, JobOutcome, OuterRetryPolicy, PgReceiptStore, ProcessingContext, ReceiptStore,
};
