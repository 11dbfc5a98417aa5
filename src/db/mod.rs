pub mod jobs;
pub mod pool;
pub mod queries;

pub use pool::create_pool;
