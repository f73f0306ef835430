//! Repository implementations for database operations.

mod job_repo;
mod queue_repo;

pub use job_repo::JobRepository;
pub use queue_repo::QueueRepository;
