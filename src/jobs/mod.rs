pub mod coordinator;
pub mod queue;
pub mod state;
pub mod store;

pub use coordinator::{JobCoordinator, PipelineServices};
pub use queue::{Task, TaskQueue};
pub use state::{JobStatus, PageStatus};
pub use store::{JobRecord, JobStore, NewJob, PageRecord};
