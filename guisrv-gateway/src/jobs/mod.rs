//! Deployment jobs and the status registry

pub mod change_sets;
pub mod job;
pub mod registry;

pub use job::{
    ChangeStatus, ErrorKind, Job, JobChange, JobDetail, JobError, JobId, JobState, JobSummary,
    NewJob, SessionId,
};
pub use change_sets::{ChangeSetStore, IssuedToken};
pub use registry::{ClaimedJob, RegistryError, StatusRegistry, WatcherId};
