//! Clip-generation jobs: the backend client, the registry of watched and
//! finished jobs, and the polling loops that connect them.

pub mod backend;
pub mod poller;
pub mod registry;

pub use backend::{HttpJobBackend, JobBackend};
pub use poller::{JobPoller, PollOutcome, PollState};
pub use registry::JobRegistry;
