//! Clock-aligned merging of compressed artifacts.
//!
//! At every `:00` and `:30` UTC boundary the [`MergeScheduler`] scans each
//! entity directory, appends compressed artifacts older than the merge age
//! to the entity's manifest, and runs one [`MergeJob`] per directory to
//! concatenate them, render a thumbnail, and prune the consumed sources.

pub mod job;
pub mod manifest;
pub mod scheduler;
pub mod window;

pub use job::{MergeJob, MergeReport};
pub use scheduler::{MergeScheduler, WindowReport};
pub use window::next_window_after;
