//! streamkeep core: tracks live-media sources, records them while live,
//! compresses finished recordings, merges compressed fragments every half
//! hour, reclaims disk space on demand, and stops the process when the
//! storage volume fills up.
//!
//! The crate is organised around one long-lived task per tracked entity
//! ([`poller::AvailabilityPoller`]), a process-wide
//! [`merge::MergeScheduler`], a bounded [`compression::CompressionWorker`]
//! pool, and the [`watchdog::DiskSpaceWatchdog`]. [`runtime::RecorderRuntime`]
//! wires them together and exposes the management operations.

pub mod activity;
pub mod artifact;
pub mod compression;
pub mod config;
pub mod error;
pub mod instance;
pub mod locks;
pub mod merge;
pub mod poller;
pub mod recording;
pub mod registry;
pub mod retention;
pub mod runtime;
pub mod status;
pub mod tool;
pub mod watchdog;

pub use activity::ActivityGate;
pub use artifact::{ArtifactKind, ArtifactLayout};
pub use config::RecorderConfig;
pub use error::{CaptureError, Result};
pub use instance::InstanceLock;
pub use registry::{EntityRegistry, TrackedEntity};
pub use runtime::{RecorderRuntime, RuntimeDeps};
