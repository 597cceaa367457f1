//! partmgr-core: partition and mount state engine for Linux hosts.
//!
//! Discovers block devices and partitions, reports where they are mounted,
//! and performs mount, unmount and swap changes behind a safety gate that
//! protects the root filesystem, active swap and the medium this program
//! runs from.
//!
//! # Modules
//!
//! - [`disk`]: Device enumeration from `lsblk`, with `/proc/partitions` fallback
//! - [`mounts`]: Live mount table, swap table and fstab reconciliation
//! - [`fstab`]: Fstab parsing and device spec resolution
//! - [`capability`]: Filesystem driver and helper detection
//! - [`busy`]: Busy holder detection and termination
//! - [`safety`]: The safety gate
//! - [`orchestrator`]: The mount/unmount state machine
//! - [`options`]: Mount option generation
//! - [`host`]: System boundary traits, with real and in-memory hosts
//! - [`executor`]: Privileged command execution
//! - [`config`]: Engine configuration
//! - [`error`]: Error types
//!
//! # Example
//!
//! ```no_run
//! use partmgr_core::{CancellationToken, Command, Engine, EngineConfig, LinuxHost, PartitionId};
//!
//! let engine = Engine::new(LinuxHost::default(), EngineConfig::default());
//! let command = Command::Unmount {
//!     partition: PartitionId::new("sdc1"),
//!     allow_terminate_busy: false,
//! };
//! let result = engine.execute(&command, &CancellationToken::new()).unwrap();
//! if let Some(failure) = result.outcome.failure() {
//!     eprintln!("{failure}");
//! }
//! ```

pub mod busy;
pub mod cancel;
pub mod capability;
pub mod config;
pub mod disk;
pub mod error;
pub mod executor;
pub mod fstab;
pub mod host;
pub mod mounts;
pub mod options;
pub mod orchestrator;
pub mod safety;

// Re-export commonly used types
pub use busy::{BusyHolder, BusyTarget, HandleKind, HolderScan, TerminationOutcome};
pub use cancel::CancellationToken;
pub use capability::Capability;
pub use config::EngineConfig;
pub use disk::{BlockDevice, DeviceSnapshot, Partition, PartitionId};
pub use error::{Error, Result};
pub use executor::{ExecutionContext, PrivilegeEscalation};
pub use host::{FakeHost, Host, LinuxHost};
pub use mounts::{Discrepancy, MountRecord, MountTable};
pub use options::MountOptions;
pub use orchestrator::{Command, Engine, Failure, OperationResult, Outcome, Phase, SystemSnapshot};
pub use safety::{Verdict, VetoReason};
