//! Mount/unmount orchestration.
//!
//! [`Engine::execute`] runs every state-changing command through the same
//! state machine:
//!
//! ```text
//! Idle -> Validating -> (BusyCheck) -> Executing -> Verifying -> Done | Failed
//! ```
//!
//! Ground truth is re-read at `Validating` and again at `Verifying`; nothing
//! is cached between commands. Refusals and failed operations are returned as
//! [`Outcome::Failed`] values with structured context. `execute` only returns
//! `Err` when the system state itself cannot be read.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::busy::{self, BusyHolder, BusyTarget, HolderScan, SignalEscalation, TerminationOutcome};
use crate::cancel::CancellationToken;
use crate::capability::{self, Capability};
use crate::config::EngineConfig;
use crate::disk::{self, DeviceSnapshot, Partition, PartitionId};
use crate::error::{Error, Result};
use crate::host::Host;
use crate::mounts::{self, Discrepancy, MountRecord, MountTable};
use crate::options::{self, MountOptions};
use crate::safety::{self, GateContext, Operation, VetoReason, Verdict};

/// Reason reported when the post-operation state does not match the request.
pub const STATE_NOT_CONFIRMED: &str = "state not confirmed";

/// A request from the UI or CLI layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    /// Refresh and return the current snapshot.
    List,
    Mount {
        partition: PartitionId,
        options: MountOptions,
    },
    Unmount {
        partition: PartitionId,
        /// Permits terminating processes that keep the partition busy.
        allow_terminate_busy: bool,
    },
    ToggleSwap {
        partition: PartitionId,
        enable: bool,
    },
}

impl Command {
    pub fn partition(&self) -> Option<&PartitionId> {
        match self {
            Self::List => None,
            Self::Mount { partition, .. }
            | Self::Unmount { partition, .. }
            | Self::ToggleSwap { partition, .. } => Some(partition),
        }
    }
}

/// State machine phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Validating,
    BusyCheck,
    Executing,
    Verifying,
    Done,
    Failed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Validating => "validating",
            Self::BusyCheck => "busy-check",
            Self::Executing => "executing",
            Self::Verifying => "verifying",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Why a command did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Failure {
    UnknownPartition {
        partition: PartitionId,
    },
    VetoedBySafety {
        partition: PartitionId,
        reason: VetoReason,
    },
    /// Processes keep the partition busy and were not (or could not be) cleared.
    BusyUnresolved {
        partition: PartitionId,
        holders: Vec<BusyHolder>,
    },
    /// The busy holders include this process or init.
    HolderProtected {
        partition: PartitionId,
        holders: Vec<BusyHolder>,
    },
    MissingDependency {
        partition: PartitionId,
        helper: String,
    },
    OperationFailed {
        partition: PartitionId,
        reason: String,
    },
    /// Cancelled before any privileged call was issued.
    Cancelled {
        partition: PartitionId,
        phase: Phase,
    },
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownPartition { partition } => write!(f, "unknown partition {}", partition),
            Self::VetoedBySafety { partition, reason } => {
                write!(f, "{}: refused, {}", partition, reason)
            }
            Self::BusyUnresolved { partition, holders } => {
                write!(f, "{}: busy", partition)?;
                for holder in holders {
                    write!(f, "\n  {} ({}) {} {}", holder.pid, holder.name, holder.handle, holder.path.display())?;
                }
                Ok(())
            }
            Self::HolderProtected { partition, holders } => {
                let pids: Vec<String> = holders.iter().map(|h| h.pid.to_string()).collect();
                write!(f, "{}: held by protected process {}", partition, pids.join(", "))
            }
            Self::MissingDependency { partition, helper } => {
                write!(f, "{}: missing helper {}", partition, helper)
            }
            Self::OperationFailed { partition, reason } => write!(f, "{}: {}", partition, reason),
            Self::Cancelled { partition, phase } => {
                write!(f, "{}: cancelled during {}", partition, phase)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "failure", rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failed(Failure),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    pub fn failure(&self) -> Option<&Failure> {
        match self {
            Self::Success => None,
            Self::Failed(failure) => Some(failure),
        }
    }
}

/// Devices and mount state read together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SystemSnapshot {
    pub devices: DeviceSnapshot,
    pub mounts: MountTable,
}

impl SystemSnapshot {
    pub fn partition(&self, id: &PartitionId) -> Option<&Partition> {
        self.devices.find_partition(id)
    }

    pub fn mount_state_of(&self, id: &PartitionId) -> Option<&MountRecord> {
        self.mounts.mount_state_of(id)
    }
}

/// What happened, plus the state read after it happened.
#[derive(Debug, Clone, Serialize)]
pub struct OperationResult {
    pub outcome: Outcome,
    pub snapshot: SystemSnapshot,
    pub warnings: Vec<Discrepancy>,
    /// Phases visited, in order.
    pub transitions: Vec<Phase>,
    pub terminations: Vec<(u32, TerminationOutcome)>,
}

/// Bookkeeping for one command.
struct Run {
    partition: PartitionId,
    transitions: Vec<Phase>,
    terminations: Vec<(u32, TerminationOutcome)>,
}

impl Run {
    fn new(partition: PartitionId) -> Self {
        Self {
            partition,
            transitions: vec![Phase::Idle],
            terminations: Vec::new(),
        }
    }

    fn enter(&mut self, phase: Phase) {
        debug!(partition = %self.partition, %phase, "state transition");
        self.transitions.push(phase);
    }

    fn fail(&self, failure: Failure) -> Outcome {
        Outcome::Failed(failure)
    }

    fn operation_failed(&self, reason: impl Into<String>) -> Outcome {
        self.fail(Failure::OperationFailed {
            partition: self.partition.clone(),
            reason: reason.into(),
        })
    }

    fn cancelled_if(&self, token: &CancellationToken, phase: Phase) -> Option<Outcome> {
        token.is_cancelled().then(|| {
            info!(partition = %self.partition, %phase, "cancelled");
            self.fail(Failure::Cancelled {
                partition: self.partition.clone(),
                phase,
            })
        })
    }
}

/// Describes a failed privileged call, keeping the underlying error text.
fn describe(err: &Error) -> String {
    match err {
        Error::AuthenticationCancelled => "authorization denied".to_string(),
        other => other.to_string(),
    }
}

/// The partition and mount state engine.
pub struct Engine<H: Host> {
    host: H,
    config: EngineConfig,
    locks: Mutex<HashMap<PartitionId, Arc<Mutex<()>>>>,
}

impl<H: Host> Engine<H> {
    pub fn new(host: H, config: EngineConfig) -> Self {
        Self {
            host,
            config,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn list_devices(&self) -> Result<DeviceSnapshot> {
        disk::list_devices(&self.host, &self.config)
    }

    /// Reads devices and mount state afresh.
    pub fn snapshot(&self) -> Result<SystemSnapshot> {
        let devices = self.list_devices()?;
        let mounts = mounts::read_mount_table(&self.host, &self.config, &devices)?;
        Ok(SystemSnapshot { devices, mounts })
    }

    pub fn current_mounts(&self) -> Result<Vec<MountRecord>> {
        Ok(self.snapshot()?.mounts.current_mounts().to_vec())
    }

    pub fn mount_state_of(&self, partition: &PartitionId) -> Result<Option<MountRecord>> {
        Ok(self.snapshot()?.mount_state_of(partition).cloned())
    }

    pub fn can_mount(&self, fstype: &str) -> Capability {
        capability::can_mount(&self.host, &self.config, fstype)
    }

    pub fn find_holders(&self, targets: &[BusyTarget]) -> Result<Vec<BusyHolder>> {
        busy::find_holders(&self.host, targets)
    }

    /// Like [`Engine::find_holders`], also reporting processes that could not be inspected.
    pub fn scan_holders(&self, targets: &[BusyTarget]) -> Result<HolderScan> {
        busy::scan_holders(&self.host, targets)
    }

    pub fn terminate(&self, holders: &[BusyHolder]) -> Vec<(u32, TerminationOutcome)> {
        let escalation = SignalEscalation::new(self.config.grace_period(), self.config.poll_interval());
        busy::terminate(&self.host, holders, escalation)
    }

    fn partition_lock(&self, partition: &PartitionId) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(partition.clone()).or_default().clone()
    }

    /// Drops locks nobody holds or waits on.
    fn prune_locks(&self) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    /// The kernel name of `partition`, so aliases of one partition share a lock.
    fn canonical_id(&self, partition: &PartitionId) -> PartitionId {
        match self.list_devices() {
            Ok(devices) => devices
                .find_partition(partition)
                .map(Partition::id)
                .unwrap_or_else(|| partition.clone()),
            Err(e) => {
                debug!(%partition, error = %e, "cannot resolve partition for locking");
                partition.clone()
            }
        }
    }

    /// Runs `command` to completion and reports the verified result.
    ///
    /// Commands on the same partition are serialized; commands on different
    /// partitions may run concurrently.
    pub fn execute(&self, command: &Command, token: &CancellationToken) -> Result<OperationResult> {
        let Some(partition) = command.partition() else {
            let snapshot = self.snapshot()?;
            return Ok(OperationResult {
                outcome: Outcome::Success,
                warnings: snapshot.mounts.warnings().to_vec(),
                snapshot,
                transitions: vec![Phase::Idle, Phase::Done],
                terminations: Vec::new(),
            });
        };

        let partition = self.canonical_id(partition);
        let lock = self.partition_lock(&partition);
        let result = {
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
            self.execute_locked(command, &partition, token)
        };
        drop(lock);
        self.prune_locks();
        result
    }

    fn execute_locked(
        &self,
        command: &Command,
        partition: &PartitionId,
        token: &CancellationToken,
    ) -> Result<OperationResult> {
        let mut run = Run::new(partition.clone());
        let outcome = match command {
            Command::Mount { options, .. } => self.run_mount(&mut run, options, token)?,
            Command::Unmount {
                allow_terminate_busy, ..
            } => self.run_unmount(&mut run, *allow_terminate_busy, token)?,
            Command::ToggleSwap { enable, .. } => self.run_swap(&mut run, *enable, token)?,
            Command::List => Outcome::Success,
        };

        match &outcome {
            Outcome::Success => {
                run.enter(Phase::Done);
                info!(%partition, "operation complete");
            }
            Outcome::Failed(failure) => {
                run.enter(Phase::Failed);
                warn!(%partition, %failure, "operation failed");
            }
        }

        let snapshot = self.snapshot()?;
        Ok(OperationResult {
            outcome,
            warnings: snapshot.mounts.warnings().to_vec(),
            snapshot,
            transitions: run.transitions,
            terminations: run.terminations,
        })
    }

    /// Evaluates the safety gate against a snapshot taken just before the decision.
    fn gate(&self, operation: Operation, snapshot: &SystemSnapshot, partition: &Partition) -> Verdict {
        let id = partition.id();
        let self_partition = self
            .host
            .self_exe_devnum()
            .and_then(|devnum| snapshot.devices.find_by_devnum(devnum))
            .map(Partition::id);
        let removable = snapshot.devices.disk_of(partition).and_then(|d| d.removable);
        let ctx = GateContext {
            partition: &id,
            root_partition: snapshot.mounts.root_partition(),
            swap_active: snapshot.mounts.is_swap_active(&id),
            self_partition: self_partition.as_ref(),
            removable,
        };
        let verdict = safety::evaluate(operation, &ctx);
        debug!(partition = %id, ?operation, ?verdict, "safety gate");
        verdict
    }

    /// Validating: fresh snapshot, partition lookup and safety gate.
    fn validate(
        &self,
        run: &mut Run,
        operation: Operation,
        token: &CancellationToken,
    ) -> Result<std::result::Result<(SystemSnapshot, Partition), Outcome>> {
        run.enter(Phase::Validating);
        if let Some(cancelled) = run.cancelled_if(token, Phase::Validating) {
            return Ok(Err(cancelled));
        }

        let snapshot = self.snapshot()?;
        let Some(partition) = snapshot.partition(&run.partition).cloned() else {
            return Ok(Err(run.fail(Failure::UnknownPartition {
                partition: run.partition.clone(),
            })));
        };
        if let Verdict::Vetoed(reason) = self.gate(operation, &snapshot, &partition) {
            warn!(partition = %run.partition, %reason, "vetoed by safety gate");
            return Ok(Err(run.fail(Failure::VetoedBySafety {
                partition: run.partition.clone(),
                reason,
            })));
        }
        Ok(Ok((snapshot, partition)))
    }

    /// Verifying: re-reads state and checks the post-condition.
    fn verify(&self, run: &mut Run, confirmed: impl FnOnce(&SystemSnapshot) -> bool) -> Outcome {
        run.enter(Phase::Verifying);
        match self.snapshot() {
            Ok(after) if confirmed(&after) => Outcome::Success,
            Ok(_) => {
                error!(partition = %run.partition, "post-condition not met after successful call");
                run.operation_failed(STATE_NOT_CONFIRMED)
            }
            Err(e) => run.operation_failed(format!("{}: {}", STATE_NOT_CONFIRMED, e)),
        }
    }

    fn run_mount(&self, run: &mut Run, request: &MountOptions, token: &CancellationToken) -> Result<Outcome> {
        let (snapshot, partition) = match self.validate(run, Operation::Mount, token)? {
            Ok(checked) => checked,
            Err(outcome) => return Ok(outcome),
        };

        if let Some(record) = snapshot.mount_state_of(&run.partition) {
            return Ok(run.operation_failed(format!("already mounted at {}", record.mountpoint.display())));
        }
        let Some(fstype) = partition.fstype.as_deref() else {
            return Ok(run.operation_failed("unknown filesystem type"));
        };

        let capability = self.can_mount(fstype);
        if let Some(helper) = capability.missing_helper() {
            warn!(partition = %run.partition, fstype, helper, "mount helper not installed");
            return Ok(run.fail(Failure::MissingDependency {
                partition: run.partition.clone(),
                helper: helper.to_string(),
            }));
        }
        let Some(driver) = capability.driver() else {
            return Ok(run.operation_failed(format!("unsupported filesystem {}", fstype)));
        };

        let target: PathBuf = request
            .target
            .clone()
            .unwrap_or_else(|| options::default_mount_point(&self.config.mount_base, &partition));
        if let Some(occupant) = snapshot.mounts.by_mountpoint(&target) {
            return Ok(run.operation_failed(format!(
                "{} is already in use by {}",
                target.display(),
                occupant.partition
            )));
        }
        let (uid, gid) = options::invoking_ids();
        let mount_options = options::build_mount_options(fstype, request, uid, gid);

        if let Some(cancelled) = run.cancelled_if(token, Phase::Validating) {
            return Ok(cancelled);
        }

        run.enter(Phase::Executing);
        info!(
            partition = %run.partition,
            target = %target.display(),
            driver,
            options = %mount_options.join(","),
            "mounting"
        );
        let created = match self.host.create_mount_point(&target) {
            Ok(created) => created,
            Err(e) => {
                error!(partition = %run.partition, error = %e, "cannot create mountpoint");
                return Ok(run.operation_failed(describe(&e)));
            }
        };
        if let Err(e) = self.host.mount(&partition.path, &target, driver, &mount_options) {
            error!(partition = %run.partition, error = %e, "mount failed");
            if created && let Err(cleanup) = self.host.remove_mount_point(&target) {
                warn!(target = %target.display(), error = %cleanup, "cannot remove mountpoint");
            }
            return Ok(run.operation_failed(describe(&e)));
        }

        let id = run.partition.clone();
        Ok(self.verify(run, |after| {
            after.mount_state_of(&id).is_some_and(|r| r.mountpoint == target)
        }))
    }

    fn run_unmount(&self, run: &mut Run, allow_terminate_busy: bool, token: &CancellationToken) -> Result<Outcome> {
        let mut terminated = false;

        loop {
            let (snapshot, partition) = match self.validate(run, Operation::Unmount, token)? {
                Ok(checked) => checked,
                Err(outcome) => return Ok(outcome),
            };
            let mountpoints = snapshot.mounts.mountpoints_of(&run.partition);
            if mountpoints.is_empty() {
                return Ok(run.operation_failed("not mounted"));
            }

            run.enter(Phase::BusyCheck);
            let mut targets = vec![BusyTarget::Device(partition.path.clone())];
            targets.extend(mountpoints.iter().cloned().map(BusyTarget::Mountpoint));
            let HolderScan { holders, uninspected } = match self.scan_holders(&targets) {
                Ok(scan) => scan,
                Err(e) => {
                    return Ok(run.operation_failed(format!("cannot inspect processes: {}", e)));
                }
            };

            if !holders.is_empty() {
                if !allow_terminate_busy || terminated {
                    warn!(partition = %run.partition, count = holders.len(), terminated, "partition busy");
                    return Ok(run.fail(Failure::BusyUnresolved {
                        partition: run.partition.clone(),
                        holders,
                    }));
                }

                let self_pid = self.host.current_pid();
                let protected: Vec<BusyHolder> = holders
                    .iter()
                    .filter(|h| busy::is_protected(h.pid, self_pid))
                    .cloned()
                    .collect();
                if !protected.is_empty() {
                    return Ok(run.fail(Failure::HolderProtected {
                        partition: run.partition.clone(),
                        holders: protected,
                    }));
                }
                if let Some(cancelled) = run.cancelled_if(token, Phase::BusyCheck) {
                    return Ok(cancelled);
                }

                info!(partition = %run.partition, count = holders.len(), "terminating busy holders");
                let outcomes = self.terminate(&holders);
                run.terminations.extend(outcomes);
                terminated = true;
                continue;
            }
            if !uninspected.is_empty() {
                warn!(
                    partition = %run.partition,
                    count = uninspected.len(),
                    "busy check incomplete, some processes could not be inspected"
                );
            }

            if let Some(cancelled) = run.cancelled_if(token, Phase::BusyCheck) {
                return Ok(cancelled);
            }

            run.enter(Phase::Executing);
            for mountpoint in &mountpoints {
                info!(partition = %run.partition, mountpoint = %mountpoint.display(), "unmounting");
                if let Err(e) = self.host.unmount(mountpoint) {
                    error!(partition = %run.partition, error = %e, "unmount failed");
                    let mut reason = describe(&e);
                    if !uninspected.is_empty() {
                        reason.push_str(&format!(
                            " ({} processes could not be inspected for open handles)",
                            uninspected.len()
                        ));
                    }
                    return Ok(run.operation_failed(reason));
                }
            }

            let id = run.partition.clone();
            return Ok(self.verify(run, |after| after.mount_state_of(&id).is_none()));
        }
    }

    fn run_swap(&self, run: &mut Run, enable: bool, token: &CancellationToken) -> Result<Outcome> {
        let operation = if enable { Operation::SwapOn } else { Operation::SwapOff };
        let (snapshot, partition) = match self.validate(run, operation, token)? {
            Ok(checked) => checked,
            Err(outcome) => return Ok(outcome),
        };

        if !partition.is_swap() {
            return Ok(run.operation_failed(format!(
                "not a swap partition ({})",
                partition.fstype_label()
            )));
        }
        let active = snapshot.mounts.is_swap_active(&run.partition);
        if active == enable {
            let state = if active { "already active" } else { "not active" };
            return Ok(run.operation_failed(format!("swap {}", state)));
        }

        if let Some(cancelled) = run.cancelled_if(token, Phase::Validating) {
            return Ok(cancelled);
        }

        run.enter(Phase::Executing);
        info!(partition = %run.partition, enable, "toggling swap");
        let executed = if enable {
            self.host.swap_on(&partition.path)
        } else {
            self.host.swap_off(&partition.path)
        };
        if let Err(e) = executed {
            error!(partition = %run.partition, error = %e, "swap toggle failed");
            return Ok(run.operation_failed(describe(&e)));
        }

        let id = run.partition.clone();
        Ok(self.verify(run, |after| after.mounts.is_swap_active(&id) == enable))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::FakeHost;
    use std::time::Duration;

    fn engine() -> Engine<FakeHost> {
        let host = FakeHost::new();
        host.add_disk("sda", Some(false));
        host.add_partition("sda", "sda1", Some("ext4"));
        host.add_partition("sda", "sda2", Some("ext4"));
        host.add_mount("/dev/sda1", "/", "ext4");
        let config = EngineConfig::default().with_grace_period(Duration::from_millis(20));
        Engine::new(host, config)
    }

    #[test]
    fn test_list_visits_no_intermediate_phases() {
        let engine = engine();
        let result = engine.execute(&Command::List, &CancellationToken::new()).unwrap();
        assert!(result.outcome.is_success());
        assert_eq!(result.transitions, vec![Phase::Idle, Phase::Done]);
        assert_eq!(result.snapshot.devices.partitions().count(), 2);
    }

    #[test]
    fn test_mount_transitions() {
        let engine = engine();
        let command = Command::Mount {
            partition: PartitionId::new("sda2"),
            options: MountOptions::new().with_target("/mnt/data"),
        };
        let result = engine.execute(&command, &CancellationToken::new()).unwrap();

        assert_eq!(result.outcome, Outcome::Success);
        assert_eq!(
            result.transitions,
            vec![Phase::Idle, Phase::Validating, Phase::Executing, Phase::Verifying, Phase::Done]
        );
        assert_eq!(
            result.snapshot.mount_state_of(&PartitionId::new("sda2")).unwrap().mountpoint,
            PathBuf::from("/mnt/data")
        );
    }

    #[test]
    fn test_unknown_partition() {
        let engine = engine();
        let command = Command::Unmount {
            partition: PartitionId::new("nvme9n1p9"),
            allow_terminate_busy: false,
        };
        let result = engine.execute(&command, &CancellationToken::new()).unwrap();
        assert!(matches!(
            result.outcome.failure(),
            Some(Failure::UnknownPartition { .. })
        ));
        assert_eq!(result.transitions.last(), Some(&Phase::Failed));
    }

    #[test]
    fn test_mount_already_mounted() {
        let engine = engine();
        engine.host().add_mount("/dev/sda2", "/srv", "ext4");
        let command = Command::Mount {
            partition: PartitionId::new("sda2"),
            options: MountOptions::new(),
        };
        let result = engine.execute(&command, &CancellationToken::new()).unwrap();
        assert_eq!(
            result.outcome.failure().map(ToString::to_string),
            Some("/dev/sda2: already mounted at /srv".to_string())
        );
        assert!(engine.host().operations().is_empty());
    }

    #[test]
    fn test_authorization_denied_reason() {
        assert_eq!(describe(&Error::AuthenticationCancelled), "authorization denied");
    }

    #[test]
    fn test_lock_is_per_partition() {
        let engine = engine();
        let a = engine.partition_lock(&PartitionId::new("sda1"));
        let b = engine.partition_lock(&PartitionId::new("/dev/sda1"));
        let c = engine.partition_lock(&PartitionId::new("sda2"));
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn test_aliases_share_a_canonical_lock() {
        let engine = engine();
        let alias = PartitionId::new("/dev/disk/by-uuid/0008-0002");
        assert_eq!(engine.canonical_id(&alias), PartitionId::new("sda2"));
        assert_eq!(
            engine.canonical_id(&PartitionId::new("sdz1")),
            PartitionId::new("sdz1")
        );
    }

    #[test]
    fn test_locks_are_released_after_execute() {
        let engine = engine();
        let command = Command::Mount {
            partition: PartitionId::new("/dev/disk/by-uuid/0008-0002"),
            options: MountOptions::new().with_target("/mnt/data"),
        };
        let result = engine.execute(&command, &CancellationToken::new()).unwrap();
        assert!(result.outcome.is_success());
        assert!(engine.host().is_mounted_at("/dev/sda2", "/mnt/data"));

        let unknown = Command::Unmount {
            partition: PartitionId::new("sdz1"),
            allow_terminate_busy: false,
        };
        engine.execute(&unknown, &CancellationToken::new()).unwrap();
        assert!(engine.locks.lock().unwrap().is_empty());
    }
}
