//! Safety gate.
//!
//! A pure decision over a snapshot: no I/O, no system calls. Every
//! state-changing command passes through [`evaluate`] before anything is
//! executed, and a veto is final for that command.

use std::fmt;

use serde::Serialize;

use crate::disk::PartitionId;

/// Kind of state change being requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Mount,
    Unmount,
    SwapOn,
    SwapOff,
}

/// Facts about the target partition, taken from the current snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateContext<'a> {
    pub partition: &'a PartitionId,
    /// Partition backing `/`, if known.
    pub root_partition: Option<&'a PartitionId>,
    pub swap_active: bool,
    /// Partition the running executable lives on, if known.
    pub self_partition: Option<&'a PartitionId>,
    /// Whether the partition's disk is removable. None when unknown.
    pub removable: Option<bool>,
}

/// Why a command was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VetoReason {
    RootFilesystem,
    ActiveSwap,
    /// The partition carries the running executable on removable media.
    SelfHostingMedium,
}

impl fmt::Display for VetoReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            Self::RootFilesystem => "root filesystem",
            Self::ActiveSwap => "active swap",
            Self::SelfHostingMedium => "medium hosting this program",
        };
        f.write_str(reason)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", content = "reason", rename_all = "snake_case")]
pub enum Verdict {
    Approved,
    Vetoed(VetoReason),
}

impl Verdict {
    pub fn is_approved(&self) -> bool {
        matches!(self, Self::Approved)
    }
}

/// Decides whether `operation` may proceed on the partition in `ctx`.
///
/// Rules, first match wins:
/// - the root filesystem is never touched, whatever the operation;
/// - an active swap partition cannot be unmounted (it must be swapped off);
/// - the partition holding this program cannot be unmounted when its disk is
///   removable, or when removability is unknown.
pub fn evaluate(operation: Operation, ctx: &GateContext<'_>) -> Verdict {
    if ctx.root_partition == Some(ctx.partition) {
        return Verdict::Vetoed(VetoReason::RootFilesystem);
    }

    if operation == Operation::Unmount {
        if ctx.swap_active {
            return Verdict::Vetoed(VetoReason::ActiveSwap);
        }
        if ctx.self_partition == Some(ctx.partition) && ctx.removable != Some(false) {
            return Verdict::Vetoed(VetoReason::SelfHostingMedium);
        }
    }

    Verdict::Approved
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx<'a>(partition: &'a PartitionId, root: &'a PartitionId) -> GateContext<'a> {
        GateContext {
            partition,
            root_partition: Some(root),
            swap_active: false,
            self_partition: None,
            removable: Some(false),
        }
    }

    #[test]
    fn test_root_always_vetoed() {
        let root = PartitionId::new("sda2");
        for op in [Operation::Mount, Operation::Unmount, Operation::SwapOn, Operation::SwapOff] {
            assert_eq!(
                evaluate(op, &ctx(&root, &root)),
                Verdict::Vetoed(VetoReason::RootFilesystem)
            );
        }
    }

    #[test]
    fn test_active_swap_blocks_unmount_only() {
        let root = PartitionId::new("sda2");
        let swap = PartitionId::new("sda3");
        let gate = GateContext {
            swap_active: true,
            ..ctx(&swap, &root)
        };

        assert_eq!(
            evaluate(Operation::Unmount, &gate),
            Verdict::Vetoed(VetoReason::ActiveSwap)
        );
        assert!(evaluate(Operation::SwapOff, &gate).is_approved());
    }

    #[test]
    fn test_self_hosting_medium() {
        let root = PartitionId::new("sda2");
        let stick = PartitionId::new("sdc1");
        let mut gate = GateContext {
            self_partition: Some(&stick),
            removable: Some(true),
            ..ctx(&stick, &root)
        };
        assert_eq!(
            evaluate(Operation::Unmount, &gate),
            Verdict::Vetoed(VetoReason::SelfHostingMedium)
        );

        gate.removable = None;
        assert_eq!(
            evaluate(Operation::Unmount, &gate),
            Verdict::Vetoed(VetoReason::SelfHostingMedium)
        );

        gate.removable = Some(false);
        assert!(evaluate(Operation::Unmount, &gate).is_approved());
        assert!(evaluate(Operation::Mount, &gate).is_approved());
    }

    #[test]
    fn test_unknown_root_approves_ordinary_partition() {
        let data = PartitionId::new("sdb1");
        let gate = GateContext {
            partition: &data,
            root_partition: None,
            swap_active: false,
            self_partition: None,
            removable: None,
        };
        assert!(evaluate(Operation::Unmount, &gate).is_approved());
    }

    #[test]
    fn test_veto_reason_display() {
        assert_eq!(VetoReason::RootFilesystem.to_string(), "root filesystem");
    }
}
