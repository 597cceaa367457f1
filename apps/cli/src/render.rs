//! Plain-text rendering of engine results.

use partmgr_core::orchestrator::SystemSnapshot;
use partmgr_core::{BlockDevice, Command, OperationResult, Outcome, Partition, TerminationOutcome};

const UNITS: &[&str] = &["B", "K", "M", "G", "T", "P"];

/// Formats a byte count the way `lsblk` does (`931.5G`).
pub fn human_size(bytes: Option<u64>) -> String {
    let Some(bytes) = bytes else {
        return "?".to_string();
    };
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{}{}", bytes, UNITS[0])
    } else {
        format!("{:.1}{}", value, UNITS[unit])
    }
}

fn partition_line(snapshot: &SystemSnapshot, partition: &Partition, last: bool) -> String {
    let id = partition.id();
    let location = if snapshot.mounts.is_swap_active(&id) {
        "[SWAP]".to_string()
    } else {
        snapshot
            .mount_state_of(&id)
            .map(|r| {
                let ro = if r.read_only { " (ro)" } else { "" };
                format!("{}{}", r.mountpoint.display(), ro)
            })
            .unwrap_or_default()
    };
    let branch = if last { "└─" } else { "├─" };
    format!(
        "{}{:<12} {:>8}  {:<8} {:<16} {}",
        branch,
        partition.name,
        human_size(partition.size),
        partition.fstype_label(),
        partition.label.as_deref().unwrap_or(""),
        location
    )
}

fn device_line(device: &BlockDevice) -> String {
    let removable = match device.removable {
        Some(true) => "removable",
        Some(false) => "",
        None => "removable?",
    };
    format!(
        "{:<14} {:>8}  {:<8} {} {}",
        device.name,
        human_size(device.size),
        device.transport.as_deref().unwrap_or(""),
        device.model.as_deref().unwrap_or(""),
        removable
    )
    .trim_end()
    .to_string()
}

pub fn print_snapshot(snapshot: &SystemSnapshot) {
    for device in &snapshot.devices.devices {
        println!("{}", device_line(device));
        let count = device.partitions.len();
        for (i, partition) in device.partitions.iter().enumerate() {
            println!("{}", partition_line(snapshot, partition, i + 1 == count));
        }
    }
}

fn termination_label(outcome: &TerminationOutcome) -> String {
    match outcome {
        TerminationOutcome::Terminated => "terminated".to_string(),
        TerminationOutcome::Killed => "killed".to_string(),
        TerminationOutcome::AlreadyExited => "already exited".to_string(),
        TerminationOutcome::Protected => "protected, not signalled".to_string(),
        TerminationOutcome::Failed(reason) => format!("failed: {}", reason),
    }
}

pub fn print_result(command: &Command, result: &OperationResult) {
    for warning in &result.warnings {
        eprintln!("warning: {}", warning);
    }
    for (pid, outcome) in &result.terminations {
        eprintln!("process {}: {}", pid, termination_label(outcome));
    }

    let Some(partition) = command.partition() else {
        print_snapshot(&result.snapshot);
        return;
    };

    match &result.outcome {
        Outcome::Success => {
            let state = if result.snapshot.mounts.is_swap_active(partition) {
                "swap active".to_string()
            } else {
                match result.snapshot.mount_state_of(partition) {
                    Some(record) => format!("mounted at {}", record.mountpoint.display()),
                    None => "not mounted".to_string(),
                }
            };
            println!("{}: {}", partition, state);
        }
        Outcome::Failed(failure) => eprintln!("{}", failure),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_human_size() {
        assert_eq!(human_size(Some(512)), "512B");
        assert_eq!(human_size(Some(536_870_912)), "512.0M");
        assert_eq!(human_size(Some(1_000_204_886_016)), "931.5G");
        assert_eq!(human_size(None), "?");
    }
}
