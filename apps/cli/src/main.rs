//! partmgr - inspect and change partition mount state.
//!
//! Thin command surface over `partmgr-core`: parses arguments, wires Ctrl+C
//! to the engine's cancellation token and renders the verified result.
//!
//! Exit codes: 0 on success, 1 when the engine refused or failed the
//! operation, 2 when the system state could not be read at all.

mod render;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use snafu::ResultExt;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use partmgr_core::options::parse_option_list;
use partmgr_core::{
    CancellationToken, Command, Engine, EngineConfig, Error, ExecutionContext, LinuxHost,
    MountOptions, PartitionId, PrivilegeEscalation, Result,
};

/// Partition and mount manager.
#[derive(Parser)]
#[command(name = "partmgr")]
#[command(about = "Inspect and change partition mount state", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Print the result as JSON.
    #[arg(long, global = true)]
    json: bool,

    /// Configuration file (defaults to the user config directory).
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Run privileged commands through sudo.
    #[arg(long, global = true, conflicts_with = "pkexec")]
    sudo: bool,

    /// Run privileged commands through pkexec.
    #[arg(long, global = true)]
    pkexec: bool,

    /// Increase log verbosity (-v info, -vv debug).
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// List block devices, partitions and their mount state.
    List,

    /// Mount a partition.
    Mount {
        /// Partition name or path (e.g. sdb1 or /dev/sdb1).
        partition: String,

        /// Mountpoint; defaults to <mount_base>/<label>.
        #[arg(long, value_name = "DIR")]
        target: Option<PathBuf>,

        /// Comma separated mount options.
        #[arg(short = 'o', long = "options", value_name = "OPTS")]
        options: Option<String>,

        #[arg(long)]
        read_only: bool,
    },

    /// Unmount a partition.
    Unmount {
        partition: String,

        /// Terminate processes keeping the partition busy (SIGTERM, then SIGKILL).
        #[arg(long)]
        kill_busy: bool,
    },

    /// Enable or disable a swap partition.
    Swap {
        partition: String,

        #[arg(value_enum)]
        state: SwapState,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum SwapState {
    On,
    Off,
}

impl Commands {
    fn to_engine(&self) -> Command {
        match self {
            Self::List => Command::List,
            Self::Mount {
                partition,
                target,
                options,
                read_only,
            } => {
                let mut request = MountOptions::new()
                    .with_options(options.as_deref().map(parse_option_list).unwrap_or_default())
                    .read_only(*read_only);
                request.target = target.clone();
                Command::Mount {
                    partition: PartitionId::new(partition),
                    options: request,
                }
            }
            Self::Unmount {
                partition,
                kill_busy,
            } => Command::Unmount {
                partition: PartitionId::new(partition),
                allow_terminate_busy: *kill_busy,
            },
            Self::Swap { partition, state } => Command::ToggleSwap {
                partition: PartitionId::new(partition),
                enable: matches!(state, SwapState::On),
            },
        }
    }
}

fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .init();
}

fn run(cli: &Cli) -> Result<ExitCode> {
    let config = match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::load_default()?,
    };

    let escalation = if cli.sudo {
        PrivilegeEscalation::Sudo
    } else if cli.pkexec {
        PrivilegeEscalation::Pkexec
    } else {
        config.escalation
    };
    let engine = Engine::new(
        LinuxHost::new(ExecutionContext::with_escalation(escalation)),
        config,
    );

    let token = CancellationToken::new();
    let handler_token = token.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        handler_token.cancel();
        info!("cancellation requested (Ctrl+C)");
    }) {
        warn!(error = %e, "cannot install Ctrl+C handler");
    }

    let command = cli.command.to_engine();
    let result = engine.execute(&command, &token)?;

    if cli.json {
        let json = serde_json::to_string_pretty(&result)
            .whatever_context::<_, Error>("failed to serialize result")?;
        println!("{}", json);
    } else {
        render::print_result(&command, &result);
    }

    Ok(if result.outcome.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    })
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(&cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {}", snafu::Report::from_error(e));
            ExitCode::from(2)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mount_arguments() {
        let cli = Cli::parse_from([
            "partmgr", "mount", "sdb1", "--target", "/mnt/games", "-o", "noatime,uid=0", "--read-only",
        ]);
        let Command::Mount { partition, options } = cli.command.to_engine() else {
            panic!("expected mount");
        };
        assert_eq!(partition, PartitionId::new("/dev/sdb1"));
        assert_eq!(options.target, Some(PathBuf::from("/mnt/games")));
        assert_eq!(options.options, vec!["noatime", "uid=0"]);
        assert!(options.read_only);
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::parse_from(["partmgr", "unmount", "sdc1", "--kill-busy", "--json", "-vv"]);
        assert!(cli.json);
        assert_eq!(cli.verbose, 2);
        assert_eq!(
            cli.command.to_engine(),
            Command::Unmount {
                partition: PartitionId::new("sdc1"),
                allow_terminate_busy: true,
            }
        );
    }

    #[test]
    fn test_swap_state() {
        let cli = Cli::parse_from(["partmgr", "swap", "sda3", "off"]);
        assert_eq!(
            cli.command.to_engine(),
            Command::ToggleSwap {
                partition: PartitionId::new("sda3"),
                enable: false,
            }
        );
    }

    #[test]
    fn test_sudo_and_pkexec_conflict() {
        assert!(Cli::try_parse_from(["partmgr", "--sudo", "--pkexec", "list"]).is_err());
    }
}
