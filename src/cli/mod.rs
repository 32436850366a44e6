//! Command-line interface for Tessera.

use crate::scheduler::PassFilter;
use crate::types::PartitionId;
use clap::{Args, Parser, Subcommand};
use std::collections::HashSet;
use std::path::PathBuf;
use std::str::FromStr;

/// Tessera - background replication, reconstruction, auditing and async
/// update sweeping for ring-partitioned object storage.
#[derive(Parser)]
#[command(name = "tessera")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file path (JSON); development defaults when absent
    #[arg(short, long, env = "TESSERA_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, env = "TESSERA_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Keep replicated partitions in sync with their peers
    Replicator(SchedulerArgs),

    /// Rebuild missing or corrupt erasure-coded fragments
    Reconstructor(SchedulerArgs),

    /// Verify local objects and quarantine corrupt ones
    Auditor(DaemonArgs),

    /// Retry queued account and container updates
    Updater(DaemonArgs),

    /// Ring management
    Ring {
        #[command(subcommand)]
        command: RingCommands,
    },

    /// Show version information
    Version,
}

/// Flags shared by every daemon.
#[derive(Args, Debug, Clone, Default)]
pub struct DaemonArgs {
    /// Run a single pass and exit
    #[arg(long)]
    pub once: bool,

    /// Only visit these devices (comma separated)
    #[arg(long, value_delimiter = ',')]
    pub devices: Vec<String>,
}

/// Flags of the replicator and the reconstructor.
#[derive(Args, Debug, Clone, Default)]
pub struct SchedulerArgs {
    #[command(flatten)]
    pub daemon: DaemonArgs,

    /// Only visit these partitions (comma separated)
    #[arg(long, value_delimiter = ',')]
    pub partitions: Vec<PartitionId>,
}

impl SchedulerArgs {
    pub fn filter(&self) -> PassFilter {
        PassFilter {
            devices: self.daemon.device_set(),
            partitions: (!self.partitions.is_empty())
                .then(|| self.partitions.iter().copied().collect()),
        }
    }
}

impl DaemonArgs {
    pub fn device_set(&self) -> Option<HashSet<String>> {
        (!self.devices.is_empty()).then(|| self.devices.iter().cloned().collect())
    }
}

/// Ring subcommands.
#[derive(Subcommand)]
pub enum RingCommands {
    /// Build a ring file from a device list
    Create {
        /// Output ring file
        #[arg(short, long)]
        output: PathBuf,

        /// log2 of the partition count
        #[arg(long, default_value_t = 10)]
        partition_power: u32,

        /// Devices per partition (replicas, or data + parity fragments)
        #[arg(long, default_value_t = 3)]
        replicas: usize,

        /// Ring version
        #[arg(long, default_value_t = 1)]
        version: u64,

        /// Device as r<region>z<zone>-<ip>:<port>/<name>[:<weight>]
        #[arg(short, long = "device", required = true)]
        devices: Vec<DeviceSpec>,
    },

    /// Print a ring's devices and partition balance
    Inspect {
        /// Ring file
        path: PathBuf,
    },
}

/// A device given on the command line.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceSpec {
    pub region: u32,
    pub zone: u32,
    pub ip: String,
    pub port: u16,
    pub name: String,
    pub weight: f64,
}

impl FromStr for DeviceSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || format!("invalid device '{}', expected r1z1-10.0.0.1:6200/sdb1:100", s);
        let rest = s.strip_prefix('r').ok_or_else(bad)?;
        let (region, rest) = rest.split_once('z').ok_or_else(bad)?;
        let (zone, rest) = rest.split_once('-').ok_or_else(bad)?;
        let (addr, device) = rest.split_once('/').ok_or_else(bad)?;
        let (ip, port) = addr.rsplit_once(':').ok_or_else(bad)?;
        let (name, weight) = match device.split_once(':') {
            Some((name, weight)) => (name, weight.parse().map_err(|_| bad())?),
            None => (device, 100.0),
        };
        if ip.is_empty() || name.is_empty() {
            return Err(bad());
        }
        Ok(Self {
            region: region.parse().map_err(|_| bad())?,
            zone: zone.parse().map_err(|_| bad())?,
            ip: ip.to_string(),
            port: port.parse().map_err(|_| bad())?,
            name: name.to_string(),
            weight,
        })
    }
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_spec() {
        let spec: DeviceSpec = "r1z2-10.0.0.5:6200/sdb1:50".parse().unwrap();
        assert_eq!(
            spec,
            DeviceSpec {
                region: 1,
                zone: 2,
                ip: "10.0.0.5".into(),
                port: 6200,
                name: "sdb1".into(),
                weight: 50.0,
            }
        );
        let spec: DeviceSpec = "r1z1-127.0.0.1:6210/sda".parse().unwrap();
        assert_eq!(spec.weight, 100.0);

        assert!("z1-127.0.0.1:6200/sda".parse::<DeviceSpec>().is_err());
        assert!("r1z1-127.0.0.1/sda".parse::<DeviceSpec>().is_err());
        assert!("r1z1-127.0.0.1:6200/".parse::<DeviceSpec>().is_err());
    }

    #[test]
    fn test_replicator_once_with_filters() {
        let cli = Cli::try_parse_from([
            "tessera",
            "replicator",
            "--once",
            "--devices",
            "sda,sdb",
            "--partitions",
            "7,42",
        ])
        .unwrap();
        let Commands::Replicator(args) = cli.command else {
            panic!("expected replicator");
        };
        assert!(args.daemon.once);
        let filter = args.filter();
        assert_eq!(filter.devices.unwrap().len(), 2);
        assert!(filter.partitions.unwrap().contains(&42));
    }

    #[test]
    fn test_unfiltered_pass() {
        let cli = Cli::try_parse_from(["tessera", "reconstructor"]).unwrap();
        let Commands::Reconstructor(args) = cli.command else {
            panic!("expected reconstructor");
        };
        let filter = args.filter();
        assert!(filter.devices.is_none());
        assert!(filter.partitions.is_none());
    }

    #[test]
    fn test_ring_create_requires_devices() {
        assert!(Cli::try_parse_from(["tessera", "ring", "create", "-o", "r.json"]).is_err());
        let cli = Cli::try_parse_from([
            "tessera",
            "ring",
            "create",
            "-o",
            "r.json",
            "--partition-power",
            "4",
            "-d",
            "r1z1-127.0.0.1:6200/sda",
        ])
        .unwrap();
        assert!(matches!(
            cli.command,
            Commands::Ring {
                command: RingCommands::Create { partition_power: 4, .. }
            }
        ));
    }
}
