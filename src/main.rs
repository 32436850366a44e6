//! Tessera CLI - Main entry point.

use tessera::cli::{Cli, Commands, RingCommands};
use tessera::config::TesseraConfig;
use tessera::ring::{Ring, RingBuilder};
use tessera::scheduler::PassFilter;
use tessera::{Role, RunOptions};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse_args();

    let mut config = match &cli.config {
        Some(path) => TesseraConfig::from_file(path)?,
        None => TesseraConfig::development(),
    };
    if let Some(level) = cli.log_level {
        config.observability.log_level = level;
    }
    if cli.json_logs {
        config.observability.json_logs = true;
    }

    let options = match cli.command {
        Commands::Replicator(args) => RunOptions {
            role: Role::Replicator,
            once: args.daemon.once,
            filter: args.filter(),
        },
        Commands::Reconstructor(args) => RunOptions {
            role: Role::Reconstructor,
            once: args.daemon.once,
            filter: args.filter(),
        },
        Commands::Auditor(args) => RunOptions {
            role: Role::Auditor,
            once: args.once,
            filter: PassFilter {
                devices: args.device_set(),
                partitions: None,
            },
        },
        Commands::Updater(args) => RunOptions {
            role: Role::Updater,
            once: args.once,
            filter: PassFilter {
                devices: args.device_set(),
                partitions: None,
            },
        },
        Commands::Ring { command } => return ring_command(command),
        Commands::Version => {
            println!("Tessera v{}", env!("CARGO_PKG_VERSION"));
            println!("Background replication, reconstruction, auditing and async updates for object storage");
            return Ok(());
        }
    };

    tessera::observability::init(&config.observability)?;
    let once = options.once;
    let stats = tessera::run(config, options).await?;
    if once && !stats.is_success() {
        std::process::exit(1);
    }
    Ok(())
}

fn ring_command(command: RingCommands) -> anyhow::Result<()> {
    match command {
        RingCommands::Create {
            output,
            partition_power,
            replicas,
            version,
            devices,
        } => {
            let mut builder = RingBuilder::new(partition_power, replicas).with_version(version);
            for spec in devices {
                builder.add_device(spec.name, spec.ip, spec.port, spec.weight, spec.region, spec.zone);
            }
            let ring = builder.build()?;
            ring.save(&output)?;
            println!(
                "Wrote ring v{} with {} partitions to {}",
                ring.version(),
                ring.partition_count(),
                output.display()
            );
        }
        RingCommands::Inspect { path } => {
            let ring = Ring::load_file(&path)?;
            println!("Ring: {}", path.display());
            println!("  Version: {}", ring.version());
            println!("  Partitions: {} (power {})", ring.partition_count(), ring.partition_power());
            println!("  Replicas: {}", ring.replica_count());
            println!("  Devices:");
            let counts = ring.assignment_counts();
            for (id, count) in counts {
                if let Some(device) = ring.device(id) {
                    println!(
                        "    {:>4}  r{}z{}  {:<24}  weight {:>7.2}  partitions {}",
                        id,
                        device.region,
                        device.zone,
                        device.to_string(),
                        device.weight,
                        count
                    );
                }
            }
        }
    }
    Ok(())
}
