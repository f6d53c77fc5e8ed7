//! erasetup CLI
//!
//! Command-line dispatcher for the `era` metadata engine.

use clap::{Parser, Subcommand};

use erasetup::core::EngineContext;
use erasetup::dm::{DmSetupClient, DropSnapshotRequest, TakeSnapshotRequest};
use erasetup::engine;

#[derive(Parser)]
#[command(name = "erasetup", version, about = "Control utility for the device-mapper era target")]
struct Cli {
    /// Increase verbosity (repeatable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Relax destructive-write checks
    #[arg(short = 'f', long = "force", global = true)]
    force: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Format a metadata device and bring up a fresh era device
    Create {
        name: String,
        metadata_dev: String,
        data_dev: String,
        /// Chunk size: bytes, or suffixed k/m/g/s
        chunk: Option<String>,
    },
    /// Rebuild the space map and bring up an existing era device
    Open {
        name: String,
        metadata_dev: String,
        data_dev: String,
    },
    /// Tear down a live era device and its origin
    Close { name: String },
    /// Report status of one device, or every device if none is named
    Status { name: Option<String> },
    /// Take a metadata snapshot of a live era device
    Takesnap {
        name: String,
        snapshot_dev: String,
    },
    /// Drop a previously taken metadata snapshot
    Dropsnap { snapshot_dev: String },
    /// Print a metadata device's superblock
    Dumpsb { metadata_dev: String },
}

fn main() {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    let ctx = EngineContext::new(cli.verbose, cli.force);
    let dm = DmSetupClient::new();

    let result = run(&ctx, &dm, cli.command);
    if let Err(e) = result {
        eprintln!("{}", e);
        std::process::exit(1);
    }
}

fn run(ctx: &EngineContext, dm: &DmSetupClient, command: Command) -> erasetup::Result<()> {
    match command {
        Command::Create {
            name,
            metadata_dev,
            data_dev,
            chunk,
        } => {
            let chunk = match chunk {
                Some(c) => engine::parse_chunk(&c)?,
                None => engine::DEFAULT_CHUNK_SECTORS,
            };
            engine::create(ctx, dm, &name, &metadata_dev, &data_dev, chunk)
        }
        Command::Open {
            name,
            metadata_dev,
            data_dev,
        } => engine::open(ctx, dm, &name, &metadata_dev, &data_dev),
        Command::Close { name } => engine::close(dm, &name),
        Command::Status { name } => {
            let statuses = engine::status(dm, name.as_deref())?;
            for s in statuses {
                println!("{}: {} {}", s.name, s.target_type, s.status);
            }
            Ok(())
        }
        Command::Takesnap { name, snapshot_dev } => erasetup::dm::take_snapshot(
            dm,
            &TakeSnapshotRequest {
                era_name: name,
                snapshot_device_path: snapshot_dev,
            },
        ),
        Command::Dropsnap { snapshot_dev } => erasetup::dm::drop_snapshot(
            dm,
            &DropSnapshotRequest {
                snapshot_device_path: snapshot_dev,
            },
        ),
        Command::Dumpsb { metadata_dev } => {
            let sb = engine::dumpsb(&metadata_dev)?;
            println!("magic: {}", sb.magic());
            println!("uuid: {}", sb.uuid());
            println!("data_block_size: {}", sb.data_block_size());
            println!("metadata_block_size: {}", sb.metadata_block_size());
            println!("nr_blocks: {}", sb.nr_blocks());
            println!("current_era: {}", sb.current_era());
            println!("metadata_snap: {}", sb.metadata_snap().unwrap_or(0));
            Ok(())
        }
    }
}
