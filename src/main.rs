//! isoforge CLI: flash ISO images onto USB drives.
//!
//! The binary layer owns argument parsing, the interactive prompts, the
//! dry-run report and exit codes. Everything destructive lives behind
//! `isoforge::burn::run`.

use std::io::Write;
use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use isoforge::analyze::{self, Strategy};
use isoforge::progress::BarProgress;
use isoforge::{
    device, BurnConfig, BurnError, FsKind, PersistenceRequest, TableType, MIB,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum TableArg {
    Mbr,
    Gpt,
}

impl From<TableArg> for TableType {
    fn from(arg: TableArg) -> Self {
        match arg {
            TableArg::Mbr => TableType::Mbr,
            TableArg::Gpt => TableType::Gpt,
        }
    }
}

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(
    name = "isoforge",
    version,
    about = "Create bootable USB drives from ISO images",
    after_help = "Requires root for anything destructive. The device must be \
                  a whole disk (/dev/sdb), not a partition (/dev/sdb1)."
)]
struct Cli {
    /// Input ISO image
    #[arg(short = 'i', long = "iso")]
    iso: Option<PathBuf>,

    /// Output device, e.g. /dev/sdb
    #[arg(short = 'o', long = "device")]
    device: Option<String>,

    /// Enable persistence with the given size in MiB
    #[arg(short = 'p', long = "persistence", value_name = "MIB")]
    persistence: Option<u64>,

    /// Filesystem for the persistence partition
    #[arg(short = 'f', long = "filesystem", value_name = "FS")]
    filesystem: Option<String>,

    /// Partition table type; prompted interactively when omitted
    #[arg(short = 't', long = "table")]
    table: Option<TableArg>,

    /// Use zero-copy fast mode for the image write
    #[arg(short = 'm', long = "fast")]
    fast: bool,

    /// Show what would happen without touching the device
    #[arg(long)]
    dry_run: bool,

    /// Skip the interactive confirmation
    #[arg(long)]
    force: bool,

    /// List candidate devices and exit
    #[arg(long)]
    list: bool,

    /// With --list, include non-removable disks
    #[arg(short = 'a', long = "all")]
    all: bool,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let device_label = cli.device.clone().unwrap_or_else(|| "unknown".to_string());

    std::process::exit(match run(cli) {
        Ok(()) => 0,
        Err(err) => {
            report_fatal(&device_label, &err);
            1
        }
    });
}

/// Print the single fatal line, with the structured space breakdown for
/// insufficient-space failures and the corrected path for partition
/// targets.
fn report_fatal(device: &str, err: &anyhow::Error) {
    match err.downcast_ref::<BurnError>() {
        Some(BurnError::InsufficientSpace(report)) => {
            eprintln!("Fatal Error: {report}");
        }
        Some(BurnError::IsPartition(base)) => {
            eprintln!("Fatal Error: the target device is incomplete.");
            eprintln!("  You specified: {device}");
            eprintln!("  Try instead: {base}");
            eprintln!("  Just remove the number at the end.");
        }
        Some(_) => eprintln!("Fatal Error: Fail writing at {device}, cause: {err}"),
        None => eprintln!("Fatal Error: {err}"),
    }
}

fn run(cli: Cli) -> Result<()> {
    println!("isoforge {}", env!("CARGO_PKG_VERSION"));

    if cli.list {
        return list_devices(cli.all);
    }

    let (Some(iso), Some(target)) = (cli.iso.clone(), cli.device.clone()) else {
        anyhow::bail!("both --iso and --device are required (see --help)");
    };

    let persistence = build_persistence_request(&cli)?;

    if !is_root() && !cli.dry_run {
        eprintln!("This is a privileged tool; run it with sudo.");
        return Err(BurnError::Permission.into());
    }

    // Name problems are caught before the device is even opened.
    if let Err(err) = device::validate(&target) {
        match err {
            // A dry run may inspect a plain file standing in for a device.
            BurnError::InvalidDevice(_) if cli.dry_run => {
                warn!("{target} is not a block device; continuing for dry run");
            }
            other => return Err(other.into()),
        }
    }

    let structure = analyze::analyse(&iso)?;
    let strategy = analyze::recommend_strategy(&structure, persistence.is_some());
    let device_bytes = device::size_bytes(&target)?;

    info!("ISO: {} ({} MiB)", iso.display(), structure.size_bytes / MIB);
    info!("Device: {target} ({} MiB)", device_bytes / MIB);
    info!("Boot type: {}", structure.boot_type_description());
    info!(
        "Layout: {} partitions required",
        analyze::required_partitions(&structure, persistence.is_some())
    );

    if structure.size_bytes > device_bytes {
        return Err(BurnError::DeviceTooSmall {
            image_bytes: structure.size_bytes,
            device_bytes,
        }
        .into());
    }

    // The prompt only runs when -t was not given; a value from the command
    // line is always preserved.
    let table = match cli.table {
        Some(arg) => arg.into(),
        None if cli.dry_run => TableType::Mbr,
        None => prompt_table_type()?,
    };

    let config = BurnConfig {
        image: iso,
        device: target.clone(),
        strategy,
        structure,
        fast_mode: cli.fast,
        persistence,
        table,
    };

    if cli.dry_run {
        print_dry_run(&config, device_bytes);
        return Ok(());
    }

    if !confirm_destruction(&target, cli.force)? {
        info!("operation cancelled");
        return Ok(());
    }

    let mut progress = BarProgress::new(config.structure.size_bytes, "Writing image");
    isoforge::burn::run(&config, &mut progress)?;

    println!("Bootable USB created successfully.");
    println!("You can now safely remove {target}.");
    Ok(())
}

fn is_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

fn build_persistence_request(cli: &Cli) -> Result<Option<PersistenceRequest>> {
    match (cli.persistence, &cli.filesystem) {
        (Some(size_mib), fs_name) => {
            let fs = match fs_name {
                Some(name) => FsKind::parse(name).map_err(|err| {
                    anyhow::anyhow!("{err} (supported: {})", FsKind::SUPPORTED.join(", "))
                })?,
                None => FsKind::Ext4,
            };
            Ok(Some(PersistenceRequest { size_mib, fs }))
        }
        (None, Some(_)) => {
            anyhow::bail!("--filesystem only makes sense together with --persistence")
        }
        (None, None) => Ok(None),
    }
}

fn list_devices(show_all: bool) -> Result<()> {
    let disks = device::list(show_all)?;
    if disks.is_empty() {
        println!("No candidate devices found. Try --all to include fixed disks.");
        return Ok(());
    }

    println!("{:<14} {:<10} {}", "DEVICE", "SIZE", "MODEL");
    for disk in disks {
        println!(
            "{:<14} {:<10} {}",
            disk.device_path(),
            disk.size,
            disk.model
        );
    }
    Ok(())
}

/// Ask which partition table to build. Only reached when `-t` was absent.
fn prompt_table_type() -> Result<TableType> {
    println!();
    println!("Select a partition table type:");
    println!("  [1] MBR - BIOS compatible, up to 4 primary partitions, disks to 2 TiB");
    println!("  [2] GPT - required for UEFI, 128 partitions, large disks");
    print!("Choose [1/2]: ");
    std::io::stdout().flush()?;

    let mut choice = String::new();
    std::io::stdin().read_line(&mut choice)?;

    Ok(match choice.trim().to_ascii_lowercase().as_str() {
        "2" | "gpt" => {
            println!("Selected: GPT");
            TableType::Gpt
        }
        "1" | "mbr" => {
            println!("Selected: MBR");
            TableType::Mbr
        }
        _ => {
            println!("Unrecognised choice, defaulting to MBR");
            TableType::Mbr
        }
    })
}

fn confirm_destruction(target: &str, force: bool) -> Result<bool> {
    println!();
    println!("WARNING: all data on {target} will be destroyed!");
    if force {
        warn!("proceeding without confirmation (--force)");
        return Ok(true);
    }

    print!("Continue? (yes/no): ");
    std::io::stdout().flush()?;
    let mut answer = String::new();
    std::io::stdin().read_line(&mut answer)?;
    Ok(answer.trim() == "yes")
}

fn print_dry_run(config: &BurnConfig, device_bytes: u64) {
    let iso_mib = config.structure.size_bytes.div_ceil(MIB);
    let device_mib = device_bytes / MIB;

    println!();
    println!("=== DRY RUN - NO CHANGES WILL BE MADE ===");
    println!();
    println!("Input:");
    println!("  ISO: {} ({iso_mib} MiB)", config.image.display());
    println!("  ISO type: {}", config.structure.boot_type_description());
    println!("  Device: {} ({device_mib} MiB)", config.device);
    println!();
    println!("Operation:");
    println!("  Strategy: {:?}", config.strategy);
    println!("  Partition table: {}", config.table);
    println!(
        "  Write mode: {}",
        if config.fast_mode { "fast (zero-copy)" } else { "raw" }
    );

    let mut step = 1;
    let mut plan = |line: &str| {
        println!("  {step}. {line}");
        step += 1;
    };

    println!();
    println!("Planned steps:");
    plan(&format!("Unmount all partitions of {}", config.device));
    plan("Wipe device head and tail");
    match config.strategy {
        Strategy::RawCopy | Strategy::HybridPreserve => {
            plan("Stream image to the whole device");
        }
        Strategy::SmartExtract => {
            plan("Create bootable FAT32 partition sized to the image");
            plan("Extract image contents into it");
        }
        Strategy::MultiPart => {
            if config.structure.has_uefi {
                plan("Create 512 MiB EFI system partition");
            }
            plan("Create main FAT32 data partition");
            plan("Extract image contents into it");
        }
    }
    if let Some(request) = &config.persistence {
        plan(&format!(
            "Create {} MiB {} persistence partition",
            request.size_mib, request.fs
        ));
    }
    plan("Install bootloader");
    plan("Sync and finalise");

    let persistence_mib = config.persistence.map(|p| p.size_mib).unwrap_or(0);
    let used = iso_mib + persistence_mib + 100;
    println!();
    println!("Space:");
    println!("  Image: {iso_mib} MiB");
    if persistence_mib > 0 {
        println!("  Persistence: {persistence_mib} MiB");
    }
    println!("  Overhead: ~100 MiB");
    println!("  Total used: {used} MiB of {device_mib} MiB");
    println!();
    println!("All checks passed. Drop --dry-run to perform the operation.");
}
