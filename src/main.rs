// ─────────────────────────────────────────────────────────────────────────────
//  vuflash  —  V-USB bootloader build & provisioning tool
//
//  USAGE
//  ─────
//    vuflash flash   --mcu atmega328p --hex bootloader.hex --port /dev/ttyUSB0
//    vuflash backup  --mcu atmega328p --port COM3 --output backup.hex
//    vuflash fuses   --mcu atmega328p --port /dev/ttyUSB0
//    vuflash build   --mcu atmega328p --name "Button Box"
//    vuflash detect
//    vuflash find    --vendor-id 0x16c0 --product-id 0x05df
// ─────────────────────────────────────────────────────────────────────────────

use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;

use vuflash::builder::{self, BuildRequest};
use vuflash::config::DeviceConfig;
use vuflash::driver;
use vuflash::error::{FlashError, Result};
use vuflash::mcu::McuProfile;
use vuflash::programmer::{self, AvrdudeSession, Fuse, Programmer, SessionConfig};
use vuflash::sequence::{run_sequence, FlashPlan, Outcome, Stage};
use vuflash::usb::{self, DeviceStatus, SystemEnumerator};

// ─────────────────────────────────────────────────────────────────────────────
//  CLI definition (clap derive)
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name    = "vuflash",
    version = env!("CARGO_PKG_VERSION"),
    about   = "V-USB bootloader build, flash & device provisioning toolkit",
    long_about = None,
)]
struct Cli {
    #[command(subcommand)]
    command: Cmd,

    /// Suppress progress output
    #[arg(long, global = true)]
    quiet: bool,

    /// Print programmer / compiler commands
    #[arg(long, short = 'v', global = true)]
    verbose: bool,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,
}

#[derive(Subcommand)]
enum Cmd {
    /// Run the full provisioning sequence (backup, fuses, flash, verify)
    Flash(FlashArgs),
    /// Back up the target's current flash to a hex file
    Backup(BackupArgs),
    /// Write the V-USB fuse bytes for an MCU
    Fuses(FusesArgs),
    /// Verify the target's flash against a hex image
    Verify(VerifyArgs),
    /// List attached USB devices
    Detect,
    /// Find an attached device by VID/PID or configured name
    Find(FindArgs),
    /// List supported MCU profiles
    Mcus,
    /// Build the V-USB bootloader firmware for an MCU
    Build(BuildArgs),
    /// Generate a Windows driver package (INF)
    Driver(DriverArgs),
    /// List devices from the device config file
    Devices(DevicesArgs),
    /// Check that avrdude and the AVR build tools are installed
    CheckDeps,
}

// ── Shared programmer connection flags ───────────────────────────────────────

#[derive(Args)]
struct SessionArgs {
    /// Serial port (COM3, /dev/ttyUSB0, …)
    #[arg(long, short = 'p')]
    port: String,

    /// avrdude programmer type
    #[arg(long, default_value = "avrisp")]
    programmer: String,

    /// Programmer baud rate
    #[arg(long, default_value = "19200")]
    baud: u32,
}

impl SessionArgs {
    fn to_config(&self) -> SessionConfig {
        SessionConfig {
            programmer_type: self.programmer.clone(),
            port: self.port.clone(),
            baud: self.baud,
            ..SessionConfig::default()
        }
    }
}

#[derive(Args)]
struct FlashArgs {
    /// Target MCU (e.g. atmega328p)
    #[arg(long, short = 'm')]
    mcu: String,

    /// Bootloader hex file to flash
    #[arg(long)]
    hex: PathBuf,

    #[command(flatten)]
    session: SessionArgs,

    /// Skip the flash backup step
    #[arg(long)]
    no_backup: bool,

    /// Skip writing the V-USB fuses
    #[arg(long)]
    no_fuses: bool,

    /// Backup destination (default: bootloader_backup_<mcu>.hex)
    #[arg(long)]
    backup_file: Option<PathBuf>,
}

#[derive(Args)]
struct BackupArgs {
    /// Target MCU
    #[arg(long, short = 'm')]
    mcu: String,

    #[command(flatten)]
    session: SessionArgs,

    /// Output hex file
    #[arg(long, short = 'o')]
    output: PathBuf,
}

#[derive(Args)]
struct FusesArgs {
    /// Target MCU
    #[arg(long, short = 'm')]
    mcu: String,

    #[command(flatten)]
    session: SessionArgs,

    /// Also write the lock byte after the fuses
    #[arg(long)]
    lock: bool,
}

#[derive(Args)]
struct VerifyArgs {
    /// Target MCU
    #[arg(long, short = 'm')]
    mcu: String,

    /// Hex file to verify against
    #[arg(long)]
    hex: PathBuf,

    #[command(flatten)]
    session: SessionArgs,
}

#[derive(Args)]
struct FindArgs {
    /// USB vendor id (e.g. 0x16c0)
    #[arg(long, required_unless_present = "device")]
    vendor_id: Option<String>,

    /// USB product id (e.g. 0x05df)
    #[arg(long, required_unless_present = "device")]
    product_id: Option<String>,

    /// Configured device name (from device_config.json)
    #[arg(long, conflicts_with_all = ["vendor_id", "product_id"])]
    device: Option<String>,

    /// Device config file
    #[arg(long, default_value = vuflash::config::DEFAULT_CONFIG_FILE)]
    config: PathBuf,
}

#[derive(Args)]
struct BuildArgs {
    /// Target MCU
    #[arg(long, short = 'm')]
    mcu: String,

    /// USB device name (max 32 chars)
    #[arg(long, default_value = "Arduino Device")]
    name: String,

    /// USB vendor id
    #[arg(long, default_value = builder::DEFAULT_VENDOR_ID)]
    vendor_id: String,

    /// USB product id
    #[arg(long, default_value = builder::DEFAULT_PRODUCT_ID)]
    product_id: String,

    /// Path to the V-USB source checkout
    #[arg(long, default_value = "v-usb")]
    vusb_path: PathBuf,

    /// Output directory for compiled bootloaders
    #[arg(long, default_value = "bootloader_builds")]
    output_dir: PathBuf,
}

#[derive(Args)]
struct DriverArgs {
    /// USB device name shown in Device Manager
    #[arg(long, default_value = "Arduino Device")]
    name: String,

    /// USB vendor id
    #[arg(long, default_value = builder::DEFAULT_VENDOR_ID)]
    vendor_id: String,

    /// USB product id
    #[arg(long, default_value = builder::DEFAULT_PRODUCT_ID)]
    product_id: String,

    /// Manufacturer string
    #[arg(long, default_value = driver::DEFAULT_MANUFACTURER)]
    manufacturer: String,

    /// Output directory for the driver package
    #[arg(long, default_value = "vusb_drivers")]
    output_dir: PathBuf,
}

#[derive(Args)]
struct DevicesArgs {
    /// Device config file
    #[arg(long, default_value = vuflash::config::DEFAULT_CONFIG_FILE)]
    config: PathBuf,
}

// ─────────────────────────────────────────────────────────────────────────────
//  Entry point
// ─────────────────────────────────────────────────────────────────────────────

fn main() {
    let cli = Cli::parse();

    if cli.no_color {
        colored::control::set_override(false);
    }

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(if cli.verbose { "debug" } else { "warn" }),
    )
    .init();

    let result = match cli.command {
        Cmd::Flash(args) => cmd_flash(args, cli.quiet),
        Cmd::Backup(args) => cmd_backup(args, cli.quiet),
        Cmd::Fuses(args) => cmd_fuses(args, cli.quiet),
        Cmd::Verify(args) => cmd_verify(args, cli.quiet),
        Cmd::Detect => cmd_detect(),
        Cmd::Find(args) => cmd_find(args),
        Cmd::Mcus => {
            cmd_mcus();
            Ok(())
        }
        Cmd::Build(args) => cmd_build(args, cli.quiet),
        Cmd::Driver(args) => cmd_driver(args),
        Cmd::Devices(args) => cmd_devices(args),
        Cmd::CheckDeps => cmd_check_deps(),
    };

    if let Err(e) = result {
        eprintln!("{} {}", "✗".red().bold(), e);
        std::process::exit(1);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
//  Command handlers
// ─────────────────────────────────────────────────────────────────────────────

fn cmd_flash(args: FlashArgs, quiet: bool) -> Result<()> {
    let profile = McuProfile::lookup(&args.mcu)?;

    if !quiet {
        println!(
            "{} {} {}",
            "Provisioning".cyan().bold(),
            format!("[{}]", profile).dimmed(),
            format!("[port: {}]", args.session.port).dimmed(),
        );
        println!("{}", "─".repeat(60).dimmed());
    }

    let mut session = AvrdudeSession::new(args.session.to_config(), &args.mcu)?;

    let plan = FlashPlan {
        mcu_id: args.mcu,
        image: args.hex,
        backup: !args.no_backup,
        backup_path: args.backup_file,
        set_fuses: !args.no_fuses,
    };

    let outcome = run_sequence(&mut session, &plan)?;
    render_outcome(&outcome, quiet);

    if outcome.succeeded() {
        Ok(())
    } else {
        Err(FlashError::Other(format!(
            "provisioning aborted at stage '{}'",
            outcome.final_stage
        )))
    }
}

fn cmd_backup(args: BackupArgs, quiet: bool) -> Result<()> {
    McuProfile::lookup(&args.mcu)?;
    let mut session = AvrdudeSession::new(args.session.to_config(), &args.mcu)?;

    if !quiet {
        println!(
            "{} flash → {}",
            "Backing up".cyan().bold(),
            args.output.display()
        );
    }

    session.read_flash(&args.output)?;

    if !quiet {
        println!(
            "{} backup saved to {}",
            "✓".green().bold(),
            args.output.display().to_string().bold()
        );
    }
    Ok(())
}

fn cmd_fuses(args: FusesArgs, quiet: bool) -> Result<()> {
    let profile = McuProfile::lookup(&args.mcu)?;
    let mut session = AvrdudeSession::new(args.session.to_config(), &args.mcu)?;

    if !quiet {
        println!("{} fuses for {}", "Writing".cyan().bold(), profile);
    }

    for (fuse, value) in profile.provisioning_fuses() {
        session.write_fuse(fuse, value)?;
        if !quiet {
            println!(
                "  {} {} = 0x{:02x}",
                "✓".green().bold(),
                fuse.memory_name(),
                value
            );
        }
    }

    if args.lock {
        session.write_fuse(Fuse::Lock, profile.fuse_lock)?;
        if !quiet {
            println!("  {} lock = 0x{:02x}", "✓".green().bold(), profile.fuse_lock);
        }
    }

    Ok(())
}

fn cmd_verify(args: VerifyArgs, quiet: bool) -> Result<()> {
    McuProfile::lookup(&args.mcu)?;
    let mut session = AvrdudeSession::new(args.session.to_config(), &args.mcu)?;

    session.verify_flash(&args.hex)?;

    if !quiet {
        println!("{} verification passed", "✓".green().bold());
    }
    Ok(())
}

fn cmd_detect() -> Result<()> {
    let devices = usb::list_devices(&SystemEnumerator);

    if devices.is_empty() {
        println!("{} No USB devices found", "!".yellow());
        return Ok(());
    }

    println!(
        "{:<10} {:<9} {:<32} {}",
        "VID:PID", "STATUS", "NAME", "PLATFORM ID"
    );
    println!("{}", "─".repeat(90).dimmed());

    for d in &devices {
        println!(
            "{:<10} {:<9} {:<32} {}",
            format!("{}:{}", d.vendor_id, d.product_id),
            status_label(d.status),
            d.display_name,
            d.raw_platform_id.dimmed(),
        );
    }

    Ok(())
}

fn cmd_find(args: FindArgs) -> Result<()> {
    let (vid, pid, label) = match &args.device {
        Some(name) => {
            let config = DeviceConfig::load(&args.config);
            let entry = config.device(name)?;
            (
                entry.vendor_id.clone(),
                entry.product_id.clone(),
                name.clone(),
            )
        }
        // clap guarantees both ids are present when --device is absent
        None => {
            let vid = args.vendor_id.clone().unwrap_or_default();
            let pid = args.product_id.clone().unwrap_or_default();
            (vid.clone(), pid.clone(), format!("{}:{}", vid, pid))
        }
    };

    println!("{} searching for {}…", "→".cyan(), label.bold());

    match usb::find_device(&SystemEnumerator, &vid, &pid)? {
        Some(device) => {
            println!("{} Device found", "✓".green().bold());
            println!("  {} {}", "name:".dimmed(), device.display_name);
            println!("  {} {}", "status:".dimmed(), status_label(device.status));
            println!("  {} {}", "id:".dimmed(), device.raw_platform_id);
            Ok(())
        }
        None => {
            // Normal outcome, not an error
            println!("{} Device not found (not connected?)", "✗".yellow());
            Ok(())
        }
    }
}

fn cmd_mcus() {
    println!(
        "{:<12} {:<36} {:>11}  {:<15} {}",
        "ID", "DESCRIPTION", "CLOCK", "FUSES L/H/E", "USB D+/D-"
    );
    println!("{}", "─".repeat(92).dimmed());

    for p in McuProfile::catalog() {
        println!(
            "{:<12} {:<36} {:>8} Hz  0x{:02x}/0x{:02x}/0x{:02x}  P{}{} / P{}{}",
            p.id.bold(),
            p.description,
            p.clock_hz,
            p.fuse_low,
            p.fuse_high,
            p.fuse_extended,
            p.usb_port_name,
            p.usb_dplus_bit,
            p.usb_port_name,
            p.usb_dminus_bit,
        );
    }
}

fn cmd_build(args: BuildArgs, quiet: bool) -> Result<()> {
    builder::check_build_tools()?;

    let profile = McuProfile::lookup(&args.mcu)?;

    if !quiet {
        println!(
            "{} {} {}",
            "Building".cyan().bold(),
            format!("[{}]", profile).dimmed(),
            format!("[device: {}]", args.name).dimmed(),
        );
        println!("{}", "─".repeat(60).dimmed());
    }

    let req = BuildRequest {
        mcu_id: args.mcu,
        device_name: args.name,
        vendor_id: args.vendor_id,
        product_id: args.product_id,
        vusb_dir: args.vusb_path,
        output_dir: args.output_dir,
    };

    let hex = builder::build(&req)?;

    if !quiet {
        println!(
            "{} bootloader compiled\n  {} {}",
            "✓".green().bold(),
            "hex:".dimmed(),
            hex.display()
        );
        println!(
            "\nNext: {}",
            format!(
                "vuflash flash --mcu {} --hex {} --port <PORT>",
                req.mcu_id,
                hex.display()
            )
            .bold()
        );
    }
    Ok(())
}

fn cmd_driver(args: DriverArgs) -> Result<()> {
    let inf = driver::write_package(
        &args.output_dir,
        &args.name,
        &args.vendor_id,
        &args.product_id,
        &args.manufacturer,
    )?;
    println!(
        "{} driver package written\n  {} {}",
        "✓".green().bold(),
        "inf:".dimmed(),
        inf.display()
    );
    Ok(())
}

fn cmd_devices(args: DevicesArgs) -> Result<()> {
    let config = DeviceConfig::load(&args.config);

    println!(
        "{:<20} {:<10} {:<12} {}",
        "NAME", "VID:PID", "MCU", "DESCRIPTION"
    );
    println!("{}", "─".repeat(70).dimmed());

    for (name, entry) in &config.devices {
        println!(
            "{:<20} {:<10} {:<12} {}",
            name.bold(),
            format!(
                "{}:{}",
                entry.vendor_id.trim_start_matches("0x"),
                entry.product_id.trim_start_matches("0x")
            ),
            entry.mcu.as_deref().unwrap_or("—"),
            entry.description.dimmed(),
        );
    }
    Ok(())
}

fn cmd_check_deps() -> Result<()> {
    match programmer::check_avrdude() {
        Ok(()) => println!("{} avrdude found", "✓".green().bold()),
        Err(e) => {
            eprintln!("{} {}", "✗".red().bold(), e);
            return Err(FlashError::Other("missing dependencies".into()));
        }
    }
    match builder::check_build_tools() {
        Ok(()) => println!("{} avr-gcc / avr-objcopy / make found", "✓".green().bold()),
        Err(e) => {
            eprintln!("{} {}", "✗".red().bold(), e);
            return Err(FlashError::Other("missing dependencies".into()));
        }
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
//  Rendering
// ─────────────────────────────────────────────────────────────────────────────

fn status_label(status: DeviceStatus) -> &'static str {
    match status {
        DeviceStatus::Present => "present",
        DeviceStatus::Absent => "absent",
        DeviceStatus::Unknown => "unknown",
    }
}

fn render_outcome(outcome: &Outcome, quiet: bool) {
    if !quiet {
        for line in &outcome.diagnostics {
            println!("  {}", line.dimmed());
        }
        println!("{}", "─".repeat(60).dimmed());
    }

    let step = |label: &str, done: bool| {
        if done {
            println!("  {} {}", "✓".green().bold(), label);
        } else {
            println!("  {} {}", "✗".red().bold(), label);
        }
    };

    match outcome.final_stage {
        Stage::Done => {
            println!("{} provisioning completed", "✓".green().bold());
            step("backup", outcome.backup_performed);
            step("fuses", outcome.fuses_applied);
            step("flash", outcome.write_succeeded);
            if outcome.verify_succeeded {
                step("verify", true);
            } else {
                // Advisory only: the image is committed and may still work
                println!(
                    "  {} verify failed — bootloader may still work",
                    "!".yellow().bold()
                );
            }
        }
        stage => {
            println!(
                "{} provisioning aborted at {}",
                "✗".red().bold(),
                stage.to_string().bold()
            );
        }
    }
}
