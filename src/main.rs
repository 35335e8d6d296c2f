use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use pdiprog::constants::{DEFAULT_TIMEOUT_MS, SIGNATURE_ADDRESS};
use pdiprog::programmer::erase_with_timeout_recovery;
use pdiprog::transport::UsbTransport;
use pdiprog::{
    EraseTarget, PartDb, PdiBus, Programmer, ProgrammerConfig, SimBus, VerifyPolicy, XprogBus,
};

#[derive(Parser)]
#[command(
    name = "pdiprog",
    version,
    about = "Program AVR XMEGA parts over PDI with a ChipWhisperer-Lite"
)]
struct Cli {
    /// Print debug messages, including raw bus traffic
    #[arg(short, long, global = true)]
    verbose: bool,

    /// PDI response timeout in milliseconds
    #[arg(long, global = true, default_value_t = DEFAULT_TIMEOUT_MS)]
    timeout: u16,

    /// Address the signature bytes are read from
    #[arg(long, global = true, value_parser = parse_number, default_value_t = SIGNATURE_ADDRESS)]
    signature_address: u32,

    /// Report verify mismatches without failing
    #[arg(long, global = true)]
    lenient_verify: bool,

    /// Additional part family file (YAML), appended to the built-in catalog
    #[arg(long, global = true)]
    parts: Option<PathBuf>,

    /// Index of the ChipWhisperer-Lite to use
    #[arg(short, long, global = true, default_value_t = 0)]
    device: usize,

    /// Use an emulated target of this part instead of hardware
    #[arg(long, global = true, value_name = "PART")]
    simulate: Option<String>,

    /// Continue even if the chip signature is unknown
    #[arg(short, long, global = true)]
    force: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Identify the connected chip
    Info,
    /// List supported parts
    Parts,
    /// Erase the chip or the application section
    Erase {
        #[arg(default_value = "chip")]
        memtype: String,
    },
    /// Erase, program and verify
    Flash {
        /// Intel HEX, ELF or raw binary file
        path: PathBuf,
        #[arg(short, long, default_value = "flash")]
        region: String,
        /// Skip the chip erase before programming
        #[arg(long)]
        no_erase: bool,
        /// Skip read-back verification
        #[arg(long)]
        no_verify: bool,
    },
    /// Compare memory content with a file
    Verify {
        path: PathBuf,
        #[arg(short, long, default_value = "flash")]
        region: String,
    },
    /// Read a memory region
    Dump {
        region: String,
        /// Number of bytes, the whole region by default
        #[arg(short, long, value_parser = parse_number)]
        length: Option<u32>,
        /// Write raw bytes to a file instead of printing a hexdump
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
}

fn parse_number(s: &str) -> std::result::Result<u32, String> {
    let n = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    };
    n.map_err(|e| format!("{:?}: {}", s, e))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        simplelog::LevelFilter::Debug
    } else {
        simplelog::LevelFilter::Info
    };
    let _ = simplelog::TermLogger::init(
        level,
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    );

    let parts = match &cli.parts {
        Some(path) => PartDb::load_with_extra(path)?,
        None => PartDb::load()?,
    };

    if let Command::Parts = cli.command {
        for family in parts.families() {
            log::info!("{}: {}", family.name, family.description);
            for part in &family.variants {
                log::info!(
                    "  {} (Flash: {}KiB, EEPROM: {}KiB)",
                    part,
                    part.flash_size() / 1024,
                    part.eeprom_size() / 1024
                );
            }
        }
        return Ok(());
    }

    let config = ProgrammerConfig {
        signature_address: cli.signature_address,
        timeout_ms: cli.timeout,
        verify_policy: if cli.lenient_verify {
            VerifyPolicy::Lenient
        } else {
            VerifyPolicy::Strict
        },
    };

    match &cli.simulate {
        Some(name) => {
            let part = parts
                .find_by_name(name)
                .ok_or_else(|| anyhow::format_err!("Unknown part {:?}", name))?;
            log::warn!("Simulating {}, no hardware is used", part);
            let bus = SimBus::with_signature_at(cli.signature_address, part.signature);
            run(&cli, bus, parts, config)
        }
        None => {
            let n = UsbTransport::scan_devices()?;
            log::debug!("{} ChipWhisperer-Lite device(s) found", n);
            let transport = UsbTransport::open_nth(cli.device)?;
            run(&cli, XprogBus::new(transport).with_progress(true), parts, config)
        }
    }
}

fn run<B: PdiBus>(cli: &Cli, bus: B, parts: PartDb, config: ProgrammerConfig) -> Result<()> {
    let mut programmer = Programmer::attach(bus, parts, config)?;

    let found = programmer.find()?;
    if !found.identified && !cli.force && !matches!(cli.command, Command::Info) {
        anyhow::bail!(
            "Unknown chip signature {}, use --force to continue as {}",
            hex::encode(found.raw_signature),
            programmer.selected_part().name
        );
    }

    match &cli.command {
        Command::Info | Command::Parts => {
            let part = programmer.selected_part();
            log::info!("Chip: {}", part);
            log::info!("Signature: {}", hex::encode(found.raw_signature));
            log::info!("Identified: {}", found.identified);
            for (name, region) in &part.memory_regions {
                log::info!(
                    "  {:<10} 0x{:08x} {:>7} bytes",
                    name,
                    region.offset,
                    region.size
                );
            }
        }
        Command::Erase { memtype } => {
            let target: EraseTarget = memtype.parse()?;
            erase_with_timeout_recovery(&mut programmer, target)?;
        }
        Command::Flash {
            path,
            region,
            no_erase,
            no_verify,
        } => {
            if !no_erase {
                log::info!("Erasing");
                erase_with_timeout_recovery(&mut programmer, EraseTarget::Chip)?;
            }
            let result = programmer.program(path, region, !no_verify)?;
            log::info!(
                "{} bytes written to {}{}",
                result.bytes_written,
                region,
                if *no_verify { ", not verified" } else { "" }
            );
            if !result.is_verified() {
                log::warn!("{} byte(s) differ after programming", result.mismatches.len());
            }
        }
        Command::Verify { path, region } => {
            let result = programmer.verify(path, region)?;
            if result.is_verified() {
                log::info!("Verified!");
            } else {
                for m in &result.mismatches {
                    log::warn!(
                        "0x{:04x}: expected {:02x}, read {:02x}",
                        m.index,
                        m.expected,
                        m.actual
                    );
                }
            }
        }
        Command::Dump {
            region,
            length,
            out,
        } => {
            let data = programmer.read_region(region, length.map(|n| n as usize))?;
            match out {
                Some(path) => {
                    std::fs::write(path, &data)?;
                    log::info!("{} bytes of {} saved to {}", data.len(), region, path.display());
                }
                None => {
                    let mut dump = Vec::new();
                    hxdmp::hexdump(&data, &mut dump)?;
                    println!("{}", String::from_utf8_lossy(&dump));
                }
            }
        }
    }

    programmer.close()?;
    Ok(())
}
