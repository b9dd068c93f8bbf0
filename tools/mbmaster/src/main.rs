//! mbmaster - Modbus TCP master on the command line
//!
//! Reads and writes holding registers through the `modbus-master` library,
//! using its blocking API on the master's own runtime.

mod logging;

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use colored::*;
use modbus_master::{MasterConfig, ModbusMaster, RegisterBuf};

#[derive(Parser)]
#[command(name = "mbmaster")]
#[command(about = "Modbus TCP master: read and write holding registers")]
#[command(long_about = "Modbus TCP master: read and write holding registers

Examples:
  mbmaster read 192.168.1.10 100 4                 # Four registers as u16
  mbmaster read 192.168.1.10:1502 0 2 -f i32 -r 2  # One int32, two retries
  mbmaster write 192.168.1.10 200 --i32 -5 70000   # Two int32 values
  mbmaster write [::1]:502 10 --hex 00010002       # Raw register bytes

Timeouts come from modbus-master.toml / modbus-master.yaml, MODBUS_MASTER_*
environment variables, or the file given with --config.")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    /// Configuration file (toml, yaml, yml or json)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Read holding registers (FC03)
    Read {
        /// Device address, host or host:port
        endpoint: String,
        /// Starting register address
        address: u16,
        /// Number of registers (1-125)
        count: u16,
        /// Retries on timeout or device error (max 5)
        #[arg(short, long, default_value_t = 0)]
        retries: u32,
        /// How to print the registers
        #[arg(short, long, value_enum, default_value_t = Format::U16)]
        format: Format,
    },
    /// Write holding registers (FC16)
    Write {
        /// Device address, host or host:port
        endpoint: String,
        /// Starting register address
        address: u16,
        #[command(flatten)]
        values: WriteValues,
        /// Retries on timeout or device error (max 5)
        #[arg(short, long, default_value_t = 0)]
        retries: u32,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Format {
    Hex,
    U16,
    I16,
    I32,
    Bits,
}

#[derive(Args, Debug)]
#[group(required = true, multiple = false)]
struct WriteValues {
    /// Unsigned register values
    #[arg(long = "u16", num_args = 1.., value_name = "V")]
    u16s: Vec<u16>,
    /// Signed register values
    #[arg(long = "i16", num_args = 1.., value_name = "V", allow_negative_numbers = true)]
    i16s: Vec<i16>,
    /// 32-bit values, two registers each, low word first
    #[arg(long = "i32", num_args = 1.., value_name = "V", allow_negative_numbers = true)]
    i32s: Vec<i32>,
    /// Raw register bytes as hex, e.g. 00FF1234
    #[arg(long, value_name = "HEX")]
    hex: Option<String>,
}

impl WriteValues {
    fn to_buffer(&self) -> Result<RegisterBuf> {
        let buffer = if let Some(hex) = &self.hex {
            RegisterBuf::from_bytes(&parse_hex(hex)?)?
        } else if !self.i32s.is_empty() {
            RegisterBuf::from_i32s(&self.i32s)?
        } else if !self.i16s.is_empty() {
            RegisterBuf::from_i16s(&self.i16s)?
        } else {
            RegisterBuf::from_u16s(&self.u16s)?
        };
        Ok(buffer)
    }
}

fn parse_hex(input: &str) -> Result<Vec<u8>> {
    let trimmed = input.trim();
    let digits: String = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed)
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '_')
        .collect();
    hex::decode(&digits).with_context(|| format!("invalid hex input '{input}'"))
}

/// One output line per value, prefixed with its register address
fn render(regs: &mut RegisterBuf, address: u16, count: u16, format: Format) -> Result<Vec<String>> {
    let mut lines = Vec::new();
    match format {
        Format::Hex => {
            let readable = regs.readable_bytes();
            let bytes = regs.read_bytes(readable)?;
            let words: Vec<String> = bytes.chunks(2).map(hex::encode_upper).collect();
            lines.push(words.join(" "));
        },
        Format::U16 => {
            for (i, value) in regs.read_u16s(usize::from(count))?.into_iter().enumerate() {
                lines.push(format!("{}: {}", address as usize + i, value));
            }
        },
        Format::I16 => {
            for (i, value) in regs.read_i16s(usize::from(count))?.into_iter().enumerate() {
                lines.push(format!("{}: {}", address as usize + i, value));
            }
        },
        Format::I32 => {
            if count % 2 != 0 {
                bail!("i32 format needs an even register count, got {count}");
            }
            for (i, value) in regs.read_i32s(usize::from(count / 2))?.into_iter().enumerate() {
                lines.push(format!("{}: {}", address as usize + i * 2, value));
            }
        },
        Format::Bits => {
            for i in 0..usize::from(count) {
                lines.push(format!("{}: {}", address as usize + i, regs.read_bits_lsb_first()?));
            }
        },
    }
    Ok(lines)
}

fn load_config(path: Option<&PathBuf>) -> Result<MasterConfig> {
    let config = match path {
        Some(path) => MasterConfig::load_from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => MasterConfig::load().context("Failed to load config")?,
    };
    Ok(config)
}

fn run(cli: Cli) -> Result<()> {
    let config = load_config(cli.config.as_ref())?;
    let master = ModbusMaster::with_config(config).context("Failed to start modbus master")?;

    match cli.command {
        Commands::Read {
            endpoint,
            address,
            count,
            retries,
            format,
        } => {
            if format == Format::I32 && count % 2 != 0 {
                bail!("i32 format needs an even register count, got {count}");
            }
            let mut regs = master
                .read_with_retries(&endpoint, address, count, retries)
                .with_context(|| format!("Read {count} registers at {address} from {endpoint}"))?;
            for line in render(&mut regs, address, count, format)? {
                match line.split_once(": ") {
                    Some((addr, value)) => println!("{}: {}", addr.bright_cyan(), value),
                    None => println!("{line}"),
                }
            }
        },
        Commands::Write {
            endpoint,
            address,
            values,
            retries,
        } => {
            let buffer = values.to_buffer()?;
            let registers = buffer.register_count();
            master
                .write_with_retries(&endpoint, address, &buffer, retries)
                .with_context(|| format!("Write {registers} registers at {address} to {endpoint}"))?;
            println!(
                "{} wrote {} registers at {} to {}",
                "OK".green(),
                registers,
                address,
                endpoint
            );
        },
    }

    master.shutdown();
    Ok(())
}

fn main() {
    let cli = Cli::parse();

    if cli.no_color {
        colored::control::set_override(false);
    }
    logging::init(cli.verbose, !cli.no_color);

    if let Err(e) = run(cli) {
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}
