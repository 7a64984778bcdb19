//! Command-line access to an I2C bus through the i2cmux engine.
//!
//! Every command opens the bus, performs one paced operation, prints the
//! result in hex and exits. Useful for bring-up and for checking what the
//! daemon would see.

use anyhow::{bail, Context, Result};
use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use std::time::Duration;

use i2cmux::bus::{Bus, BusOptions, Presence};
use i2cmux::transport::I2cDev;
use i2cmux::types::DeviceAddress;

const DEFAULT_BUS: &str = "/dev/i2c-1";

fn main() -> Result<()> {
    i2cmux::tracing::init_stderr();

    let address = || {
        Arg::with_name("address")
            .help("Device address (0x08-0x77)")
            .required(true)
    };
    let register = || Arg::with_name("register").help("Register (command code)").required(true);
    let word = || {
        Arg::with_name("word")
            .short("w")
            .long("word")
            .help("16-bit word access instead of a byte")
    };

    let matches = App::new("i2cmux")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Rate-limited I2C bus access")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(
            Arg::with_name("bus")
                .short("b")
                .long("bus")
                .value_name("DEVICE")
                .help("I2C adapter device")
                .takes_value(true)
                .default_value(DEFAULT_BUS)
                .global(true),
        )
        .arg(
            Arg::with_name("interval")
                .long("interval")
                .value_name("MICROSECONDS")
                .help("Minimum spacing between transactions")
                .takes_value(true)
                .global(true),
        )
        .arg(
            Arg::with_name("recover-ioctl")
                .long("recover-ioctl")
                .value_name("REQUEST")
                .help("Driver ioctl request for kernel-assisted recovery")
                .takes_value(true)
                .global(true),
        )
        .subcommand(SubCommand::with_name("scan").about("Probe every device address"))
        .subcommand(
            SubCommand::with_name("get")
                .about("Read a register")
                .arg(address())
                .arg(register())
                .arg(word()),
        )
        .subcommand(
            SubCommand::with_name("set")
                .about("Write a register")
                .arg(address())
                .arg(register())
                .arg(Arg::with_name("value").help("Value to write").required(true))
                .arg(word()),
        )
        .subcommand(
            SubCommand::with_name("block")
                .about("Read up to 256 consecutive registers")
                .arg(address())
                .arg(register())
                .arg(Arg::with_name("length").help("Byte count (1-256)").required(true)),
        )
        .subcommand(
            SubCommand::with_name("u32")
                .about("Read a little-endian 32-bit value")
                .arg(address())
                .arg(register()),
        )
        .subcommand(
            SubCommand::with_name("raw-write")
                .about("Send one byte with no SMBus framing")
                .arg(address())
                .arg(Arg::with_name("value").help("Byte to send").required(true)),
        )
        .subcommand(
            SubCommand::with_name("raw-read")
                .about("Read bytes with no SMBus framing")
                .arg(address())
                .arg(Arg::with_name("length").help("Byte count (1-32)").required(true)),
        )
        .subcommand(SubCommand::with_name("recover").about("Attempt to unstick the bus"))
        .subcommand(SubCommand::with_name("funcs").about("Show adapter functionality"))
        .get_matches();

    let mut bus = open_bus(&matches)?;

    match matches.subcommand() {
        ("scan", Some(_)) => scan(&mut bus),
        ("get", Some(m)) => {
            let (address, reg) = (arg_address(m)?, arg_u8(m, "register")?);
            if m.is_present("word") {
                println!("0x{:04x}", bus.read_word(address, reg)?);
            } else {
                println!("0x{:02x}", bus.read_byte(address, reg)?);
            }
        }
        ("set", Some(m)) => {
            let (address, reg) = (arg_address(m)?, arg_u8(m, "register")?);
            if m.is_present("word") {
                bus.write_word(address, reg, arg_u16(m, "value")?)?;
            } else {
                bus.write_byte(address, reg, arg_u8(m, "value")?)?;
            }
        }
        ("block", Some(m)) => {
            let (address, reg) = (arg_address(m)?, arg_u8(m, "register")?);
            let length: usize = parse_number(value(m, "length")?)?
                .try_into()
                .context("length")?;
            let data = bus.read_block(address, reg, length)?;
            if data.len() < length {
                eprintln!("warning: short read, {} of {} bytes", data.len(), length);
            }
            dump(reg, &data);
        }
        ("u32", Some(m)) => {
            let value = bus.read_u32_le(arg_address(m)?, arg_u8(m, "register")?)?;
            println!("0x{:08x}", value);
        }
        ("raw-write", Some(m)) => {
            bus.raw_write_to(arg_address(m)?, arg_u8(m, "value")?)?;
        }
        ("raw-read", Some(m)) => {
            let length: usize = parse_number(value(m, "length")?)?
                .try_into()
                .context("length")?;
            println!("{}", hex::encode(bus.raw_read_from(arg_address(m)?, length)?));
        }
        ("recover", Some(_)) => {
            let strategy = bus.recover_bus()?;
            println!("recovered via {}", strategy);
        }
        ("funcs", Some(_)) => {
            let funcs = bus.functionality()?;
            println!("0x{:08x}", funcs.bits());
            for name in funcs.describe() {
                println!("  {}", name);
            }
        }
        (other, _) => bail!("unknown command: {}", other),
    }

    bus.close()?;
    Ok(())
}

fn open_bus(matches: &ArgMatches<'_>) -> Result<Bus<I2cDev>> {
    let path = value(matches, "bus")?;
    let mut options = BusOptions {
        name: path.to_string(),
        ..BusOptions::default()
    };
    if let Some(us) = matches.value_of("interval") {
        options.min_interval = Duration::from_micros(parse_number(us)?);
    }
    let recover_request = matches.value_of("recover-ioctl").map(parse_number).transpose()?;

    Bus::open(path, DeviceAddress::LOWEST, recover_request, options).with_context(|| format!("opening {}", path))
}

// Same layout as i2cdetect: one row per 16 addresses, reserved ones blank.
fn scan(bus: &mut Bus<I2cDev>) {
    println!("     0  1  2  3  4  5  6  7  8  9  a  b  c  d  e  f");
    for row in (0u8..0x80).step_by(16) {
        print!("{:02x}:", row);
        for address in row..row + 16 {
            match bus.scan_address(address) {
                Presence::Detected => print!(" {:02x}", address),
                Presence::NotDetected => print!(" --"),
                Presence::Invalid => print!("   "),
            }
        }
        println!();
    }
}

fn dump(start: u8, data: &[u8]) {
    for (i, line) in data.chunks(16).enumerate() {
        let offset = start.wrapping_add((i * 16) as u8);
        println!("{:02x}: {}", offset, hex::encode(line));
    }
}

fn value<'a>(m: &'a ArgMatches<'_>, name: &str) -> Result<&'a str> {
    m.value_of(name).with_context(|| format!("missing {}", name))
}

fn arg_address(m: &ArgMatches<'_>) -> Result<DeviceAddress> {
    Ok(value(m, "address")?.parse::<DeviceAddress>()?)
}

fn arg_u8(m: &ArgMatches<'_>, name: &str) -> Result<u8> {
    parse_number(value(m, name)?)?
        .try_into()
        .with_context(|| format!("{} must fit in a byte", name))
}

fn arg_u16(m: &ArgMatches<'_>, name: &str) -> Result<u16> {
    parse_number(value(m, name)?)?
        .try_into()
        .with_context(|| format!("{} must fit in 16 bits", name))
}

// Accepts 0x-prefixed hex or decimal.
fn parse_number(text: &str) -> Result<u64> {
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(digits) => u64::from_str_radix(digits, 16),
        None => text.parse(),
    };
    match parsed {
        Ok(n) => Ok(n),
        Err(_) => bail!("not a number: {}", text),
    }
}
