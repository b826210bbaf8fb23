// Copyright 2021-2024 Kenta Ida
//
// SPDX-License-Identifier: Apache-2.0
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use clap::{Parser, ValueEnum};
use log::{error, info, warn};
use rust_dap::sim::SimTarget;
use rust_dap::{
    BitBangIo, ClockTiming, CmsisDap, ProbeInfo, SerialNumber, DEFAULT_PRODUCT, DEFAULT_VENDOR,
};
use rust_dap_tcp::DapServer;

mod board;
#[cfg(target_os = "linux")]
mod cdev_pin;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Backend {
    /// Simulated SWD target, for exercising host tools without hardware.
    Sim,
    /// Linux GPIO character device lines.
    Gpio,
}

#[derive(Debug, Parser)]
#[clap(
    name = "dap-tcp-server",
    version,
    about = "CMSIS-DAP probe served over TCP with bit-banged GPIO pins."
)]
struct Args {
    #[clap(long, default_value = "0.0.0.0:4441", help = "Address to listen on.")]
    bind: SocketAddr,

    #[clap(long, value_enum, default_value = "gpio")]
    backend: Backend,

    #[clap(long, default_value = "/dev/gpiochip0", help = "GPIO character device.")]
    chip: PathBuf,

    #[clap(long, default_value_t = 2, help = "SWCLK/TCK line offset.")]
    swclk: u32,
    #[clap(long, default_value_t = 3, help = "SWDIO/TMS line offset.")]
    swdio: u32,
    #[clap(long, help = "TDI line offset.")]
    tdi: Option<u32>,
    #[clap(long, help = "TDO line offset.")]
    tdo: Option<u32>,
    #[clap(long, help = "nTRST line offset.")]
    ntrst: Option<u32>,
    #[clap(long, help = "nRESET line offset.")]
    nreset: Option<u32>,
    #[clap(long, help = "Connect LED line offset.")]
    led_connect: Option<u32>,
    #[clap(long, help = "Running LED line offset.")]
    led_running: Option<u32>,

    #[clap(
        long,
        default_value_t = 160_000_000,
        value_parser = clap::value_parser!(u32).range(1_000_000..),
        help = "CPU clock the delay loop timing is expressed in, Hz."
    )]
    cpu_clock: u32,
    #[clap(long, default_value_t = 72, help = "CPU cycles per SWCLK/TCK write.")]
    io_port_write_cycles: u32,
    #[clap(
        long,
        default_value_t = 5,
        value_parser = clap::value_parser!(u32).range(1..),
        help = "CPU cycles per delay loop iteration."
    )]
    delay_slow_cycles: u32,

    #[clap(long, default_value = "eth0", help = "Network interface whose MAC becomes the serial number.")]
    interface: String,
    #[clap(long, help = "Serial number. Overrides the MAC address.")]
    serial: Option<String>,
    #[clap(long, default_value = DEFAULT_VENDOR)]
    vendor: String,
    #[clap(long, default_value = DEFAULT_PRODUCT)]
    product: String,

    #[clap(long, default_value_t = 1000, help = "Sleep between idle polls, in microseconds.")]
    poll_interval_us: u64,
}

impl Args {
    fn timing(&self) -> ClockTiming {
        ClockTiming {
            cpu_clock: self.cpu_clock,
            io_port_write_cycles: self.io_port_write_cycles,
            delay_slow_cycles: self.delay_slow_cycles,
        }
    }
}

fn main() {
    pretty_env_logger::formatted_timed_builder()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    let args = Args::parse();
    if let Err(err) = run(&args) {
        error!("{:#}", err);
        std::process::exit(1);
    }
}

fn run(args: &Args) -> anyhow::Result<()> {
    let timing = args.timing();
    let info = ProbeInfo {
        vendor: &args.vendor,
        product: &args.product,
        serial: serial_number(args),
        firmware_version: Some(env!("CARGO_PKG_VERSION")),
        ..ProbeInfo::default()
    };
    info!("serial number {}", info.serial.as_str());

    match args.backend {
        Backend::Sim => {
            let target = SimTarget::swd().with_timing(timing);
            serve(args, CmsisDap::new(target, info, timing))
        }
        Backend::Gpio => {
            let board = open_board(args, timing)?;
            serve(args, CmsisDap::new(board, info, timing))
        }
    }
}

#[cfg(target_os = "linux")]
fn open_board(args: &Args, timing: ClockTiming) -> anyhow::Result<cdev_pin::GpioBoard> {
    cdev_pin::open_board(args, timing)
}

#[cfg(not(target_os = "linux"))]
fn open_board(_args: &Args, _timing: ClockTiming) -> anyhow::Result<SimTarget> {
    bail!("the gpio backend needs Linux GPIO character devices")
}

fn serve<Io: BitBangIo>(args: &Args, dap: CmsisDap<'_, Io>) -> anyhow::Result<()> {
    let mut server = DapServer::bind(args.bind, dap)
        .with_context(|| format!("cannot listen on {}", args.bind))?;
    let idle = Duration::from_micros(args.poll_interval_us);
    loop {
        match server.process() {
            Ok(0) => thread::sleep(idle),
            Ok(_) => {}
            Err(err) if err.is_fatal() => return Err(err).context("server stopped"),
            // Already logged; the server is listening again.
            Err(_) => {}
        }
    }
}

fn serial_number(args: &Args) -> SerialNumber {
    if let Some(serial) = &args.serial {
        return SerialNumber::new(serial);
    }
    match read_mac(&args.interface) {
        Ok(mac) => SerialNumber::from_mac(mac),
        Err(err) => {
            warn!("{:#}, using a zero serial number", err);
            SerialNumber::from_mac([0; 6])
        }
    }
}

fn read_mac(interface: &str) -> anyhow::Result<[u8; 6]> {
    let path = format!("/sys/class/net/{}/address", interface);
    let text = fs::read_to_string(&path).with_context(|| format!("cannot read {}", path))?;
    parse_mac(text.trim())
}

fn parse_mac(text: &str) -> anyhow::Result<[u8; 6]> {
    let mut mac = [0u8; 6];
    let mut parts = text.split(':');
    for byte in mac.iter_mut() {
        let part = parts
            .next()
            .ok_or_else(|| anyhow!("MAC address {:?} is too short", text))?;
        *byte = u8::from_str_radix(part, 16)
            .with_context(|| format!("MAC address {:?} is malformed", text))?;
    }
    if parts.next().is_some() {
        bail!("MAC address {:?} is too long", text);
    }
    Ok(mac)
}

#[cfg(test)]
mod test {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_is_consistent() {
        Args::command().debug_assert();
    }

    #[test]
    fn defaults() {
        let args = Args::try_parse_from(["dap-tcp-server"]).unwrap();
        assert_eq!(args.bind, "0.0.0.0:4441".parse().unwrap());
        assert_eq!(args.backend, Backend::Gpio);
        assert_eq!(args.timing(), ClockTiming::default());
        assert_eq!(args.vendor, "OpenOCD");
        assert_eq!(args.tdi, None);
    }

    #[test]
    fn rejects_zero_delay_loop() {
        assert!(Args::try_parse_from(["dap-tcp-server", "--delay-slow-cycles", "0"]).is_err());
    }

    #[test]
    fn serial_override() {
        let args =
            Args::try_parse_from(["dap-tcp-server", "--backend", "sim", "--serial", "probe-1"]).unwrap();
        assert_eq!(args.backend, Backend::Sim);
        assert_eq!(serial_number(&args).as_str(), "probe-1");
    }

    #[test]
    fn mac_parsing() {
        assert_eq!(
            parse_mac("40:4c:ca:01:a2:ff").unwrap(),
            [0x40, 0x4c, 0xca, 0x01, 0xa2, 0xff]
        );
        assert!(parse_mac("40:4c:ca:01:a2").is_err());
        assert!(parse_mac("40:4c:ca:01:a2:ff:00").is_err());
        assert!(parse_mac("40:4c:ca:01:a2:zz").is_err());
    }
}
