// SPDX-FileCopyrightText: 2026 The nftrace-rs Authors
// SPDX-License-Identifier: GPL-3.0-or-later

//! CLI flags (§6). Parsed by hand into `OnceLock` cells, as the teacher's
//! `opt.rs` does for its own small flat flag set — `clap` would be
//! overkill for nine flags with no subcommands.

use anyhow::{anyhow, Context, Result};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use crate::logging::Severity;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Collector {
    Ebpf,
    Netlink,
}

impl fmt::Display for Collector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Collector::Ebpf => "ebpf",
            Collector::Netlink => "netlink",
        })
    }
}

#[derive(Debug)]
pub struct ParseCollectorError(String);
impl fmt::Display for ParseCollectorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid collector '{}' (use: ebpf|netlink)", self.0)
    }
}
impl std::error::Error for ParseCollectorError {}

impl FromStr for Collector {
    type Err = ParseCollectorError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ebpf" => Ok(Collector::Ebpf),
            "netlink" => Ok(Collector::Netlink),
            _ => Err(ParseCollectorError(s.to_string())),
        }
    }
}

const DEFAULT_RATE: u64 = 0;
const DEFAULT_SIZE: usize = 16 * 1024 * 1024;
const DEFAULT_LEVEL: Severity = Severity::Info;
const DEFAULT_TL: &str = "0.0.0.0:5000";
const DEFAULT_EV: u64 = 10;
const DEFAULT_COLLECTOR: Collector = Collector::Ebpf;
const DEFAULT_AGGREGATE: bool = false;
const DEFAULT_JSON: bool = false;
const DEFAULT_NO_PRINT: bool = false;
const DEFAULT_BALLAST_MIB: usize = 0;

static OPT_RATE: OnceLock<u64> = OnceLock::new();
static OPT_SIZE: OnceLock<usize> = OnceLock::new();
static OPT_LEVEL: OnceLock<Severity> = OnceLock::new();
static OPT_TL: OnceLock<String> = OnceLock::new();
static OPT_EV: OnceLock<u64> = OnceLock::new();
static OPT_COLLECTOR: OnceLock<Collector> = OnceLock::new();
static OPT_AGGREGATE: OnceLock<bool> = OnceLock::new();
static OPT_JSON: OnceLock<bool> = OnceLock::new();
static OPT_NO_PRINT: OnceLock<bool> = OnceLock::new();
static OPT_BALLAST_MIB: OnceLock<usize> = OnceLock::new();
static OPT_LOG_FILE: OnceLock<Option<String>> = OnceLock::new();

pub fn rate() -> u64 {
    *OPT_RATE.get().unwrap_or(&DEFAULT_RATE)
}
pub fn ring_size() -> usize {
    *OPT_SIZE.get().unwrap_or(&DEFAULT_SIZE)
}
pub fn level() -> Severity {
    *OPT_LEVEL.get().unwrap_or(&DEFAULT_LEVEL)
}
pub fn telemetry_addr() -> &'static str {
    OPT_TL.get().map(String::as_str).unwrap_or(DEFAULT_TL)
}
pub fn flush_hz() -> u64 {
    *OPT_EV.get().unwrap_or(&DEFAULT_EV)
}
pub fn collector() -> Collector {
    *OPT_COLLECTOR.get().unwrap_or(&DEFAULT_COLLECTOR)
}
pub fn aggregate() -> bool {
    *OPT_AGGREGATE.get().unwrap_or(&DEFAULT_AGGREGATE)
}
pub fn json() -> bool {
    *OPT_JSON.get().unwrap_or(&DEFAULT_JSON)
}
pub fn no_print() -> bool {
    *OPT_NO_PRINT.get().unwrap_or(&DEFAULT_NO_PRINT)
}
pub fn ballast_mib() -> usize {
    *OPT_BALLAST_MIB.get().unwrap_or(&DEFAULT_BALLAST_MIB)
}
pub fn log_file() -> Option<&'static str> {
    OPT_LOG_FILE.get().and_then(|o| o.as_deref())
}

fn take_value<T, I>(args: &mut I, arg_name: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    I: Iterator<Item = String>,
{
    let raw = args
        .next()
        .ok_or_else(|| anyhow!("argument: missing value after {arg_name}"))?;
    raw.parse::<T>()
        .with_context(|| format!("argument {arg_name}: invalid value '{raw}'"))
}

fn set_opt<T: fmt::Display>(name: &str, cell: &OnceLock<T>, value: T) -> Result<()> {
    cell.set(value).map_err(|_| anyhow!("{name} already initialized"))?;
    log::info!("{name}: {}", cell.get().expect("just set; qed"));
    Ok(())
}

fn usage() {
    println!(
        r#"Usage: nftrace [OPTIONS]

Options:
  --rate       <u64>           Kernel-side sample rate, 0 = every packet (default: {DEFAULT_RATE})
  --size       <bytes>         Receive ring-buffer size (default: {DEFAULT_SIZE})
  --level      <level>         INFO|DEBUG|WARN|ERROR|PANIC|FATAL (default: {DEFAULT_LEVEL})
  --tl         <host:port>     Telemetry HTTP endpoint (default: {DEFAULT_TL})
  --ev         <hz>            Aggregation flush frequency, 1-100 (default: {DEFAULT_EV})
  -c           <ebpf|netlink>  Collector selection (default: {DEFAULT_COLLECTOR})
  -a                           Enable aggregation
  -j                           Print JSON
  --np                         Suppress printing
  --ballast-mib <mib>          Pin a ballast allocation of this size (default: {DEFAULT_BALLAST_MIB}, off)
  --log-file   <path>          Also log to this file
  -h, --help                   Show this help"#
    );
}

fn parse_args_1() -> Result<()> {
    let mut rate = DEFAULT_RATE;
    let mut size = DEFAULT_SIZE;
    let mut level = DEFAULT_LEVEL;
    let mut tl = DEFAULT_TL.to_string();
    let mut ev = DEFAULT_EV;
    let mut collector = DEFAULT_COLLECTOR;
    let mut aggregate = DEFAULT_AGGREGATE;
    let mut json = DEFAULT_JSON;
    let mut no_print = DEFAULT_NO_PRINT;
    let mut ballast_mib = DEFAULT_BALLAST_MIB;
    let mut log_file: Option<String> = None;

    let mut args = std::env::args().skip(1);

    while let Some(arg) = args.next() {
        let argv = arg.as_str();
        match argv {
            "-h" | "--help" => {
                usage();
                std::process::exit(0);
            }
            "--rate" => rate = take_value(&mut args, argv)?,
            "--size" => size = take_value(&mut args, argv)?,
            "--level" => level = take_value(&mut args, argv)?,
            "--tl" => tl = take_value(&mut args, argv)?,
            "--ev" => {
                let hz: u64 = take_value(&mut args, argv)?;
                if !(1..=100).contains(&hz) {
                    return Err(anyhow!("argument --ev: must be in 1..=100, got {hz}"));
                }
                ev = hz;
            }
            "-c" => collector = take_value(&mut args, argv)?,
            "-a" => aggregate = true,
            "-j" => json = true,
            "--np" => no_print = true,
            "--ballast-mib" => ballast_mib = take_value(&mut args, argv)?,
            "--log-file" => log_file = Some(take_value(&mut args, argv)?),
            _ => return Err(anyhow!("argument: unknown: {arg}")),
        }
    }

    set_opt("rate", &OPT_RATE, rate)?;
    set_opt("size", &OPT_SIZE, size)?;
    set_opt("level", &OPT_LEVEL, level)?;
    set_opt("tl", &OPT_TL, tl)?;
    set_opt("ev", &OPT_EV, ev)?;
    set_opt("c", &OPT_COLLECTOR, collector)?;
    set_opt("a", &OPT_AGGREGATE, aggregate)?;
    set_opt("j", &OPT_JSON, json)?;
    set_opt("np", &OPT_NO_PRINT, no_print)?;
    set_opt("ballast-mib", &OPT_BALLAST_MIB, ballast_mib)?;
    OPT_LOG_FILE
        .set(log_file)
        .map_err(|_| anyhow!("log-file already initialized"))?;

    Ok(())
}

pub fn parse_args() {
    if let Err(e) = parse_args_1() {
        eprintln!("{e}");
        usage();
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collector_roundtrips() {
        assert_eq!("ebpf".parse::<Collector>().unwrap(), Collector::Ebpf);
        assert_eq!("NETLINK".parse::<Collector>().unwrap(), Collector::Netlink);
        assert!("bogus".parse::<Collector>().is_err());
    }
}
