// SPDX-FileCopyrightText: 2026 The nftrace-rs Authors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Startup preflight checks (SPEC_FULL.md §C), ported from the source
//! project's `kernel-info.go`: kernel version, `nf_tables` module
//! presence, and BTF availability. All three are startup-fatal (§7).

use crate::errors::PreflightError;
use anyhow::{Context, Result};
use std::fs;

const MIN_KERNEL_MAJOR: u32 = 5;
const MIN_KERNEL_MINOR: u32 = 8;

fn kernel_release() -> Result<String> {
    let uname = nix::sys::utsname::uname().context("uname(2)")?;
    Ok(uname.release().to_string_lossy().into_owned())
}

fn parse_major_minor(release: &str) -> Option<(u32, u32)> {
    let mut parts = release.split('.');
    let major: u32 = parts.next()?.parse().ok()?;
    let minor_str = parts.next()?;
    let minor: u32 = minor_str
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect::<String>()
        .parse()
        .ok()?;
    Some((major, minor))
}

fn check_kernel_version(release: &str) -> Result<(), PreflightError> {
    match parse_major_minor(release) {
        Some((major, minor)) if major > MIN_KERNEL_MAJOR || (major == MIN_KERNEL_MAJOR && minor >= MIN_KERNEL_MINOR) => {
            Ok(())
        }
        _ => Err(PreflightError::KernelTooOld(release.to_string())),
    }
}

fn check_module_loaded(name: &str) -> Result<(), PreflightError> {
    let modules = fs::read_to_string("/proc/modules").unwrap_or_default();
    let loaded = modules
        .lines()
        .any(|line| line.split_whitespace().next() == Some(name));
    if loaded {
        Ok(())
    } else {
        Err(PreflightError::ModuleMissing(name.to_string()))
    }
}

fn check_btf(release: &str) -> Result<(), PreflightError> {
    let path = format!("/boot/config-{release}");
    let contents = fs::read_to_string(&path).unwrap_or_default();
    let enabled = contents
        .lines()
        .any(|line| line.trim() == "CONFIG_DEBUG_INFO_BTF=y");
    if enabled {
        Ok(())
    } else {
        Err(PreflightError::BtfMissing(path))
    }
}

/// Runs all preflight checks; returns the first failure.
pub fn check() -> Result<()> {
    let release = kernel_release()?;
    check_kernel_version(&release)?;
    check_module_loaded("nf_tables")?;
    check_btf(&release)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_standard_release_strings() {
        assert_eq!(parse_major_minor("5.15.0-91-generic"), Some((5, 15)));
        assert_eq!(parse_major_minor("6.1.0"), Some((6, 1)));
    }

    #[test]
    fn rejects_old_kernels() {
        assert!(check_kernel_version("4.19.0").is_err());
        assert!(check_kernel_version("5.7.12").is_err());
    }

    #[test]
    fn accepts_new_enough_kernels() {
        assert!(check_kernel_version("5.8.0").is_ok());
        assert!(check_kernel_version("5.15.0-91-generic").is_ok());
        assert!(check_kernel_version("6.1.0").is_ok());
    }
}
