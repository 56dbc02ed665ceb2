// SPDX-FileCopyrightText: 2026 The nftrace-rs Authors
// SPDX-License-Identifier: GPL-3.0-or-later

//! The per-rule register file (§3, §4.1). Loader expressions stash a
//! fragment here keyed by destination register; consumer expressions
//! read it back to compose their emitted token. `NFT_REG_VERDICT` is
//! reserved and rejected as a loader destination.

use serde_json::Value;
use std::collections::HashMap;

/// `NFT_REG_VERDICT` in the kernel's register numbering.
pub const REG_VERDICT: u8 = 0;

/// What produced a register's value, consulted by `cmp`/bitwise-chain
/// rendering to pick the right right-hand-side formatter (§4.1
/// "Comparison semantics").
#[derive(Debug, Clone)]
pub enum RegSource {
    Meta(MetaKey),
    Payload(PayloadField),
    Ct(CtKey),
    Bitwise(Box<RegSource>),
    Immediate,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaKey {
    L4proto,
    Nfproto,
    Protocol,
    Iif,
    Oif,
    Iifname,
    Oifname,
    Nftrace,
    Mark,
    Other(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtKey {
    State,
    Direction,
    L3proto,
    Expiration,
    Other(u32),
}

#[derive(Debug, Clone)]
pub struct PayloadField {
    pub base: PayloadBase,
    pub offset_bits: u32,
    pub len_bits: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadBase {
    LinkHeader,
    NetworkHeader,
    TransportHeader,
}

#[derive(Debug, Clone)]
pub struct RegEntry {
    /// The text this register would render as if it were consumed
    /// standalone (used by bitwise-chain and cmp descriptor lookups).
    pub text: String,
    pub json: Value,
    pub byte_length: usize,
    pub source: RegSource,
}

#[derive(Default)]
pub struct RegisterFile {
    regs: HashMap<u8, RegEntry>,
}

impl RegisterFile {
    pub fn new() -> Self {
        Self {
            regs: HashMap::new(),
        }
    }

    pub fn store(&mut self, reg: u8, entry: RegEntry) -> Result<(), crate::errors::DecodeError> {
        if reg == REG_VERDICT {
            return Err(crate::errors::DecodeError::InvalidDestReg);
        }
        self.regs.insert(reg, entry);
        Ok(())
    }

    pub fn load(&self, reg: u8) -> Result<&RegEntry, crate::errors::DecodeError> {
        self.regs
            .get(&reg)
            .ok_or(crate::errors::DecodeError::MissingSource(reg))
    }

    /// Cleared between rules (§3 invariant iii).
    pub fn reset(&mut self) {
        self.regs.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_to_verdict_register_is_rejected() {
        let mut rf = RegisterFile::new();
        let entry = RegEntry {
            text: "x".into(),
            json: Value::Null,
            byte_length: 4,
            source: RegSource::Immediate,
        };
        assert!(rf.store(REG_VERDICT, entry).is_err());
    }

    #[test]
    fn load_missing_register_errors() {
        let rf = RegisterFile::new();
        assert!(rf.load(3).is_err());
    }

    #[test]
    fn reset_clears_all_registers() {
        let mut rf = RegisterFile::new();
        rf.store(
            1,
            RegEntry {
                text: "x".into(),
                json: Value::Null,
                byte_length: 4,
                source: RegSource::Immediate,
            },
        )
        .unwrap();
        rf.reset();
        assert!(rf.load(1).is_err());
    }
}
