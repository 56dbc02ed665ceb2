// SPDX-FileCopyrightText: 2026 The nftrace-rs Authors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Typed errors for the resolver/assembler components (§7 of the design:
//! "resolver-specific" vs. "recoverable" vs. "fatal"). Top-level startup
//! and run-loop errors stay on `anyhow`; these enums exist so worker loops
//! can pattern-match an error kind and decide metric-vs-fatal without
//! string matching.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("consumer expression read register {0} before it was written")]
    MissingSource(u8),

    #[error("loader targeted the reserved verdict register")]
    InvalidDestReg,

    #[error("lookup referenced set {table}/{name}#{id}, not in cache or kernel")]
    UnknownSet {
        table: String,
        name: String,
        id: u32,
    },

    #[error("expression data truncated: expected at least {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },
}

#[derive(Debug, Error)]
pub enum RuleCacheError {
    #[error("no cached rule for {table}/{chain}#{handle}")]
    NotFound {
        table: String,
        chain: String,
        handle: u64,
    },

    #[error("rule {table}/{chain}#{handle} was removed before the traced packet")]
    Expired {
        table: String,
        chain: String,
        handle: u64,
    },

    #[error("synchronous GETRULE query for {table}/{chain}#{handle} failed: {reason}")]
    QueryFailed {
        table: String,
        chain: String,
        handle: u64,
        reason: String,
    },
}

#[derive(Debug, Error)]
pub enum IfaceCacheError {
    #[error("no cached interface for index {0}")]
    CacheMiss(u32),
}

#[derive(Debug, Error)]
pub enum TraceGroupError {
    #[error("trace type {0} is not one of rule/return/policy")]
    UnknownTraceType(u8),

    #[error("group has no trace for trace_id {0}")]
    TraceGroupEmpty(u32),

    #[error("no rule event found in the group for trace_id {0}")]
    NoRuleEvent(u32),

    #[error("group is not yet terminal")]
    TraceDataNotReady,

    #[error(transparent)]
    Rule(#[from] RuleCacheError),

    #[error(transparent)]
    Iface(#[from] IfaceCacheError),
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue is at capacity")]
    Full,
}

/// Startup preconditions (§4.5, §7 "startup-fatal").
#[derive(Debug, Error)]
pub enum PreflightError {
    #[error("kernel version {0} is older than the minimum required 5.8")]
    KernelTooOld(String),

    #[error("BTF is not available: CONFIG_DEBUG_INFO_BTF is not set in {0}")]
    BtfMissing(String),

    #[error("required kernel module `{0}` is not loaded")]
    ModuleMissing(String),
}
