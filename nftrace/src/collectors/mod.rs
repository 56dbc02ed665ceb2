// SPDX-FileCopyrightText: 2026 The nftrace-rs Authors
// SPDX-License-Identifier: GPL-3.0-or-later

mod btf_offsets;
pub mod ebpf;
pub mod netlink;
mod netlink_attrs;

/// Counters both collectors report via the `prometheus` registry (§6).
#[derive(Debug, Default, Clone, Copy)]
pub struct CollectorStats {
    pub rcv_samples: u64,
    pub rcv_pkt: u64,
    pub lost_samples: u64,
}
