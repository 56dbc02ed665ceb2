// SPDX-FileCopyrightText: 2026 The nftrace-rs Authors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Types shared across the eBPF/userspace boundary.
//!
//! [`RawTraceInfo`] is read by the eBPF program out of kernel stack memory
//! and written verbatim into the ring buffer; userspace reinterprets the
//! same bytes back into this struct (see `nftrace::ebpf_collector`). The
//! layout must stay `repr(C)` and field-for-field stable — there is no
//! wire-format negotiation between the two sides, just a shared header.

#![no_std]

#[cfg(test)]
extern crate std;

/// Upper bound on the per-rule table/chain/jump-target name length copied
/// out of kernel memory. Matches `NFT_NAME_MAXLEN` less a null terminator
/// headroom.
pub const NAME_MAXLEN: usize = 32;

/// `nft_trace_types` as exposed by the kernel through `NFTA_TRACE_TYPE`.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceKind {
    Rule = 1,
    Return = 2,
    Policy = 3,
}

impl TraceKind {
    pub fn from_raw(v: u32) -> Option<Self> {
        match v {
            1 => Some(Self::Rule),
            2 => Some(Self::Return),
            3 => Some(Self::Policy),
            _ => None,
        }
    }
}

/// `nfproto` family identifiers (`NFPROTO_*`).
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    Unspec = 0,
    Inet = 1,
    Ipv4 = 2,
    Arp = 3,
    Netdev = 5,
    Bridge = 7,
    Ipv6 = 10,
}

impl Family {
    pub fn from_raw(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Unspec),
            1 => Some(Self::Inet),
            2 => Some(Self::Ipv4),
            3 => Some(Self::Arp),
            5 => Some(Self::Netdev),
            7 => Some(Self::Bridge),
            10 => Some(Self::Ipv6),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unspec => "unspec",
            Self::Inet => "inet",
            Self::Ipv4 => "ip",
            Self::Arp => "arp",
            Self::Netdev => "netdev",
            Self::Bridge => "bridge",
            Self::Ipv6 => "ip6",
        }
    }
}

/// Fixed-layout trace record produced by the kprobe program and drained
/// from the ring buffer by `nftrace::ebpf_collector`.
///
/// `src_ip`/`dst_ip` always hold 16 bytes; IPv4 addresses are stored in the
/// first 4 bytes with the remainder zeroed, distinguished by `family`.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct RawTraceInfo {
    pub trace_id: u32,
    pub trace_type: u32,
    pub family: u8,
    pub nfproto: u8,
    pub _pad0: [u8; 2],
    pub table_name: [u8; NAME_MAXLEN],
    pub chain_name: [u8; NAME_MAXLEN],
    pub jump_target: [u8; NAME_MAXLEN],
    pub rule_handle: u64,
    pub verdict: i32,
    pub policy: i32,
    pub iif: u32,
    pub oif: u32,
    pub iif_type: u16,
    pub oif_type: u16,
    pub iifname: [u8; 16],
    pub oifname: [u8; 16],
    pub src_mac: [u8; 6],
    pub dst_mac: [u8; 6],
    pub src_ip: [u8; 16],
    pub dst_ip: [u8; 16],
    pub src_port: u16,
    pub dst_port: u16,
    pub ip_proto: u8,
    pub _pad1: [u8; 3],
    pub length: u32,
    pub counter: u64,
    pub trace_hash: u32,
    pub timestamp_ns: u64,
}

impl RawTraceInfo {
    pub const WIRE_SIZE: usize = core::mem::size_of::<RawTraceInfo>();

    /// Reinterpret a byte slice produced by the ring buffer as a
    /// `RawTraceInfo`. Fails rather than reading out of bounds when the
    /// record was truncated.
    ///
    /// # Safety
    /// `RawTraceInfo` is `repr(C, packed)` with only integer and byte-array
    /// fields, so any `Self::WIRE_SIZE`-byte buffer is a valid bit pattern.
    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::WIRE_SIZE {
            return None;
        }
        let mut raw = core::mem::MaybeUninit::<RawTraceInfo>::uninit();
        unsafe {
            core::ptr::copy_nonoverlapping(
                buf.as_ptr(),
                raw.as_mut_ptr() as *mut u8,
                Self::WIRE_SIZE,
            );
            Some(raw.assume_init())
        }
    }
}

/// One entry of the per-CPU aggregation table the kprobe folds repeated
/// traces into and the flush program drains. A fixed-capacity array of
/// these, scanned with a constant-bound loop, is what lets the flush
/// program satisfy the verifier without a map-iteration helper: `occupied`
/// distinguishes a real entry from an empty slot so a zero trace_hash
/// (however unlikely) is never mistaken for "unused".
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct AggSlot {
    pub occupied: u32,
    pub trace_hash: u32,
    pub count: u32,
    pub info: RawTraceInfo,
}

/// Byte offsets of the `nft_traceinfo`/`nft_pktinfo`/`nft_rule`/`nft_chain`/
/// `nft_table`/`nft_verdict` fields the kprobe needs, resolved from the
/// running kernel's BTF by `nftrace::collectors::btf_offsets` at load time
/// and handed to the eBPF program through the single-entry `OFFSETS` map.
/// The eBPF side never hardcodes a struct layout; it only knows how to chase
/// pointers by these offsets (the "Runtime Offset Discovery" approach: one
/// extra L1-cached load per field buys portability across kernel builds
/// that would otherwise each need their own compiled probe).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct TraceInfoOffsets {
    /// `nft_traceinfo.type` (`enum nft_trace_types`).
    pub ti_type: u32,
    /// `nft_traceinfo.pkt` (`const struct nft_pktinfo *`).
    pub ti_pkt: u32,
    /// `nft_traceinfo.verdict` (`const struct nft_verdict *`).
    pub ti_verdict: u32,
    /// `nft_traceinfo.rule` (`const struct nft_rule *`).
    pub ti_rule: u32,
    /// `nft_traceinfo.chain` (`const struct nft_chain *`).
    pub ti_chain: u32,
    /// `nft_pktinfo.skb`, used to derive a stable per-packet trace id the
    /// same way the kernel's own netlink tracer correlates multiple trace
    /// points for one packet.
    pub pkt_skb: u32,
    pub pkt_family: u32,
    /// `nft_rule.handle` (packed bitfield; low 42 bits).
    pub rule_handle: u32,
    pub chain_name: u32,
    pub chain_table: u32,
    pub chain_policy: u32,
    pub table_name: u32,
    /// `nft_verdict.code`.
    pub verdict_code: u32,
    /// `nft_verdict.chain`, set only for `NFT_JUMP`/`NFT_GOTO` verdicts.
    pub verdict_chain: u32,
}

impl TraceInfoOffsets {
    pub const WORDS: usize = 14;

    /// Flattens to plain `u32`s so the userspace loader can write this
    /// through a `u32`-valued map, without either side needing a shared
    /// notion of "this struct is safely transmutable" across the
    /// eBPF/userspace crate boundary. Field order must match
    /// [`TraceInfoOffsets::from_words`].
    pub fn to_words(self) -> [u32; Self::WORDS] {
        [
            self.ti_type,
            self.ti_pkt,
            self.ti_verdict,
            self.ti_rule,
            self.ti_chain,
            self.pkt_skb,
            self.pkt_family,
            self.rule_handle,
            self.chain_name,
            self.chain_table,
            self.chain_policy,
            self.table_name,
            self.verdict_code,
            self.verdict_chain,
        ]
    }

    pub fn from_words(w: [u32; Self::WORDS]) -> Self {
        Self {
            ti_type: w[0],
            ti_pkt: w[1],
            ti_verdict: w[2],
            ti_rule: w[3],
            ti_chain: w[4],
            pkt_skb: w[5],
            pkt_family: w[6],
            rule_handle: w[7],
            chain_name: w[8],
            chain_table: w[9],
            chain_policy: w[10],
            table_name: w[11],
            verdict_code: w[12],
            verdict_chain: w[13],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_size_is_packed_and_stable() {
        // Changing this constant is a wire-format break between the eBPF
        // program and the userspace collector.
        assert_eq!(RawTraceInfo::WIRE_SIZE, core::mem::size_of::<RawTraceInfo>());
    }

    #[test]
    fn trace_info_offsets_words_roundtrip() {
        let offsets = TraceInfoOffsets {
            ti_type: 1,
            ti_pkt: 2,
            ti_verdict: 3,
            ti_rule: 4,
            ti_chain: 5,
            pkt_skb: 6,
            pkt_family: 7,
            rule_handle: 8,
            chain_name: 9,
            chain_table: 10,
            chain_policy: 11,
            table_name: 12,
            verdict_code: 13,
            verdict_chain: 14,
        };
        let words = offsets.to_words();
        let back = TraceInfoOffsets::from_words(words);
        assert_eq!(back.ti_pkt, 2);
        assert_eq!(back.verdict_chain, 14);
    }

    #[test]
    fn from_bytes_rejects_short_buffers() {
        let buf = [0u8; 4];
        assert!(RawTraceInfo::from_bytes(&buf).is_none());
    }

    #[test]
    fn from_bytes_roundtrips() {
        let mut buf = alloc_buf();
        buf[0..4].copy_from_slice(&42u32.to_ne_bytes());
        let parsed = RawTraceInfo::from_bytes(&buf).expect("parse");
        assert_eq!(parsed.trace_id, 42);
    }

    fn alloc_buf() -> std::vec::Vec<u8> {
        std::vec![0u8; RawTraceInfo::WIRE_SIZE]
    }
}
