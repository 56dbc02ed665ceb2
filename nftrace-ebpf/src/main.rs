// SPDX-FileCopyrightText: 2026 The nftrace-rs Authors
// SPDX-License-Identifier: GPL-3.0-or-later

//! kprobe program attached to `nft_trace_notify`.
//!
//! Userspace populates three scalar maps before attach: `SAMPLE_RATE`
//! (0 = trace every packet), `USE_AGGREGATION` (route through the per-CPU
//! `AGG_TABLE` instead of emitting directly), and `OFFSETS` (the
//! `nft_traceinfo`/... field offsets for the running kernel, resolved from
//! BTF). `EVENTS` is the output ring buffer userspace reads with
//! `aya::maps::RingBuf`.
//!
//! This program only ever reads kernel memory it was handed by the probed
//! function; it never dereferences userspace pointers.

#![no_std]
#![no_main]

use aya_ebpf::{
    helpers::{bpf_ktime_get_ns, bpf_probe_read_kernel, bpf_probe_read_kernel_str_bytes},
    macros::{kprobe, map},
    maps::{Array, PerCpuArray, RingBuf},
    programs::ProbeContext,
};
use nftrace_common::{AggSlot, RawTraceInfo, TraceInfoOffsets, NAME_MAXLEN};

/// One slot per CPU; the probe writes into it before reserving ring buffer
/// space, avoiding a ringbuf reservation failure mid-copy.
#[map]
static SCRATCH: PerCpuArray<RawTraceInfo> = PerCpuArray::with_max_entries(1, 0);

#[map]
static EVENTS: RingBuf = RingBuf::with_byte_size(0, 0);

/// 0 = emit every event. N>0 = emit 1-in-N.
#[map]
static SAMPLE_RATE: Array<u64> = Array::with_max_entries(1, 0);

/// Non-zero: route through the per-CPU aggregation queue instead of
/// emitting directly; drained by the flush program attached to the
/// per-CPU `PERF_COUNT_SW_CPU_CLOCK` timer.
#[map]
static USE_AGGREGATION: Array<u64> = Array::with_max_entries(1, 0);

/// Per-CPU fixed-capacity table of in-flight flow fingerprints awaiting the
/// next flush tick. A plain `HashMap` would need `bpf_for_each_map_elem` (or
/// similar) to drain from inside the flush program; a small fixed-size
/// array scanned with a constant-bound loop needs neither, at the cost of a
/// much smaller per-CPU capacity than `HashMap`'s 200k-entry-wide spec
/// budget would allow — a full table just drops the overflow, the same as
/// a ring buffer reservation failure would.
const AGG_CAP: u32 = 1024;

#[map]
static AGG_TABLE: PerCpuArray<AggSlot> = PerCpuArray::with_max_entries(AGG_CAP, 0);

/// `nft_traceinfo`/`nft_pktinfo`/... field offsets for the running kernel,
/// written once by `nftrace::collectors::btf_offsets::discover` before the
/// kprobe attaches. Stored flattened (`TraceInfoOffsets::to_words`) so
/// neither side needs a shared notion of safe struct transmutation across
/// the eBPF/userspace crate boundary.
#[map]
static OFFSETS: Array<[u32; TraceInfoOffsets::WORDS]> = Array::with_max_entries(1, 0);

#[inline(always)]
fn sample_rate() -> u64 {
    SAMPLE_RATE.get(0).copied().unwrap_or(0)
}

#[inline(always)]
fn aggregation_enabled() -> bool {
    USE_AGGREGATION.get(0).copied().unwrap_or(0) != 0
}

/// Deterministic 1-in-N sampling keyed off the kernel clock, mirroring the
/// kernel's own `nft_trace` sampling rather than pulling in a PRNG map.
#[inline(always)]
fn should_sample(rate: u64, now_ns: u64) -> bool {
    rate == 0 || now_ns % rate == 0
}

#[kprobe]
pub fn nftrace(ctx: ProbeContext) -> u32 {
    match try_nftrace(ctx) {
        Ok(ret) => ret,
        Err(ret) => ret as u32,
    }
}

fn try_nftrace(ctx: ProbeContext) -> Result<u32, i64> {
    let now_ns = unsafe { bpf_ktime_get_ns() };
    let rate = sample_rate();

    if !should_sample(rate, now_ns) {
        return Ok(0);
    }

    let slot = SCRATCH.get_ptr_mut(0).ok_or(-1i64)?;
    // SAFETY: slot is a valid PerCpuArray element for this CPU; reading
    // the probed function's `struct nft_traceinfo *` argument and copying
    // its fixed-size fields is the program's only unsafe surface.
    let info: &mut RawTraceInfo = unsafe { &mut *slot };
    read_trace_info(&ctx, info)?;
    info.timestamp_ns = now_ns;

    if aggregation_enabled() {
        enqueue_for_aggregation(info)?;
    } else {
        emit(info)?;
    }

    Ok(0)
}

#[inline(always)]
unsafe fn read_u32(base: *const u8, offset: u32) -> Option<u32> {
    bpf_probe_read_kernel(base.add(offset as usize) as *const u32).ok()
}

#[inline(always)]
unsafe fn read_u64(base: *const u8, offset: u32) -> Option<u64> {
    bpf_probe_read_kernel(base.add(offset as usize) as *const u64).ok()
}

/// Reads a kernel pointer field and returns it as a byte pointer, or `None`
/// if the read faults or the pointer is NULL.
#[inline(always)]
unsafe fn read_ptr(base: *const u8, offset: u32) -> Option<*const u8> {
    let addr = read_u64(base, offset)?;
    if addr == 0 {
        None
    } else {
        Some(addr as *const u8)
    }
}

#[inline(always)]
unsafe fn read_name(base: *const u8, offset: u32, out: &mut [u8; NAME_MAXLEN]) {
    if let Some(name_ptr) = read_ptr(base, offset) {
        let _ = bpf_probe_read_kernel_str_bytes(name_ptr, out);
    }
}

/// Copies the fields `nft_trace_notify(struct nft_traceinfo *info)` exposes
/// into `info`, chasing `nft_traceinfo -> {nft_pktinfo, nft_rule,
/// nft_chain -> nft_table, nft_verdict}` with `bpf_probe_read_kernel` at the
/// offsets `OFFSETS` was loaded with. Every pointer is treated as possibly
/// NULL or unmapped; a failed read just leaves the corresponding field at
/// its zeroed default rather than aborting the whole probe, since a rule
/// trace with no jump target (say) legitimately has a NULL verdict chain.
#[inline(always)]
fn read_trace_info(ctx: &ProbeContext, info: &mut RawTraceInfo) -> Result<(), i64> {
    let off = TraceInfoOffsets::from_words(OFFSETS.get(0).copied().ok_or(-1i64)?);
    let traceinfo: *const u8 = ctx.arg(0).ok_or(-1i64)?;

    unsafe {
        info.trace_type = read_u32(traceinfo, off.ti_type).unwrap_or(0);

        if let Some(pkt) = read_ptr(traceinfo, off.ti_pkt) {
            info.family = read_u32(pkt, off.pkt_family).unwrap_or(0) as u8;
            info.nfproto = info.family;
            // iif/oif sit behind nft_pktinfo's embedded nf_hook_state,
            // another pointer hop this probe doesn't chase; the netlink
            // collector is the source of truth for interface indices.
            // The kernel's own netlink tracer correlates the several
            // nft_trace_notify() calls made while walking one packet's
            // rule chain by the packet's skb address; folding that same
            // pointer here gives the aggregator a stable per-packet key
            // without having to parse the packet's own L3/L4 headers.
            if let Some(skb) = read_ptr(pkt, off.pkt_skb) {
                let addr = skb as u64;
                info.trace_id = (addr ^ (addr >> 32)) as u32;
            }
        }

        if let Some(rule) = read_ptr(traceinfo, off.ti_rule) {
            info.rule_handle = read_u64(rule, off.rule_handle).unwrap_or(0);
        }

        if let Some(chain) = read_ptr(traceinfo, off.ti_chain) {
            read_name(chain, off.chain_name, &mut info.chain_name);
            info.policy = read_u32(chain, off.chain_policy).unwrap_or(0) as i32;
            if let Some(table) = read_ptr(chain, off.chain_table) {
                read_name(table, off.table_name, &mut info.table_name);
            }
        }

        if let Some(verdict) = read_ptr(traceinfo, off.ti_verdict) {
            info.verdict = read_u32(verdict, off.verdict_code).unwrap_or(0) as i32;
            if let Some(jump_chain) = read_ptr(verdict, off.verdict_chain) {
                read_name(jump_chain, off.chain_name, &mut info.jump_target);
            }
        }
    }

    info.trace_hash = info.trace_id;
    Ok(())
}

#[inline(always)]
fn emit(info: &RawTraceInfo) -> Result<(), i64> {
    let mut entry = EVENTS.reserve::<RawTraceInfo>(0).ok_or(-1i64)?;
    entry.write(*info);
    entry.submit(0);
    Ok(())
}

/// Finds `info.trace_hash` in `AGG_TABLE` and bumps its count, or claims the
/// first free slot. Both the match scan and the free-slot scan run in the
/// same constant-bound pass; a table full on this CPU silently drops the
/// sample rather than erroring the probe.
#[inline(always)]
fn enqueue_for_aggregation(info: &RawTraceInfo) -> Result<(), i64> {
    let hash = info.trace_hash;
    let mut first_free: Option<u32> = None;

    for i in 0..AGG_CAP {
        let slot = AGG_TABLE.get_ptr_mut(i).ok_or(-1i64)?;
        let slot: &mut AggSlot = unsafe { &mut *slot };
        if slot.occupied != 0 {
            if slot.trace_hash == hash {
                slot.count += 1;
                slot.info = *info;
                return Ok(());
            }
        } else if first_free.is_none() {
            first_free = Some(i);
        }
    }

    if let Some(i) = first_free {
        let slot = AGG_TABLE.get_ptr_mut(i).ok_or(-1i64)?;
        let slot: &mut AggSlot = unsafe { &mut *slot };
        slot.occupied = 1;
        slot.trace_hash = hash;
        slot.count = 1;
        slot.info = *info;
    }
    Ok(())
}

/// Attached to a per-CPU `PERF_COUNT_SW_CPU_CLOCK` event when aggregation
/// is enabled (`nftrace::collectors::ebpf::EbpfCollector::attach_flush`,
/// step 4 of spec §4.5). Walks this CPU's `AGG_TABLE` with a constant-bound
/// loop (the verifier-friendly alternative to `bpf_for_each_map_elem`,
/// which a 200k-entry-wide `HashMap` would otherwise require), emits one
/// aggregated record per occupied slot with `counter` folded in, and frees
/// the slot. A slot whose ring buffer reservation fails is left occupied so
/// the next tick retries it instead of losing the fold.
#[aya_ebpf::macros::perf_event]
pub fn nftrace_flush(_ctx: aya_ebpf::programs::PerfEventContext) -> u32 {
    match try_nftrace_flush() {
        Ok(ret) => ret,
        Err(ret) => ret as u32,
    }
}

fn try_nftrace_flush() -> Result<u32, i64> {
    for i in 0..AGG_CAP {
        let slot = AGG_TABLE.get_ptr_mut(i).ok_or(-1i64)?;
        let slot: &mut AggSlot = unsafe { &mut *slot };
        if slot.occupied == 0 {
            continue;
        }

        let mut record = slot.info;
        record.counter = slot.count as u64;
        if emit(&record).is_ok() {
            slot.occupied = 0;
            slot.count = 0;
        }
    }
    Ok(0)
}

#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    loop {}
}
