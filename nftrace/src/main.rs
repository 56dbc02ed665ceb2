// SPDX-FileCopyrightText: 2026 The nftrace-rs Authors
// SPDX-License-Identifier: GPL-3.0-or-later

use anyhow::{Context, Result};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

mod bimap;
mod cancel;
mod collectors;
mod decoder;
mod errors;
mod kernel_info;
mod logging;
mod metrics;
mod opt;
mod printer;
mod providers;
mod queue;
mod resource_guard;
mod trace;

use cancel::CancellationToken;
use collectors::{ebpf::EbpfCollector, netlink::NetlinkCollector};
use metrics::Metrics;
use printer::Printer;
use providers::iface_cache::IfaceCache;
use providers::iface_provider::IfaceProvider;
use providers::rule_cache::RuleCache;
use providers::rule_provider::RuleProvider;
use queue::AggregatingQueue;
use trace::TraceGroupAssembler;

const PKG_VERSION: &str = env!("CARGO_PKG_VERSION");
const PKG_DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");
const RULE_TTL: Duration = Duration::from_secs(30);
const QUEUE_CAPACITY: usize = 4096;

fn hostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|n| n.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

fn splash() {
    log::info!("nftrace v{PKG_VERSION} - {PKG_DESCRIPTION}");
}

fn run() -> Result<()> {
    opt::parse_args();
    logging::init(opt::level(), opt::log_file()).context("initializing logger")?;
    splash();

    kernel_info::check().context("preflight checks failed")?;

    let _ballast = resource_guard::Ballast::new(opt::ballast_mib());

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        ctrlc::set_handler(move || cancel.cancel()).context("installing SIGINT/SIGTERM handler")?;
    }

    let metrics = Arc::new(Metrics::new(&hostname()).context("registering telemetry metrics")?);
    let rule_cache = Arc::new(
        RuleCache::with_query(RULE_TTL, providers::rule_provider::query_rule_sync)
            .context("constructing rule cache")?,
    );
    let iface_cache = Arc::new(IfaceCache::new());
    let sets = decoder::SetCache::new();
    let queue = Arc::new(AggregatingQueue::new(QUEUE_CAPACITY));

    IfaceProvider::seed(&iface_cache).context("seeding interface cache")?;

    let mut workers = Vec::new();

    workers.push(spawn_cleaner(&rule_cache, &cancel));
    workers.push(spawn_iface_provider(&iface_cache, &metrics, &cancel)?);
    workers.push(spawn_rule_provider(&rule_cache, &cancel)?);
    workers.push(spawn_telemetry(&metrics, &cancel)?);

    if !opt::no_print() {
        workers.push(spawn_printer(&queue, opt::json(), &cancel));
    }

    run_collector(&rule_cache, &iface_cache, &queue, &metrics, &cancel, &sets)?;

    cancel.cancel();
    for w in workers {
        let _ = w.join();
    }

    log::info!(
        "shutdown complete: traces={}",
        metrics.traces.get() as u64
    );
    Ok(())
}

fn spawn_cleaner(rule_cache: &Arc<RuleCache>, cancel: &CancellationToken) -> thread::JoinHandle<()> {
    let handle = rule_cache.start_cleaner(cancel.clone());
    handle
}

fn spawn_iface_provider(
    iface_cache: &Arc<IfaceCache>,
    metrics: &Arc<Metrics>,
    cancel: &CancellationToken,
) -> Result<thread::JoinHandle<()>> {
    let mut provider = IfaceProvider::bind().context("binding interface provider")?;
    let iface_cache = Arc::clone(iface_cache);
    let metrics = Arc::clone(metrics);
    let cancel = cancel.clone();
    Ok(thread::spawn(move || {
        if let Err(e) = provider.run(&cancel, &iface_cache, &metrics) {
            log::error!("interface provider exited: {e}");
        }
    }))
}

fn spawn_rule_provider(rule_cache: &Arc<RuleCache>, cancel: &CancellationToken) -> Result<thread::JoinHandle<()>> {
    let mut provider = RuleProvider::bind().context("binding rule provider")?;
    let rule_cache = Arc::clone(rule_cache);
    let cancel = cancel.clone();
    Ok(thread::spawn(move || {
        let sets = decoder::SetCache::new();
        if let Err(e) = provider.run(&cancel, &rule_cache, &sets) {
            log::error!("rule provider exited: {e}");
        }
    }))
}

fn spawn_telemetry(metrics: &Arc<Metrics>, cancel: &CancellationToken) -> Result<thread::JoinHandle<()>> {
    let metrics = Arc::clone(metrics);
    let addr = opt::telemetry_addr().to_string();
    let cancel = cancel.clone();
    Ok(thread::spawn(move || {
        if let Err(e) = metrics::serve(&addr, metrics, cancel) {
            log::error!("telemetry listener exited: {e}");
        }
    }))
}

fn spawn_printer(queue: &Arc<AggregatingQueue>, json: bool, cancel: &CancellationToken) -> thread::JoinHandle<()> {
    let queue = Arc::clone(queue);
    let cancel = cancel.clone();
    thread::spawn(move || {
        let stdout = std::io::stdout();
        let mut printer = Printer::new(&queue, stdout.lock(), json);
        printer.run(&cancel);
    })
}

/// Runs exactly one collector (§6 `-c ebpf|netlink`), feeding decoded
/// events through the trace-group assembler and into the aggregating
/// queue. One `TraceGroupAssembler` per collector instance, never shared
/// (§4.4 closing note).
fn run_collector(
    rule_cache: &Arc<RuleCache>,
    iface_cache: &Arc<IfaceCache>,
    queue: &Arc<AggregatingQueue>,
    metrics: &Arc<Metrics>,
    cancel: &CancellationToken,
    sets: &decoder::SetCache,
) -> Result<()> {
    let mut assembler = TraceGroupAssembler::new(Arc::clone(rule_cache), Arc::clone(iface_cache));
    let aggregate = opt::aggregate();

    match opt::collector() {
        opt::Collector::Ebpf => {
            let mut collector = EbpfCollector::load(opt::rate(), aggregate).context("loading eBPF collector")?;
            collector.attach(opt::flush_hz(), aggregate).context("attaching eBPF programs")?;
            collector.run(cancel, metrics, |raw| {
                emit_raw_trace(raw, &mut assembler, queue, metrics, sets)
            })?;
        }
        opt::Collector::Netlink => {
            let mut collector = NetlinkCollector::bind().context("binding netlink collector")?;
            collector.run(cancel, metrics, |nft_trace| {
                assembler.add_trace(nft_trace);
                maybe_emit(&mut assembler, queue, metrics, sets)
            })?;
        }
    }
    Ok(())
}

fn emit_raw_trace(
    raw: nftrace_common::RawTraceInfo,
    assembler: &mut TraceGroupAssembler,
    queue: &Arc<AggregatingQueue>,
    metrics: &Arc<Metrics>,
    sets: &decoder::SetCache,
) -> Result<()> {
    let nft_trace = decode_raw_trace(raw)?;
    assembler.add_trace(nft_trace);
    maybe_emit(assembler, queue, metrics, sets)
}

fn decode_raw_trace(raw: nftrace_common::RawTraceInfo) -> Result<trace::NftTrace> {
    use nftrace_common::{Family, TraceKind};

    let family = Family::from_raw(raw.family).unwrap_or(Family::Unspec);
    let kind = TraceKind::from_raw(raw.trace_type)
        .ok_or_else(|| anyhow::anyhow!(errors::TraceGroupError::UnknownTraceType(raw.trace_type)))?;
    let is_v6 = family == Family::Ipv6;

    Ok(trace::NftTrace {
        trace_id: raw.trace_id,
        kind,
        family,
        table_name: cstr(&raw.table_name),
        chain_name: cstr(&raw.chain_name),
        jump_target: non_empty(cstr(&raw.jump_target)),
        rule_handle: raw.rule_handle,
        verdict: raw.verdict,
        policy: raw.policy,
        iif: raw.iif,
        oif: raw.oif,
        iifname: non_empty(cstr(&raw.iifname)),
        oifname: non_empty(cstr(&raw.oifname)),
        src_mac: Some(format_mac(&raw.src_mac)),
        dst_mac: Some(format_mac(&raw.dst_mac)),
        src_ip: Some(decoder::protocols::ip_addr_to_string(is_v6, &raw.src_ip)),
        dst_ip: Some(decoder::protocols::ip_addr_to_string(is_v6, &raw.dst_ip)),
        src_port: Some(raw.src_port),
        dst_port: Some(raw.dst_port),
        ip_proto: raw.ip_proto,
        length: raw.length,
        counter: raw.counter.max(1),
        trace_hash: raw.trace_hash,
    })
}

fn maybe_emit(
    assembler: &mut TraceGroupAssembler,
    queue: &Arc<AggregatingQueue>,
    metrics: &Arc<Metrics>,
    sets: &decoder::SetCache,
) -> Result<()> {
    if !assembler.group_ready() {
        return Err(anyhow::anyhow!(errors::TraceGroupError::TraceDataNotReady));
    }
    let model = assembler.to_model(std::time::Instant::now(), sets)?;
    assembler.reset();

    let result = if opt::aggregate() {
        queue.upsert(model.fingerprint(), model)
    } else {
        queue.enque(model)
    };

    match result {
        Ok(()) => {
            metrics.traces.inc();
            Ok(())
        }
        Err(e) => {
            metrics.trace_que_overflow.inc();
            Err(e.into())
        }
    }
}

fn cstr(buf: &[u8]) -> String {
    let end = buf.iter().position(|&c| c == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

fn non_empty(s: String) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

fn format_mac(mac: &[u8; 6]) -> String {
    mac.iter().map(|b| format!("{b:02x}")).collect::<Vec<_>>().join(":")
}

fn main() {
    let code = match run() {
        Ok(()) => 0,
        Err(e) => {
            log::error!("{e}");
            for (i, cause) in e.chain().skip(1).enumerate() {
                log::error!("caused by[{i}]: {cause}");
            }
            1
        }
    };
    std::process::exit(code);
}
