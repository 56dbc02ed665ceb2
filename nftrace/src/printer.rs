// SPDX-FileCopyrightText: 2026 The nftrace-rs Authors
// SPDX-License-Identifier: GPL-3.0-or-later

//! The printer (C8, §4.8). Drains the aggregating queue and formats each
//! record to the sink, either as a human-readable line or single-line
//! JSON. In text mode, a whole batch is collected first so identical
//! flow-fingerprints can be coalesced into one printed line.

use crate::cancel::CancellationToken;
use crate::queue::AggregatingQueue;
use crate::trace::Trace;
use std::collections::HashMap;
use std::io::Write;
use std::time::Duration;

const DRAIN_TICK: Duration = Duration::from_millis(200);

pub struct Printer<'a, W: Write> {
    queue: &'a AggregatingQueue,
    sink: W,
    json: bool,
}

impl<'a, W: Write> Printer<'a, W> {
    pub fn new(queue: &'a AggregatingQueue, sink: W, json: bool) -> Self {
        Self { queue, sink, json }
    }

    /// Runs until cancelled. `--np` (suppress printing) is handled by the
    /// caller simply not constructing a `Printer` at all.
    pub fn run(&mut self, cancel: &CancellationToken) {
        loop {
            if cancel.wait_timeout(DRAIN_TICK) {
                self.drain_batch();
                return;
            }
            self.drain_batch();
        }
    }

    fn drain_batch(&mut self) {
        let mut batch = Vec::new();
        while let Some(t) = self.queue.read() {
            batch.push(t);
        }
        if batch.is_empty() {
            return;
        }
        if self.json {
            for t in &batch {
                self.write_json(t);
            }
        } else {
            self.write_coalesced_text(&batch);
        }
    }

    fn write_json(&mut self, t: &Trace) {
        if let Ok(line) = serde_json::to_string(t) {
            let _ = writeln!(self.sink, "{line}");
        }
    }

    /// §4.8: "identical flow-fingerprints seen in a single batch are
    /// coalesced: the printed line shows `cnt = trace.cnt *
    /// number_of_identical_entries_in_batch`."
    fn write_coalesced_text(&mut self, batch: &[Trace]) {
        let mut counts: HashMap<u64, (usize, &Trace)> = HashMap::new();
        for t in batch {
            let fp = t.fingerprint();
            counts
                .entry(fp)
                .and_modify(|(n, _)| *n += 1)
                .or_insert((1, t));
        }
        for (n, t) in counts.values() {
            let cnt = t.cnt * (*n as u64);
            let _ = writeln!(
                self.sink,
                "[{}] {} {} {} -> {} {} {} verdict={} cnt={} rule=\"{}\"",
                t.timestamp.to_rfc3339(),
                t.family,
                t.proto,
                t.ip_src.as_deref().unwrap_or("-"),
                t.ip_dst.as_deref().unwrap_or("-"),
                t.sport.map(|p| p.to_string()).unwrap_or_else(|| "-".into()),
                t.dport.map(|p| p.to_string()).unwrap_or_else(|| "-".into()),
                t.verdict,
                cnt,
                t.rule,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn trace(dport: u32, cnt: u64) -> Trace {
        Trace {
            trace_id: 1,
            table_name: "filter".into(),
            chain_name: "input".into(),
            jt: None,
            handle: 1,
            family: "ip".into(),
            iif: None,
            oif: None,
            hw_src: None,
            hw_dst: None,
            ip_src: Some("10.0.0.1".into()),
            ip_dst: Some("10.0.0.2".into()),
            sport: Some(1234),
            dport: Some(dport),
            len: 60,
            proto: "tcp".into(),
            ip_proto: 6,
            verdict: "rule::accept".into(),
            rule: "accept # handle 1".into(),
            cnt,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn json_mode_prints_one_line_per_record() {
        let q = AggregatingQueue::new(4);
        q.enque(trace(80, 1)).unwrap();
        q.enque(trace(443, 1)).unwrap();
        let mut sink = Vec::new();
        let mut printer = Printer::new(&q, &mut sink, true);
        printer.drain_batch();
        let out = String::from_utf8(sink).unwrap();
        assert_eq!(out.lines().count(), 2);
    }

    #[test]
    fn text_mode_coalesces_identical_fingerprints_in_one_batch() {
        let q = AggregatingQueue::new(4);
        q.enque(trace(80, 2)).unwrap();
        q.enque(trace(80, 3)).unwrap();
        let mut sink = Vec::new();
        let mut printer = Printer::new(&q, &mut sink, false);
        printer.drain_batch();
        let out = String::from_utf8(sink).unwrap();
        assert_eq!(out.lines().count(), 1);
        assert!(out.contains("cnt=6"));
    }
}
