// SPDX-FileCopyrightText: 2026 The nftrace-rs Authors
// SPDX-License-Identifier: GPL-3.0-or-later

//! The aggregating bounded queue (C7, §4.7). `enque` appends
//! unconditionally and fails `Full` at capacity; `upsert` dedups by
//! fingerprint, folding a new record's `cnt` into the in-flight one
//! instead of enqueuing again. Each queued item is an `Arc<Mutex<Trace>>`
//! rather than a bare `Trace`: this is what lets `upsert` mutate an
//! already-enqueued record in place and have the eventual reader observe
//! the updated `cnt`, mirroring the source project's channel-of-pointers
//! design (§4.7 "the item sits in the map-backed buffer, not yet copied
//! out"). `crossbeam_channel`'s bounded `try_send`/`Full` maps directly
//! onto the spec's `Full` error, which `std::sync::mpsc` doesn't expose.

use crate::errors::QueueError;
use crate::trace::Trace;
use crossbeam_channel::{Receiver, Sender, TrySendError};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

type Item = Arc<Mutex<Trace>>;

pub struct AggregatingQueue {
    tx: Sender<Item>,
    rx: Receiver<Item>,
    in_flight: Mutex<HashMap<u64, Item>>,
}

impl AggregatingQueue {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        Self {
            tx,
            rx,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Appends unconditionally; no dedup. §4.7.
    pub fn enque(&self, t: Trace) -> Result<(), QueueError> {
        self.send(Arc::new(Mutex::new(t)))
    }

    /// Dedups by `fingerprint`: if a record with this fingerprint is
    /// currently in flight, its `cnt` is folded into the existing record
    /// in place; otherwise `t` is enqueued fresh and marked in flight.
    pub fn upsert(&self, fingerprint: u64, t: Trace) -> Result<(), QueueError> {
        let mut in_flight = self.in_flight.lock().expect("queue lock poisoned");
        if let Some(existing) = in_flight.get(&fingerprint) {
            existing.lock().expect("queue lock poisoned").cnt += t.cnt;
            return Ok(());
        }

        let item = Arc::new(Mutex::new(t));
        self.send(item.clone())?;
        in_flight.insert(fingerprint, item);
        Ok(())
    }

    fn send(&self, item: Item) -> Result<(), QueueError> {
        self.tx.try_send(item).map_err(|e| match e {
            TrySendError::Full(_) => QueueError::Full,
            TrySendError::Disconnected(_) => QueueError::Full,
        })
    }

    /// Drains one item in FIFO order, clearing its fingerprint's
    /// in-flight marker so a later `upsert` of the same fingerprint
    /// enqueues fresh rather than folding into an already-read record.
    pub fn read(&self) -> Option<Trace> {
        let item = self.rx.try_recv().ok()?;
        let t = item.lock().expect("queue lock poisoned").clone();
        let fp = t.fingerprint();
        let mut in_flight = self.in_flight.lock().expect("queue lock poisoned");
        if in_flight.get(&fp).is_some_and(|existing| Arc::ptr_eq(existing, &item)) {
            in_flight.remove(&fp);
        }
        Some(t)
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
    fn enque_respects_capacity() {
        let q = AggregatingQueue::new(1);
        assert!(q.enque(trace(1, 1)).is_ok());
        assert!(matches!(q.enque(trace(2, 1)), Err(QueueError::Full)));
    }

    #[test]
    fn upsert_collision_adds_counts_without_a_second_enqueue() {
        let q = AggregatingQueue::new(1);
        q.upsert(42, trace(80, 1)).unwrap();
        q.upsert(42, trace(80, 3)).unwrap();
        // Capacity is 1: a second send would have errored, proving the
        // collision didn't enqueue again.
        assert!(matches!(q.enque(trace(81, 1)), Err(QueueError::Full)));
        let read = q.read().unwrap();
        assert_eq!(read.cnt, 4);
    }

    #[test]
    fn read_clears_in_flight_so_same_fingerprint_can_enqueue_again() {
        let q = AggregatingQueue::new(4);
        q.upsert(42, trace(80, 1)).unwrap();
        q.read().unwrap();
        q.upsert(42, trace(80, 5)).unwrap();
        assert_eq!(q.read().unwrap().cnt, 5);
    }

    #[test]
    fn dedup_conservation_sum_of_cnt_read_equals_sum_submitted() {
        let q = AggregatingQueue::new(8);
        let mut submitted = 0u64;
        for cnt in [1, 2, 3, 4] {
            q.upsert(7, trace(80, cnt)).unwrap();
            submitted += cnt;
        }
        let read: u64 = std::iter::from_fn(|| q.read()).map(|t| t.cnt).sum();
        assert_eq!(read, submitted);
    }
}
