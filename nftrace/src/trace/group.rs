// SPDX-FileCopyrightText: 2026 The nftrace-rs Authors
// SPDX-License-Identifier: GPL-3.0-or-later

//! The trace-group assembler (C4, §4.4). Accumulates the per-`trace_id`
//! sequence of kernel events into one logical verdict record. Exactly
//! one assembler exists per collector instance and it is never shared
//! across threads (§4.4 closing note).

use super::models::{verdict_name, NftTrace, Trace};
use crate::decoder::{self, SetCache};
use crate::errors::TraceGroupError;
use crate::providers::iface_cache::IfaceCache;
use crate::providers::rule_cache::{RuleCache, RuleKey};
use chrono::Utc;
use nftrace_common::TraceKind;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

pub struct TraceGroupAssembler {
    traces: HashMap<u32, Vec<NftTrace>>,
    top: Option<NftTrace>,
    rule_cache: Arc<RuleCache>,
    iface_cache: Arc<IfaceCache>,
}

impl TraceGroupAssembler {
    pub fn new(rule_cache: Arc<RuleCache>, iface_cache: Arc<IfaceCache>) -> Self {
        Self {
            traces: HashMap::new(),
            top: None,
            rule_cache,
            iface_cache,
        }
    }

    pub fn add_trace(&mut self, mut t: NftTrace) {
        if t.kind == TraceKind::Policy {
            t.verdict = t.policy;
        }
        self.traces.entry(t.trace_id).or_default().push(t.clone());
        self.top = Some(t);
    }

    /// §4.4 `group_ready`: true iff the latest appended event's verdict
    /// is terminal.
    pub fn group_ready(&self) -> bool {
        matches!(self.top.as_ref().map(|t| t.verdict), Some(1) | Some(0))
    }

    /// §4.4 `to_model`. `traced_at` is the wall-clock instant the packet
    /// was judged, used for the rule cache's staleness check.
    pub fn to_model(&mut self, traced_at: Instant, sets: &SetCache) -> Result<Trace, TraceGroupError> {
        let top = self.top.clone().ok_or(TraceGroupError::TraceDataNotReady)?;
        let events = self
            .traces
            .get(&top.trace_id)
            .ok_or(TraceGroupError::TraceGroupEmpty(top.trace_id))?;

        let segments: Vec<String> = events
            .iter()
            .filter(|e| e.kind != TraceKind::Return)
            .map(|e| format!("{}::{}", kind_label(e.kind), verdict_name(e.verdict)))
            .collect();
        let verdict = segments.join("->");

        let representative = events
            .iter()
            .find(|e| e.kind == TraceKind::Rule && e.rule_handle != 0)
            .cloned()
            .ok_or(TraceGroupError::NoRuleEvent(top.trace_id))?;
        self.top = Some(representative.clone());

        let key = RuleKey {
            table: representative.table_name.clone(),
            family: representative.family as u8,
            chain: representative.chain_name.clone(),
            handle: representative.rule_handle,
        };
        let rule_entry = self.rule_cache.get_rule_for_trace(&key, traced_at)?;
        let _ = sets; // set cache is consulted when the rule is decoded, not here

        let iif = self.resolve_iface(top.iif, top.iifname.clone())?;
        let oif = self.resolve_iface(top.oif, top.oifname.clone())?;

        Ok(Trace {
            trace_id: top.trace_id,
            table_name: representative.table_name.clone(),
            chain_name: representative.chain_name.clone(),
            jt: representative.jump_target.clone(),
            handle: representative.rule_handle,
            family: top.family.as_str().to_string(),
            iif,
            oif,
            hw_src: top.src_mac.clone(),
            hw_dst: top.dst_mac.clone(),
            ip_src: top.src_ip.clone(),
            ip_dst: top.dst_ip.clone(),
            sport: top.src_port.map(u32::from),
            dport: top.dst_port.map(u32::from),
            len: top.length,
            proto: decoder::protocols::l4_proto_name(top.ip_proto).to_string(),
            ip_proto: top.ip_proto,
            verdict,
            rule: rule_entry.text,
            cnt: top.counter,
            timestamp: Utc::now(),
        })
    }

    fn resolve_iface(&self, index: u32, name: Option<String>) -> Result<Option<String>, TraceGroupError> {
        match name {
            Some(n) if !n.is_empty() => Ok(Some(n)),
            _ if index != 0 => Ok(Some(self.iface_cache.get_iface(index)?)),
            _ => Ok(None),
        }
    }

    /// §4.4 `reset`: erase the current trace_id's accumulated events.
    pub fn reset(&mut self) {
        if let Some(top) = &self.top {
            self.traces.remove(&top.trace_id);
        }
        self.top = None;
    }

    pub fn close(&mut self) {
        self.traces.clear();
        self.top = None;
    }
}

fn kind_label(kind: TraceKind) -> &'static str {
    match kind {
        TraceKind::Rule => "rule",
        TraceKind::Return => "return",
        TraceKind::Policy => "policy",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::SetCache;
    use nftrace_common::Family;
    use std::time::Duration;

    fn base_trace(trace_id: u32, kind: TraceKind, handle: u64, verdict: i32) -> NftTrace {
        NftTrace {
            trace_id,
            kind,
            family: Family::Ipv4,
            table_name: "filter".into(),
            chain_name: "input".into(),
            jump_target: None,
            rule_handle: handle,
            verdict,
            policy: verdict,
            iif: 0,
            oif: 0,
            iifname: None,
            oifname: None,
            src_mac: None,
            dst_mac: None,
            src_ip: Some("10.0.0.1".into()),
            dst_ip: Some("10.0.0.2".into()),
            src_port: Some(1234),
            dst_port: Some(80),
            ip_proto: 6,
            length: 60,
            counter: 1,
            trace_hash: 0,
        }
    }

    fn assembler() -> TraceGroupAssembler {
        let rules = Arc::new(RuleCache::new(Duration::from_secs(5)).unwrap());
        rules.upsert(
            RuleKey { table: "filter".into(), family: Family::Ipv4 as u8, chain: "input".into(), handle: 1 },
            vec![],
            "accept # handle 1".into(),
            false,
        );
        let ifaces = Arc::new(IfaceCache::new());
        TraceGroupAssembler::new(rules, ifaces)
    }

    #[test]
    fn s1_single_rule_accept() {
        let mut asm = assembler();
        asm.add_trace(base_trace(1, TraceKind::Rule, 1, 1));
        assert!(asm.group_ready());
        let model = asm.to_model(Instant::now(), &SetCache::new()).unwrap();
        assert_eq!(model.verdict, "rule::accept");
        assert_eq!(model.handle, 1);
    }

    #[test]
    fn s2_goto_then_policy_accept_suppresses_return() {
        let mut asm = assembler();
        asm.add_trace(base_trace(2, TraceKind::Rule, 1, -3)); // goto
        asm.add_trace(base_trace(2, TraceKind::Return, 2, -5)); // continue
        asm.add_trace(base_trace(2, TraceKind::Policy, 0, 1)); // accept
        assert!(asm.group_ready());
        let model = asm.to_model(Instant::now(), &SetCache::new()).unwrap();
        assert_eq!(model.verdict, "rule::goto->policy::accept");
        assert_eq!(model.handle, 1);
    }

    #[test]
    fn s3_zero_handle_mid_chain_prefers_nonzero_handle() {
        let mut asm = assembler();
        asm.add_trace(base_trace(3, TraceKind::Rule, 1, -3)); // goto
        asm.add_trace(base_trace(3, TraceKind::Rule, 0, -5)); // continue
        asm.add_trace(base_trace(3, TraceKind::Policy, 0, 1)); // accept
        let model = asm.to_model(Instant::now(), &SetCache::new()).unwrap();
        assert_eq!(model.verdict, "rule::goto->rule::continue->policy::accept");
        assert_eq!(model.handle, 1);
    }

    #[test]
    fn s4_double_rule_accept() {
        let mut asm = assembler();
        asm.add_trace(base_trace(4, TraceKind::Rule, 1, -3)); // goto
        asm.add_trace(base_trace(4, TraceKind::Rule, 2, 1)); // accept
        let model = asm.to_model(Instant::now(), &SetCache::new()).unwrap();
        assert_eq!(model.verdict, "rule::goto->rule::accept");
        assert_eq!(model.handle, 1);
    }

    #[test]
    fn group_ready_is_false_until_terminal_verdict() {
        let mut asm = assembler();
        asm.add_trace(base_trace(5, TraceKind::Rule, 1, -3)); // goto, not terminal
        assert!(!asm.group_ready());
    }

    #[test]
    fn reset_drops_only_the_current_trace_id() {
        let mut asm = assembler();
        asm.add_trace(base_trace(6, TraceKind::Rule, 1, 1));
        asm.reset();
        assert!(asm.traces.get(&6).is_none());
    }
}
