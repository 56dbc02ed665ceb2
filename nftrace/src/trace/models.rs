// SPDX-FileCopyrightText: 2026 The nftrace-rs Authors
// SPDX-License-Identifier: GPL-3.0-or-later

//! `NftTrace` (the normalized in-process representation both collectors
//! produce, §3) and `Trace` (the output record, serialized per §6's
//! stable JSON key set).

use chrono::{DateTime, Utc};
use nftrace_common::{Family, TraceKind};
use serde::Serialize;
use std::hash::Hasher;
use twox_hash::XxHash64;

#[derive(Debug, Clone)]
pub struct NftTrace {
    pub trace_id: u32,
    pub kind: TraceKind,
    pub family: Family,
    pub table_name: String,
    pub chain_name: String,
    pub jump_target: Option<String>,
    pub rule_handle: u64,
    pub verdict: i32,
    pub policy: i32,
    pub iif: u32,
    pub oif: u32,
    pub iifname: Option<String>,
    pub oifname: Option<String>,
    pub src_mac: Option<String>,
    pub dst_mac: Option<String>,
    pub src_ip: Option<String>,
    pub dst_ip: Option<String>,
    pub src_port: Option<u16>,
    pub dst_port: Option<u16>,
    pub ip_proto: u8,
    pub length: u32,
    /// Packets this event represents. 1 for the netlink path; the folded
    /// count for the eBPF aggregation path.
    pub counter: u64,
    pub trace_hash: u32,
}

/// The verdict codes accept/drop render to in the composed `verdict`
/// string (§4.4 `to_model`). nftables itself uses small negative/positive
/// integers for these; the mapping matches `include/uapi/linux/netfilter.h`.
pub fn verdict_name(code: i32) -> &'static str {
    match code {
        0 => "drop",
        1 => "accept",
        2 => "stolen",
        3 => "queue",
        4 => "repeat",
        5 => "stop",
        -1 => "return",
        -2 => "jump",
        -3 => "goto",
        -4 => "break",
        -5 => "continue",
        _ => "unknown",
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Trace {
    pub trace_id: u32,
    pub table_name: String,
    pub chain_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jt: Option<String>,
    pub handle: u64,
    pub family: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iif: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oif: Option<String>,
    #[serde(rename = "hw-src", skip_serializing_if = "Option::is_none")]
    pub hw_src: Option<String>,
    #[serde(rename = "hw-dst", skip_serializing_if = "Option::is_none")]
    pub hw_dst: Option<String>,
    #[serde(rename = "ip-src", skip_serializing_if = "Option::is_none")]
    pub ip_src: Option<String>,
    #[serde(rename = "ip-dst", skip_serializing_if = "Option::is_none")]
    pub ip_dst: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sport: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dport: Option<u32>,
    pub len: u32,
    pub proto: String,
    #[serde(skip)]
    pub ip_proto: u8,
    pub verdict: String,
    pub rule: String,
    pub cnt: u64,
    pub timestamp: DateTime<Utc>,
}

impl Trace {
    /// `xxhash64(ip_proto || src_ip || dst_ip || src_port || dst_port)`
    /// (§3 "fingerprint"), used by the aggregating queue for dedup.
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = XxHash64::with_seed(0);
        hasher.write_u8(self.ip_proto);
        hasher.write(self.ip_src.as_deref().unwrap_or("").as_bytes());
        hasher.write(self.ip_dst.as_deref().unwrap_or("").as_bytes());
        hasher.write(&self.sport.unwrap_or(0).to_be_bytes());
        hasher.write(&self.dport.unwrap_or(0).to_be_bytes());
        hasher.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample() -> Trace {
        Trace {
            trace_id: 1,
            table_name: "filter".into(),
            chain_name: "input".into(),
            jt: None,
            handle: 1,
            family: "ip".into(),
            iif: Some("eth0".into()),
            oif: None,
            hw_src: None,
            hw_dst: None,
            ip_src: Some("10.0.0.1".into()),
            ip_dst: Some("10.0.0.2".into()),
            sport: Some(1234),
            dport: Some(443),
            len: 60,
            proto: "tcp".into(),
            ip_proto: 6,
            verdict: "rule::accept".into(),
            rule: "tcp dport 443 accept # handle 1".into(),
            cnt: 1,
            timestamp: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    #[test]
    fn fingerprint_is_deterministic() {
        let a = sample();
        let b = sample();
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn fingerprint_differs_on_five_tuple() {
        let a = sample();
        let mut b = sample();
        b.dport = Some(80);
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn json_omits_absent_optional_fields() {
        let t = sample();
        let v = serde_json::to_value(&t).unwrap();
        assert!(v.get("oif").is_none());
        assert_eq!(v.get("iif").unwrap(), "eth0");
    }

    #[test]
    fn verdict_names_match_known_codes() {
        assert_eq!(verdict_name(1), "accept");
        assert_eq!(verdict_name(0), "drop");
        assert_eq!(verdict_name(-3), "goto");
    }
}
