// SPDX-FileCopyrightText: 2026 The nftrace-rs Authors
// SPDX-License-Identifier: GPL-3.0-or-later

//! The expression sum type and its evaluation dispatch (§4.1). One pass
//! over the expression list: loaders write into the register file,
//! consumers read it back and emit a token, terminals emit their own
//! token directly. Reimplemented as a plain `enum` + a small register
//! map rather than as a hierarchy of encoder types, per Design Notes §9.

use super::protocols;
use super::registers::{CtKey, MetaKey, PayloadBase, PayloadField, RegEntry, RegSource, RegisterFile};
use super::sets::SetCache;
use crate::errors::DecodeError;
use serde_json::{json, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Neq,
    Lt,
    Gt,
    Le,
    Ge,
}

impl CmpOp {
    /// `==` is elided (§4.1 "cmp emits left op right where op omits ==").
    pub fn as_str(self) -> &'static str {
        match self {
            CmpOp::Eq => "",
            CmpOp::Neq => "!= ",
            CmpOp::Lt => "< ",
            CmpOp::Gt => "> ",
            CmpOp::Le => "<= ",
            CmpOp::Ge => ">= ",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerdictCode {
    Accept,
    Drop,
    Stolen,
    Queue,
    Repeat,
    Stop,
    Return,
    Jump,
    Goto,
    Continue,
    Break,
}

impl VerdictCode {
    pub fn as_str(self) -> &'static str {
        match self {
            VerdictCode::Accept => "accept",
            VerdictCode::Drop => "drop",
            VerdictCode::Stolen => "stolen",
            VerdictCode::Queue => "queue",
            VerdictCode::Repeat => "repeat",
            VerdictCode::Stop => "stop",
            VerdictCode::Return => "return",
            VerdictCode::Jump => "jump",
            VerdictCode::Goto => "goto",
            VerdictCode::Continue => "continue",
            VerdictCode::Break => "break",
        }
    }
}

#[derive(Debug, Clone)]
pub enum Expr {
    // --- loaders: write a register, emit nothing at this position ---
    Meta { key: MetaKey, dreg: u8 },
    Payload { field: PayloadField, dreg: u8 },
    Immediate { dreg: u8, data: Vec<u8> },
    Bitwise { sreg: u8, dreg: u8, len_bits: u32, mask: Vec<u8>, xor: Vec<u8> },
    Byteorder { sreg: u8, dreg: u8 },
    Ct { key: CtKey, dreg: u8 },
    Numgen { dreg: u8 },
    Hash { dreg: u8 },
    Fib { dreg: u8 },
    Rt { dreg: u8 },
    Socket { dreg: u8 },
    ExthdrLoad { dreg: u8 },

    // --- consumers: read a register, emit a token ---
    Cmp { sreg: u8, op: CmpOp, rhs: Vec<u8> },
    Range { sreg: u8, op: CmpOp, from: Vec<u8>, to: Vec<u8> },
    Lookup { sreg: u8, set_name: String, set_id: u32, dreg: Option<u8>, invert: bool },
    Dynset { sreg: u8, set_name: String },
    Nat { family: &'static str },
    Redir,
    Tproxy,
    Dup,
    MetaSet { key: MetaKey, sreg: u8 },
    CtSet { key: CtKey, sreg: u8 },
    PayloadSet { sreg: u8 },
    ExthdrSet { sreg: u8 },

    // --- terminals: emit their own token directly ---
    Counter { packets: u64, bytes: u64 },
    Log,
    Limit { rate: u64, per: &'static str },
    Quota { bytes: u64 },
    Reject,
    Notrack,
    FlowOffload { name: String },
    Connlimit { count: u32 },
    Objref { name: String },
    Verdict { code: VerdictCode, chain: Option<String> },
    Queue { num: u16 },
    Match(String),
    Target(String),
}

pub struct EvalOutput {
    pub text: String,
    pub json: Value,
}

/// Evaluates one rule's expression list into text and JSON forms in a
/// single traversal (§4.1: "implementers may produce them in one pass").
pub fn eval(
    exprs: &[Expr],
    table: &str,
    is_v6: bool,
    sets: &SetCache,
) -> Result<EvalOutput, DecodeError> {
    let mut regs = RegisterFile::new();
    let mut tokens: Vec<String> = Vec::new();
    let mut json_items: Vec<Value> = Vec::new();

    for expr in exprs {
        match expr {
            Expr::Meta { key, dreg } => {
                let text = meta_keyword(*key);
                regs.store(
                    *dreg,
                    RegEntry {
                        text: text.to_string(),
                        json: json!({"meta": {"key": meta_json_key(*key)}}),
                        byte_length: 4,
                        source: RegSource::Meta(*key),
                    },
                )?;
            }
            Expr::Payload { field, dreg } => {
                let desc = protocols::lookup(field.base, field.offset_bits, field.len_bits, is_v6);
                let text = desc.map(|d| d.name.to_string()).unwrap_or_else(|| {
                    format!("payload @{:?},{},{}", field.base, field.offset_bits, field.len_bits)
                });
                regs.store(
                    *dreg,
                    RegEntry {
                        text,
                        json: json!({"payload": {"base": format!("{:?}", field.base), "offset": field.offset_bits, "len": field.len_bits}}),
                        byte_length: (field.len_bits / 8) as usize,
                        source: RegSource::Payload(field.clone()),
                    },
                )?;
            }
            Expr::Immediate { dreg, data } => {
                // Short immediates (verdict-set values like `meta nftrace
                // set 1`) print as decimal; nft only switches to hex for
                // longer opaque byte strings.
                let text = if data.len() <= 8 {
                    format_integer(data)
                } else {
                    hex_of(data)
                };
                regs.store(
                    *dreg,
                    RegEntry {
                        text,
                        json: json!({"immediate": hex_of(data)}),
                        byte_length: data.len(),
                        source: RegSource::Immediate,
                    },
                )?;
            }
            Expr::Bitwise { sreg, dreg, len_bits, mask, xor } => {
                let src = regs.load(*sreg)?.clone();
                let (text, o_nonzero, xor_nonzero) = eval_bitwise(&src, mask, xor, *len_bits);
                let _ = (o_nonzero, xor_nonzero);
                regs.store(
                    *dreg,
                    RegEntry {
                        text,
                        json: src.json.clone(),
                        byte_length: src.byte_length,
                        source: RegSource::Bitwise(Box::new(src.source)),
                    },
                )?;
            }
            Expr::Byteorder { sreg, dreg } => {
                let src = regs.load(*sreg)?.clone();
                regs.store(*dreg, src)?;
            }
            Expr::Ct { key, dreg } => {
                let text = ct_keyword(*key);
                regs.store(
                    *dreg,
                    RegEntry {
                        text: text.to_string(),
                        json: json!({"ct": {"key": text}}),
                        byte_length: 4,
                        source: RegSource::Ct(*key),
                    },
                )?;
            }
            Expr::Numgen { dreg } => regs.store(*dreg, synthetic("numgen"))?,
            Expr::Hash { dreg } => regs.store(*dreg, synthetic("jhash"))?,
            Expr::Fib { dreg } => regs.store(*dreg, synthetic("fib"))?,
            Expr::Rt { dreg } => regs.store(*dreg, synthetic("rt"))?,
            Expr::Socket { dreg } => regs.store(*dreg, synthetic("socket"))?,
            Expr::ExthdrLoad { dreg } => regs.store(*dreg, synthetic("exthdr"))?,

            Expr::Cmp { sreg, op, rhs } => {
                let src = regs.load(*sreg)?;
                let rhs_text = format_rhs(&src.source, rhs);
                tokens.push(format!("{} {}{}", src.text, op.as_str(), rhs_text));
                json_items.push(json!({"match": {"left": src.text, "op": cmp_json_op(*op), "right": rhs_text}}));
            }
            Expr::Range { sreg, op, from, to } => {
                let src = regs.load(*sreg)?;
                let (from_s, to_s) = (format_rhs(&src.source, from), format_rhs(&src.source, to));
                let prefix = if *op == CmpOp::Neq { "!= " } else { "" };
                tokens.push(format!("{} {}{}-{}", src.text, prefix, from_s, to_s));
                json_items.push(json!({"range": {"left": src.text, "from": from_s, "to": to_s}}));
            }
            Expr::Lookup { sreg, set_name, set_id, dreg, invert } => {
                let src = regs.load(*sreg)?;
                let set = sets.get(table, set_name, *set_id);
                let set_repr = match set {
                    Some(s) if s.flags.anonymous => s.render_inline(),
                    Some(_) => format!("@{set_name}"),
                    None => {
                        return Err(DecodeError::UnknownSet {
                            table: table.to_string(),
                            name: set_name.clone(),
                            id: *set_id,
                        })
                    }
                };
                let token = match dreg {
                    Some(d) if *d == super::registers::REG_VERDICT => {
                        format!("{} vmap {}", src.text, set_repr)
                    }
                    Some(_) => format!("{} map {}", src.text, set_repr),
                    None => {
                        let bang = if *invert { "!= " } else { "" };
                        format!("{} {}{}", src.text, bang, set_repr)
                    }
                };
                tokens.push(token.clone());
                json_items.push(json!({"lookup": {"left": src.text, "set": set_name, "invert": invert}}));
            }
            Expr::Dynset { sreg, set_name } => {
                let src = regs.load(*sreg)?;
                tokens.push(format!("add {} @{}", src.text, set_name));
                json_items.push(json!({"dynset": {"key": src.text, "set": set_name}}));
            }
            Expr::Nat { family } => {
                tokens.push(format!("{family} nat"));
                json_items.push(json!({"nat": family}));
            }
            Expr::Redir => {
                tokens.push("redirect".to_string());
                json_items.push(json!({"redir": Value::Null}));
            }
            Expr::Tproxy => {
                tokens.push("tproxy".to_string());
                json_items.push(json!({"tproxy": Value::Null}));
            }
            Expr::Dup => {
                tokens.push("dup".to_string());
                json_items.push(json!({"dup": Value::Null}));
            }
            Expr::MetaSet { key, sreg } => {
                let src = regs.load(*sreg)?;
                tokens.push(format!("meta {} set {}", meta_json_key(*key), src.text));
                json_items.push(json!({"mangle": {"key": meta_json_key(*key), "value": src.text}}));
            }
            Expr::CtSet { key, sreg } => {
                let src = regs.load(*sreg)?;
                tokens.push(format!("ct {} set {}", ct_keyword(*key), src.text));
                json_items.push(json!({"ct set": {"key": ct_keyword(*key), "value": src.text}}));
            }
            Expr::PayloadSet { sreg } => {
                let src = regs.load(*sreg)?;
                tokens.push(format!("payload set {}", src.text));
                json_items.push(json!({"payload set": src.text}));
            }
            Expr::ExthdrSet { sreg } => {
                let src = regs.load(*sreg)?;
                tokens.push(format!("exthdr set {}", src.text));
                json_items.push(json!({"exthdr set": src.text}));
            }

            Expr::Counter { packets, bytes } => {
                tokens.push(format!("counter packets {packets} bytes {bytes}"));
                json_items.push(json!({"counter": {"packets": packets, "bytes": bytes}}));
            }
            Expr::Log => {
                tokens.push("log".to_string());
                json_items.push(json!({"log": Value::Null}));
            }
            Expr::Limit { rate, per } => {
                tokens.push(format!("limit rate {rate}/{per}"));
                json_items.push(json!({"limit": {"rate": rate, "per": per}}));
            }
            Expr::Quota { bytes } => {
                tokens.push(format!("quota {bytes}"));
                json_items.push(json!({"quota": bytes}));
            }
            Expr::Reject => {
                tokens.push("reject".to_string());
                json_items.push(json!({"reject": Value::Null}));
            }
            Expr::Notrack => {
                tokens.push("notrack".to_string());
                json_items.push(json!({"notrack": Value::Null}));
            }
            Expr::FlowOffload { name } => {
                tokens.push(format!("flow add @{name}"));
                json_items.push(json!({"flow": {"op": "add", "flowtable": name}}));
            }
            Expr::Connlimit { count } => {
                tokens.push(format!("ct count {count}"));
                json_items.push(json!({"ct count": count}));
            }
            Expr::Objref { name } => {
                tokens.push(format!("counter {name}"));
                json_items.push(json!({"counter": name}));
            }
            Expr::Verdict { code, chain } => {
                let token = match (code, chain) {
                    (VerdictCode::Jump, Some(c)) | (VerdictCode::Goto, Some(c)) => {
                        format!("{} {}", code.as_str(), c)
                    }
                    _ => code.as_str().to_string(),
                };
                tokens.push(token);
                json_items.push(json!({"verdict": code.as_str(), "chain": chain}));
            }
            Expr::Queue { num } => {
                tokens.push(format!("queue num {num}"));
                json_items.push(json!({"queue": {"num": num}}));
            }
            Expr::Match(s) => {
                tokens.push(s.clone());
                json_items.push(json!({"match_raw": s}));
            }
            Expr::Target(s) => {
                tokens.push(s.clone());
                json_items.push(json!({"target_raw": s}));
            }
        }
    }

    Ok(EvalOutput {
        text: tokens.join(" "),
        json: Value::Array(json_items),
    })
}

fn synthetic(name: &str) -> RegEntry {
    RegEntry {
        text: name.to_string(),
        json: json!({name: Value::Null}),
        byte_length: 4,
        source: RegSource::Other,
    }
}

fn meta_keyword(key: MetaKey) -> String {
    match key {
        // nft prints these with the "meta" keyword.
        MetaKey::L4proto => "meta l4proto".to_string(),
        MetaKey::Nfproto => "meta nfproto".to_string(),
        MetaKey::Protocol => "meta protocol".to_string(),
        MetaKey::Mark => "meta mark".to_string(),
        MetaKey::Nftrace => "meta nftrace".to_string(),
        // ...and these without it, matching real nft output.
        MetaKey::Iifname => "iifname".to_string(),
        MetaKey::Oifname => "oifname".to_string(),
        MetaKey::Iif => "iif".to_string(),
        MetaKey::Oif => "oif".to_string(),
        MetaKey::Other(n) => format!("meta {n}"),
    }
}

fn meta_json_key(key: MetaKey) -> &'static str {
    match key {
        MetaKey::L4proto => "l4proto",
        MetaKey::Nfproto => "nfproto",
        MetaKey::Protocol => "protocol",
        MetaKey::Mark => "mark",
        MetaKey::Nftrace => "nftrace",
        MetaKey::Iifname => "iifname",
        MetaKey::Oifname => "oifname",
        MetaKey::Iif => "iif",
        MetaKey::Oif => "oif",
        MetaKey::Other(_) => "unknown",
    }
}

fn ct_keyword(key: CtKey) -> &'static str {
    match key {
        CtKey::State => "ct state",
        CtKey::Direction => "ct direction",
        CtKey::L3proto => "ct l3proto",
        CtKey::Expiration => "ct expiration",
        CtKey::Other(_) => "ct",
    }
}

fn cmp_json_op(op: CmpOp) -> &'static str {
    match op {
        CmpOp::Eq => "==",
        CmpOp::Neq => "!=",
        CmpOp::Lt => "<",
        CmpOp::Gt => ">",
        CmpOp::Le => "<=",
        CmpOp::Ge => ">=",
    }
}

fn hex_of(bytes: &[u8]) -> String {
    let mut s = String::from("0x");
    for b in bytes {
        s.push_str(&format!("{b:02x}"));
    }
    s
}

/// §4.1 "Bitwise semantics": `o = (m & x) ^ x`, then `mask |= o`,
/// `xor &= mask`. Returns the rendered text plus whether `o`/`xor` ended
/// up non-zero (kept for callers that want the raw-arithmetic rendering
/// decision without recomputing).
fn eval_bitwise(src: &RegEntry, mask: &[u8], xor: &[u8], len_bits: u32) -> (String, bool, bool) {
    let n = mask.len().max(xor.len());
    let mut o = vec![0u8; n];
    let mut mask = mask.to_vec();
    let mut xor = xor.to_vec();
    mask.resize(n, 0);
    xor.resize(n, 0);

    for i in 0..n {
        o[i] = (mask[i] & xor[i]) ^ xor[i];
        mask[i] |= o[i];
        xor[i] &= mask[i];
    }

    let o_nonzero = o.iter().any(|&b| b != 0);
    let xor_nonzero = xor.iter().any(|&b| b != 0);
    let full_coverage = scan_first_zero_bit(&mask) >= len_bits;

    // nft only drops the mask/xor in favor of the bare descriptor name
    // for payload loads and the three meta keys that are themselves
    // protocol numbers (l4proto/protocol/nfproto) — every other
    // descriptor, including other meta keys and ct keys, still needs
    // the mask/xor rendered since it changes what the comparison means.
    if matches!(
        src.source,
        RegSource::Payload(_)
            | RegSource::Meta(MetaKey::L4proto | MetaKey::Protocol | MetaKey::Nfproto)
    ) {
        return (src.text.clone(), o_nonzero, xor_nonzero);
    }

    let mut text = src.text.clone();
    if !full_coverage {
        text = format!("({text} & {})", hex_of(&mask));
    }
    if xor_nonzero {
        text = format!("{text} ^ {}", hex_of(&xor));
    }
    if o_nonzero {
        text = format!("{text} | {}", hex_of(&o));
    }
    (text, o_nonzero, xor_nonzero)
}

/// Position (in bits, MSB-first within the byte slice) of the first zero
/// bit, or `bytes.len()*8` if the whole mask is set.
fn scan_first_zero_bit(bytes: &[u8]) -> u32 {
    for (i, b) in bytes.iter().enumerate() {
        if *b != 0xff {
            return (i as u32) * 8 + b.trailing_ones();
        }
    }
    (bytes.len() as u32) * 8
}

fn format_rhs(source: &RegSource, bytes: &[u8]) -> String {
    match source {
        RegSource::Meta(MetaKey::L4proto) => protocols::l4_proto_name(bytes.first().copied().unwrap_or(0)).to_string(),
        RegSource::Meta(MetaKey::Nfproto) => protocols::nfproto_name(bytes.first().copied().unwrap_or(0)).to_string(),
        RegSource::Meta(MetaKey::Iifname) | RegSource::Meta(MetaKey::Oifname) => trimmed_string(bytes),
        RegSource::Ct(CtKey::L3proto) => protocols::nfproto_name(bytes.first().copied().unwrap_or(0)).to_string(),
        RegSource::Ct(_) => trimmed_string(bytes),
        RegSource::Payload(field) if field.len_bits == 32 => format_v4(bytes),
        RegSource::Payload(field) if field.len_bits == 128 => format_v6(bytes),
        RegSource::Payload(_) => format_integer(bytes),
        RegSource::Bitwise(inner) => format_rhs(inner, bytes),
        RegSource::Immediate | RegSource::Other => {
            if bytes.iter().all(|b| b.is_ascii_graphic() || *b == 0) {
                trimmed_string(bytes)
            } else {
                format_integer(bytes)
            }
        }
    }
}

fn trimmed_string(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

fn format_integer(bytes: &[u8]) -> String {
    let mut v: u64 = 0;
    for &b in bytes {
        v = (v << 8) | b as u64;
    }
    v.to_string()
}

fn format_v4(bytes: &[u8]) -> String {
    if bytes.len() < 4 {
        return format_integer(bytes);
    }
    format!("{}.{}.{}.{}", bytes[0], bytes[1], bytes[2], bytes[3])
}

fn format_v6(bytes: &[u8]) -> String {
    if bytes.len() < 16 {
        return format_integer(bytes);
    }
    let groups: Vec<String> = bytes.chunks(2).map(|c| format!("{:02x}{:02x}", c[0], c[1])).collect();
    groups.join(":")
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::registers::PayloadField;
    use super::super::sets::SetCache;

    #[test]
    fn s5_meta_l4proto_tcp_counter_log_accept() {
        let exprs = vec![
            Expr::Meta { key: MetaKey::L4proto, dreg: 1 },
            Expr::Cmp { sreg: 1, op: CmpOp::Eq, rhs: vec![0x06] },
            Expr::Counter { packets: 0, bytes: 0 },
            Expr::Log,
            Expr::Verdict { code: VerdictCode::Accept, chain: None },
        ];
        let out = eval(&exprs, "filter", false, &SetCache::new()).unwrap();
        assert_eq!(out.text, "meta l4proto tcp counter packets 0 bytes 0 log accept");
    }

    #[test]
    fn s6_oifname_neq_lo_meta_nftrace_goto() {
        let exprs = vec![
            Expr::Meta { key: MetaKey::Oifname, dreg: 1 },
            Expr::Cmp { sreg: 1, op: CmpOp::Neq, rhs: b"lo\0\0\0\0\0\0\0\0\0\0\0\0\0\0".to_vec() },
            Expr::Immediate { dreg: 1, data: vec![0x01] },
            Expr::MetaSet { key: MetaKey::Nftrace, sreg: 1 },
            Expr::Verdict { code: VerdictCode::Goto, chain: Some("FW-OUT".to_string()) },
        ];
        let out = eval(&exprs, "filter", false, &SetCache::new()).unwrap();
        assert_eq!(out.text, "oifname != lo meta nftrace set 1 goto FW-OUT");
    }

    #[test]
    fn cmp_reading_unwritten_register_errors() {
        let exprs = vec![Expr::Cmp { sreg: 5, op: CmpOp::Eq, rhs: vec![1] }];
        assert!(eval(&exprs, "filter", false, &SetCache::new()).is_err());
    }

    #[test]
    fn payload_ip_saddr_formats_as_dotted_quad() {
        let exprs = vec![
            Expr::Payload {
                field: PayloadField { base: PayloadBase::NetworkHeader, offset_bits: 96, len_bits: 32 },
                dreg: 1,
            },
            Expr::Cmp { sreg: 1, op: CmpOp::Eq, rhs: vec![10, 0, 0, 1] },
        ];
        let out = eval(&exprs, "filter", false, &SetCache::new()).unwrap();
        assert_eq!(out.text, "ip saddr 10.0.0.1");
    }

    #[test]
    fn bitwise_raw_arithmetic_when_source_is_not_descriptor_backed() {
        let exprs = vec![
            Expr::Immediate { dreg: 1, data: vec![0xff, 0xff] },
            Expr::Bitwise {
                sreg: 1,
                dreg: 2,
                len_bits: 16,
                mask: vec![0x0f, 0xff],
                xor: vec![0x00, 0x01],
            },
            Expr::Cmp { sreg: 2, op: CmpOp::Eq, rhs: vec![0, 1] },
        ];
        let out = eval(&exprs, "filter", false, &SetCache::new()).unwrap();
        assert!(out.text.contains("&"));
    }
}
