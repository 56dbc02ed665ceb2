// SPDX-FileCopyrightText: 2026 The nftrace-rs Authors
// SPDX-License-Identifier: GPL-3.0-or-later

//! The nftables expression decoder (C1). Turns a rule's parsed
//! expression list into the textual and JSON forms attached to a
//! `Trace` (§4.1). The boundary with the raw kernel bytecode — decoding
//! `NFTA_RULE_EXPRESSIONS` nested netlink attributes into `Expr` values —
//! lives in `providers::rule_cache`, which owns the `neli` socket; this
//! module only evaluates an already-structured expression list, so it
//! stays testable without a running kernel.

pub mod expr;
pub mod protocols;
pub mod registers;
pub mod sets;

pub use expr::{CmpOp, Expr, VerdictCode};
pub use registers::{CtKey, MetaKey, PayloadBase, PayloadField};
pub use sets::{SetCache, SetDatatype, SetEntry, SetFlags};

use crate::errors::DecodeError;
use serde_json::Value;

pub struct DecodedRule {
    pub text: String,
    pub json: Value,
}

/// Decodes one rule's expression list plus its trailing `# handle N`
/// comment (and an optional user comment, §8 scenario S6) into text and
/// JSON forms.
pub fn decode_rule(
    exprs: &[Expr],
    table: &str,
    is_v6: bool,
    sets: &SetCache,
    handle: u64,
    comment: Option<&str>,
) -> Result<DecodedRule, DecodeError> {
    let out = expr::eval(exprs, table, is_v6, sets)?;

    let mut text = out.text;
    if let Some(c) = comment {
        text.push_str(&format!(" comment \"{c}\""));
    }
    text.push_str(&format!(" # handle {handle}"));

    Ok(DecodedRule { text, json: out.json })
}

#[cfg(test)]
mod tests {
    use super::*;
    use registers::PayloadField;

    #[test]
    fn s5_full_rule_with_handle_suffix() {
        let exprs = vec![
            Expr::Meta { key: MetaKey::L4proto, dreg: 1 },
            Expr::Cmp { sreg: 1, op: CmpOp::Eq, rhs: vec![0x06] },
            Expr::Counter { packets: 0, bytes: 0 },
            Expr::Log,
            Expr::Verdict { code: VerdictCode::Accept, chain: None },
        ];
        let d = decode_rule(&exprs, "filter", false, &SetCache::new(), 1, None).unwrap();
        assert_eq!(d.text, "meta l4proto tcp counter packets 0 bytes 0 log accept # handle 1");
    }

    #[test]
    fn s6_full_rule_with_comment_and_zero_handle() {
        let exprs = vec![
            Expr::Meta { key: MetaKey::Oifname, dreg: 1 },
            Expr::Cmp { sreg: 1, op: CmpOp::Neq, rhs: b"lo\0\0\0\0\0\0\0\0\0\0\0\0\0\0".to_vec() },
            Expr::Immediate { dreg: 1, data: vec![0x01] },
            Expr::MetaSet { key: MetaKey::Nftrace, sreg: 1 },
            Expr::Verdict { code: VerdictCode::Goto, chain: Some("FW-OUT".to_string()) },
        ];
        let d = decode_rule(&exprs, "filter", false, &SetCache::new(), 0, Some("user note")).unwrap();
        assert_eq!(
            d.text,
            "oifname != lo meta nftrace set 1 goto FW-OUT comment \"user note\" # handle 0"
        );
    }

    #[test]
    fn lookup_against_a_cached_named_set_renders_its_name() {
        let mut cache = SetCache::new();
        cache.insert(
            "filter",
            "blocklist",
            1,
            SetEntry {
                datatype: SetDatatype::Integer,
                flags: SetFlags::default(),
                key_type_bytes: 4,
                elements: vec![],
            },
        );
        let exprs = vec![
            Expr::Payload {
                field: PayloadField { base: PayloadBase::NetworkHeader, offset_bits: 96, len_bits: 32 },
                dreg: 1,
            },
            Expr::Lookup { sreg: 1, set_name: "blocklist".to_string(), set_id: 1, dreg: None, invert: false },
        ];
        let d = decode_rule(&exprs, "filter", false, &cache, 3, None).unwrap();
        assert!(d.text.contains("@blocklist"));
    }

    #[test]
    fn lookup_against_an_absent_set_errors() {
        let exprs = vec![
            Expr::Payload {
                field: PayloadField { base: PayloadBase::NetworkHeader, offset_bits: 96, len_bits: 32 },
                dreg: 1,
            },
            Expr::Lookup { sreg: 1, set_name: "blocklist".to_string(), set_id: 1, dreg: None, invert: false },
        ];
        assert!(decode_rule(&exprs, "filter", false, &SetCache::new(), 3, None).is_err());
    }
}
