// SPDX-FileCopyrightText: 2026 The nftrace-rs Authors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Resolves the `nft_traceinfo`/`nft_pktinfo`/`nft_rule`/`nft_chain`/
//! `nft_table`/`nft_verdict` field offsets the kprobe needs from the running
//! kernel's BTF (`/sys/kernel/btf/vmlinux`), so the compiled probe is not
//! tied to one kernel build's struct layout ("Runtime Offset Discovery").
//!
//! No crate in this workspace's dependency graph exposes a ready-made
//! "struct member byte offset by name" query, so this walks the BTF type
//! section directly — the same hand-rolled-cursor style `providers::nlattr`
//! uses for netlink TLVs, applied to a different kernel binary format. The
//! format itself (`Documentation/bpf/btf.rst`) is stable kernel ABI, not
//! this crate's invention.

use anyhow::{anyhow, Context, Result};
use nftrace_common::TraceInfoOffsets;
use std::collections::HashMap;
use std::path::Path;

const VMLINUX_BTF_PATH: &str = "/sys/kernel/btf/vmlinux";
const BTF_MAGIC: u16 = 0xeB9F;

const BTF_KIND_INT: u8 = 1;
const BTF_KIND_ARRAY: u8 = 3;
const BTF_KIND_STRUCT: u8 = 4;
const BTF_KIND_UNION: u8 = 5;
const BTF_KIND_ENUM: u8 = 6;
const BTF_KIND_FUNC_PROTO: u8 = 13;
const BTF_KIND_VAR: u8 = 14;
const BTF_KIND_DATASEC: u8 = 15;
const BTF_KIND_DECL_TAG: u8 = 17;
const BTF_KIND_ENUM64: u8 = 19;

struct Member {
    name: String,
    /// Byte offset from the start of the struct.
    byte_offset: u32,
}

struct StructDef {
    members: Vec<Member>,
}

/// Parsed view of a vmlinux BTF blob, indexed by struct name for the
/// handful of lookups `discover` needs. Everything else in the type graph
/// (ints, pointers, enums, function prototypes...) is walked only far
/// enough to stay in sync with the next type's offset; its content is
/// never retained.
struct Btf {
    structs: HashMap<String, StructDef>,
}

impl Btf {
    fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 24 {
            return Err(anyhow!("BTF blob too short for a header"));
        }
        let magic = u16::from_ne_bytes([data[0], data[1]]);
        if magic != BTF_MAGIC {
            return Err(anyhow!("not a BTF blob: bad magic {magic:#x}"));
        }
        let hdr_len = u32::from_ne_bytes(data[4..8].try_into().unwrap()) as usize;
        let type_off = u32::from_ne_bytes(data[8..12].try_into().unwrap()) as usize;
        let type_len = u32::from_ne_bytes(data[12..16].try_into().unwrap()) as usize;
        let str_off = u32::from_ne_bytes(data[16..20].try_into().unwrap()) as usize;
        let str_len = u32::from_ne_bytes(data[20..24].try_into().unwrap()) as usize;

        let types_start = hdr_len.checked_add(type_off).context("type section offset overflow")?;
        let types_end = types_start.checked_add(type_len).context("type section length overflow")?;
        let strs_start = hdr_len.checked_add(str_off).context("string section offset overflow")?;
        let strs_end = strs_start.checked_add(str_len).context("string section length overflow")?;
        let types = data
            .get(types_start..types_end)
            .ok_or_else(|| anyhow!("BTF type section out of bounds"))?;
        let strings = data
            .get(strs_start..strs_end)
            .ok_or_else(|| anyhow!("BTF string section out of bounds"))?;

        let mut structs = HashMap::new();
        let mut pos = 0usize;
        while pos + 12 <= types.len() {
            let name_off = u32::from_ne_bytes(types[pos..pos + 4].try_into().unwrap());
            let info = u32::from_ne_bytes(types[pos + 4..pos + 8].try_into().unwrap());
            let kind = ((info >> 24) & 0x1f) as u8;
            let vlen = (info & 0xffff) as usize;
            pos += 12;

            match kind {
                BTF_KIND_STRUCT | BTF_KIND_UNION => {
                    let mut members = Vec::with_capacity(vlen);
                    for _ in 0..vlen {
                        if pos + 12 > types.len() {
                            return Err(anyhow!("truncated btf_member array"));
                        }
                        let m_name_off = u32::from_ne_bytes(types[pos..pos + 4].try_into().unwrap());
                        let m_offset = u32::from_ne_bytes(types[pos + 8..pos + 12].try_into().unwrap());
                        // bit 31 of btf_type.info marks bitfield members, in
                        // which case the low 24 bits of m_offset hold the
                        // bit offset rather than a byte-aligned one; none of
                        // the fields this probe reads are bitfields (only
                        // nft_rule.handle is, and it's read directly from
                        // the struct's base offset).
                        let bit_offset = m_offset & 0x00ff_ffff;
                        members.push(Member {
                            name: read_str(strings, m_name_off)?,
                            byte_offset: bit_offset / 8,
                        });
                        pos += 12;
                    }
                    let name = read_str(strings, name_off)?;
                    if !name.is_empty() {
                        structs.insert(name, StructDef { members });
                    }
                }
                BTF_KIND_ENUM => pos += vlen * 8,
                BTF_KIND_ENUM64 => pos += vlen * 12,
                BTF_KIND_ARRAY => pos += 12,
                BTF_KIND_FUNC_PROTO => pos += vlen * 8,
                BTF_KIND_VAR => pos += 4,
                BTF_KIND_DATASEC => pos += vlen * 12,
                BTF_KIND_DECL_TAG => pos += 4,
                BTF_KIND_INT => pos += 4,
                // BTF_KIND_PTR/FWD/TYPEDEF/VOLATILE/CONST/RESTRICT/FUNC/
                // FLOAT/TYPE_TAG carry no trailing data.
                _ => {}
            }
        }

        Ok(Self { structs })
    }

    fn member_offset(&self, struct_name: &str, field: &str) -> Result<u32> {
        let def = self
            .structs
            .get(struct_name)
            .ok_or_else(|| anyhow!("BTF has no struct `{struct_name}`"))?;
        def.members
            .iter()
            .find(|m| m.name == field)
            .map(|m| m.byte_offset)
            .ok_or_else(|| anyhow!("struct `{struct_name}` has no field `{field}`"))
    }
}

fn read_str(strings: &[u8], offset: u32) -> Result<String> {
    let start = offset as usize;
    let bytes = strings.get(start..).ok_or_else(|| anyhow!("BTF string offset out of bounds"))?;
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    Ok(String::from_utf8_lossy(&bytes[..end]).into_owned())
}

/// Resolves every offset `nftrace-ebpf`'s `read_trace_info` needs. Run once
/// at collector load time and written into the `OFFSETS` map.
pub fn discover() -> Result<TraceInfoOffsets> {
    discover_from(Path::new(VMLINUX_BTF_PATH))
}

fn discover_from(path: &Path) -> Result<TraceInfoOffsets> {
    let data = std::fs::read(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let btf = Btf::parse(&data).context("parsing vmlinux BTF")?;

    Ok(TraceInfoOffsets {
        ti_type: btf.member_offset("nft_traceinfo", "type")?,
        ti_pkt: btf.member_offset("nft_traceinfo", "pkt")?,
        ti_verdict: btf.member_offset("nft_traceinfo", "verdict")?,
        ti_rule: btf.member_offset("nft_traceinfo", "rule")?,
        ti_chain: btf.member_offset("nft_traceinfo", "chain")?,
        pkt_skb: btf.member_offset("nft_pktinfo", "skb")?,
        pkt_family: btf.member_offset("nft_pktinfo", "family")?,
        rule_handle: btf.member_offset("nft_rule", "handle")?,
        chain_name: btf.member_offset("nft_chain", "name")?,
        chain_table: btf.member_offset("nft_chain", "table")?,
        chain_policy: btf.member_offset("nft_chain", "policy")?,
        table_name: btf.member_offset("nft_table", "name")?,
        verdict_code: btf.member_offset("nft_verdict", "code")?,
        verdict_chain: btf.member_offset("nft_verdict", "chain")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Hand-assembles a minimal BTF blob (header + one struct type with two
    /// members + its string table) and checks the offsets round-trip,
    /// without needing a real `/sys/kernel/btf/vmlinux` to run against.
    fn synthetic_btf() -> Vec<u8> {
        let mut strings = vec![0u8]; // btf string offset 0 is always ""
        let struct_name_off = strings.len() as u32;
        strings.extend_from_slice(b"nft_traceinfo\0");
        let field_a_off = strings.len() as u32;
        strings.extend_from_slice(b"type\0");
        let field_b_off = strings.len() as u32;
        strings.extend_from_slice(b"pkt\0");

        let mut types = Vec::new();
        // btf_type: name_off, info (kind=STRUCT, vlen=2), size
        types.extend_from_slice(&struct_name_off.to_ne_bytes());
        types.extend_from_slice(&(((BTF_KIND_STRUCT as u32) << 24) | 2).to_ne_bytes());
        types.extend_from_slice(&16u32.to_ne_bytes()); // struct size
        // btf_member #1: "type" at byte offset 0 (bit offset 0)
        types.extend_from_slice(&field_a_off.to_ne_bytes());
        types.extend_from_slice(&0u32.to_ne_bytes()); // member type id
        types.extend_from_slice(&0u32.to_ne_bytes()); // bit offset
        // btf_member #2: "pkt" at byte offset 8 (bit offset 64)
        types.extend_from_slice(&field_b_off.to_ne_bytes());
        types.extend_from_slice(&0u32.to_ne_bytes());
        types.extend_from_slice(&64u32.to_ne_bytes());

        let hdr_len = 24u32;
        let type_off = 0u32;
        let type_len = types.len() as u32;
        let str_off = type_len;
        let str_len = strings.len() as u32;

        let mut blob = Vec::new();
        blob.extend_from_slice(&BTF_MAGIC.to_ne_bytes());
        blob.push(1); // version
        blob.push(0); // flags
        blob.extend_from_slice(&hdr_len.to_ne_bytes());
        blob.extend_from_slice(&type_off.to_ne_bytes());
        blob.extend_from_slice(&type_len.to_ne_bytes());
        blob.extend_from_slice(&str_off.to_ne_bytes());
        blob.extend_from_slice(&str_len.to_ne_bytes());
        blob.extend_from_slice(&types);
        blob.extend_from_slice(&strings);
        blob
    }

    #[test]
    fn resolves_member_offsets_from_a_synthetic_blob() {
        let blob = synthetic_btf();
        let btf = Btf::parse(&blob).expect("parse");
        assert_eq!(btf.member_offset("nft_traceinfo", "type").unwrap(), 0);
        assert_eq!(btf.member_offset("nft_traceinfo", "pkt").unwrap(), 8);
    }

    #[test]
    fn unknown_struct_is_an_error() {
        let blob = synthetic_btf();
        let btf = Btf::parse(&blob).expect("parse");
        assert!(btf.member_offset("nft_rule", "handle").is_err());
    }

    #[test]
    fn rejects_bad_magic() {
        let mut blob = synthetic_btf();
        blob[0] = 0;
        assert!(Btf::parse(&blob).is_err());
    }

    #[test]
    fn discover_from_missing_path_is_an_error() {
        assert!(discover_from(Path::new("/nonexistent/vmlinux-btf")).is_err());
    }
}
