// SPDX-FileCopyrightText: 2026 The nftrace-rs Authors
// SPDX-License-Identifier: GPL-3.0-or-later

//! The set cache (§3 "Set cache"). Backs `lookup`/`dynset`/`map`/`vmap`
//! decoding: resolves `(table, set_name, set_id)` to its element list and
//! applies the two element-ordering rules from §4.1 "Set element
//! ordering".

use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetDatatype {
    Integer,
    Ipv4Addr,
    Ipv6Addr,
    /// string, verdict, and ifname types all preserve insertion order.
    StringLike,
}

#[derive(Debug, Clone, Default)]
pub struct SetFlags {
    pub anonymous: bool,
    pub constant: bool,
    pub interval: bool,
    pub map: bool,
    pub timeout: bool,
    pub concat: bool,
}

#[derive(Debug, Clone)]
pub struct SetElement {
    /// Pre-rendered text for this key (`"10.0.0.1"`, `"443"`, `"eth0"`...).
    pub display: String,
    /// Big-endian integer value of the key, used for numeric sort.
    pub integer_value: Option<u128>,
    pub val: Option<String>,
    pub timeout: Option<u64>,
    pub expires: Option<u64>,
    pub counter: Option<u64>,
    pub interval_end: bool,
}

#[derive(Debug, Clone)]
pub struct SetEntry {
    pub datatype: SetDatatype,
    pub flags: SetFlags,
    pub key_type_bytes: usize,
    pub elements: Vec<SetElement>,
}

impl SetEntry {
    /// Applies the §4.1 ordering rule and drops interval-end markers,
    /// which are bookkeeping only and never printed.
    pub fn ordered_elements(&self) -> Vec<&SetElement> {
        let mut elems: Vec<&SetElement> = self.elements.iter().filter(|e| !e.interval_end).collect();
        if self.datatype != SetDatatype::StringLike {
            elems.sort_by_key(|e| e.integer_value.unwrap_or(0));
        }
        elems
    }

    /// Renders `{ e1, e2, ... }` for an anonymous set inlined at the use
    /// site, or the element list of a named set's definition.
    pub fn render_inline(&self) -> String {
        let parts: Vec<String> = self
            .ordered_elements()
            .iter()
            .map(|e| match &e.val {
                Some(v) if self.flags.map => format!("{} : {}", e.display, v),
                _ => e.display.clone(),
            })
            .collect();
        format!("{{ {} }}", parts.join(", "))
    }
}

#[derive(Default)]
pub struct SetCache {
    sets: HashMap<(String, String, u32), SetEntry>,
}

impl SetCache {
    pub fn new() -> Self {
        Self {
            sets: HashMap::new(),
        }
    }

    pub fn get(&self, table: &str, name: &str, id: u32) -> Option<&SetEntry> {
        self.sets.get(&(table.to_string(), name.to_string(), id))
    }

    pub fn insert(&mut self, table: &str, name: &str, id: u32, entry: SetEntry) {
        self.sets
            .insert((table.to_string(), name.to_string(), id), entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn elem(display: &str, n: u128) -> SetElement {
        SetElement {
            display: display.to_string(),
            integer_value: Some(n),
            val: None,
            timeout: None,
            expires: None,
            counter: None,
            interval_end: false,
        }
    }

    #[test]
    fn numeric_sets_sort_ascending_by_integer_value() {
        let set = SetEntry {
            datatype: SetDatatype::Integer,
            flags: SetFlags::default(),
            key_type_bytes: 4,
            elements: vec![elem("30", 30), elem("10", 10), elem("20", 20)],
        };
        let ordered: Vec<&str> = set.ordered_elements().iter().map(|e| e.display.as_str()).collect();
        assert_eq!(ordered, vec!["10", "20", "30"]);
    }

    #[test]
    fn string_like_sets_preserve_insertion_order() {
        let set = SetEntry {
            datatype: SetDatatype::StringLike,
            flags: SetFlags::default(),
            key_type_bytes: 16,
            elements: vec![elem("eth1", 2), elem("eth0", 1)],
        };
        let ordered: Vec<&str> = set.ordered_elements().iter().map(|e| e.display.as_str()).collect();
        assert_eq!(ordered, vec!["eth1", "eth0"]);
    }

    #[test]
    fn interval_end_markers_are_suppressed() {
        let mut e = elem("65535", 65535);
        e.interval_end = true;
        let set = SetEntry {
            datatype: SetDatatype::Integer,
            flags: SetFlags::default(),
            key_type_bytes: 2,
            elements: vec![elem("1024", 1024), e],
        };
        assert_eq!(set.ordered_elements().len(), 1);
    }

    #[test]
    fn render_inline_formats_braces() {
        let set = SetEntry {
            datatype: SetDatatype::Integer,
            flags: SetFlags::default(),
            key_type_bytes: 2,
            elements: vec![elem("80", 80), elem("443", 443)],
        };
        assert_eq!(set.render_inline(), "{ 80, 443 }");
    }
}
