// SPDX-FileCopyrightText: 2026 The nftrace-rs Authors
// SPDX-License-Identifier: GPL-3.0-or-later

//! A minimal nlattr TLV cursor shared by the rule provider and the
//! netlink trace collector. Both walk flat and nested netlink attribute
//! lists that follow the standard `len(u16) | type(u16) | payload`
//! layout with 4-byte alignment; `neli`'s typed attribute machinery is
//! built around its own derive macros, so ad hoc per-message walks like
//! these are easier to hand-roll, mirroring what `original_source` does
//! with `netlink.AttributeDecoder`.

pub struct Cursor<'a> {
    buf: &'a [u8],
}

pub struct Attr<'a> {
    pub kind: u16,
    pub payload: &'a [u8],
}

impl<'a> Cursor<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }
}

impl<'a> Iterator for Cursor<'a> {
    type Item = Attr<'a>;

    fn next(&mut self) -> Option<Attr<'a>> {
        if self.buf.len() < 4 {
            return None;
        }
        let len = u16::from_ne_bytes([self.buf[0], self.buf[1]]) as usize;
        let kind = u16::from_ne_bytes([self.buf[2], self.buf[3]]) & 0x3fff;
        if len < 4 || len > self.buf.len() {
            return None;
        }
        let payload = &self.buf[4..len];
        let aligned = (len + 3) & !3;
        self.buf = &self.buf[aligned.min(self.buf.len())..];
        Some(Attr { kind, payload })
    }
}

pub fn be_u16(b: &[u8]) -> Option<u16> {
    Some(u16::from_be_bytes(b.get(0..2)?.try_into().ok()?))
}
pub fn be_u32(b: &[u8]) -> Option<u32> {
    Some(u32::from_be_bytes(b.get(0..4)?.try_into().ok()?))
}
pub fn be_u64(b: &[u8]) -> Option<u64> {
    Some(u64::from_be_bytes(b.get(0..8)?.try_into().ok()?))
}
pub fn cstr(b: &[u8]) -> String {
    let end = b.iter().position(|&c| c == 0).unwrap_or(b.len());
    String::from_utf8_lossy(&b[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push(buf: &mut Vec<u8>, kind: u16, payload: &[u8]) {
        let len = (4 + payload.len()) as u16;
        buf.extend_from_slice(&len.to_ne_bytes());
        buf.extend_from_slice(&kind.to_ne_bytes());
        buf.extend_from_slice(payload);
        while buf.len() % 4 != 0 {
            buf.push(0);
        }
    }

    #[test]
    fn walks_two_attributes_with_padding() {
        let mut buf = Vec::new();
        push(&mut buf, 1, b"abc");
        push(&mut buf, 2, &9u32.to_be_bytes());
        let attrs: Vec<_> = Cursor::new(&buf).collect();
        assert_eq!(attrs.len(), 2);
        assert_eq!(attrs[0].kind, 1);
        assert_eq!(cstr(attrs[0].payload), "abc");
        assert_eq!(attrs[1].kind, 2);
        assert_eq!(be_u32(attrs[1].payload), Some(9));
    }
}
