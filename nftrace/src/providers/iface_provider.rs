// SPDX-FileCopyrightText: 2026 The nftrace-rs Authors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Interface provider (`C3::run`, §4.3). Seeds the cache from the
//! kernel's current link list, then watches `NETLINK_ROUTE` for
//! `RTMGRP_LINK | RTMGRP_IPV4_IFADDR` to keep it current: `NEWLINK`
//! updates, `DELLINK` removes by name. Memory-pressure errors on the
//! socket are reported and otherwise ignored (§4.3). Grounded on
//! `original_source`'s `iface-provider.go` run loop.

use crate::cancel::CancellationToken;
use crate::providers::iface_cache::IfaceCache;
use crate::providers::nlattr::{be_u32, cstr, Cursor};
use anyhow::{Context, Result};
use neli::consts::socket::NlFamily;
use neli::socket::NlSocketHandle;
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::time::Duration;

const RTMGRP_LINK: u32 = 1;
const RTMGRP_IPV4_IFADDR: u32 = 0x10;
const RTM_NEWLINK: u16 = 16;
const RTM_DELLINK: u16 = 17;
const IFLA_IFNAME: u16 = 3;
const READ_DEADLINE: Duration = Duration::from_secs(1);

pub struct IfaceProvider {
    socket: NlSocketHandle,
}

impl IfaceProvider {
    pub fn bind() -> Result<Self> {
        let socket = NlSocketHandle::connect(
            NlFamily::Route,
            None,
            &[RTMGRP_LINK, RTMGRP_IPV4_IFADDR],
        )
        .context("binding NETLINK_ROUTE / joining RTMGRP_LINK|RTMGRP_IPV4_IFADDR")?;
        Ok(Self { socket })
    }

    /// Populates `cache` from the OS's current link list (§4.3 `reload`).
    pub fn seed(cache: &IfaceCache) -> Result<()> {
        let links = nix::net::if_::if_nameindex().context("enumerating network interfaces")?;
        cache.reload(
            links
                .iter()
                .map(|l| (l.index(), l.name().to_string_lossy().into_owned())),
        );
        Ok(())
    }

    pub fn run(&mut self, cancel: &CancellationToken, cache: &Arc<IfaceCache>, metrics: &crate::metrics::Metrics) -> Result<()> {
        while !cancel.is_cancelled() {
            let fd = self.socket.as_raw_fd();
            if !wait_readable(fd, READ_DEADLINE)? {
                continue;
            }
            let mut buf = vec![0u8; 64 * 1024];
            match nix::sys::socket::recv(fd, &mut buf, nix::sys::socket::MsgFlags::empty()) {
                Ok(n) => {
                    buf.truncate(n);
                    handle_message(&buf, cache);
                }
                Err(nix::errno::Errno::EINTR) => continue,
                Err(nix::errno::Errno::ENOBUFS) => {
                    metrics.err_nl_mem.with_label_values(&["iface"]).inc();
                    continue;
                }
                Err(e) => return Err(anyhow::anyhow!("iface provider recv: {e}")),
            }
        }
        Ok(())
    }

}

fn handle_message(msg: &[u8], cache: &IfaceCache) {
    const NLMSG_HDR_LEN: usize = 16;
    const IFINFOMSG_LEN: usize = 16;
    if msg.len() < NLMSG_HDR_LEN + IFINFOMSG_LEN {
        return;
    }
    let nlmsg_type = u16::from_ne_bytes([msg[4], msg[5]]);
    let ifi_index = i32::from_ne_bytes(msg[NLMSG_HDR_LEN + 4..NLMSG_HDR_LEN + 8].try_into().unwrap());

    let attrs_start = NLMSG_HDR_LEN + IFINFOMSG_LEN;
    let mut ifname = None;
    for attr in Cursor::new(&msg[attrs_start..]) {
        if attr.kind == IFLA_IFNAME {
            ifname = Some(cstr(attr.payload));
        }
    }

    match (nlmsg_type, ifname) {
        (t, Some(name)) if t == RTM_NEWLINK => cache.update(ifi_index as u32, name),
        (t, Some(name)) if t == RTM_DELLINK => cache.remove_by_name(&name),
        _ => {}
    }
}

fn wait_readable(fd: i32, timeout: Duration) -> Result<bool> {
    use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
    use std::os::fd::BorrowedFd;

    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    let mut fds = [PollFd::new(&borrowed, PollFlags::POLLIN)];
    let timeout_ms: i32 = timeout.as_millis().try_into().unwrap_or(i32::MAX);
    let n = poll(&mut fds, PollTimeout::try_from(timeout_ms).unwrap_or(PollTimeout::NONE))
        .context("poll() on iface provider fd")?;
    Ok(n > 0)
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

    fn build_message(nlmsg_type: u16, ifi_index: i32, ifname: &str) -> Vec<u8> {
        let mut msg = vec![0u8; 16]; // nlmsghdr (len/flags/seq/pid not inspected here)
        msg[4..6].copy_from_slice(&nlmsg_type.to_ne_bytes());
        msg.extend_from_slice(&[0u8; 16]); // ifinfomsg
        msg[16 + 4..16 + 8].copy_from_slice(&ifi_index.to_ne_bytes());
        let mut name = ifname.as_bytes().to_vec();
        name.push(0);
        push(&mut msg, IFLA_IFNAME, &name);
        msg
    }

    #[test]
    fn newlink_updates_cache() {
        let cache = IfaceCache::new();
        let msg = build_message(RTM_NEWLINK, 5, "eth0");
        handle_message(&msg, &cache);
        assert_eq!(cache.get_iface(5).unwrap(), "eth0");
    }

    #[test]
    fn dellink_removes_by_name() {
        let cache = IfaceCache::new();
        cache.update(5, "eth0".to_string());
        let msg = build_message(RTM_DELLINK, 5, "eth0");
        handle_message(&msg, &cache);
        assert!(cache.get_iface(5).is_err());
    }
}
