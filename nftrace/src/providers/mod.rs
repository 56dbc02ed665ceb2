// SPDX-FileCopyrightText: 2026 The nftrace-rs Authors
// SPDX-License-Identifier: GPL-3.0-or-later

pub mod iface_cache;
pub mod iface_provider;
pub mod nlattr;
pub mod rule_cache;
pub mod rule_provider;
