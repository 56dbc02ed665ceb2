// SPDX-FileCopyrightText: 2026 The nftrace-rs Authors
// SPDX-License-Identifier: GPL-3.0-or-later

pub mod group;
pub mod models;

pub use group::TraceGroupAssembler;
pub use models::{NftTrace, Trace};
