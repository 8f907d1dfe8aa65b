// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024-2025 SUSE LLC
//
// Author: Joerg Roedel <jroedel@suse.de>

use crate::address::GuestAddr;
use crate::gmap::Gmap;

/// Callback invoked whenever a previously valid guest range becomes
/// invalid, covering both plain unmaps and shadow-table teardown.
///
/// Callbacks run with the affected address space's table lock held and must
/// not call back into the engine. Unregistration blocks until every
/// notification walk that started before it has finished, so a notifier may
/// be freed as soon as `unregister_notifier` returns.
pub trait GmapNotifier: Send + Sync {
    fn invalidated(&self, gmap: &Gmap, start: GuestAddr, end: GuestAddr);
}
