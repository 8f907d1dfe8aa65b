// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024-2025 SUSE LLC
//
// Author: Joerg Roedel <jroedel@suse.de>

use crate::address::{Address, GuestAddr, HostAddr};
use crate::gmap::Gmap;
use crate::host::HostMm;
use crate::locking::RWLock;
use crate::notify::GmapNotifier;
use crate::tlb::TlbFlush;
use crate::types::{FlushScope, NotifyBits, PAGE_SIZE, SEGMENT_SIZE};
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;

/// Construction-time configuration of a host context.
#[derive(Clone, Copy, Debug)]
pub struct MmConfig {
    /// Allow guest segments to be backed by large host mappings.
    pub allow_large_pages: bool,
    /// Upper bound on table pages per address space. Exceeding it makes
    /// operations fail with `OutOfMemory`.
    pub table_limit: usize,
    /// Upper bound on forward-index entries per address space.
    pub index_limit: usize,
}

impl Default for MmConfig {
    fn default() -> Self {
        Self {
            allow_large_pages: false,
            table_limit: usize::MAX,
            index_limit: usize::MAX,
        }
    }
}

/// Per-process context shared by all guest address spaces built on top of
/// one host address space. Owns the collaborator handles, the list of
/// attached address spaces and the invalidation-notifier registry.
pub struct MmContext {
    pub(crate) host: Arc<dyn HostMm>,
    pub(crate) tlb: Arc<dyn TlbFlush>,
    pub(crate) config: MmConfig,
    gmaps: RWLock<Vec<Weak<Gmap>>>,
    notifiers: RWLock<Vec<Arc<dyn GmapNotifier>>>,
}

impl MmContext {
    pub fn new(host: Arc<dyn HostMm>, tlb: Arc<dyn TlbFlush>, config: MmConfig) -> Arc<Self> {
        Arc::new(Self {
            host,
            tlb,
            config,
            gmaps: RWLock::new(Vec::new()),
            notifiers: RWLock::new(Vec::new()),
        })
    }

    /// Register an invalidation callback.
    pub fn register_notifier(&self, nb: Arc<dyn GmapNotifier>) {
        self.notifiers.lock_write().push(nb);
    }

    /// Remove an invalidation callback. Blocks until every notification
    /// walk that started before this call has finished, so the notifier can
    /// be freed once this returns.
    pub fn unregister_notifier(&self, nb: &Arc<dyn GmapNotifier>) {
        self.notifiers
            .lock_write()
            .retain(|n| !core::ptr::eq(Arc::as_ptr(n) as *const (), Arc::as_ptr(nb) as *const ()));
    }

    pub(crate) fn call_notifiers(&self, gmap: &Gmap, start: GuestAddr, end: GuestAddr) {
        for nb in self.notifiers.lock_read().iter() {
            nb.invalidated(gmap, start, end);
        }
    }

    pub(crate) fn attach(&self, gmap: &Arc<Gmap>) {
        self.gmaps.lock_write().push(Arc::downgrade(gmap));
    }

    pub(crate) fn detach(&self, gmap: &Gmap) {
        self.gmaps
            .lock_write()
            .retain(|w| !core::ptr::eq(w.as_ptr(), gmap));
    }

    fn live_gmaps(&self) -> Vec<Arc<Gmap>> {
        self.gmaps
            .lock_read()
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    /// Entry point for the host when a notify-marked 4k translation entry
    /// is written. Dispatches the shadow-table cascade and the registered
    /// invalidation callbacks for the affected guest page.
    pub fn notify_page_modified(&self, vmaddr: HostAddr, bits: NotifyBits) {
        for gmap in self.live_gmaps() {
            let Some(gseg) = gmap.host_to_guest_lookup(vmaddr) else {
                continue;
            };
            let gaddr = gseg + (vmaddr.segment_offset() & !(PAGE_SIZE - 1));

            if bits.contains(NotifyBits::SHADOW) {
                let mut children = gmap.children.lock();
                children.retain(|sg| !sg.shadow_notify(vmaddr, gaddr));
            }
            if bits.contains(NotifyBits::MPROT) {
                self.call_notifiers(&gmap, gaddr, gaddr + (PAGE_SIZE - 1));
            }
        }
    }

    /// Entry point for the host when one of its segment mappings goes away
    /// or changes: disconnect the affected guest segment in every attached
    /// address space, optionally flushing the stale translation.
    pub fn invalidate_segment(&self, vmaddr: HostAddr, flush: Option<FlushScope>) {
        for gmap in self.live_gmaps() {
            gmap.zap_host_segment(vmaddr, flush);
        }
    }

    /// Disconnect the guest segment backed by `vmaddr` in every attached
    /// address space, flushing each space that held a live entry. Used when
    /// the host retires a whole leaf table.
    pub fn unlink_segment(&self, vmaddr: HostAddr) {
        for gmap in self.live_gmaps() {
            if gmap.unlink_by_host(vmaddr) {
                self.tlb.flush_space(gmap.asce());
            }
        }
    }
}

// Sanity check: the guest page derived in notify_page_modified stays inside
// one segment.
const _: () = assert!(PAGE_SIZE <= SEGMENT_SIZE);
