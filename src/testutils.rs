// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024-2025 SUSE LLC
//
// Author: Carlos López <carlos.lopez@suse.com>

use crate::address::{Address, GuestAddr, HostAddr};
use crate::arena::Asce;
use crate::error::GmapError;
use crate::gmap::Gmap;
use crate::host::{Fixup, HostLeaf, HostMm, HostPteView, HostSegment};
use crate::locking::{LockGuard, SpinLock};
use crate::mm::{MmConfig, MmContext};
use crate::notify::GmapNotifier;
use crate::tlb::TlbFlush;
use crate::types::{FlushScope, NotifyBits, Prot, TableKind, PAGE_SIZE, SEGMENT_SIZE};
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// One 4k translation entry of the mock host address space.
#[derive(Clone, Copy, Debug)]
pub struct MockPte {
    pub frame: u64,
    pub present: bool,
    pub writable: bool,
    pub notify: NotifyBits,
    pub dirty: bool,
}

/// Host collaborator backed by plain maps. Faulting in pages happens
/// through `fixup_fault`, like the real thing.
pub struct MockHost {
    leaves: SpinLock<BTreeMap<u64, MockPte>>,
    segments: SpinLock<BTreeMap<u64, HostSegment>>,
    fixups: AtomicUsize,
    rescheds: AtomicUsize,
    fail_fixup: AtomicBool,
    unlocked_fixup: AtomicBool,
}

impl MockHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            leaves: SpinLock::new(BTreeMap::new()),
            segments: SpinLock::new(BTreeMap::new()),
            fixups: AtomicUsize::new(0),
            rescheds: AtomicUsize::new(0),
            fail_fixup: AtomicBool::new(false),
            unlocked_fixup: AtomicBool::new(false),
        })
    }

    /// Populate a host range with 4k-backed segments and present, writable
    /// leaf entries.
    pub fn map_range(&self, vmaddr: HostAddr, len: u64) {
        assert!(vmaddr.is_aligned(SEGMENT_SIZE) && len % SEGMENT_SIZE == 0);
        let mut segments = self.segments.lock();
        let mut leaves = self.leaves.lock();
        let mut off = 0;
        while off < len {
            let seg = vmaddr + off;
            segments.insert(
                seg.segment_index(),
                HostSegment {
                    origin: seg,
                    large: false,
                    writable: true,
                },
            );
            off += SEGMENT_SIZE;
        }
        let mut page = 0;
        while page < len {
            let addr = vmaddr + page;
            leaves.insert(
                addr.page_index(),
                MockPte {
                    frame: addr.bits(),
                    present: true,
                    writable: true,
                    notify: NotifyBits::empty(),
                    dirty: false,
                },
            );
            page += PAGE_SIZE;
        }
    }

    /// Register a single large host segment without leaf entries.
    pub fn add_large_segment(&self, vmaddr: HostAddr, writable: bool) {
        self.segments.lock().insert(
            vmaddr.segment_index(),
            HostSegment {
                origin: vmaddr.segment_align(),
                large: true,
                writable,
            },
        );
    }

    pub fn set_segment_writable(&self, vmaddr: HostAddr, writable: bool) {
        let mut segments = self.segments.lock();
        let seg = segments
            .get_mut(&vmaddr.segment_index())
            .expect("segment not registered");
        seg.writable = writable;
    }

    pub fn remove_leaf(&self, vmaddr: HostAddr) {
        self.leaves.lock().remove(&vmaddr.page_index());
    }

    pub fn set_leaf_dirty(&self, vmaddr: HostAddr) {
        self.leaves
            .lock()
            .get_mut(&vmaddr.page_index())
            .expect("leaf not registered")
            .dirty = true;
    }

    pub fn leaf(&self, vmaddr: HostAddr) -> Option<MockPte> {
        self.leaves.lock().get(&vmaddr.page_index()).copied()
    }

    pub fn fixup_count(&self) -> usize {
        self.fixups.load(Ordering::Relaxed)
    }

    pub fn resched_count(&self) -> usize {
        self.rescheds.load(Ordering::Relaxed)
    }

    pub fn set_fail_fixup(&self, fail: bool) {
        self.fail_fixup.store(fail, Ordering::Relaxed);
    }

    /// Make `fixup_fault` report that it had to drop the caller's lock.
    pub fn set_unlocked_fixup(&self, unlocked: bool) {
        self.unlocked_fixup.store(unlocked, Ordering::Relaxed);
    }
}

struct MockLeafGuard<'a> {
    map: LockGuard<'a, BTreeMap<u64, MockPte>>,
    key: u64,
}

impl MockLeafGuard<'_> {
    fn pte(&mut self) -> &mut MockPte {
        self.map.get_mut(&self.key).unwrap()
    }
}

impl HostLeaf for MockLeafGuard<'_> {
    fn get(&self) -> HostPteView {
        let pte = self.map.get(&self.key).unwrap();
        HostPteView {
            frame: pte.frame,
            present: pte.present,
            writable: pte.writable,
        }
    }

    fn force_prot(&mut self, prot: Prot, bits: NotifyBits) -> Result<(), GmapError> {
        let pte = self.pte();
        if !pte.present {
            return Err(GmapError::Retry);
        }
        match prot {
            Prot::None => pte.present = false,
            Prot::Read => pte.writable = false,
            Prot::Write => (),
        }
        pte.notify |= bits;
        Ok(())
    }

    fn set_notify(&mut self, bits: NotifyBits) {
        self.pte().notify |= bits;
    }

    fn test_and_clear_dirty(&mut self) -> bool {
        let pte = self.pte();
        let dirty = pte.dirty;
        pte.dirty = false;
        dirty
    }
}

impl HostMm for MockHost {
    fn segment(&self, vmaddr: HostAddr) -> Option<HostSegment> {
        self.segments.lock().get(&vmaddr.segment_index()).copied()
    }

    fn lock_leaf(&self, vmaddr: HostAddr) -> Option<Box<dyn HostLeaf + '_>> {
        let map = self.leaves.lock();
        let key = vmaddr.page_index();
        if !map.contains_key(&key) {
            return None;
        }
        Some(Box::new(MockLeafGuard { map, key }))
    }

    fn fixup_fault(&self, vmaddr: HostAddr, access: Prot) -> Result<Fixup, GmapError> {
        if self.fail_fixup.load(Ordering::Relaxed) {
            return Err(GmapError::Fault);
        }
        self.fixups.fetch_add(1, Ordering::Relaxed);
        let mut leaves = self.leaves.lock();
        let pte = leaves.entry(vmaddr.page_index()).or_insert(MockPte {
            frame: vmaddr.page_align().bits(),
            present: false,
            writable: false,
            notify: NotifyBits::empty(),
            dirty: false,
        });
        pte.present = true;
        if access == Prot::Write {
            pte.writable = true;
        }
        if self.unlocked_fixup.load(Ordering::Relaxed) {
            return Ok(Fixup::Unlocked);
        }
        Ok(Fixup::Resolved)
    }

    fn resched(&self) {
        self.rescheds.fetch_add(1, Ordering::Relaxed);
    }
}

/// Flush primitive that records every invalidation in program order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TlbEvent {
    Space(Asce),
    Entry {
        kind: TableKind,
        addr: GuestAddr,
        scope: FlushScope,
    },
    Page {
        addr: GuestAddr,
        scope: FlushScope,
    },
}

pub struct RecordingTlb {
    events: SpinLock<Vec<TlbEvent>>,
}

impl RecordingTlb {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            events: SpinLock::new(Vec::new()),
        })
    }

    pub fn events(&self) -> Vec<TlbEvent> {
        self.events.lock().clone()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }

    pub fn space_flushes(&self) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| matches!(e, TlbEvent::Space(_)))
            .count()
    }

    /// Whether a recorded entry-granular flush covers `addr`.
    pub fn entry_flushed(&self, addr: GuestAddr) -> bool {
        self.events.lock().iter().any(|e| match e {
            TlbEvent::Entry { kind, addr: start, .. } => {
                addr.bits() >= start.bits() && addr.bits() < start.bits() + kind.entry_span()
            }
            _ => false,
        })
    }
}

impl TlbFlush for RecordingTlb {
    fn flush_space(&self, asce: Asce) {
        self.events.lock().push(TlbEvent::Space(asce));
    }

    fn flush_entry(&self, _asce: Asce, kind: TableKind, addr: GuestAddr, scope: FlushScope) {
        self.events.lock().push(TlbEvent::Entry { kind, addr, scope });
    }

    fn flush_page(&self, addr: GuestAddr, scope: FlushScope) {
        self.events.lock().push(TlbEvent::Page { addr, scope });
    }
}

/// Notifier recording every invalidated range.
pub struct RecordingNotifier {
    events: SpinLock<Vec<(u64, u64)>>,
}

impl RecordingNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            events: SpinLock::new(Vec::new()),
        })
    }

    pub fn events(&self) -> Vec<(u64, u64)> {
        self.events.lock().clone()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl GmapNotifier for RecordingNotifier {
    fn invalidated(&self, _gmap: &Gmap, start: GuestAddr, end: GuestAddr) {
        self.events.lock().push((start.bits(), end.bits()));
    }
}

/// Context with large pages enabled and no artificial limits.
pub fn test_ctx() -> (Arc<MmContext>, Arc<MockHost>, Arc<RecordingTlb>) {
    test_ctx_with(MmConfig {
        allow_large_pages: true,
        ..Default::default()
    })
}

pub fn test_ctx_with(config: MmConfig) -> (Arc<MmContext>, Arc<MockHost>, Arc<RecordingTlb>) {
    let host = MockHost::new();
    let tlb = RecordingTlb::new();
    let mm = MmContext::new(host.clone(), tlb.clone(), config);
    (mm, host, tlb)
}
