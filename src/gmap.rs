// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024-2025 SUSE LLC
//
// Author: Joerg Roedel <jroedel@suse.de>

use crate::address::{Address, GuestAddr, HostAddr};
use crate::arena::{Asce, TableArena, TableHandle, TablePage};
use crate::entry::{
    CrstEntry, EntrySnapshot, LinkState, PageEntry, SegFlags, SegmentLeaf, TableLink,
};
use crate::error::GmapError;
use crate::host::{Fixup, HostLeaf};
use crate::locking::SpinLock;
use crate::mm::MmContext;
use crate::shadow::{Rmap, ShadowRoot};
use crate::types::{
    FlushScope, NotifyBits, Prot, TableKind, PAGE_SHIFT, PAGE_SIZE, PTES_PER_TABLE, SEGMENT_SIZE,
};
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

/// State of one guest address space guarded by its table lock: the table
/// tree, both index maps and, for shadows, the reverse-mapping multimap and
/// the removed flag.
pub(crate) struct GmapInner {
    pub(crate) arena: TableArena,
    pub(crate) asce: Asce,
    pub(crate) removed: bool,
    /// guest segment index -> host address, filled by map_segment().
    pub(crate) guest_to_host: BTreeMap<u64, HostAddr>,
    /// host segment index -> guest segment address, filled by link().
    pub(crate) host_to_guest: BTreeMap<u64, GuestAddr>,
    /// host page index -> shadow entries depending on that page.
    pub(crate) host_to_rmap: BTreeMap<u64, Vec<Rmap>>,
}

impl GmapInner {
    /// Walk the table tree to the entry covering `gaddr` at `level`.
    ///
    /// Level 0 addresses a leaf page-table entry (the returned flag is true
    /// in that case), level 1 a segment entry, levels 2 to 4 the region
    /// entries. Returns `None` when the requested level exceeds the
    /// configured depth, the address is outside the representable range,
    /// any intermediate link is missing or still pending, or the space has
    /// already been torn down. Never allocates.
    pub(crate) fn walk_slot(
        &self,
        gaddr: GuestAddr,
        level: u8,
    ) -> Option<(TableHandle, usize, bool)> {
        if self.removed {
            return None;
        }
        let root_kind = self.asce.kind;
        if level > root_kind.level() {
            log::warn!(
                "table walk at level {} beyond address space depth {}",
                level,
                root_kind.level()
            );
            return None;
        }
        if root_kind != TableKind::Region1 && gaddr.bits() >= root_kind.max_addr() {
            return None;
        }

        let mut table = self.asce.root;
        let mut kind = root_kind;
        loop {
            let idx = kind.index(gaddr.bits());
            if kind.level() == level {
                return Some((table, idx, false));
            }
            let CrstEntry::Table(link) = self.crst(table)[idx] else {
                return None;
            };
            if !link.is_established() {
                return None;
            }
            match kind.child() {
                Some(next) => {
                    table = link.table;
                    kind = next;
                }
                None => {
                    // Segment entries link leaf page tables.
                    let pidx =
                        ((gaddr.bits() >> PAGE_SHIFT) & (PTES_PER_TABLE as u64 - 1)) as usize;
                    return Some((link.table, pidx, true));
                }
            }
        }
    }

    pub(crate) fn crst(&self, table: TableHandle) -> &[CrstEntry; crate::types::CRST_ENTRIES] {
        self.arena.get(table).as_crst()
    }

    pub(crate) fn set_crst(&mut self, table: TableHandle, idx: usize, entry: CrstEntry) {
        self.arena.get_mut(table).as_crst_mut()[idx] = entry;
    }

    pub(crate) fn leaf(&self, table: TableHandle, idx: usize) -> PageEntry {
        self.arena.get(table).as_leaf()[idx]
    }

    pub(crate) fn set_leaf(&mut self, table: TableHandle, idx: usize, entry: PageEntry) {
        self.arena.get_mut(table).as_leaf_mut()[idx] = entry;
    }
}

/// One guest address space: a primary space mapping guest segments into the
/// host, or a shadow space mirroring a guest's own nested tables.
pub struct Gmap {
    pub(crate) mm: Arc<MmContext>,
    asce: Asce,
    limit: u64,
    parent: Option<Arc<Gmap>>,
    pub(crate) source: Option<ShadowRoot>,
    pub(crate) edat_level: u8,
    pub(crate) inner: SpinLock<GmapInner>,
    /// Shadow children of this space. Taken before any child's table lock.
    pub(crate) children: SpinLock<Vec<Arc<Gmap>>>,
}

impl Gmap {
    /// Create a primary guest address space able to map addresses up to
    /// `limit` and attach it to the host context.
    pub fn create(mm: &Arc<MmContext>, limit: u64) -> Result<Arc<Self>, GmapError> {
        let gmap = Self::alloc(mm, limit, None, None, 0)?;
        mm.attach(&gmap);
        Ok(gmap)
    }

    pub(crate) fn alloc(
        mm: &Arc<MmContext>,
        limit: u64,
        parent: Option<Arc<Gmap>>,
        source: Option<ShadowRoot>,
        edat_level: u8,
    ) -> Result<Arc<Self>, GmapError> {
        let (kind, end) = TableKind::for_limit(limit);
        let mut arena = TableArena::new(mm.config.table_limit);
        let root = arena.adopt(TablePage::new_crst())?;
        let asce = Asce { root, kind };
        Ok(Arc::new(Self {
            mm: mm.clone(),
            asce,
            limit: end,
            parent,
            source,
            edat_level,
            inner: SpinLock::new(GmapInner {
                arena,
                asce,
                removed: false,
                guest_to_host: BTreeMap::new(),
                host_to_guest: BTreeMap::new(),
                host_to_rmap: BTreeMap::new(),
            }),
            children: SpinLock::new(Vec::new()),
        }))
    }

    /// Detach this address space: drop all shadow children and remove it
    /// from the host context. The space itself is freed once the last
    /// reference goes away.
    pub fn remove(self: Arc<Self>) {
        self.children.lock().clear();
        self.mm.detach(&self);
    }

    pub fn asce(&self) -> Asce {
        self.asce
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn is_shadow(&self) -> bool {
        self.parent.is_some()
    }

    pub fn parent(&self) -> Option<&Arc<Gmap>> {
        self.parent.as_ref()
    }

    pub fn edat_level(&self) -> u8 {
        self.edat_level
    }

    /// Number of live table pages, for teardown accounting.
    pub fn live_tables(&self) -> usize {
        self.inner.lock().arena.live()
    }

    /// Read-only snapshot of the table entry covering `gaddr` at `level`.
    /// Walk semantics match [`GmapInner::walk_slot`].
    pub fn probe(&self, gaddr: GuestAddr, level: u8) -> Option<EntrySnapshot> {
        let inner = self.inner.lock();
        let (table, idx, is_leaf) = inner.walk_slot(gaddr, level)?;
        Some(if is_leaf {
            EntrySnapshot::Page(inner.leaf(table, idx))
        } else {
            EntrySnapshot::Crst(inner.crst(table)[idx])
        })
    }

    /// Translate a guest address through the forward index.
    pub fn translate(&self, gaddr: GuestAddr) -> Result<HostAddr, GmapError> {
        // Note: the forward index is empty for a shadow.
        let inner = self.inner.lock();
        inner
            .guest_to_host
            .get(&gaddr.segment_index())
            .map(|host| *host + gaddr.segment_offset())
            .ok_or(GmapError::Fault)
    }

    /// Resolve a host-side fault for `gaddr`/`vmaddr` and reconnect the
    /// segment. When the host reports that it dropped its own lock the
    /// reconnect is skipped and the caller has to re-validate before
    /// retrying.
    pub fn fixup(&self, gaddr: GuestAddr, vmaddr: HostAddr, access: Prot) -> Result<(), GmapError> {
        assert!(!self.is_shadow());
        match self.mm.host.fixup_fault(vmaddr, access)? {
            Fixup::Unlocked => Ok(()),
            Fixup::Resolved => self.link(gaddr, vmaddr),
        }
    }

    /// Grow the table tree so that the entry at `slot_level` for `gaddr` is
    /// an established link. The table page is allocated outside the lock
    /// and installed only if the slot is still empty; a racing winner makes
    /// the spare allocation go away.
    fn ensure_table(&self, gaddr: GuestAddr, slot_level: u8) -> Result<(), GmapError> {
        loop {
            {
                let inner = self.inner.lock();
                let (table, idx, _) = inner
                    .walk_slot(gaddr, slot_level)
                    .ok_or(GmapError::Fault)?;
                match inner.crst(table)[idx] {
                    CrstEntry::Table(link) if link.is_established() => return Ok(()),
                    CrstEntry::Empty => (),
                    _ => panic!("unexpected entry while growing the table tree"),
                }
            }
            let page = TablePage::new_crst();
            let mut inner = self.inner.lock();
            let (table, idx, _) = inner
                .walk_slot(gaddr, slot_level)
                .ok_or(GmapError::Fault)?;
            if inner.crst(table)[idx].is_empty() {
                let child = inner.arena.adopt(page)?;
                inner.set_crst(
                    table,
                    idx,
                    CrstEntry::Table(TableLink {
                        table: child,
                        state: LinkState::Established,
                        protect: false,
                        fake: false,
                    }),
                );
                return Ok(());
            }
        }
    }

    /// Connect a guest segment to the host segment backing `vmaddr`,
    /// growing intermediate table levels as needed.
    ///
    /// An empty segment entry gets the host segment's access bits copied in
    /// and the reverse-index record inserted. An entry that is read-only
    /// while the host mapping meanwhile became writable is write-enabled
    /// again and marked dirty. Fails with `Conflict` if the host segment is
    /// already bound to a different guest segment, or if it is a large
    /// mapping and large pages are disabled.
    pub fn link(&self, gaddr: GuestAddr, vmaddr: HostAddr) -> Result<(), GmapError> {
        assert!(!self.is_shadow());
        if gaddr.bits() > self.limit {
            return Err(GmapError::Invalid);
        }
        let root_level = self.asce.kind.level();
        for slot_level in (2..=root_level).rev() {
            self.ensure_table(gaddr, slot_level)?;
        }

        let seg = self.mm.host.segment(vmaddr).ok_or(GmapError::Fault)?;
        if seg.large && !self.mm.config.allow_large_pages {
            return Err(GmapError::Conflict);
        }

        let mut inner = self.inner.lock();
        let (table, idx, _) = inner.walk_slot(gaddr, 1).ok_or(GmapError::Fault)?;
        match inner.crst(table)[idx] {
            CrstEntry::Empty => {
                let key = vmaddr.segment_index();
                if inner.host_to_guest.contains_key(&key) {
                    return Err(GmapError::Conflict);
                }
                inner.host_to_guest.insert(key, gaddr.segment_align());
                let mut flags = SegFlags::empty();
                if seg.large {
                    flags |= SegFlags::LARGE | SegFlags::DIRTY;
                }
                if !seg.writable {
                    flags |= SegFlags::PROTECT;
                }
                inner.set_crst(
                    table,
                    idx,
                    CrstEntry::Segment(SegmentLeaf {
                        host: seg.origin,
                        flags,
                    }),
                );
            }
            CrstEntry::Segment(leaf)
                if leaf.flags.contains(SegFlags::PROTECT) && seg.writable =>
            {
                // Copy-on-write got resolved upstream, propagate it down.
                let mut new = leaf;
                new.flags.remove(SegFlags::PROTECT);
                new.flags.insert(SegFlags::DIRTY);
                self.segment_exchange(&mut inner, gaddr, table, idx, new);
            }
            _ => (),
        }
        Ok(())
    }

    /// Replace a live segment entry: consume its notify bit, run the
    /// invalidation callbacks, flush the old translation and only then
    /// install the replacement.
    fn segment_exchange(
        &self,
        inner: &mut GmapInner,
        gaddr: GuestAddr,
        table: TableHandle,
        idx: usize,
        mut new: SegmentLeaf,
    ) {
        let gaddr = gaddr.segment_align();
        if let CrstEntry::Segment(mut old) = inner.crst(table)[idx] {
            old.flags.remove(SegFlags::NOTIFY);
            inner.set_crst(table, idx, CrstEntry::Segment(old));
        }
        self.mm
            .call_notifiers(self, gaddr, gaddr + (SEGMENT_SIZE - 1));
        new.flags.remove(SegFlags::NOTIFY);
        self.mm
            .tlb
            .flush_entry(self.asce, TableKind::Segment, gaddr, FlushScope::Global);
        inner.set_crst(table, idx, CrstEntry::Segment(new));
    }

    /// Disconnect the guest segment backed by `vmaddr`. Removes the
    /// reverse-index record and clears the segment entry, returning whether
    /// a translation flush is required.
    pub(crate) fn unlink_by_host(&self, vmaddr: HostAddr) -> bool {
        assert!(!self.is_shadow());
        let mut inner = self.inner.lock();
        let Some(gaddr) = inner.host_to_guest.remove(&vmaddr.segment_index()) else {
            return false;
        };
        let Some((table, idx, _)) = inner.walk_slot(gaddr, 1) else {
            return false;
        };
        match inner.crst(table)[idx] {
            CrstEntry::Empty => false,
            CrstEntry::Segment(_) => {
                inner.set_crst(table, idx, CrstEntry::Empty);
                true
            }
            CrstEntry::Table(_) => {
                panic!("table link at segment level of a primary address space")
            }
        }
    }

    /// Remove the forward-index record for `gaddr` and disconnect the
    /// segment it pointed to. Returns whether a flush is required.
    fn unmap_by_guest(&self, gaddr: GuestAddr) -> bool {
        let vmaddr = {
            let mut inner = self.inner.lock();
            inner.guest_to_host.remove(&gaddr.segment_index())
        };
        match vmaddr {
            Some(vmaddr) => self.unlink_by_host(vmaddr),
            None => false,
        }
    }

    /// Drop the host-side connection of the segment backing `vmaddr` after
    /// the host invalidated it, running the invalidation callbacks and
    /// optionally flushing the stale entry.
    pub(crate) fn zap_host_segment(&self, vmaddr: HostAddr, flush: Option<FlushScope>) {
        let mut inner = self.inner.lock();
        let Some(gaddr) = inner.host_to_guest.remove(&vmaddr.segment_index()) else {
            return;
        };
        let Some((table, idx, _)) = inner.walk_slot(gaddr, 1) else {
            return;
        };
        if let CrstEntry::Segment(mut leaf) = inner.crst(table)[idx] {
            leaf.flags.remove(SegFlags::NOTIFY);
            inner.set_crst(table, idx, CrstEntry::Segment(leaf));
            let gaddr = gaddr.segment_align();
            self.mm
                .call_notifiers(self, gaddr, gaddr + (SEGMENT_SIZE - 1));
            if let Some(scope) = flush {
                self.mm
                    .tlb
                    .flush_entry(self.asce, TableKind::Segment, gaddr, scope);
            }
            inner.set_crst(table, idx, CrstEntry::Empty);
        }
    }

    pub(crate) fn host_to_guest_lookup(&self, vmaddr: HostAddr) -> Option<GuestAddr> {
        self.inner
            .lock()
            .host_to_guest
            .get(&vmaddr.segment_index())
            .copied()
    }

    /// Map a range of guest segments 1:1 onto a range of host segments by
    /// populating the forward index. The actual table entries are connected
    /// lazily through [`Gmap::link`]. On failure everything mapped so far
    /// is unmapped again.
    pub fn map_segment(&self, from: HostAddr, to: GuestAddr, len: u64) -> Result<(), GmapError> {
        assert!(!self.is_shadow());
        if (from.bits() | to.bits() | len) & (SEGMENT_SIZE - 1) != 0 {
            return Err(GmapError::Invalid);
        }
        if len == 0
            || from.checked_add(len).is_none()
            || to.checked_add(len).is_none()
            || to.bits() + len - 1 > self.limit
        {
            return Err(GmapError::Invalid);
        }

        let mut flush = false;
        let mut failed = false;
        let mut off = 0;
        while off < len {
            // Remove any old translation first.
            flush |= self.unmap_by_guest(to + off);
            let mut inner = self.inner.lock();
            if inner.guest_to_host.len() >= self.mm.config.index_limit {
                failed = true;
                break;
            }
            inner
                .guest_to_host
                .insert((to + off).segment_index(), from + off);
            drop(inner);
            off += SEGMENT_SIZE;
        }
        if flush {
            self.mm.tlb.flush_space(self.asce);
        }
        if failed {
            self.unmap_segment(to, len)?;
            return Err(GmapError::OutOfMemory);
        }
        Ok(())
    }

    /// Unmap a range of guest segments, dropping both index records and
    /// clearing the connected entries.
    pub fn unmap_segment(&self, to: GuestAddr, len: u64) -> Result<(), GmapError> {
        assert!(!self.is_shadow());
        if (to.bits() | len) & (SEGMENT_SIZE - 1) != 0 {
            return Err(GmapError::Invalid);
        }
        if len == 0 || to.checked_add(len).is_none() {
            return Err(GmapError::Invalid);
        }

        let mut flush = false;
        let mut off = 0;
        while off < len {
            flush |= self.unmap_by_guest(to + off);
            off += SEGMENT_SIZE;
        }
        if flush {
            self.mm.tlb.flush_space(self.asce);
        }
        Ok(())
    }

    /// Change the access rights of the leaf mapping covering `gaddr` and
    /// record notification requests.
    ///
    /// Returns the number of bytes covered by the reprotected entry.
    /// `Retry` means the mapping is missing or the host state first needs a
    /// fixup; requesting the shadow cascade on a large mapping is
    /// `Invalid` because large entries have to be split first.
    pub fn protect_one(
        &self,
        gaddr: GuestAddr,
        prot: Prot,
        bits: NotifyBits,
    ) -> Result<u64, GmapError> {
        assert!(!self.is_shadow());
        let mut inner = self.inner.lock();
        let Some((table, idx, _)) = inner.walk_slot(gaddr, 1) else {
            return Err(GmapError::Retry);
        };
        match inner.crst(table)[idx] {
            CrstEntry::Segment(leaf) if leaf.flags.contains(SegFlags::LARGE) => {
                self.protect_segment(&mut inner, gaddr, table, idx, prot, bits)?;
                Ok(SEGMENT_SIZE)
            }
            CrstEntry::Segment(leaf) => {
                if leaf.flags.contains(SegFlags::INVALID) {
                    return Err(GmapError::Retry);
                }
                drop(inner);
                self.protect_pte(gaddr, prot, bits)?;
                Ok(PAGE_SIZE)
            }
            CrstEntry::Empty => Err(GmapError::Retry),
            CrstEntry::Table(_) => {
                panic!("table link at segment level of a primary address space")
            }
        }
    }

    /// Protection state machine for a large segment entry. Expects the
    /// table lock to be held.
    fn protect_segment(
        &self,
        inner: &mut GmapInner,
        gaddr: GuestAddr,
        table: TableHandle,
        idx: usize,
        prot: Prot,
        bits: NotifyBits,
    ) -> Result<(), GmapError> {
        let CrstEntry::Segment(leaf) = inner.crst(table)[idx] else {
            return Err(GmapError::Retry);
        };
        let invalid = leaf.flags.contains(SegFlags::INVALID);
        let protected = leaf.flags.contains(SegFlags::PROTECT);

        // Fixup needed
        if (invalid && prot != Prot::None) || (protected && prot == Prot::Write) {
            return Err(GmapError::Retry);
        }

        if prot == Prot::None && !invalid {
            let mut new = leaf;
            new.flags.insert(SegFlags::INVALID);
            self.segment_exchange(inner, gaddr, table, idx, new);
        }
        if prot == Prot::Read && !protected {
            let mut new = leaf;
            new.flags.remove(SegFlags::INVALID);
            new.flags.insert(SegFlags::PROTECT);
            self.segment_exchange(inner, gaddr, table, idx, new);
        }
        if bits.contains(NotifyBits::MPROT) {
            if let CrstEntry::Segment(mut cur) = inner.crst(table)[idx] {
                cur.flags.insert(SegFlags::NOTIFY);
                inner.set_crst(table, idx, CrstEntry::Segment(cur));
            }
        }
        // The shadow cascade works on 4k granules; callers must split
        // large mappings first.
        if bits.contains(NotifyBits::SHADOW) {
            return Err(GmapError::Invalid);
        }
        Ok(())
    }

    /// Walk to the segment entry covering `gaddr` and lock the 4k host
    /// translation entry behind it. This is how every pte-level operation
    /// starts: `Retry` means the segment is not connected yet (or the host
    /// has no leaf table there) and the caller has to fix up and retry.
    pub(crate) fn pte_op(
        &self,
        gaddr: GuestAddr,
    ) -> Result<(HostAddr, Box<dyn HostLeaf + '_>), GmapError> {
        let vmaddr = {
            let inner = self.inner.lock();
            let Some((table, idx, _)) = inner.walk_slot(gaddr, 1) else {
                return Err(GmapError::Retry);
            };
            match inner.crst(table)[idx] {
                CrstEntry::Segment(leaf)
                    if !leaf
                        .flags
                        .intersects(SegFlags::INVALID | SegFlags::LARGE) =>
                {
                    leaf.host + gaddr.segment_offset()
                }
                _ => return Err(GmapError::Retry),
            }
        };
        let leaf = self
            .mm
            .host
            .lock_leaf(vmaddr.page_align())
            .ok_or(GmapError::Retry)?;
        Ok((vmaddr, leaf))
    }

    /// Protect a 4k-backed segment through the host's per-leaf lock.
    fn protect_pte(
        &self,
        gaddr: GuestAddr,
        prot: Prot,
        bits: NotifyBits,
    ) -> Result<(), GmapError> {
        let (_, mut leaf) = self.pte_op(gaddr)?;
        leaf.force_prot(prot, bits)
    }

    /// Protect a guest range, resolving host-side faults as they come up.
    pub fn protect_range(
        &self,
        start: GuestAddr,
        len: u64,
        prot: Prot,
        bits: NotifyBits,
    ) -> Result<(), GmapError> {
        assert!(!self.is_shadow());
        let end = start.bits() + len;
        let mut addr = start;
        while addr.bits() < end {
            match self.protect_one(addr, prot, bits) {
                Ok(n) => addr = GuestAddr::new((addr.bits() & !(n - 1)) + n),
                Err(GmapError::Retry) => {
                    let vmaddr = self.translate(addr)?;
                    self.fixup(addr, vmaddr, prot)?;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Collect and reset the dirty state of the segment covering `gaddr`
    /// into `bitmap`, one bit per 4k page. `vmaddr` is the host segment
    /// backing it.
    pub fn sync_dirty_log(&self, gaddr: GuestAddr, vmaddr: HostAddr, bitmap: &mut [u64; 4]) {
        let mut inner = self.inner.lock();
        let Some((table, idx, _)) = inner.walk_slot(gaddr, 1) else {
            return;
        };
        match inner.crst(table)[idx] {
            CrstEntry::Segment(leaf) if leaf.flags.contains(SegFlags::LARGE) => {
                if self.test_and_clear_dirty_segment(&mut inner, gaddr, table, idx) {
                    bitmap.fill(u64::MAX);
                }
            }
            CrstEntry::Segment(_) => {
                drop(inner);
                let base = vmaddr.segment_align();
                for i in 0..PTES_PER_TABLE {
                    let page = base + (i as u64) * PAGE_SIZE;
                    let Some(mut leaf) = self.mm.host.lock_leaf(page) else {
                        continue;
                    };
                    if leaf.test_and_clear_dirty() {
                        bitmap[i / 64] |= 1 << (i % 64);
                    }
                }
            }
            _ => (),
        }
    }

    /// Test and reset the dirty state of a large segment entry. A
    /// protected entry that was not written since it was protected is
    /// clean.
    fn test_and_clear_dirty_segment(
        &self,
        inner: &mut GmapInner,
        gaddr: GuestAddr,
        table: TableHandle,
        idx: usize,
    ) -> bool {
        let CrstEntry::Segment(mut leaf) = inner.crst(table)[idx] else {
            return false;
        };
        if leaf.flags.contains(SegFlags::INVALID) {
            return false;
        }
        if leaf.flags.contains(SegFlags::PROTECT) && !leaf.flags.contains(SegFlags::DIRTY) {
            return false;
        }
        leaf.flags.remove(SegFlags::DIRTY);
        inner.set_crst(table, idx, CrstEntry::Segment(leaf));
        let _ = self.protect_segment(inner, gaddr, table, idx, Prot::Read, NotifyBits::empty());
        true
    }

    #[cfg(test)]
    pub(crate) fn children_count(&self) -> usize {
        self.children.lock().len()
    }
}

impl Drop for Gmap {
    fn drop(&mut self) {
        // Flush the stale translations of this space unless that already
        // happened when the shadow was torn down. Table pages, index maps
        // and rmap chains are owned by the inner state and freed with it.
        let removed = self.inner.lock().removed;
        if !(self.is_shadow() && removed) {
            self.mm.tlb.flush_space(self.asce);
        }
    }
}
