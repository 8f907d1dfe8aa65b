// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024-2025 SUSE LLC
//
// Author: Joerg Roedel <jroedel@suse.de>

use crate::address::{Address, GuestAddr, HostAddr};
use crate::arena::{TableHandle, TablePage};
use crate::entry::{CrstEntry, LinkState, PageEntry, TableLink};
use crate::error::GmapError;
use crate::gmap::{Gmap, GmapInner};
use crate::types::{
    FlushScope, NotifyBits, Prot, TableKind, CRST_TABLE_SIZE, PAGE_SIZE,
};
use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

/// Descriptor of the guest's own top-level table, in parent address space
/// terms. Two shadows are interchangeable iff their descriptors and
/// protection levels match.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ShadowRoot {
    /// Guest address of the nested root table.
    pub origin: GuestAddr,
    pub kind: TableKind,
    /// Identity-style root covering guest real storage; there is no table
    /// to protect.
    pub real_space: bool,
}

/// Which level of the guest's nested tables is being shadowed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShadowLevel {
    Region2Table,
    Region3Table,
    SegmentTable,
    PageTable,
}

impl ShadowLevel {
    /// Walk level of the slot the shadow table gets installed into: a
    /// region-2 table hangs off a region-1 entry and so on down to leaf
    /// page tables hanging off segment entries.
    fn slot_level(self) -> u8 {
        match self {
            ShadowLevel::Region2Table => 4,
            ShadowLevel::Region3Table => 3,
            ShadowLevel::SegmentTable => 2,
            ShadowLevel::PageTable => 1,
        }
    }

    fn slot_kind(self) -> TableKind {
        TableKind::from_level(self.slot_level())
    }

    /// Guest address range covered by the shadow table.
    fn covered(self) -> u64 {
        self.slot_kind().entry_span()
    }

    /// Footprint of the source table in guest memory; this is the range
    /// that gets write-protected in the parent.
    fn source_bytes(self) -> u64 {
        match self {
            ShadowLevel::PageTable => PAGE_SIZE,
            _ => CRST_TABLE_SIZE,
        }
    }

    fn dep(self) -> RmapDep {
        match self {
            ShadowLevel::Region2Table => RmapDep::Region1,
            ShadowLevel::Region3Table => RmapDep::Region2,
            ShadowLevel::SegmentTable => RmapDep::Region3,
            ShadowLevel::PageTable => RmapDep::Segment,
        }
    }

    fn new_page(self) -> Box<TablePage> {
        match self {
            ShadowLevel::PageTable => TablePage::new_leaf(),
            _ => TablePage::new_crst(),
        }
    }
}

/// Which shadow entry depends on a protected parent page: the tag names
/// the level of the slot holding the dependent entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RmapDep {
    Region1,
    Region2,
    Region3,
    Segment,
    Page,
}

/// Reverse-mapping record: a shadow entry at `raddr` depends on the
/// content of a write-protected parent page. Owned by the shadow's
/// host-to-rmap multimap, keyed by the parent page.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Rmap {
    pub raddr: GuestAddr,
    pub dep: RmapDep,
}

/// A guest page-table entry as read from the parent address space, input
/// to [`Gmap::shadow_page`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GuestPte {
    /// Guest-physical page the entry maps.
    pub frame: GuestAddr,
    pub protected: bool,
}

impl GmapInner {
    /// Record that the shadow entry in `rmap` depends on the parent page
    /// backing `vmaddr`. Duplicate dependencies collapse into one record.
    pub(crate) fn insert_rmap(&mut self, vmaddr: HostAddr, rmap: Rmap) {
        let chain = self.host_to_rmap.entry(vmaddr.page_index()).or_default();
        if chain.iter().any(|r| *r == rmap) {
            return;
        }
        chain.push(rmap);
    }
}

impl Gmap {
    /// Create (or reuse) a shadow of the guest's nested tables described
    /// by `source`.
    ///
    /// The shadow holds a reference on this space for its whole lifetime
    /// and is entered into the children list. Unless the source is a
    /// real-space root, its table is write-protected so that a guest write
    /// to it tears the whole shadow down again.
    pub fn shadow(
        self: &Arc<Self>,
        source: ShadowRoot,
        edat_level: u8,
    ) -> Result<Arc<Gmap>, GmapError> {
        assert!(!self.is_shadow());
        if let Some(sg) = self.find_shadow(&source, edat_level) {
            return Ok(sg);
        }

        let limit = match source.kind {
            TableKind::Region1 => u64::MAX,
            kind => kind.max_addr() - 1,
        };
        let sg = Gmap::alloc(&self.mm, limit, Some(self.clone()), Some(source), edat_level)?;

        if !source.real_space {
            self.protect_range(
                source.origin,
                CRST_TABLE_SIZE,
                Prot::Read,
                NotifyBits::SHADOW,
            )?;
        }

        let mut children = self.children.lock();
        // Lost a race against a concurrent shadow of the same tables; the
        // freshly built one is dropped again.
        if let Some(existing) = children
            .iter()
            .find(|sg| sg.matches_source(&source, edat_level))
        {
            return Ok(existing.clone());
        }
        children.push(sg.clone());
        Ok(sg)
    }

    fn find_shadow(&self, source: &ShadowRoot, edat_level: u8) -> Option<Arc<Gmap>> {
        self.children
            .lock()
            .iter()
            .find(|sg| sg.matches_source(source, edat_level))
            .cloned()
    }

    /// Check whether this shadow mirrors the given source descriptor at
    /// the given protection level and is still usable.
    pub fn matches_source(&self, source: &ShadowRoot, edat_level: u8) -> bool {
        self.source.as_ref() == Some(source)
            && self.edat_level == edat_level
            && !self.inner.lock().removed
    }

    /// Instantiate one level of the shadow table tree.
    ///
    /// `saddr` is the faulting address in this shadow, `source` the guest
    /// address of the nested table to mirror and `source_protected` its
    /// descriptor's protect bit. A `fake` table stands for a contiguous
    /// guest range instead of a real nested table and becomes usable
    /// immediately; otherwise the source table is write-protected in the
    /// parent first and the new table only exposed once that succeeded.
    ///
    /// Succeeds as well if the level is already shadowed. `Retry` reports
    /// a race with a concurrent shadow or unshadow of the same slot.
    pub fn shadow_table(
        &self,
        saddr: GuestAddr,
        source: GuestAddr,
        source_protected: bool,
        level: ShadowLevel,
        fake: bool,
    ) -> Result<(), GmapError> {
        assert!(self.is_shadow());
        let slot_level = level.slot_level();
        let page = level.new_page();

        let handle;
        {
            let mut inner = self.inner.lock();
            let Some((table, idx, _)) = inner.walk_slot(saddr, slot_level) else {
                return Err(GmapError::Retry); // Race with unshadow
            };
            match inner.crst(table)[idx] {
                CrstEntry::Table(link) if link.is_established() => return Ok(()),
                CrstEntry::Table(_) => return Err(GmapError::Retry), // Race with shadow
                CrstEntry::Segment(_) => panic!("segment mapping in a shadow table tree"),
                CrstEntry::Empty => (),
            }
            handle = inner.arena.adopt(page)?;
            // Region levels only carry the source's protect bit with
            // enhanced translation; page tables always do.
            let protect = source_protected
                && (level == ShadowLevel::PageTable || self.edat_level >= 1);
            let mut link = TableLink {
                table: handle,
                state: LinkState::Pending,
                protect,
                fake,
            };
            if fake {
                // Nothing to protect for fake tables.
                link.establish();
                inner.set_crst(table, idx, CrstEntry::Table(link));
                return Ok(());
            }
            inner.set_crst(table, idx, CrstEntry::Table(link));
        }

        // Make the source table read-only in the parent.
        let raddr = GuestAddr::new(saddr.bits() & !(level.covered() - 1));
        let origin = GuestAddr::new(source.bits() & !(level.source_bytes() - 1));
        let rc = self.protect_rmap(level.dep(), raddr, origin, level.source_bytes());

        let mut inner = self.inner.lock();
        match rc {
            Ok(()) => {
                let slot = inner.walk_slot(saddr, slot_level);
                let verified = slot.and_then(|(table, idx, _)| match inner.crst(table)[idx] {
                    CrstEntry::Table(mut link) if link.table == handle => {
                        link.establish();
                        Some((table, idx, link))
                    }
                    _ => None,
                });
                match verified {
                    Some((table, idx, link)) => {
                        inner.set_crst(table, idx, CrstEntry::Table(link));
                        Ok(())
                    }
                    None => Err(GmapError::Retry), // Race with unshadow
                }
            }
            Err(e) => {
                self.unshadow_table(&mut inner, raddr, level);
                Err(e)
            }
        }
    }

    /// Write-protect `len` bytes of parent memory starting at the guest
    /// address `paddr` and record, per page, that the shadow range at
    /// `raddr` depends on it.
    fn protect_rmap(
        &self,
        dep: RmapDep,
        raddr: GuestAddr,
        paddr: GuestAddr,
        len: u64,
    ) -> Result<(), GmapError> {
        let parent = self.parent().expect("shadow without parent").clone();
        let end = paddr.bits() + len;
        let mut paddr = paddr;
        while paddr.bits() < end {
            let vmaddr = parent.translate(paddr)?;
            let mut protected = false;
            if let Ok((_, mut leaf)) = parent.pte_op(paddr) {
                let mut inner = self.inner.lock();
                if leaf.force_prot(Prot::Read, NotifyBits::SHADOW).is_ok() {
                    inner.insert_rmap(vmaddr, Rmap { raddr, dep });
                    protected = true;
                }
            }
            if protected {
                paddr = paddr + PAGE_SIZE;
            } else {
                parent.fixup(paddr, vmaddr, Prot::Read)?;
            }
        }
        Ok(())
    }

    /// Install a single shadow leaf translation for `saddr` from the guest
    /// page-table entry `pte`, retrying through the fixup collaborator
    /// until the parent-side state is resolved.
    ///
    /// On success the parent's leaf entry is tagged for shadow
    /// notification and a page-level rmap recorded, so that a write to the
    /// guest page table holding `pte` unshadows this translation again.
    pub fn shadow_page(&self, saddr: GuestAddr, pte: GuestPte) -> Result<(), GmapError> {
        assert!(self.is_shadow());
        let parent = self.parent().expect("shadow without parent").clone();
        let prot = if pte.protected { Prot::Read } else { Prot::Write };

        loop {
            let paddr = pte.frame.page_align();
            let vmaddr = parent.translate(paddr)?;
            if let Ok((_, mut sleaf)) = parent.pte_op(paddr) {
                let mut inner = self.inner.lock();
                let Some((table, idx, true)) = inner.walk_slot(saddr, 0) else {
                    // The covering shadow page table is gone, the caller
                    // has to rebuild it first.
                    return Err(GmapError::Retry);
                };
                let host = sleaf.get();
                if host.present && !(prot == Prot::Write && !host.writable) {
                    if inner.leaf(table, idx) == PageEntry::Empty {
                        inner.set_leaf(
                            table,
                            idx,
                            PageEntry::Mapped {
                                frame: host.frame,
                                prot,
                            },
                        );
                        sleaf.set_notify(NotifyBits::SHADOW);
                        inner.insert_rmap(
                            vmaddr,
                            Rmap {
                                raddr: saddr.page_align(),
                                dep: RmapDep::Page,
                            },
                        );
                    }
                    return Ok(());
                }
            }
            parent.fixup(paddr, vmaddr, prot)?;
        }
    }

    /// Remove a single shadow leaf translation.
    pub(crate) fn unshadow_page(&self, inner: &mut GmapInner, raddr: GuestAddr) {
        let Some((table, idx, true)) = inner.walk_slot(raddr, 0) else {
            return;
        };
        if inner.leaf(table, idx) == PageEntry::Empty {
            return;
        }
        self.mm
            .call_notifiers(self, raddr, raddr + (PAGE_SIZE - 1));
        self.mm.tlb.flush_page(raddr, FlushScope::Global);
        inner.set_leaf(table, idx, PageEntry::Empty);
    }

    /// Remove a shadow table and everything below it. The translation for
    /// the whole covered range is flushed before any page is released.
    pub(crate) fn unshadow_table(
        &self,
        inner: &mut GmapInner,
        raddr: GuestAddr,
        level: ShadowLevel,
    ) {
        let Some((table, idx, _)) = inner.walk_slot(raddr, level.slot_level()) else {
            return;
        };
        let CrstEntry::Table(link) = inner.crst(table)[idx] else {
            return;
        };
        self.mm
            .call_notifiers(self, raddr, raddr + (level.covered() - 1));
        self.mm
            .tlb
            .flush_entry(inner.asce, level.slot_kind(), raddr, FlushScope::Global);
        inner.set_crst(table, idx, CrstEntry::Empty);
        self.free_subtree(inner, link.table);
    }

    /// Release a table and all tables reachable from it, depth first. The
    /// caller has already flushed the covering translation.
    fn free_subtree(&self, inner: &mut GmapInner, handle: TableHandle) {
        let children: Vec<TableHandle> = match inner.arena.get(handle) {
            TablePage::Leaf(_) => Vec::new(),
            TablePage::Crst(entries) => entries
                .iter()
                .filter_map(|entry| match entry {
                    CrstEntry::Table(link) => Some(link.table),
                    _ => None,
                })
                .collect(),
        };
        for child in children {
            self.free_subtree(inner, child);
        }
        self.mm.host.resched();
        inner.arena.release(handle);
    }

    /// Tear down the complete shadow table tree. Idempotent; the space
    /// stays allocated (and unusable) until the last reference is dropped.
    pub fn unshadow(&self) {
        let mut inner = self.inner.lock();
        self.unshadow_locked(&mut inner);
    }

    pub(crate) fn unshadow_locked(&self, inner: &mut GmapInner) {
        assert!(self.is_shadow());
        if inner.removed {
            return;
        }
        inner.removed = true;
        log::debug!("tearing down shadow table tree");
        self.mm
            .call_notifiers(self, GuestAddr::null(), GuestAddr::new(u64::MAX));
        self.mm.tlb.flush_space(inner.asce);

        let root = inner.asce.root;
        let links: Vec<(usize, TableHandle)> = inner
            .crst(root)
            .iter()
            .enumerate()
            .filter_map(|(idx, entry)| match entry {
                CrstEntry::Table(link) => Some((idx, link.table)),
                _ => None,
            })
            .collect();
        for (idx, handle) in links {
            inner.set_crst(root, idx, CrstEntry::Empty);
            self.free_subtree(inner, handle);
        }
    }

    /// Cascade a write to the protected parent page backing `vmaddr` into
    /// this shadow. `gaddr` is the guest address of that page in the
    /// parent's space. Returns true when the whole shadow went away and
    /// must be detached from the parent's children list.
    pub(crate) fn shadow_notify(&self, vmaddr: HostAddr, gaddr: GuestAddr) -> bool {
        let mut inner = self.inner.lock();
        if inner.removed {
            return false;
        }
        let source = self.source.expect("shadow without source descriptor");
        if !source.real_space {
            let start = source.origin.bits();
            let end = start + CRST_TABLE_SIZE;
            if gaddr.bits() >= start && gaddr.bits() < end {
                // The complete shadow table has to go.
                self.unshadow_locked(&mut inner);
                return true;
            }
        }
        // Remove the dependent shadow entries of this page only.
        let Some(chain) = inner.host_to_rmap.remove(&vmaddr.page_index()) else {
            return false;
        };
        for rmap in chain {
            match rmap.dep {
                RmapDep::Region1 => {
                    self.unshadow_table(&mut inner, rmap.raddr, ShadowLevel::Region2Table)
                }
                RmapDep::Region2 => {
                    self.unshadow_table(&mut inner, rmap.raddr, ShadowLevel::Region3Table)
                }
                RmapDep::Region3 => {
                    self.unshadow_table(&mut inner, rmap.raddr, ShadowLevel::SegmentTable)
                }
                RmapDep::Segment => {
                    self.unshadow_table(&mut inner, rmap.raddr, ShadowLevel::PageTable)
                }
                RmapDep::Page => self.unshadow_page(&mut inner, rmap.raddr),
            }
        }
        false
    }

    #[cfg(test)]
    pub(crate) fn rmap_count(&self) -> usize {
        self.inner
            .lock()
            .host_to_rmap
            .values()
            .map(Vec::len)
            .sum()
    }

    #[cfg(test)]
    pub(crate) fn is_removed(&self) -> bool {
        self.inner.lock().removed
    }
}
