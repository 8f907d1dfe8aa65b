// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024-2025 SUSE LLC
//
// Author: Joerg Roedel <jroedel@suse.de>

use crate::address::HostAddr;
use crate::error::GmapError;
use crate::types::{NotifyBits, Prot};
use alloc::boxed::Box;

/// Outcome of a host-side fault fixup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Fixup {
    /// The mapping was resolved in place; the caller may reconnect and
    /// retry immediately.
    Resolved,
    /// The host had to drop its address-space lock while resolving the
    /// fault. The caller must re-validate its state before retrying.
    Unlocked,
}

/// View of one large-page-sized host mapping, as needed to connect a guest
/// segment to it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HostSegment {
    pub origin: HostAddr,
    /// Backed by a single large mapping instead of a leaf table.
    pub large: bool,
    pub writable: bool,
}

/// Snapshot of one 4k host translation entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HostPteView {
    pub frame: u64,
    pub present: bool,
    pub writable: bool,
}

/// Scoped lock handle over a single 4k host translation entry, returned by
/// [`HostMm::lock_leaf`]. The entry stays locked until the handle is
/// dropped.
pub trait HostLeaf {
    fn get(&self) -> HostPteView;

    /// Force the entry to at most `prot` access and record the given
    /// notification bits. Fails with [`GmapError::Retry`] when the entry is
    /// not present or the host's own protection forbids the change; the
    /// caller resolves that through [`HostMm::fixup_fault`].
    fn force_prot(&mut self, prot: Prot, bits: NotifyBits) -> Result<(), GmapError>;

    /// Record notification bits without changing access rights.
    fn set_notify(&mut self, bits: NotifyBits);

    /// Test and clear the host dirty state of the entry.
    fn test_and_clear_dirty(&mut self) -> bool;
}

/// The host virtual-memory collaborator. Everything this engine knows about
/// the parent process address space goes through this trait; implementations
/// may sleep in [`HostMm::fixup_fault`] but in nothing else.
pub trait HostMm: Send + Sync {
    /// Look up the host mapping covering the segment of `vmaddr`, if any.
    fn segment(&self, vmaddr: HostAddr) -> Option<HostSegment>;

    /// Lock the 4k host translation entry covering `vmaddr`. Returns `None`
    /// when the host has no leaf table there yet; the caller fixes up and
    /// retries.
    fn lock_leaf(&self, vmaddr: HostAddr) -> Option<Box<dyn HostLeaf + '_>>;

    /// Fault in the host mapping for `vmaddr` with the given access.
    fn fixup_fault(&self, vmaddr: HostAddr, access: Prot) -> Result<Fixup, GmapError>;

    /// Voluntary preemption point used by bulk teardown loops.
    fn resched(&self) {}
}
