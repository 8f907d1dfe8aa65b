// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024-2025 SUSE LLC
//
// Author: Joerg Roedel <jroedel@suse.de>

use crate::address::GuestAddr;
use crate::arena::Asce;
use crate::types::{FlushScope, TableKind};

/// Hardware translation-invalidation primitive. Every teardown path in this
/// crate invalidates through this trait before a table page is cleared or
/// released, so an instrumented implementation observes flush-before-reuse
/// ordering directly.
pub trait TlbFlush: Send + Sync {
    /// Flush every translation derived from the given address space root.
    fn flush_space(&self, asce: Asce);

    /// Flush the translations derived from a single region/segment table
    /// entry. `kind` names the level of the table containing the entry,
    /// `addr` selects the entry within it.
    fn flush_entry(&self, asce: Asce, kind: TableKind, addr: GuestAddr, scope: FlushScope);

    /// Flush a single 4k translation.
    fn flush_page(&self, addr: GuestAddr, scope: FlushScope);
}
