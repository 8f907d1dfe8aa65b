// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024-2025 SUSE LLC
//
// Author: Carlos López <carlos.lopez@suse.com>

// Every public operation of this crate reports failure through GmapError.
// The variants encode how the caller is expected to react: OutOfMemory and
// Retry are recoverable, Fault needs a host-side fixup before retrying, and
// Invalid/Conflict indicate a request that must not be retried.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GmapError {
    /// A table or metadata allocation failed. No partial mutation is left
    /// behind; the caller may retry after reclaiming memory.
    OutOfMemory,
    /// A required translation in the parent address space is missing. The
    /// caller has to resolve the host-side fault and retry.
    Fault,
    /// A benign race with a concurrent operation, or host-side state that
    /// needs a fixup. Retried by the immediate caller.
    Retry,
    /// Structurally invalid request (bad alignment, address outside the
    /// configured range, unsupported notification bits).
    Invalid,
    /// The host granule is already bound to a different guest segment, or a
    /// large host mapping cannot be used here.
    Conflict,
}
