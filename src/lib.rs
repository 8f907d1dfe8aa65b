// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024-2025 SUSE LLC
//
// Author: Joerg Roedel <jroedel@suse.de>

#![no_std]

extern crate alloc;

pub mod address;
pub mod arena;
pub mod entry;
pub mod error;
pub mod gmap;
pub mod host;
pub mod locking;
pub mod mm;
pub mod notify;
pub mod shadow;
pub mod tlb;
pub mod types;

// Shared mock collaborators for unit tests.
#[cfg(test)]
pub mod testutils;
