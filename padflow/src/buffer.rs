// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Reference-counted media buffers.
//!
//! Buffers live in a [`BufferArena`]. A [`Buffer`] handle owns one reference
//! to a slot; a composite buffer that borrows memory from another buffer pins
//! that buffer's slot with [`Buffer::add_parent`] instead of holding a handle.
//! The pinned slot stays alive until every composite pinning it is finalized.

pub mod arena;
pub mod meta;

pub use arena::{Buffer, BufferArena, BufferId, Memory};
pub use meta::{BufferFlags, ChannelMask, CropRect, RoiMeta};
