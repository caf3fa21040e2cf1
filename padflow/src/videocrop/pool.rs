// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Fixed-size frame pool of one processing stage.

use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::buffer::Memory;
use crate::error::{Error, Result};

struct PoolState {
    free: Vec<Vec<u8>>,
    outstanding: usize,
    active: bool,
}

struct PoolInner {
    frame_size: usize,
    min_buffers: usize,
    max_buffers: usize,
    state: Mutex<PoolState>,
}

/// Pool of equally sized frames. A frame handed out returns to the pool when
/// the last reference to its memory is dropped.
#[derive(Clone)]
pub struct FramePool {
    inner: Arc<PoolInner>,
}

impl FramePool {
    /// Creates an inactive pool. `max_buffers == 0` lets the pool grow
    /// without bound; otherwise `min_buffers` is clamped to it.
    pub fn new(frame_size: usize, min_buffers: usize, max_buffers: usize) -> Self {
        let min_buffers = match max_buffers {
            0 => min_buffers,
            max => min_buffers.min(max),
        };
        FramePool {
            inner: Arc::new(PoolInner {
                frame_size,
                min_buffers,
                max_buffers,
                state: Mutex::new(PoolState {
                    free: Vec::new(),
                    outstanding: 0,
                    active: false,
                }),
            }),
        }
    }

    /// Size of each frame in bytes.
    pub fn frame_size(&self) -> usize {
        self.inner.frame_size
    }

    /// Activates the pool, preallocating the minimum number of frames, or
    /// deactivates it, freeing every idle frame.
    pub fn set_active(&self, active: bool) {
        let mut state = self.inner.state.lock();
        state.active = active;
        if active {
            let missing = self
                .inner
                .min_buffers
                .saturating_sub(state.free.len() + state.outstanding);
            for _ in 0..missing {
                state.free.push(vec![0; self.inner.frame_size]);
            }
        } else {
            state.free.clear();
        }
    }

    /// Whether frames can be acquired.
    pub fn is_active(&self) -> bool {
        self.inner.state.lock().active
    }

    /// Takes a frame out of the pool.
    pub fn acquire(&self) -> Result<PooledFrame> {
        let mut state = self.inner.state.lock();
        if !state.active {
            return Err(Error::PoolInactive);
        }
        let data = match state.free.pop() {
            Some(data) => data,
            None if self.inner.max_buffers == 0 || state.outstanding < self.inner.max_buffers => {
                vec![0; self.inner.frame_size]
            }
            None => {
                return Err(Error::PoolExhausted {
                    max: self.inner.max_buffers,
                });
            }
        };
        state.outstanding += 1;
        Ok(PooledFrame {
            data,
            pool: Arc::downgrade(&self.inner),
        })
    }

    /// Frames currently handed out.
    pub fn outstanding(&self) -> usize {
        self.inner.state.lock().outstanding
    }

    /// Idle frames ready to be handed out.
    pub fn idle(&self) -> usize {
        self.inner.state.lock().free.len()
    }
}

/// A frame borrowed from a [`FramePool`].
pub struct PooledFrame {
    data: Vec<u8>,
    pool: Weak<PoolInner>,
}

impl PooledFrame {
    /// Writable frame bytes.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Freezes the frame into buffer memory. The frame goes back to its pool
    /// once every clone of the memory is dropped.
    pub fn into_memory(self) -> Memory {
        Bytes::from_owner(self)
    }
}

impl AsRef<[u8]> for PooledFrame {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl Drop for PooledFrame {
    fn drop(&mut self) {
        let Some(pool) = self.pool.upgrade() else {
            return;
        };
        let mut state = pool.state.lock();
        state.outstanding = state.outstanding.saturating_sub(1);
        if state.active {
            state.free.push(std::mem::take(&mut self.data));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_return_when_memory_drops() {
        let pool = FramePool::new(16, 1, 2);
        assert!(matches!(pool.acquire(), Err(Error::PoolInactive)));
        pool.set_active(true);
        assert_eq!(pool.idle(), 1);

        let first = pool.acquire().unwrap().into_memory();
        let second = pool.acquire().unwrap();
        assert!(matches!(pool.acquire(), Err(Error::PoolExhausted { max: 2 })));

        let shared = first.clone();
        drop(first);
        assert_eq!(pool.outstanding(), 2);
        drop(shared);
        assert_eq!(pool.outstanding(), 1);
        assert_eq!(pool.idle(), 1);

        drop(second);
        assert_eq!(pool.idle(), 2);
        pool.set_active(false);
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn minimum_never_exceeds_maximum() {
        let pool = FramePool::new(8, 5, 2);
        pool.set_active(true);
        assert_eq!(pool.idle(), 2);
        let frames: Vec<_> = (0..2).map(|_| pool.acquire().unwrap()).collect();
        assert!(matches!(pool.acquire(), Err(Error::PoolExhausted { max: 2 })));
        assert_eq!(pool.outstanding(), 2);
        drop(frames);
        assert_eq!(pool.idle(), 2);
    }

    #[test]
    fn unlimited_pool_grows() {
        let pool = FramePool::new(4, 0, 0);
        pool.set_active(true);
        let frames: Vec<_> = (0..32).map(|_| pool.acquire().unwrap()).collect();
        assert_eq!(pool.outstanding(), 32);
        drop(frames);
        assert_eq!(pool.outstanding(), 0);
    }
}
