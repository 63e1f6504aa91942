// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Fixed-capacity admission counter.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Bounds the number of outstanding messages of one function type.
///
/// `held` never exceeds `capacity`: acquisition is a compare-and-swap that
/// fails instead of overshooting.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: usize,
    held: AtomicUsize,
}

impl TokenBucket {
    /// Create a bucket with `capacity` tokens.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            held: AtomicUsize::new(0),
        }
    }

    /// Take one token if any is left.
    pub fn try_acquire(&self) -> bool {
        self.held
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |held| {
                (held < self.capacity).then_some(held + 1)
            })
            .is_ok()
    }

    /// Return one token. Releasing with nothing held is ignored.
    pub fn release(&self) {
        let _ = self
            .held
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |held| held.checked_sub(1));
    }

    /// Tokens currently held.
    pub fn held(&self) -> usize {
        self.held.load(Ordering::Acquire)
    }

    /// Total tokens.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Share of tokens held, 0-100.
    pub fn load_percentage(&self) -> u8 {
        if self.capacity == 0 {
            return 100;
        }
        ((self.held() * 100) / self.capacity) as u8
    }
}
