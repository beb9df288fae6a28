//! Advisory cap on simultaneous calls to one capability.
//!
//! A [`ConcurrencyLimit`] is shared between runs; wrapping a capability in
//! [`Throttled`] makes every call hold a permit for its duration. Correctness
//! never depends on the limit, it only protects provider rate budgets.

use std::collections::BTreeSet;
use std::sync::{Arc, Condvar, Mutex, PoisonError};

use crate::capability::{Detector, EditHint, Editor, Persistence, Verifier};
use crate::error::ProviderError;
use crate::result::PipelineResult;
use crate::types::{DetectionResult, Image, Verification};

#[derive(Debug)]
struct Slots {
    free: Mutex<usize>,
    released: Condvar,
    capacity: usize,
}

/// Counting semaphore. Clones share the same permits.
#[derive(Debug, Clone)]
pub struct ConcurrencyLimit {
    slots: Arc<Slots>,
}

impl ConcurrencyLimit {
    /// A limit allowing `capacity` concurrent holders (at least one).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: Arc::new(Slots {
                free: Mutex::new(capacity),
                released: Condvar::new(),
                capacity,
            }),
        }
    }

    /// Maximum concurrent holders.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.capacity
    }

    /// Permits not currently held.
    #[must_use]
    pub fn available(&self) -> usize {
        *self
            .slots
            .free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until a permit is free and take it.
    #[must_use]
    pub fn acquire(&self) -> Permit<'_> {
        let mut free = self
            .slots
            .free
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        while *free == 0 {
            free = self
                .slots
                .released
                .wait(free)
                .unwrap_or_else(PoisonError::into_inner);
        }
        *free -= 1;
        Permit { limit: self }
    }
}

/// A held permit; released on drop.
#[derive(Debug)]
pub struct Permit<'a> {
    limit: &'a ConcurrencyLimit,
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        let mut free = self
            .limit
            .slots
            .free
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *free += 1;
        self.limit.slots.released.notify_one();
    }
}

/// A capability whose calls each hold a permit from a shared limit.
#[derive(Debug, Clone)]
pub struct Throttled<C> {
    inner: C,
    limit: ConcurrencyLimit,
}

impl<C> Throttled<C> {
    /// Wrap `inner` so that calls go through `limit`.
    pub fn new(inner: C, limit: ConcurrencyLimit) -> Self {
        Self { inner, limit }
    }

    /// The wrapped capability.
    pub fn inner(&self) -> &C {
        &self.inner
    }
}

impl<C: Detector> Detector for Throttled<C> {
    fn detect(&self, image: &Image) -> Result<DetectionResult, ProviderError> {
        let _permit = self.limit.acquire();
        self.inner.detect(image)
    }
}

impl<C: Editor> Editor for Throttled<C> {
    fn edit(
        &self,
        image: &Image,
        hint: &EditHint,
        brands: &BTreeSet<String>,
    ) -> Result<Image, ProviderError> {
        let _permit = self.limit.acquire();
        self.inner.edit(image, hint, brands)
    }
}

impl<C: Verifier> Verifier for Throttled<C> {
    fn verify(
        &self,
        image: &Image,
        brands: &BTreeSet<String>,
    ) -> Result<Verification, ProviderError> {
        let _permit = self.limit.acquire();
        self.inner.verify(image, brands)
    }
}

impl<C: Persistence> Persistence for Throttled<C> {
    fn save(&self, product_id: &str, result: &PipelineResult) -> Result<(), ProviderError> {
        let _permit = self.limit.acquire();
        self.inner.save(product_id, result)
    }
}
