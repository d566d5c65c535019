//! Typed handle pools.
//!
//! Transaction handles and estimator states churn at transaction rate, so
//! each partition keeps them in an arena with a free list. Slots carry a
//! generation counter; a [`PoolRef`] from a previous occupancy goes stale at
//! check-in and resolves to nothing afterwards, which is what lets callbacks
//! hold a non-owning reference to a pooled handle without keeping it alive.

use hornet_common::error::{HornetError, HornetResult};

/// Non-owning reference to a pooled value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolRef {
    index: usize,
    generation: u64,
}

#[derive(Debug)]
struct Slot<T> {
    generation: u64,
    value: Option<T>,
    active: bool,
}

/// Pool occupancy counters for status reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolCounters {
    /// Values constructed over the pool's lifetime.
    pub created: u64,
    /// Slots currently checked out.
    pub active: usize,
    /// Slots holding a reusable value.
    pub idle: usize,
}

/// Arena + free-list pool for one handle kind.
#[derive(Debug)]
pub struct HandlePool<T> {
    slots: Vec<Slot<T>>,
    free: Vec<usize>,
    created: u64,
    idle_high_water: Option<usize>,
}

impl<T> HandlePool<T> {
    /// Creates a pool that retains every checked-in value.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            created: 0,
            idle_high_water: None,
        }
    }

    /// Creates a pool that drops checked-in values beyond `limit` idle
    /// slots instead of retaining them.
    #[must_use]
    pub fn with_idle_high_water(limit: usize) -> Self {
        Self {
            idle_high_water: Some(limit),
            ..Self::new()
        }
    }

    /// Checks out a slot, reusing a pooled value or constructing a fresh one.
    pub fn checkout(&mut self, make: impl FnOnce() -> T) -> PoolRef {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index];
            slot.active = true;
            if slot.value.is_none() {
                slot.value = Some(make());
                self.created += 1;
            }
            return PoolRef {
                index,
                generation: slot.generation,
            };
        }
        let index = self.slots.len();
        self.slots.push(Slot {
            generation: 0,
            value: Some(make()),
            active: true,
        });
        self.created += 1;
        PoolRef {
            index,
            generation: 0,
        }
    }

    /// Resolves a reference; stale references resolve to `None`.
    #[must_use]
    pub fn get(&self, handle: PoolRef) -> Option<&T> {
        let slot = self.slots.get(handle.index)?;
        if !slot.active || slot.generation != handle.generation {
            return None;
        }
        slot.value.as_ref()
    }

    /// Mutably resolves a reference; stale references resolve to `None`.
    #[must_use]
    pub fn get_mut(&mut self, handle: PoolRef) -> Option<&mut T> {
        let slot = self.slots.get_mut(handle.index)?;
        if !slot.active || slot.generation != handle.generation {
            return None;
        }
        slot.value.as_mut()
    }

    /// Returns a value to the pool, resetting it for reuse.
    ///
    /// Bumps the slot generation, so the checked-in reference and any copy
    /// of it go stale immediately. Beyond the idle high-water mark the
    /// value is dropped instead of retained.
    ///
    /// # Errors
    ///
    /// Returns an error when the reference is stale or was already checked
    /// in.
    pub fn checkin(&mut self, handle: PoolRef, reset: impl FnOnce(&mut T)) -> HornetResult<()> {
        let idle = self.free.len();
        let Some(slot) = self.slots.get_mut(handle.index) else {
            return Err(HornetError::InvalidState("pool reference is out of range"));
        };
        if !slot.active || slot.generation != handle.generation {
            return Err(HornetError::InvalidState("pool reference is stale"));
        }
        slot.active = false;
        slot.generation += 1;
        if self.idle_high_water.is_some_and(|limit| idle >= limit) {
            slot.value = None;
        } else if let Some(value) = slot.value.as_mut() {
            reset(value);
        }
        self.free.push(handle.index);
        Ok(())
    }

    /// Current occupancy counters.
    #[must_use]
    pub fn counters(&self) -> PoolCounters {
        PoolCounters {
            created: self.created,
            active: self.slots.iter().filter(|slot| slot.active).count(),
            idle: self.free.len(),
        }
    }
}

impl<T> Default for HandlePool<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Value-recycling pool: callers take values out and give them back.
///
/// Used where a value crosses thread boundaries while in use (estimator
/// states travel with the transaction handle), so a slot reference cannot
/// outlive the checkout. Surplus beyond the idle high-water mark is dropped
/// instead of retained.
#[derive(Debug)]
pub struct ValuePool<T> {
    idle: Vec<T>,
    idle_high_water: usize,
    created: u64,
    outstanding: usize,
}

impl<T> ValuePool<T> {
    /// Creates a pool retaining at most `idle_high_water` idle values.
    #[must_use]
    pub fn new(idle_high_water: usize) -> Self {
        Self {
            idle: Vec::new(),
            idle_high_water,
            created: 0,
            outstanding: 0,
        }
    }

    /// Takes a pooled value, constructing one when none is idle.
    pub fn take(&mut self, make: impl FnOnce() -> T) -> T {
        self.outstanding += 1;
        match self.idle.pop() {
            Some(value) => value,
            None => {
                self.created += 1;
                make()
            }
        }
    }

    /// Returns a value, resetting it for reuse; dropped beyond the idle
    /// high-water mark.
    pub fn give(&mut self, mut value: T, reset: impl FnOnce(&mut T)) {
        self.outstanding = self.outstanding.saturating_sub(1);
        if self.idle.len() < self.idle_high_water {
            reset(&mut value);
            self.idle.push(value);
        }
    }

    /// Current occupancy counters.
    #[must_use]
    pub fn counters(&self) -> PoolCounters {
        PoolCounters {
            created: self.created,
            active: self.outstanding,
            idle: self.idle.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::HandlePool;
    use googletest::prelude::*;
    use rstest::rstest;

    #[rstest]
    fn checkout_reuses_checked_in_values() {
        let mut pool = HandlePool::<Vec<u8>>::new();
        let first = pool.checkout(|| vec![1, 2, 3]);
        pool.checkin(first, Vec::clear).expect("checkin must succeed");
        let second = pool.checkout(|| unreachable!("pooled value must be reused"));

        assert_that!(pool.get(second).map(Vec::len), eq(Some(0_usize)));
        assert_that!(pool.counters().created, eq(1));
    }

    #[rstest]
    fn stale_references_resolve_to_nothing() {
        let mut pool = HandlePool::<u32>::new();
        let handle = pool.checkout(|| 7);
        let copy = handle;
        pool.checkin(handle, |value| *value = 0)
            .expect("checkin must succeed");

        assert_that!(pool.get(copy).is_none(), eq(true));
        assert_that!(pool.checkin(copy, |_| {}).is_err(), eq(true));
    }

    #[rstest]
    fn idle_high_water_drops_surplus_values() {
        let mut pool = HandlePool::<u32>::with_idle_high_water(1);
        let first = pool.checkout(|| 1);
        let second = pool.checkout(|| 2);
        pool.checkin(first, |_| {}).expect("checkin must succeed");
        pool.checkin(second, |_| {}).expect("checkin must succeed");

        // One idle value retained, one dropped; the next two checkouts must
        // construct exactly once more.
        let _third = pool.checkout(|| 3);
        let _fourth = pool.checkout(|| 4);
        assert_that!(pool.counters().created, eq(3));
    }

    #[rstest]
    fn value_pool_recycles_until_the_high_water_mark() {
        let mut pool = super::ValuePool::<Vec<u8>>::new(1);
        let first = pool.take(|| vec![1]);
        let second = pool.take(|| vec![2]);
        pool.give(first, Vec::clear);
        pool.give(second, Vec::clear);

        assert_that!(pool.counters().idle, eq(1_usize));
        let reused = pool.take(|| unreachable!("idle value must be reused"));
        assert_that!(reused.is_empty(), eq(true));
        let _fresh = pool.take(|| vec![3]);
        assert_that!(pool.counters().created, eq(3));
    }

    #[rstest]
    fn counters_track_active_and_idle_slots() {
        let mut pool = HandlePool::<u32>::new();
        let first = pool.checkout(|| 1);
        let _second = pool.checkout(|| 2);
        pool.checkin(first, |_| {}).expect("checkin must succeed");

        let counters = pool.counters();
        assert_that!(counters.active, eq(1_usize));
        assert_that!(counters.idle, eq(1_usize));
    }
}
