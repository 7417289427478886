//! Fixed-capacity buffer pools.
//!
//! A `Pool` owns all of its items up front. Acquiring one hands out a [`Handle`], which is an
//! index into the pool; whoever holds the handle owns the item until it is released again. Handles
//! move between pipes and lists instead of the buffers themselves, so a buffer is never aliased.
//!
//! [`Handle`]: struct.Handle.html

use heapless::Vec;

/// Index of an acquired pool item.
///
/// A `Handle` is only meaningful for the pool it was acquired from.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Handle(u8);

impl Handle {
    /// Returns the item's index in its pool.
    pub fn index(&self) -> usize {
        usize::from(self.0)
    }
}

/// A slab of `N` preallocated `T`s with a free stack.
pub struct Pool<T, const N: usize> {
    items: [T; N],
    free: Vec<u8, N>,
    allocated: [bool; N],
}

impl<T: Default, const N: usize> Pool<T, N> {
    /// Creates a pool with all items free.
    pub fn new() -> Self {
        assert!(N <= 256, "pools are limited to 256 items");

        let mut pool = Self {
            items: [(); N].map(|_| T::default()),
            free: Vec::new(),
            allocated: [false; N],
        };
        pool.reset();
        pool
    }

    /// Marks every item as free again.
    ///
    /// Outstanding handles become dangling; only call this when nothing can use them anymore.
    pub fn reset(&mut self) {
        self.free.clear();
        for index in (0..N).rev() {
            // Cannot fail: `free` has room for exactly `N` entries.
            self.free.push(index as u8).ok();
        }
        self.allocated = [false; N];
    }
}

impl<T, const N: usize> Pool<T, N> {
    /// Takes an item out of the pool.
    ///
    /// Returns `None` when all items are in use.
    pub fn acquire(&mut self) -> Option<Handle> {
        let index = self.free.pop()?;
        self.allocated[usize::from(index)] = true;
        Some(Handle(index))
    }

    /// Returns an item to the pool.
    ///
    /// # Panics
    ///
    /// This will panic if `handle` is not currently acquired.
    pub fn release(&mut self, handle: Handle) {
        assert!(
            self.allocated[handle.index()],
            "double release of pool item {}",
            handle.0
        );
        self.allocated[handle.index()] = false;
        // Cannot fail: at most `N` handles are ever outstanding.
        self.free.push(handle.0).ok();
    }

    /// Returns the number of free items.
    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// Returns a reference to an acquired item.
    pub fn get(&self, handle: Handle) -> &T {
        debug_assert!(self.allocated[handle.index()]);
        &self.items[handle.index()]
    }

    /// Returns a mutable reference to an acquired item.
    pub fn get_mut(&mut self, handle: Handle) -> &mut T {
        debug_assert!(self.allocated[handle.index()]);
        &mut self.items[handle.index()]
    }
}

impl<T: Default, const N: usize> Default for Pool<T, N> {
    fn default() -> Self {
        Self::new()
    }
}
