//! Stack-based object pools.
//!
//! Pools use LIFO discipline so the most recently returned (and therefore
//! warmest) object is handed out first. Oversized objects are trimmed by the
//! caller before being recycled.

use parking_lot::Mutex;

pub(crate) struct Pool<T> {
    items: Mutex<Vec<T>>,
    capacity: usize,
}

impl<T> Pool<T> {
    pub(crate) fn new(capacity: usize) -> Self {
        Pool {
            items: Mutex::new(Vec::new()),
            capacity,
        }
    }

    /// Pops the most recently recycled object, or creates a fresh one.
    pub(crate) fn rent_with(&self, create: impl FnOnce() -> T) -> T {
        self.items.lock().pop().unwrap_or_else(create)
    }

    /// Returns an object to the pool. Dropped silently once the pool is full.
    pub(crate) fn recycle(&self, item: T) {
        let mut items = self.items.lock();
        if items.len() < self.capacity {
            items.push(item);
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.items.lock().len()
    }
}

impl<T: Default> Pool<T> {
    pub(crate) fn rent(&self) -> T {
        self.rent_with(T::default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rents_in_lifo_order() {
        let pool: Pool<Vec<u32>> = Pool::new(4);
        pool.recycle(vec![1]);
        pool.recycle(vec![2]);
        assert_eq!(pool.rent(), vec![2]);
        assert_eq!(pool.rent(), vec![1]);
        assert_eq!(pool.rent(), Vec::<u32>::new());
    }

    #[test]
    fn drops_items_beyond_capacity() {
        let pool: Pool<Vec<u32>> = Pool::new(1);
        pool.recycle(vec![1]);
        pool.recycle(vec![2]);
        assert_eq!(pool.len(), 1);
    }
}
