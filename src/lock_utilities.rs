use parking_lot::{Mutex, MutexGuard};

/// Provides functional expression methods for `Mutex`.
pub(crate) trait MappedMutex<T> {
    /// Use `func` to read the value in the mutex
    fn map_read<F, R>(&self, func: F) -> R
    where
        F: FnOnce(&MutexGuard<'_, T>) -> R;

    /// Use `func` to write the value in the mutex
    fn map_write<F, R>(&self, func: F) -> R
    where
        F: FnOnce(&mut MutexGuard<'_, T>) -> R;
}

impl<T> MappedMutex<T> for Mutex<T> {
    fn map_read<F, R>(&self, func: F) -> R
    where
        F: FnOnce(&MutexGuard<'_, T>) -> R,
    {
        let guard = self.lock();
        func(&guard)
    }

    fn map_write<F, R>(&self, func: F) -> R
    where
        F: FnOnce(&mut MutexGuard<'_, T>) -> R,
    {
        let mut guard = self.lock();
        func(&mut guard)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_write_then_read() {
        let posted = Mutex::new(vec![1_u32, 2_u32]);
        posted.map_write(|queue| queue.push(3_u32));
        assert_eq!(posted.map_read(|queue| queue.len()), 3);
        assert!(!posted.is_locked());
    }
}
