use crate::RawRwSpin;
use core::{
    cell::UnsafeCell,
    ops::{Deref, DerefMut},
};

/// Reader/writer spin lock.
///
/// Any number of [`read`](Self::read) guards may coexist; a
/// [`write`](Self::write) guard excludes everyone else. Writers are not
/// prioritized: a steady stream of readers can delay a writer.
pub struct RwSpinLock<T> {
    raw: RawRwSpin,
    inner: UnsafeCell<T>,
}

// Safety: readers hand out &T concurrently (T: Sync), writers hand out &mut T (T: Send).
unsafe impl<T: Send + Sync> Sync for RwSpinLock<T> {}
unsafe impl<T: Send> Send for RwSpinLock<T> {}

impl<T> RwSpinLock<T> {
    pub const fn new(inner: T) -> Self {
        Self {
            raw: RawRwSpin::new(),
            inner: UnsafeCell::new(inner),
        }
    }

    /// Spin until a shared hold is acquired.
    #[inline]
    pub fn read(&self) -> RwSpinLockReadGuard<'_, T> {
        self.raw.lock_shared();
        RwSpinLockReadGuard { lock: self }
    }

    /// Try once for a shared hold.
    #[inline]
    pub fn try_read(&self) -> Option<RwSpinLockReadGuard<'_, T>> {
        self.raw
            .try_lock_shared()
            .then(|| RwSpinLockReadGuard { lock: self })
    }

    /// Spin until the exclusive hold is acquired.
    #[inline]
    pub fn write(&self) -> RwSpinLockWriteGuard<'_, T> {
        self.raw.lock_exclusive();
        RwSpinLockWriteGuard { lock: self }
    }

    /// Try once for the exclusive hold.
    #[inline]
    pub fn try_write(&self) -> Option<RwSpinLockWriteGuard<'_, T>> {
        self.raw
            .try_lock_exclusive()
            .then(|| RwSpinLockWriteGuard { lock: self })
    }

    #[inline]
    pub fn with_read<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        let g = self.read();
        f(&g)
    }

    #[inline]
    pub fn with_write<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut g = self.write();
        f(&mut g)
    }

    /// Mutable access when you have `&mut self` (no contention possible).
    #[inline]
    pub const fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }

    #[inline]
    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

pub struct RwSpinLockReadGuard<'a, T> {
    lock: &'a RwSpinLock<T>,
}

impl<T> Deref for RwSpinLockReadGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.inner.get() }
    }
}

impl<T> Drop for RwSpinLockReadGuard<'_, T> {
    fn drop(&mut self) {
        unsafe { self.lock.raw.unlock_shared() }
    }
}

pub struct RwSpinLockWriteGuard<'a, T> {
    lock: &'a RwSpinLock<T>,
}

impl<T> Deref for RwSpinLockWriteGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.inner.get() }
    }
}

impl<T> DerefMut for RwSpinLockWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.inner.get() }
    }
}

impl<T> Drop for RwSpinLockWriteGuard<'_, T> {
    fn drop(&mut self) {
        unsafe { self.lock.raw.unlock_exclusive() }
    }
}
