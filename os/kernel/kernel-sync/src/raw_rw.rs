use core::hint::spin_loop;
use core::sync::atomic::{AtomicUsize, Ordering};

/// Writer bit of the lock word.
const WRITER: usize = 1;

/// One reader; readers are counted above the writer bit.
const READER: usize = 1 << 1;

/// Raw reader/writer spin lock word.
///
/// * `0`: free
/// * `WRITER`: held exclusively
/// * `n * READER`: held shared by `n` readers
///
/// Readers never wait on other readers; a writer waits until the word drops
/// back to zero.
pub struct RawRwSpin {
    state: AtomicUsize,
}

impl Default for RawRwSpin {
    fn default() -> Self {
        Self::new()
    }
}

impl RawRwSpin {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: AtomicUsize::new(0),
        }
    }

    /// Try once to take the word exclusively.
    #[inline]
    pub fn try_lock_exclusive(&self) -> bool {
        self.state
            .compare_exchange(0, WRITER, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Spin until the word is taken exclusively (TATAS).
    #[inline]
    pub fn lock_exclusive(&self) {
        while !self.try_lock_exclusive() {
            // Spin on a plain load until the word looks free again.
            while self.state.load(Ordering::Relaxed) != 0 {
                spin_loop();
            }
        }
    }

    /// Try once to take a shared hold; fails while a writer holds the word.
    #[inline]
    pub fn try_lock_shared(&self) -> bool {
        let current = self.state.load(Ordering::Relaxed);
        if current & WRITER != 0 {
            return false;
        }
        self.state
            .compare_exchange(current, current + READER, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Spin until a shared hold is taken.
    #[inline]
    pub fn lock_shared(&self) {
        loop {
            let current = self.state.load(Ordering::Relaxed);
            if current & WRITER != 0 {
                spin_loop();
                continue;
            }
            if self
                .state
                .compare_exchange_weak(
                    current,
                    current + READER,
                    Ordering::Acquire,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                return;
            }
        }
    }

    /// # Safety
    /// The caller must hold the word exclusively.
    #[inline]
    pub unsafe fn unlock_exclusive(&self) {
        debug_assert_eq!(self.state.load(Ordering::Relaxed), WRITER);
        self.state.store(0, Ordering::Release);
    }

    /// # Safety
    /// The caller must hold one shared hold on the word.
    #[inline]
    pub unsafe fn unlock_shared(&self) {
        let previous = self.state.fetch_sub(READER, Ordering::Release);
        debug_assert!(previous >= READER && previous & WRITER == 0);
    }

    /// Whether anyone (reader or writer) currently holds the word.
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.state.load(Ordering::Relaxed) != 0
    }

    /// Number of readers currently holding the word.
    #[inline]
    pub fn readers(&self) -> usize {
        self.state.load(Ordering::Relaxed) / READER
    }
}
