use std::sync::atomic::{AtomicBool, Ordering};

/// Number of spins before a waiting thread starts yielding its time slice
pub const DEFAULT_SPIN_COUNT_TO_YIELD: u32 = 256;

/// A single atomic flag used as a spinlock. The flag does not know who holds it, so unlocking is
/// the responsibility of whoever locked it (normally a `LockHelper`).
#[derive(Default)]
pub struct LockFlag {
    locked: AtomicBool,
}

impl LockFlag {
    pub const fn new() -> Self {
        LockFlag {
            locked: AtomicBool::new(false),
        }
    }

    /// Atomically transitions the flag from unlocked to locked. Returns true if this call acquired it.
    #[inline(always)]
    pub fn try_lock(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    #[inline(always)]
    pub fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }

    #[inline(always)]
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for LockFlag {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("LockFlag")
            .field("locked", &self.is_locked())
            .finish()
    }
}

/// Scoped holder of a `LockFlag`. The flag is released when the helper is dropped, or earlier with
/// `unlock`. A helper may hold at most one flag at a time.
pub struct LockHelper<'a> {
    flag: Option<&'a LockFlag>,
    spin_count_to_yield: u32,
}

impl<'a> Default for LockHelper<'a> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> LockHelper<'a> {
    /// Creates a helper that holds nothing
    pub fn new() -> Self {
        LockHelper {
            flag: None,
            spin_count_to_yield: DEFAULT_SPIN_COUNT_TO_YIELD,
        }
    }

    /// Creates a helper and blocks until `flag` is acquired
    pub fn lock_flag(flag: &'a LockFlag) -> Self {
        let mut helper = Self::new();
        helper.lock(flag);
        helper
    }

    pub fn with_spin_count(
        mut self,
        spin_count_to_yield: u32,
    ) -> Self {
        self.spin_count_to_yield = spin_count_to_yield;
        self
    }

    /// Attempts to acquire `flag` once. On success the helper holds the flag.
    pub fn try_lock(
        &mut self,
        flag: &'a LockFlag,
    ) -> bool {
        assert!(
            self.flag.is_none(),
            "LockHelper already holds a lock flag, unlock it first"
        );

        if flag.try_lock() {
            self.flag = Some(flag);
            true
        } else {
            false
        }
    }

    /// Spins on `flag` until acquired, yielding the thread once the spin budget is used up
    pub fn lock(
        &mut self,
        flag: &'a LockFlag,
    ) {
        assert!(
            self.flag.is_none(),
            "LockHelper already holds a lock flag, unlock it first"
        );

        let mut spin_count = 0;
        loop {
            // Only attempt the exclusive CAS once the flag looks free to keep the cache line shared
            // while another thread holds it
            if !flag.is_locked() && flag.try_lock() {
                break;
            }

            spin_count += 1;
            if spin_count >= self.spin_count_to_yield {
                spin_count = 0;
                std::thread::yield_now();
            } else {
                std::hint::spin_loop();
            }
        }

        self.flag = Some(flag);
    }

    pub fn unlock(&mut self) {
        if let Some(flag) = self.flag.take() {
            flag.unlock();
        }
    }

    pub fn is_locked(&self) -> bool {
        self.flag.is_some()
    }
}

impl<'a> Drop for LockHelper<'a> {
    fn drop(&mut self) {
        self.unlock();
    }
}
