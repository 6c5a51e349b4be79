//! The two lock tiers.
//!
//! A [`SleepLock`] may block its caller for as long as it likes, and so
//! guards multi-step sequences that can themselves sleep (policy
//! `init`/`term`, context setup). An [`IrqSpinLock`] never sleeps and is
//! the only lock interrupt-context code may take; everything done while
//! holding it must be short and bounded.
//!
//! We cannot disable interrupts from user space, but we *can* keep the
//! discipline honest: every [`IrqGuard`] bumps a per-thread atomic-section
//! depth, and anything that may sleep checks it via [`might_sleep`].
use crate::helpe::*;

thread_local! {
    static ATOMIC_DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// Returns `true` if the calling thread holds at least one [`IrqSpinLock`].
#[inline(always)]
pub fn in_atomic() -> bool {
    ATOMIC_DEPTH.with(|d| d.get() > 0)
}

/// Marks a point that may block. Calling it inside a spinlock-protected
/// section is a bug, caught in debug builds.
#[inline(always)]
pub fn might_sleep() {
    debug_assert!(!in_atomic(), "Sleeping call made while holding an IRQ spinlock!");
}

/// Outer-tier lock. Never taken from interrupt context.
#[derive(Debug, Default)]
pub struct SleepLock<T> {
    inner: Mutex<T>,
}

impl<T> SleepLock<T> {
    pub const fn new(val: T) -> Self {
        Self {
            inner: Mutex::new(val),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, T> {
        might_sleep();
        // Protected state is only ever mutated through asserted paths: a
        // panic in some other holder has already surfaced the bug.
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Inner-tier lock, safe to take from interrupt context.
#[derive(Debug, Default)]
pub struct IrqSpinLock<T> {
    inner: spin::Mutex<T>,
}

impl<T> IrqSpinLock<T> {
    pub const fn new(val: T) -> Self {
        Self {
            inner: spin::Mutex::new(val),
        }
    }

    /// Spins until the lock is ours. The returned guard marks the thread
    /// as atomic until dropped.
    pub fn lock_irqsave(&self) -> IrqGuard<'_, T> {
        let guard = self.inner.lock();
        ATOMIC_DEPTH.with(|d| d.set(d.get() + 1));

        IrqGuard { guard }
    }
}

pub struct IrqGuard<'a, T> {
    guard: spin::MutexGuard<'a, T>,
}

impl<T> std::ops::Deref for IrqGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> std::ops::DerefMut for IrqGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for IrqGuard<'_, T> {
    fn drop(&mut self) {
        ATOMIC_DEPTH.with(|d| {
            debug_assert!(d.get() > 0, "Unbalanced IRQ spinlock depth!");
            d.set(d.get() - 1);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_tracks_atomic_depth() {
        let outer = IrqSpinLock::new(1u32);
        let inner = IrqSpinLock::new(2u32);
        assert!(!in_atomic());
        {
            let a = outer.lock_irqsave();
            assert!(in_atomic());
            {
                let b = inner.lock_irqsave();
                assert_eq!(*a + *b, 3);
            }
            assert!(in_atomic());
        }
        assert!(!in_atomic());
    }

    #[test]
    fn sleep_lock_outside_spinlock_is_fine() {
        let m = SleepLock::new(vec![0u8]);
        m.lock().push(1);
        assert_eq!(m.lock().len(), 2);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "Sleeping call")]
    fn sleep_lock_inside_spinlock_panics() {
        let s = IrqSpinLock::new(());
        let m = SleepLock::new(());
        let _irq = s.lock_irqsave();
        let _never = m.lock();
    }
}
