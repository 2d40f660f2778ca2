/*
 * Ticket Spinlock
 *
 * Mutual exclusion between CPUs. Waiters are served in FIFO order, so no CPU
 * starves behind the others on a contended lock.
 *
 * Interrupt handling: `lock` disables interrupts on the current CPU before
 * taking a ticket and restores the saved state on unlock. Without this, a
 * timer interrupt arriving while the lock is held could re-enter the
 * scheduler and spin on the same lock forever.
 *
 * The context switcher needs a lock that stays held across the register
 * swap and is released on the successor's stack. The RAII guard cannot
 * express that, so `raw_lock`/`raw_unlock` expose the bare acquire and
 * release. Callers of the raw API manage the interrupt flag themselves.
 */

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU32, Ordering};

use crate::arch::interrupts;

/// A ticket-based spinlock that disables interrupts while held.
pub struct SpinLock<T> {
    /// The next ticket to be dispensed.
    next_ticket: AtomicU32,

    /// The ticket number currently being served.
    now_serving: AtomicU32,

    /// The protected data. UnsafeCell is required because we mutate through
    /// a shared reference (the lock ensures exclusive access at runtime).
    data: UnsafeCell<T>,
}

// SAFETY: the lock ensures that only one CPU accesses T at a time.
unsafe impl<T: Send> Send for SpinLock<T> {}
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            next_ticket: AtomicU32::new(0),
            now_serving: AtomicU32::new(0),
            data: UnsafeCell::new(value),
        }
    }

    /// Acquire the lock, disabling interrupts on the current CPU.
    ///
    /// Returns a guard providing `Deref`/`DerefMut` access to the protected
    /// data. The lock is released and the interrupt flag restored when the
    /// guard is dropped.
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        let irq_was_enabled = interrupts::are_enabled();
        interrupts::disable();

        let my_ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        while self.now_serving.load(Ordering::Acquire) != my_ticket {
            core::hint::spin_loop();
        }

        SpinLockGuard {
            lock: self,
            irq_was_enabled,
        }
    }

    /// Attempt to acquire the lock without spinning.
    ///
    /// Returns `None` if the lock is currently held. Used by the zombie
    /// reaper, which must never wait on a context-switch path.
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        let irq_was_enabled = interrupts::are_enabled();
        interrupts::disable();

        let current = self.now_serving.load(Ordering::Relaxed);
        let result = self.next_ticket.compare_exchange(
            current,
            current + 1,
            Ordering::Acquire,
            Ordering::Relaxed,
        );

        match result {
            Ok(_) => Some(SpinLockGuard {
                lock: self,
                irq_was_enabled,
            }),
            Err(_) => {
                if irq_was_enabled {
                    interrupts::enable();
                }
                None
            }
        }
    }

    /// Bare acquire without touching the interrupt flag.
    ///
    /// # Safety
    /// The caller must have interrupts disabled and must pair this with
    /// exactly one `raw_unlock`, possibly on a different kernel stack.
    pub unsafe fn raw_lock(&self) {
        let my_ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        while self.now_serving.load(Ordering::Acquire) != my_ticket {
            core::hint::spin_loop();
        }
    }

    /// Bare release matching `raw_lock`.
    ///
    /// # Safety
    /// The calling CPU must hold the lock via `raw_lock`.
    pub unsafe fn raw_unlock(&self) {
        self.now_serving.fetch_add(1, Ordering::Release);
    }

    /// Access the protected data while holding the lock via `raw_lock`.
    ///
    /// # Safety
    /// Only valid between `raw_lock` and `raw_unlock` on this CPU.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn raw_get(&self) -> &mut T {
        unsafe { &mut *self.data.get() }
    }

    /// Mutable access without locking. Safe because `&mut self` guarantees
    /// exclusive access at compile time; used during single-CPU boot.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

/// RAII guard for a held spinlock.
pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
    irq_was_enabled: bool,
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: We hold the lock, so we have exclusive access.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: We hold the lock, so we have exclusive access.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.now_serving.fetch_add(1, Ordering::Release);
        if self.irq_was_enabled {
            interrupts::enable();
        }
    }
}
