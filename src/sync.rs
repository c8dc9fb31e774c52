//! Mutex that disables IRQs while held, to avoid deadlocks against
//! paths that can be re-entered from a timer callback (see spec.md
//! §5: "IRQs may be disabled across RQ-lock sections that can be
//! entered from timer callbacks").

use core::ops::{Deref, DerefMut};
use spin::{Mutex, MutexGuard};

use crate::irq;

pub struct IrqSafeMutex<T> {
    inner: Mutex<T>,
}

pub struct IrqSafeGuard<'a, T> {
    irq_was_enabled: bool,
    guard: MutexGuard<'a, T>,
}

impl<T> IrqSafeMutex<T> {
    pub const fn new(value: T) -> Self {
        Self { inner: Mutex::new(value) }
    }

    pub fn lock(&self) -> IrqSafeGuard<'_, T> {
        let irq_was_enabled = irq::disable();
        let guard = self.inner.lock();
        IrqSafeGuard { irq_was_enabled, guard }
    }

    /// Non-blocking variant used by the double-lock-with-revalidation
    /// path in the SMP balancer (spec.md §5).
    pub fn try_lock(&self) -> Option<IrqSafeGuard<'_, T>> {
        let irq_was_enabled = irq::disable();
        match self.inner.try_lock() {
            Some(guard) => Some(IrqSafeGuard { irq_was_enabled, guard }),
            None => {
                irq::restore(irq_was_enabled);
                None
            }
        }
    }
}

impl<'a, T> Deref for IrqSafeGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<'a, T> DerefMut for IrqSafeGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<'a, T> Drop for IrqSafeGuard<'a, T> {
    fn drop(&mut self) {
        irq::restore(self.irq_was_enabled);
    }
}
