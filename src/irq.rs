//! IRQ enable/disable shim.
//!
//! Stands in for the teacher's `arch::interrupts::{disable, restore}`.
//! Real interrupt masking is the architecture layer's job and is out
//! of this crate's scope (spec.md §1: "the OS timer subsystem... CPU
//! topology discovery" and friends are external collaborators); this
//! just tracks the saved-enabled flag so [`crate::sync::IrqSafeMutex`]
//! has something to call in a host-testable build.

use core::sync::atomic::{AtomicBool, Ordering};

static IRQ_ENABLED: AtomicBool = AtomicBool::new(true);

/// Disable IRQs, returning whether they were enabled beforehand.
pub fn disable() -> bool {
    IRQ_ENABLED.swap(false, Ordering::AcqRel)
}

/// Restore IRQ state to what `disable` observed.
pub fn restore(was_enabled: bool) {
    IRQ_ENABLED.store(was_enabled, Ordering::Release);
}
