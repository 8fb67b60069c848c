//! Debug-only lock-ordering assertions (§5): every thread that holds more
//! than one of {retrieve-list coarse, retrieve-list fine, FSA host slot}
//! simultaneously must acquire them in that order. Violating it is a
//! deadlock waiting to happen the moment two threads take the reverse
//! order under contention.
//!
//! This is assert-only bookkeeping, not a real lock implementation — it
//! exists to catch a violation in a debug/test build before it ships as a
//! hang in production, the same role `debug_assert!` plays in the
//! teacher's own size/bounds checks.

use std::cell::Cell;

/// Position in the required acquisition order. Holding a lock at level N
/// forbids acquiring one at level <= N on the same thread until it's
/// dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LockLevel {
    RetrieveListCoarse = 0,
    RetrieveListFine = 1,
    FsaHostSlot = 2,
}

thread_local! {
    static HELD: Cell<Option<LockLevel>> = const { Cell::new(None) };
}

/// RAII guard recording that the current thread now holds `level`. Dropping
/// it clears the record. Not a real mutex guard — pair it with the actual
/// lock acquisition at the call site.
pub struct LockOrderGuard {
    previous: Option<LockLevel>,
}

impl Drop for LockOrderGuard {
    fn drop(&mut self) {
        HELD.with(|h| h.set(self.previous));
    }
}

/// Record that the current thread is about to acquire `level`. Panics in
/// debug builds if a lock at an equal-or-higher level is already held by
/// this thread, since that would mean the reverse order is possible
/// somewhere and two threads taking it from opposite ends deadlock.
pub fn enter(level: LockLevel) -> LockOrderGuard {
    let previous = HELD.with(|h| h.get());
    if let Some(current) = previous {
        debug_assert!(
            current < level,
            "lock order violation: tried to acquire {level:?} while already holding {current:?} (required order: coarse -> fine -> host-slot)"
        );
    }
    HELD.with(|h| h.set(Some(level)));
    LockOrderGuard { previous }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_acquisition_in_order_is_fine() {
        let _coarse = enter(LockLevel::RetrieveListCoarse);
        let _fine = enter(LockLevel::RetrieveListFine);
        let _slot = enter(LockLevel::FsaHostSlot);
    }

    #[test]
    #[should_panic(expected = "lock order violation")]
    fn nested_acquisition_out_of_order_panics() {
        let _slot = enter(LockLevel::FsaHostSlot);
        let _coarse = enter(LockLevel::RetrieveListCoarse);
    }

    #[test]
    fn guard_drop_restores_previous_level() {
        {
            let _coarse = enter(LockLevel::RetrieveListCoarse);
            {
                let _fine = enter(LockLevel::RetrieveListFine);
            }
            // fine guard dropped: coarse is the innermost level again, so
            // re-entering fine must still succeed.
            let _fine_again = enter(LockLevel::RetrieveListFine);
        }
        // everything dropped: any level is acquirable from scratch.
        let _slot = enter(LockLevel::FsaHostSlot);
    }
}
