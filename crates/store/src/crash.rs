//! Crash-point injection for recovery tests.
//!
//! The write and flush paths pass through named points (`wal_append`,
//! `wal_fsync`, `manifest_save`, `memtable_flush`). In test builds a point
//! can be armed on the current thread; the next time that thread reaches it,
//! the point disarms itself and the operation fails with an injected I/O
//! error, simulating a crash at exactly that step. Arming is thread-local so
//! concurrently running tests cannot trip each other's points. In production
//! builds the hooks compile to no-ops.

use crate::error::Result;
#[cfg(any(test, feature = "failpoints"))]
use crate::error::StoreError;

#[cfg(any(test, feature = "failpoints"))]
mod armed {
    use std::cell::Cell;

    thread_local! {
        static POINT: Cell<Option<&'static str>> = const { Cell::new(None) };
    }

    pub fn arm(point: &'static str) {
        POINT.with(|p| p.set(Some(point)));
    }

    pub fn disarm() {
        POINT.with(|p| p.set(None));
    }

    pub fn take_if(point: &str) -> bool {
        POINT.with(|p| {
            if p.get() == Some(point) {
                p.set(None);
                true
            } else {
                false
            }
        })
    }
}

#[cfg(any(test, feature = "failpoints"))]
pub(crate) fn hit(point: &'static str) -> Result<()> {
    if armed::take_if(point) {
        return Err(StoreError::Io(std::io::Error::other(format!(
            "injected crash at {}",
            point
        ))));
    }
    Ok(())
}

#[cfg(not(any(test, feature = "failpoints")))]
#[inline(always)]
pub(crate) fn hit(_point: &'static str) -> Result<()> {
    Ok(())
}

#[cfg(any(test, feature = "failpoints"))]
pub(crate) use armed::{arm, disarm};
