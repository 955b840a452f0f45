//! Thread affinity for automation host calls.
//!
//! The host's object model is single-thread-affine: every call against one
//! live handle must come from the thread that created it. A thread declares
//! itself fit for host work by holding an [`ApartmentGuard`]; session
//! creation refuses to run anywhere else.

use crate::error::{ConversionError, Result};
use std::cell::Cell;
use std::marker::PhantomData;
use std::thread::{self, ThreadId};
use tracing::debug;

thread_local! {
    static APARTMENT_DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// RAII guard marking the current thread as a host apartment.
///
/// Nested guards are allowed; the thread stays an apartment until the
/// outermost guard is dropped. The guard cannot leave its thread.
#[derive(Debug)]
pub struct ApartmentGuard {
    thread: ThreadId,
    _not_send: PhantomData<*const ()>,
}

impl ApartmentGuard {
    /// Enter the host apartment on the current thread.
    pub fn enter() -> Self {
        let depth = APARTMENT_DEPTH.with(|d| {
            let depth = d.get() + 1;
            d.set(depth);
            depth
        });
        if depth == 1 {
            debug!("Entered host apartment on {:?}", thread::current().name());
        }
        Self {
            thread: thread::current().id(),
            _not_send: PhantomData,
        }
    }

    /// Thread this guard belongs to.
    pub fn thread_id(&self) -> ThreadId {
        self.thread
    }
}

impl Drop for ApartmentGuard {
    fn drop(&mut self) {
        APARTMENT_DEPTH.with(|d| d.set(d.get().saturating_sub(1)));
    }
}

/// Whether the current thread is a host apartment.
pub fn is_entered() -> bool {
    APARTMENT_DEPTH.with(|d| d.get() > 0)
}

/// Fail fast unless the current thread is a host apartment.
pub fn require() -> Result<()> {
    if is_entered() {
        Ok(())
    } else {
        Err(ConversionError::ApartmentRequired)
    }
}
