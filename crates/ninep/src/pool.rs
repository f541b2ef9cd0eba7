//! Tag and FID allocation.
//!
//! Tags bound the number of in-flight requests: acquiring one waits while all
//! are out, and releasing wakes one waiter. FIDs are never waited for; the pool
//! hands out fresh numbers until the 32-bit space runs out.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::Semaphore;

use crate::error::Error;
use crate::fcall::NOFID;
use crate::utils::{lock, Result};

/// Bounded pool of request tags `0..capacity`, reused in FIFO order.
/// `capacity` is at most 65535, so `NOTAG` is never handed out.
#[derive(Debug)]
pub struct TagPool {
    free: Mutex<VecDeque<u16>>,
    available: Semaphore,
    capacity: u16,
}

impl TagPool {
    pub fn new(capacity: u16) -> TagPool {
        debug_assert!(capacity > 0);
        TagPool {
            free: Mutex::new((0..capacity).collect()),
            available: Semaphore::new(capacity as usize),
            capacity,
        }
    }

    /// Wait for a free tag.
    ///
    /// Fails with `ConnectionClosed` once the pool has been closed, including
    /// for callers already waiting.
    pub async fn acquire(&self) -> Result<u16> {
        let permit = self
            .available
            .acquire()
            .await
            .map_err(|_| Error::ConnectionClosed("tag pool closed".to_owned()))?;
        permit.forget();

        match lock(&self.free).pop_front() {
            Some(tag) => Ok(tag),
            None => Err(Error::ConnectionClosed("tag pool empty".to_owned())),
        }
    }

    /// Return a tag. It must have come from `acquire` and not been released since.
    pub fn release(&self, tag: u16) {
        debug_assert!(tag < self.capacity);
        lock(&self.free).push_back(tag);
        self.available.add_permits(1);
    }

    /// Wake every waiter with an error and refuse further acquisitions
    pub fn close(&self) {
        self.available.close();
    }

    pub fn is_closed(&self) -> bool {
        self.available.is_closed()
    }

    /// Number of tags not currently in use
    pub fn free(&self) -> usize {
        lock(&self.free).len()
    }

    pub fn capacity(&self) -> u16 {
        self.capacity
    }
}

#[derive(Debug)]
struct FidState {
    next: u32,
    exhausted: bool,
}

/// FID allocator: a counter starting at 1 which takes back only the most
/// recently issued FID. `NOFID` is never handed out.
#[derive(Debug)]
pub struct FidPool {
    state: Mutex<FidState>,
}

impl Default for FidPool {
    fn default() -> Self {
        FidPool::new()
    }
}

impl FidPool {
    pub fn new() -> FidPool {
        FidPool {
            state: Mutex::new(FidState {
                next: 1,
                exhausted: false,
            }),
        }
    }

    pub fn acquire(&self) -> Result<u32> {
        let mut state = lock(&self.state);
        if state.exhausted || state.next == NOFID {
            state.exhausted = true;
            return Err(Error::FidsExhausted);
        }
        let fid = state.next;
        state.next += 1;
        Ok(fid)
    }

    /// Give a FID back. Only the last one issued is actually reused; other
    /// values are simply retired.
    pub fn release(&self, fid: u32) {
        let mut state = lock(&self.state);
        if !state.exhausted && fid.wrapping_add(1) == state.next {
            state.next = fid;
        }
    }
}
