//! Producer/consumer frame handoff.
//!
//! Two slots alternate between the producer (filling the back slot) and
//! the network thread (draining the front slot). In async mode there is a
//! single slot shared by both sides.
//!
//! ```text
//!   Empty ──acquire_write──▶ Filling ──release──▶ Ready
//!     ▲                                            │
//!     └──────release / drop── Draining ◀─acquire_read┘
//! ```
//!
//! Acquiring blocks while the wanted slot is in the wrong phase. After
//! `shutdown` every waiter wakes with [`WallError::Shutdown`].

use std::ops::{Deref, DerefMut};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use crate::error::{Result, WallError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotPhase {
    Empty,
    Filling,
    Ready,
    Draining,
}

struct Handoff {
    phases: Vec<SlotPhase>,
    back: usize,
    front: usize,
    shutdown: bool,
}

/// Double (or single, in async mode) buffered frame handoff.
pub struct DoubleBuffer<T> {
    slots: Vec<Mutex<T>>,
    state: Mutex<Handoff>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl<T> DoubleBuffer<T> {
    /// Two slots built by `make`, or one when `async_mode` is set.
    pub fn new(async_mode: bool, mut make: impl FnMut() -> Result<T>) -> Result<Self> {
        let count = if async_mode { 1 } else { 2 };
        let slots = (0..count)
            .map(|_| make().map(Mutex::new))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            slots,
            state: Mutex::new(Handoff {
                phases: vec![SlotPhase::Empty; count],
                back: 0,
                front: 0,
                shutdown: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Handoff> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_async(&self) -> bool {
        self.slots.len() == 1
    }

    pub fn phases(&self) -> Vec<SlotPhase> {
        self.lock().phases.clone()
    }

    /// Wait for the back slot to be free and start filling it.
    pub fn acquire_write(&self) -> Result<WriteSlot<'_, T>> {
        let mut st = self.lock();
        loop {
            if st.shutdown {
                return Err(WallError::Shutdown);
            }
            let back = st.back;
            if st.phases[back] == SlotPhase::Empty {
                st.phases[back] = SlotPhase::Filling;
                drop(st);
                return Ok(WriteSlot {
                    owner: self,
                    index: back,
                    guard: self.slots[back].lock().unwrap_or_else(PoisonError::into_inner),
                    published: false,
                });
            }
            st = self.not_full.wait(st).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Wait for the front slot to be ready and start draining it.
    pub fn acquire_read(&self) -> Result<ReadSlot<'_, T>> {
        let mut st = self.lock();
        loop {
            if st.shutdown {
                return Err(WallError::Shutdown);
            }
            let front = st.front;
            if st.phases[front] == SlotPhase::Ready {
                st.phases[front] = SlotPhase::Draining;
                drop(st);
                return Ok(ReadSlot {
                    owner: self,
                    index: front,
                    guard: self.slots[front].lock().unwrap_or_else(PoisonError::into_inner),
                });
            }
            st = self.not_empty.wait(st).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Publish the last frame again without new pixels (async mode only).
    ///
    /// Returns `false` when the slot is busy; the pending frame will carry
    /// the change anyway.
    pub fn resend(&self) -> Result<bool> {
        if !self.is_async() {
            return Err(WallError::Config("resend needs a single-slot buffer".into()));
        }
        let mut st = self.lock();
        if st.shutdown {
            return Err(WallError::Shutdown);
        }
        if st.phases[0] != SlotPhase::Empty {
            return Ok(false);
        }
        st.phases[0] = SlotPhase::Ready;
        drop(st);
        self.not_empty.notify_all();
        Ok(true)
    }

    /// Wake every waiter; further acquires fail.
    pub fn shutdown(&self) {
        self.lock().shutdown = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn is_shut_down(&self) -> bool {
        self.lock().shutdown
    }

    fn finish_write(&self, index: usize, published: bool) {
        let mut st = self.lock();
        if published {
            st.phases[index] = SlotPhase::Ready;
            st.back = (index + 1) % self.slots.len();
        } else {
            st.phases[index] = SlotPhase::Empty;
        }
        drop(st);
        if published {
            self.not_empty.notify_all();
        } else {
            self.not_full.notify_all();
        }
    }

    fn finish_read(&self, index: usize) {
        let mut st = self.lock();
        st.phases[index] = SlotPhase::Empty;
        st.front = (index + 1) % self.slots.len();
        drop(st);
        self.not_full.notify_all();
    }
}

// ── Slot guards ──────────────────────────────────────────────────

/// Exclusive access to the back slot. Dropping it without
/// [`release`](Self::release) discards the frame.
pub struct WriteSlot<'a, T> {
    owner: &'a DoubleBuffer<T>,
    index: usize,
    guard: MutexGuard<'a, T>,
    published: bool,
}

impl<T> WriteSlot<'_, T> {
    /// Mark the frame ready for the consumer.
    pub fn release(mut self) {
        self.published = true;
    }
}

impl<T> Deref for WriteSlot<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for WriteSlot<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for WriteSlot<'_, T> {
    fn drop(&mut self) {
        self.owner.finish_write(self.index, self.published);
    }
}

/// Exclusive access to the front slot; releasing (or dropping) it frees the
/// slot for the producer.
pub struct ReadSlot<'a, T> {
    owner: &'a DoubleBuffer<T>,
    index: usize,
    guard: MutexGuard<'a, T>,
}

impl<T> ReadSlot<'_, T> {
    pub fn release(self) {}
}

impl<T> Deref for ReadSlot<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for ReadSlot<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for ReadSlot<'_, T> {
    fn drop(&mut self) {
        self.owner.finish_read(self.index);
    }
}

// ── Tests ────────────────────────────────────────────────────────
