//! Variable-increment FIFO counting resource
//!
//! Unlike a standard semaphore, one acquisition may take any amount in
//! `1..=max`, so a single reservation can stand for "N blocks' worth" of a
//! shared budget. Waiters are admitted strictly in arrival order: a head
//! waiter that does not fit blocks everyone behind it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use sdrive_core::{TransferError, TransferResult};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

struct Waiter {
    id: u64,
    amount: usize,
    grant: oneshot::Sender<()>,
}

#[derive(Default)]
struct State {
    usage: usize,
    next_id: u64,
    waiters: VecDeque<Waiter>,
}

impl State {
    /// Admit head waiters while they fit.
    fn grant_waiters(&mut self, max: usize) {
        while let Some(head) = self.waiters.front() {
            if self.usage + head.amount > max {
                break;
            }
            let Some(waiter) = self.waiters.pop_front() else {
                break;
            };
            // A waiter whose future is gone takes nothing.
            if waiter.grant.send(()).is_ok() {
                self.usage += waiter.amount;
            }
        }
    }
}

pub struct FifoResource {
    max: usize,
    state: Mutex<State>,
}

impl std::fmt::Debug for FifoResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("FifoResource")
            .field("max", &self.max)
            .field("usage", &state.usage)
            .field("waiters", &state.waiters.len())
            .finish()
    }
}

impl FifoResource {
    /// A resource with capacity `max` (at least 1).
    pub fn new(max: usize) -> Self {
        Self {
            max: max.max(1),
            state: Mutex::new(State::default()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.max
    }

    pub fn usage(&self) -> usize {
        self.lock().usage
    }

    pub fn waiting(&self) -> usize {
        self.lock().waiters.len()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_amount(&self, amount: usize) -> TransferResult<()> {
        if amount == 0 || amount > self.max {
            return Err(TransferError::InvalidAmount {
                amount,
                max: self.max,
            });
        }
        Ok(())
    }

    /// Take `amount` without waiting. `Ok(false)` when it does not fit or
    /// others are already queued.
    pub fn try_acquire(&self, amount: usize) -> TransferResult<bool> {
        self.check_amount(amount)?;
        let mut state = self.lock();
        if state.waiters.is_empty() && state.usage + amount <= self.max {
            state.usage += amount;
            return Ok(true);
        }
        Ok(false)
    }

    /// Wait in line for `amount`.
    ///
    /// Cancellation removes this waiter from the queue without disturbing
    /// the others; if the grant raced with cancellation, the amount is
    /// handed back.
    pub async fn acquire(&self, amount: usize, cancel: &CancellationToken) -> TransferResult<()> {
        self.check_amount(amount)?;

        let (id, granted) = {
            let mut state = self.lock();
            if state.waiters.is_empty() && state.usage + amount <= self.max {
                state.usage += amount;
                return Ok(());
            }
            if cancel.is_cancelled() {
                return Err(TransferError::Cancelled);
            }
            let id = state.next_id;
            state.next_id += 1;
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(Waiter {
                id,
                amount,
                grant: tx,
            });
            (id, rx)
        };

        let mut guard = QueuedWaiter {
            resource: self,
            id,
            amount,
            armed: true,
        };

        tokio::select! {
            biased;
            result = granted => {
                guard.armed = false;
                result.map_err(|_| TransferError::Cancelled)
            }
            _ = cancel.cancelled() => Err(TransferError::Cancelled),
        }
    }

    /// Return `amount`, floored at zero usage, and wake waiters that now fit.
    pub fn release(&self, amount: usize) {
        if amount == 0 {
            return;
        }
        let mut state = self.lock();
        state.usage = state.usage.saturating_sub(amount);
        state.grant_waiters(self.max);
    }

    pub async fn acquire_owned(
        self: &Arc<Self>,
        amount: usize,
        cancel: &CancellationToken,
    ) -> TransferResult<FifoPermit> {
        self.acquire(amount, cancel).await?;
        Ok(FifoPermit::new(Arc::clone(self), amount))
    }

    pub fn try_acquire_owned(self: &Arc<Self>, amount: usize) -> TransferResult<Option<FifoPermit>> {
        Ok(self
            .try_acquire(amount)?
            .then(|| FifoPermit::new(Arc::clone(self), amount)))
    }
}

/// Removes a queued waiter, or gives back its grant, if `acquire` does not
/// complete normally.
struct QueuedWaiter<'a> {
    resource: &'a FifoResource,
    id: u64,
    amount: usize,
    armed: bool,
}

impl Drop for QueuedWaiter<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut state = self.resource.lock();
        if let Some(pos) = state.waiters.iter().position(|w| w.id == self.id) {
            state.waiters.remove(pos);
        } else {
            // Granted while being cancelled.
            state.usage = state.usage.saturating_sub(self.amount);
        }
        state.grant_waiters(self.resource.max);
    }
}

/// An owned grant on a [`FifoResource`]. Whatever has not been released
/// explicitly is returned on drop.
pub struct FifoPermit {
    resource: Arc<FifoResource>,
    remaining: AtomicUsize,
}

impl FifoPermit {
    fn new(resource: Arc<FifoResource>, amount: usize) -> Self {
        Self {
            resource,
            remaining: AtomicUsize::new(amount),
        }
    }

    pub fn remaining(&self) -> usize {
        self.remaining.load(Ordering::Acquire)
    }

    /// Hand back up to `amount` of this grant early. Returns what was released.
    pub fn release(&self, amount: usize) -> usize {
        let mut current = self.remaining.load(Ordering::Acquire);
        loop {
            let take = amount.min(current);
            if take == 0 {
                return 0;
            }
            match self.remaining.compare_exchange(
                current,
                current - take,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.resource.release(take);
                    return take;
                }
                Err(actual) => current = actual,
            }
        }
    }
}

impl Drop for FifoPermit {
    fn drop(&mut self) {
        let rest = *self.remaining.get_mut();
        if rest > 0 {
            self.resource.release(rest);
        }
    }
}

impl std::fmt::Debug for FifoPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FifoPermit")
            .field("remaining", &self.remaining())
            .finish()
    }
}
