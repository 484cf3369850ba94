//! Ordering multiplexer: hands out one [`ResultHandle`] per request of a batch.
//!
//! [`Fanout`] is a lazy iterator. Every call to `next()` creates (at most) one pending slot and
//! returns the oldest handle that has not been handed out yet. Completions coming back from the
//! dispatcher settle the slots, and which slot a completion settles depends on the state at
//! that instant:
//!
//! - **Streaming**: while not every slot has been created, a completion settles the oldest
//!   unsettled slot. A caller that awaits each handle before pulling the next one therefore
//!   gets the responses fastest first.
//! - **Positional**: once every slot has been created and none has been settled, a completion
//!   settles the slot at its own batch index. A caller that collects all handles before
//!   awaiting any of them can address each response by the position of its request.
//!
//! A completion that arrives before the caller pulled anything creates the slot itself; the
//! settled handle is then returned by a later pull.

use crate::dispatch::{BatchId, Dispatch, Outcome};
use crate::errors::FanoutError;
use crate::lock;
use std::collections::VecDeque;
use std::future::Future;
use std::iter::FusedIterator;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::sync::oneshot;

/// Awaitable outcome of one request of a batch.
///
/// Resolves to the response, or to the error of the request the slot was settled with. Which
/// request that is depends on how the batch is consumed (see the [module docs](self)).
#[derive(Debug)]
pub struct ResultHandle {
    rx: oneshot::Receiver<Outcome>,
}

impl Future for ResultHandle {
    type Output = Outcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or_else(|_| Err(FanoutError::Abandoned)))
    }
}

/// Lifecycle of a batch's handle sequence
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Phase {
    /// Nothing pulled yet, nothing dispatched
    Created,
    /// Dispatched, not every slot has been created yet
    SlotsPending,
    /// Every slot has been created, some handles still wait to be handed out
    Draining,
    /// Every handle has been handed out
    Exhausted,
}

/// Slot and queue bookkeeping of one batch
#[derive(Debug)]
pub(crate) struct Slots {
    asked: usize,
    made: usize,
    phase: Phase,
    /// Unsettled slots in creation order. Positional settling leaves a `None` behind.
    pending: VecDeque<Option<oneshot::Sender<Outcome>>>,
    /// Handles created but not handed out yet
    ready: VecDeque<ResultHandle>,
    /// Batch indices whose outcome has been delivered
    finalized: Vec<bool>,
}

impl Slots {
    pub(crate) fn new(asked: usize) -> Self {
        Self {
            asked,
            made: 0,
            phase: Phase::Created,
            pending: VecDeque::with_capacity(asked),
            ready: VecDeque::with_capacity(asked),
            finalized: vec![false; asked],
        }
    }

    pub(crate) fn phase(&self) -> Phase {
        self.phase
    }

    /// Number of handles not yet handed out
    pub(crate) fn remaining(&self) -> usize {
        self.asked - self.made + self.ready.len()
    }

    pub(crate) fn mark_dispatched(&mut self) {
        if self.phase == Phase::Created {
            self.phase = if self.made < self.asked {
                Phase::SlotsPending
            } else {
                Phase::Draining
            };
        }
    }

    fn make_slot(&mut self) {
        if self.made >= self.asked {
            return;
        }

        let (tx, rx) = oneshot::channel();
        self.pending.push_back(Some(tx));
        self.ready.push_back(ResultHandle { rx });
        self.made += 1;

        if self.made == self.asked {
            self.phase = Phase::Draining;
        }
    }

    /// Creates the next slot (if any are left) and hands out the oldest waiting handle.
    pub(crate) fn advance(&mut self) -> Option<ResultHandle> {
        self.make_slot();

        let handle = self.ready.pop_front();
        if self.made == self.asked && self.ready.is_empty() {
            self.phase = Phase::Exhausted;
        }
        handle
    }

    /// Settles a slot with the outcome of the request at `index`.
    pub(crate) fn settle(&mut self, index: usize, outcome: Outcome) {
        match self.finalized.get(index) {
            Some(false) => {}
            Some(true) => {
                log::trace!("request {index}: duplicate completion ignored");
                return;
            }
            None => {
                log::warn!("request {index}: completion outside of a batch of {}", self.asked);
                return;
            }
        }

        if self.pending.is_empty() {
            self.make_slot();
        }

        let slot = if self.pending.len() == self.asked {
            log::trace!("request {index}: settling positionally");
            self.pending.get_mut(index).and_then(Option::take)
        } else {
            log::trace!("request {index}: settling oldest pending slot");
            std::iter::from_fn(|| self.pending.pop_front()).flatten().next()
        };

        self.finalized[index] = true;

        match slot {
            Some(tx) => {
                // The caller may have dropped the handle already
                let _ = tx.send(outcome);
            }
            None => log::warn!("request {index}: no pending slot left to settle"),
        }
    }
}

/// Lazy sequence of result handles for one batch. Created by [`fanout`](crate::fanout).
///
/// The batch is dispatched when the first handle is pulled. The sequence yields exactly as many
/// handles as the batch has requests, then `None` forever.
pub struct Fanout {
    id: BatchId,
    slots: Arc<Mutex<Slots>>,
    dispatch: Option<Dispatch>,
}

impl Fanout {
    pub(crate) fn new(dispatch: Dispatch) -> Self {
        Self {
            id: dispatch.id(),
            slots: Arc::new(Mutex::new(Slots::new(dispatch.len()))),
            dispatch: Some(dispatch),
        }
    }

    pub fn id(&self) -> BatchId {
        self.id
    }

    pub fn phase(&self) -> Phase {
        lock(&self.slots).phase()
    }
}

impl Iterator for Fanout {
    type Item = ResultHandle;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(dispatch) = self.dispatch.take() {
            lock(&self.slots).mark_dispatched();

            let slots = Arc::clone(&self.slots);
            dispatch.run(Arc::new(move |index: usize, outcome: Outcome| {
                lock(&slots).settle(index, outcome);
            }));
        }

        lock(&self.slots).advance()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = lock(&self.slots).remaining();
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for Fanout {}

impl FusedIterator for Fanout {}

impl std::fmt::Debug for Fanout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fanout")
            .field("id", &self.id)
            .field("slots", &*lock(&self.slots))
            .finish()
    }
}
