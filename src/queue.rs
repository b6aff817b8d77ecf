//! Bounded FIFO queue with suspending take
//!
//! Items, waiting takers and blocked offerers are three FIFO lists.
//! `offer` hands its value to the longest-waiting taker when one exists,
//! enqueues while under capacity, and otherwise suspends the offerer until
//! a take frees a slot. At any quiescent moment at most one of
//! items/takers is non-empty.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use crate::effect::{wrap, Eff, RawEff};
use crate::latch::RawLatch;
use crate::runtime::Runtime;

struct QueueState<A> {
    capacity: usize,
    items: VecDeque<A>,
    /// Suspended takers, longest-waiting first.
    takers: VecDeque<RawLatch>,
    /// Offerers parked on a full queue, with their pending items.
    offerers: VecDeque<(A, RawLatch)>,
}

/// A bounded multi-producer multi-consumer FIFO.
pub struct Queue<A> {
    state: Rc<RefCell<QueueState<A>>>,
}

impl<A> Clone for Queue<A> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<A> Queue<A>
where
    A: Clone + 'static,
{
    /// A queue holding at most `capacity` items.
    pub fn bounded(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be positive");
        Self {
            state: Rc::new(RefCell::new(QueueState {
                capacity,
                items: VecDeque::new(),
                takers: VecDeque::new(),
                offerers: VecDeque::new(),
            })),
        }
    }

    /// A queue bounded only by memory.
    pub fn unbounded() -> Self {
        Self::bounded(usize::MAX)
    }

    pub fn capacity(&self) -> usize {
        self.state.borrow().capacity
    }

    /// Number of buffered items. A snapshot, not synchronized with
    /// in-flight takes.
    pub fn len(&self) -> usize {
        self.state.borrow().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the buffered items in FIFO order.
    pub fn items(&self) -> Vec<A> {
        self.state.borrow().items.iter().cloned().collect()
    }

    /// Insert a value: hand it to a waiting taker, buffer it under
    /// capacity, or suspend until a take frees a slot.
    pub fn offer<E, R>(&self, value: A) -> Eff<(), E, R>
    where
        E: Clone + 'static,
        R: 'static,
    {
        let state = self.state.clone();
        Eff::runtime().and_then(move |rt: Runtime| {
            let state = state.clone();
            let value = value.clone();
            Eff::from_raw(RawEff::Suspend(Rc::new(move || {
                let mut st = state.borrow_mut();
                if let Some(taker) = st.takers.pop_front() {
                    drop(st);
                    taker.set_now(RawEff::Succeed(wrap(value.clone())), &rt);
                    RawEff::Succeed(wrap(()))
                } else if st.items.len() < st.capacity {
                    st.items.push_back(value.clone());
                    RawEff::Succeed(wrap(()))
                } else {
                    let parked = RawLatch::new();
                    st.offerers.push_back((value.clone(), parked.clone()));
                    parked.get_raw()
                }
            })))
        })
    }

    /// Remove the oldest value, suspending while the queue is empty. A
    /// completed take admits the longest-parked offerer, if any.
    pub fn take<E, R>(&self) -> Eff<A, E, R>
    where
        E: Clone + 'static,
        R: 'static,
    {
        let state = self.state.clone();
        Eff::runtime().and_then(move |rt: Runtime| {
            let state = state.clone();
            Eff::from_raw(RawEff::Suspend(Rc::new(move || {
                let mut st = state.borrow_mut();
                if let Some(item) = st.items.pop_front() {
                    let admitted = st.offerers.pop_front();
                    if let Some((parked_value, parked)) = admitted {
                        st.items.push_back(parked_value);
                        drop(st);
                        parked.set_now(RawEff::Succeed(wrap(())), &rt);
                    }
                    RawEff::Succeed(wrap(item))
                } else {
                    let taker = RawLatch::new();
                    st.takers.push_back(taker.clone());
                    taker.get_raw()
                }
            })))
        })
    }

    /// `count` takes, collected in arrival order.
    pub fn take_n<E, R>(&self, count: usize) -> Eff<Vec<A>, E, R>
    where
        E: Clone + 'static,
        R: 'static,
    {
        let queue = self.clone();
        (0..count).fold(Eff::succeed(Vec::new()), move |acc, _| {
            let queue = queue.clone();
            acc.and_then(move |collected: Vec<A>| {
                queue.take().map(move |item| {
                    let mut collected = collected.clone();
                    collected.push(item);
                    collected
                })
            })
        })
    }
}
