//! Idle-object reaper
//!
//! A [`Reaper`] calls back when an entry is not refreshed within the expiry
//! interval. Entries are kept in most-recently-refreshed-first order, so a
//! reaping pass scans from the oldest entry and stops at the first one that
//! has not expired.
//!
//! Concurrency contract:
//!
//! - a callback fires at most once per entry;
//! - once [`ReapItem::cancel`] returns, the callback has either already
//!   completed or will never run. The cancel path rendezvouses with an
//!   in-flight reaping pass through a condition variable, which is what
//!   allows the owner of a reap item to be deallocated immediately after
//!   cancelling;
//! - callbacks are invoked with no lock held, so a callback may refresh or
//!   cancel reap items (including its own) without deadlocking;
//! - a panic in a callback is confined to that callback.
//!
//! The list holds the entries; a [`ReapItem`] holds a weak handle to the
//! reaper, so neither side keeps the other alive.

use crate::error::{MiddlewareError, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};
use tracing::warn;

/// What happens to pending entries when the reaper is destroyed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestroyPolicy {
    /// Pending callbacks are skipped (default)
    NoCallbackOnDestroy,
    /// All remaining callbacks fire once, in one final pass
    CallbackOnDestroy,
}

type Callback = Box<dyn FnOnce() + Send>;

struct EntryState {
    cancelled: bool,
    /// Key of this entry in the reap list; reassigned on refresh
    seq: u64,
    timestamp: Instant,
    callback: Option<Callback>,
}

struct ReapEntry {
    state: Mutex<EntryState>,
}

struct ListState {
    /// Ascending seq == least-recently-refreshed first
    entries: BTreeMap<u64, Arc<ReapEntry>>,
    next_seq: u64,
    finish: bool,
}

struct ReapFlag {
    in_progress: bool,
    thread_id: Option<ThreadId>,
}

struct ReaperCore {
    reap_interval: Duration,
    expiry_interval: Duration,
    policy: DestroyPolicy,
    list: Mutex<ListState>,
    work: Condvar,
    flag: Mutex<ReapFlag>,
    reap_done: Condvar,
}

/// Generic LRU timeout manager
pub struct Reaper {
    core: Arc<ReaperCore>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Reaper {
    /// Create a reaper that makes at most one pass per `reap_interval` and
    /// expires entries not refreshed within `expiry_interval`.
    pub fn new(
        reap_interval: Duration,
        expiry_interval: Duration,
        policy: DestroyPolicy,
    ) -> Result<Arc<Reaper>> {
        if reap_interval.is_zero() {
            return Err(MiddlewareError::Logic(
                "Reaper: reap_interval must be greater than zero".into(),
            ));
        }
        if reap_interval > expiry_interval {
            return Err(MiddlewareError::Logic(format!(
                "Reaper: reap_interval ({:?}) must not exceed expiry_interval ({:?})",
                reap_interval, expiry_interval
            )));
        }

        let core = Arc::new(ReaperCore {
            reap_interval,
            expiry_interval,
            policy,
            list: Mutex::new(ListState {
                entries: BTreeMap::new(),
                next_seq: 0,
                finish: false,
            }),
            work: Condvar::new(),
            flag: Mutex::new(ReapFlag {
                in_progress: false,
                thread_id: None,
            }),
            reap_done: Condvar::new(),
        });

        let worker_core = Arc::clone(&core);
        let worker = thread::Builder::new()
            .name("reaper".into())
            .spawn(move || reap_loop(worker_core))
            .map_err(MiddlewareError::Io)?;

        Ok(Arc::new(Reaper {
            core,
            worker: Mutex::new(Some(worker)),
        }))
    }

    /// Add an entry. If it is not refreshed within the expiry interval the
    /// callback fires, and the entry is removed.
    pub fn add<F>(&self, callback: F) -> Result<ReapItem>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut list = self.core.list.lock();
        if list.finish {
            return Err(MiddlewareError::Logic(
                "Reaper: cannot add entry to destroyed reaper".into(),
            ));
        }

        let seq = list.next_seq;
        list.next_seq += 1;
        let entry = Arc::new(ReapEntry {
            state: Mutex::new(EntryState {
                cancelled: false,
                seq,
                timestamp: Instant::now(),
                callback: Some(Box::new(callback)),
            }),
        });
        list.entries.insert(seq, Arc::clone(&entry));
        if list.entries.len() == 1 {
            // Wake the worker out of its empty-list wait.
            self.core.work.notify_one();
        }

        Ok(ReapItem {
            core: Arc::downgrade(&self.core),
            entry,
        })
    }

    pub fn size(&self) -> usize {
        self.core.list.lock().entries.len()
    }

    /// Stop the worker thread. With `CallbackOnDestroy`, all remaining
    /// callbacks fire in one final pass first. Idempotent; blocks until
    /// the worker has exited.
    pub fn destroy(&self) {
        {
            let mut list = self.core.list.lock();
            if !list.finish {
                list.finish = true;
                self.core.work.notify_all();
            }
        }
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            let _ = worker.join();
        }
    }
}

impl Drop for Reaper {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Per-entry ticket returned by [`Reaper::add`]
///
/// Dropping the ticket cancels the entry.
pub struct ReapItem {
    core: Weak<ReaperCore>,
    entry: Arc<ReapEntry>,
}

impl ReapItem {
    /// Reset the entry's idle clock and move it to the fresh end of the
    /// list.
    pub fn refresh(&self) {
        match self.core.upgrade() {
            Some(core) => {
                let mut list = core.list.lock();
                let mut state = self.entry.state.lock();
                if state.cancelled {
                    // A reaping pass got here first.
                    return;
                }
                let old_seq = state.seq;
                let new_seq = list.next_seq;
                list.next_seq += 1;
                state.seq = new_seq;
                state.timestamp = Instant::now();
                drop(state);
                if let Some(entry) = list.entries.remove(&old_seq) {
                    list.entries.insert(new_seq, entry);
                }
            }
            None => {
                // The reaper has gone away; disable ourselves.
                self.entry.state.lock().cancelled = true;
            }
        }
    }

    /// Remove the entry so its callback never fires.
    ///
    /// If a reaping pass is running on another thread, this blocks until
    /// the pass (including its callbacks) has completed, so the caller may
    /// rely on the callback never executing after cancel() returns. Called
    /// from within a callback on the reap thread itself, it returns without
    /// waiting.
    pub fn cancel(&self) {
        match self.core.upgrade() {
            Some(core) => {
                let mut flag = core.flag.lock();
                if flag.thread_id != Some(thread::current().id()) {
                    while flag.in_progress {
                        core.reap_done.wait(&mut flag);
                    }
                }
                // Hold the flag lock so no new reaping pass can begin while
                // the entry is being cancelled.
                let mut list = core.list.lock();
                let mut state = self.entry.state.lock();
                if state.cancelled {
                    return;
                }
                state.cancelled = true;
                state.callback = None;
                let seq = state.seq;
                drop(state);
                list.entries.remove(&seq);
            }
            None => {
                let mut state = self.entry.state.lock();
                state.cancelled = true;
                state.callback = None;
            }
        }
    }
}

impl Drop for ReapItem {
    fn drop(&mut self) {
        self.cancel();
    }
}

fn reap_loop(core: Arc<ReaperCore>) {
    core.flag.lock().thread_id = Some(thread::current().id());

    let mut list = core.list.lock();
    loop {
        if list.entries.is_empty() {
            // Nothing to reap; no point in waking periodically.
            while list.entries.is_empty() && !list.finish {
                core.work.wait(&mut list);
            }
        } else {
            // The first-to-expire entry is at the ascending-order front.
            // Sleep long enough for it to get a chance to expire, but at
            // least reap_interval so there is at most one pass per
            // reap_interval.
            let oldest_timestamp = {
                let entry = list.entries.values().next().expect("non-empty list");
                let state = entry.state.lock();
                state.timestamp
            };
            let age = oldest_timestamp.elapsed();
            let sleep = core
                .expiry_interval
                .saturating_sub(age)
                .max(core.reap_interval);
            let deadline = Instant::now() + sleep;
            while !list.finish {
                if core.work.wait_until(&mut list, deadline).timed_out() {
                    break;
                }
            }
        }

        if list.finish && core.policy == DestroyPolicy::NoCallbackOnDestroy {
            return;
        }

        let mut zombies: Vec<Arc<ReapEntry>> = Vec::new();
        if list.finish {
            // Final pass for CallbackOnDestroy: everything goes.
            zombies.extend(list.entries.values().cloned());
        } else {
            let now = Instant::now();
            for entry in list.entries.values() {
                let timestamp = entry.state.lock().timestamp;
                if now < timestamp + core.expiry_interval {
                    break; // LRU order: everything after this is younger
                }
                zombies.push(Arc::clone(entry));
            }
        }

        // Callbacks are made outside the list lock so they can call back
        // into the reaper.
        drop(list);
        remove_zombies(&core, zombies);
        list = core.list.lock();

        if list.finish {
            return;
        }
    }
}

fn remove_zombies(core: &Arc<ReaperCore>, zombies: Vec<Arc<ReapEntry>>) {
    // in_progress keeps ReapItem::cancel() from returning before the
    // callbacks of this pass have completed.
    {
        let mut flag = core.flag.lock();
        flag.in_progress = true;
    }

    for entry in zombies {
        let mut list = core.list.lock();
        let mut state = entry.state.lock();
        if state.cancelled {
            // cancel() won the race during this pass.
            continue;
        }
        state.cancelled = true;
        let seq = state.seq;
        let callback = state.callback.take();
        drop(state);
        list.entries.remove(&seq);
        drop(list);

        if let Some(callback) = callback {
            if catch_unwind(AssertUnwindSafe(callback)).is_err() {
                // A buggy timeout handler must not take down the reap
                // thread.
                warn!("reaper: expiry callback panicked");
            }
        }
    }

    let mut flag = core.flag.lock();
    flag.in_progress = false;
    core.reap_done.notify_all();
}
