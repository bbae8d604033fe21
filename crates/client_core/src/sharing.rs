//! Keeps one store subscription alive on behalf of any number of consumers.
//!
//! Phases: `Idle` (no upstream) -> `Active` (consumers attached) ->
//! `Draining` (last consumer left, grace timer running) -> `Idle`. An attach
//! during `Draining` returns to `Active` on the same upstream. The latest
//! snapshot survives every phase, so a late consumer starts from it.

use std::{
    mem,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
    time::Duration,
};

use futures::StreamExt;
use shared::domain::{empty_snapshot, Item, Snapshot};
use storage::ItemStore;
use tokio::{runtime::Handle, sync::watch, task::JoinHandle};
use tracing::{debug, error};

enum Phase {
    Idle,
    Active {
        upstream: JoinHandle<()>,
    },
    Draining {
        upstream: JoinHandle<()>,
        timer: JoinHandle<()>,
    },
}

struct SharingState {
    consumers: usize,
    phase: Phase,
    // Bumped whenever a drain starts or is interrupted, so a stale timer
    // cannot tear down a newer upstream.
    generation: u64,
}

struct SharedInner {
    store: Arc<dyn ItemStore>,
    runtime: Handle,
    grace: Duration,
    latest: Arc<watch::Sender<Snapshot>>,
    state: Mutex<SharingState>,
}

pub(crate) struct SharedList {
    inner: Arc<SharedInner>,
}

impl SharedList {
    pub(crate) fn new(store: Arc<dyn ItemStore>, runtime: Handle, grace: Duration) -> Self {
        let (latest, _) = watch::channel(empty_snapshot());
        Self {
            inner: Arc::new(SharedInner {
                store,
                runtime,
                grace,
                latest: Arc::new(latest),
                state: Mutex::new(SharingState {
                    consumers: 0,
                    phase: Phase::Idle,
                    generation: 0,
                }),
            }),
        }
    }

    pub(crate) fn attach(&self) -> ListSubscription {
        SharedInner::attach(&self.inner)
    }

    pub(crate) fn latest(&self) -> Snapshot {
        self.inner.latest.borrow().clone()
    }

    pub(crate) fn is_upstream_active(&self) -> bool {
        match &self.inner.lock_state().phase {
            Phase::Idle => false,
            Phase::Active { upstream } | Phase::Draining { upstream, .. } => {
                !upstream.is_finished()
            }
        }
    }
}

impl SharedInner {
    fn lock_state(&self) -> MutexGuard<'_, SharingState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn attach(this: &Arc<Self>) -> ListSubscription {
        let mut state = this.lock_state();
        state.consumers += 1;

        state.phase = match mem::replace(&mut state.phase, Phase::Idle) {
            Phase::Idle => {
                debug!("shared list idle -> active");
                Phase::Active {
                    upstream: this.spawn_upstream(),
                }
            }
            Phase::Active { upstream } => Phase::Active {
                upstream: this.restart_if_finished(upstream),
            },
            Phase::Draining { upstream, timer } => {
                timer.abort();
                state.generation += 1;
                debug!("shared list draining -> active");
                Phase::Active {
                    upstream: this.restart_if_finished(upstream),
                }
            }
        };
        drop(state);

        ListSubscription {
            receiver: this.latest.subscribe(),
            shared: Arc::clone(this),
        }
    }

    fn detach(this: &Arc<Self>) {
        let mut state = this.lock_state();
        state.consumers = state.consumers.saturating_sub(1);
        if state.consumers > 0 {
            return;
        }

        state.phase = match mem::replace(&mut state.phase, Phase::Idle) {
            Phase::Active { upstream } if this.grace.is_zero() => {
                upstream.abort();
                debug!("shared list active -> idle");
                Phase::Idle
            }
            Phase::Active { upstream } => {
                state.generation += 1;
                let timer = this.runtime.spawn(expire(
                    Arc::downgrade(this),
                    state.generation,
                    this.grace,
                ));
                debug!(grace_ms = this.grace.as_millis() as u64, "shared list active -> draining");
                Phase::Draining { upstream, timer }
            }
            other => other,
        };
    }

    fn restart_if_finished(&self, upstream: JoinHandle<()>) -> JoinHandle<()> {
        if upstream.is_finished() {
            debug!("store subscription ended; resubscribing");
            self.spawn_upstream()
        } else {
            upstream
        }
    }

    fn spawn_upstream(&self) -> JoinHandle<()> {
        self.runtime
            .spawn(forward_snapshots(Arc::clone(&self.store), Arc::clone(&self.latest)))
    }
}

impl Drop for SharedInner {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        match mem::replace(&mut state.phase, Phase::Idle) {
            Phase::Idle => {}
            Phase::Active { upstream } => upstream.abort(),
            Phase::Draining { upstream, timer } => {
                upstream.abort();
                timer.abort();
            }
        }
    }
}

async fn forward_snapshots(store: Arc<dyn ItemStore>, latest: Arc<watch::Sender<Snapshot>>) {
    let mut snapshots = match store.observe_all().await {
        Ok(snapshots) => snapshots,
        Err(err) => {
            error!(error = %err, "failed to subscribe to item store");
            return;
        }
    };

    while let Some(snapshot) = snapshots.next().await {
        latest.send_if_modified(|current| {
            if *current == snapshot {
                return false;
            }
            *current = snapshot;
            true
        });
    }
    debug!("item store stream ended");
}

async fn expire(shared: Weak<SharedInner>, generation: u64, grace: Duration) {
    tokio::time::sleep(grace).await;
    let Some(shared) = shared.upgrade() else {
        return;
    };

    let mut state = shared.lock_state();
    if state.generation != generation || state.consumers > 0 {
        return;
    }
    state.phase = match mem::replace(&mut state.phase, Phase::Idle) {
        Phase::Draining { upstream, .. } => {
            upstream.abort();
            debug!("shared list draining -> idle");
            Phase::Idle
        }
        other => other,
    };
}

/// One attached consumer of the live list. Dropping it detaches; cloning
/// attaches another consumer.
pub struct ListSubscription {
    receiver: watch::Receiver<Snapshot>,
    shared: Arc<SharedInner>,
}

impl ListSubscription {
    pub fn latest(&self) -> Snapshot {
        self.receiver.borrow().clone()
    }

    /// Waits for the next snapshot that differs from the last one seen.
    pub async fn changed(&mut self) -> Option<Snapshot> {
        self.receiver.changed().await.ok()?;
        Some(self.receiver.borrow_and_update().clone())
    }

    /// Waits until the list satisfies `predicate`, checking the current value
    /// first.
    pub async fn wait_for(&mut self, mut predicate: impl FnMut(&[Item]) -> bool) -> Option<Snapshot> {
        self.receiver
            .wait_for(|snapshot| predicate(snapshot))
            .await
            .ok()
            .map(|snapshot| snapshot.clone())
    }
}

impl Clone for ListSubscription {
    fn clone(&self) -> Self {
        SharedInner::attach(&self.shared)
    }
}

impl Drop for ListSubscription {
    fn drop(&mut self) {
        SharedInner::detach(&self.shared);
    }
}
