//! The rotation barrier: quiesce every in-flight fetch, swap the network
//! identity once, release everyone
//!
//! Workers bracket each network call with a [`FetchPermit`]. A worker that
//! sees a challenge page (or finds a barrier already forming when it arrives)
//! joins the waiting set and parks. The last in-flight worker to join closes
//! the barrier and wakes the coordinator routine, which performs the blocking
//! interface reset and then releases all waiters at once. A released worker
//! redoes its fetch from scratch against the new identity; nothing is
//! preserved mid-flight.
//!
//! State machine: IDLE -> BARRIER_FORMING -> ROTATING -> IDLE.

mod interface;

pub use interface::{IdentityRotator, PppRotator};

use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct BarrierState {
    /// Workers currently inside a network call (waiters included).
    in_flight: usize,
    /// Workers parked awaiting rotation. Invariant while a rotation is
    /// pending: waiting <= in_flight.
    waiting: usize,
    /// Completed rotations. A parked worker resumes when this moves past the
    /// value it read while joining the waiting set.
    generation: u64,
}

/// Shared barrier coordinating fetch workers against one disruptive global
/// action. Cheap to clone via `Arc`; every pool that fetches through the same
/// network identity must share one instance.
pub struct RotationCoordinator {
    state: Mutex<BarrierState>,
    /// Signals the coordinator routine that the waiting set is complete.
    barrier_closed: Notify,
    /// Broadcast to waiters after each completed rotation.
    released: Notify,
}

impl Default for RotationCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl RotationCoordinator {
    pub fn new() -> Self {
        RotationCoordinator {
            state: Mutex::new(BarrierState::default()),
            barrier_closed: Notify::new(),
            released: Notify::new(),
        }
    }

    /// Enters the fetch-critical section.
    ///
    /// If a barrier is already forming, the caller joins the waiting set
    /// before issuing its request and only proceeds once the pending rotation
    /// completes. Drop the permit when the network call is done.
    pub async fn begin_fetch(self: &Arc<Self>) -> FetchPermit {
        let must_wait = {
            let mut state = self.state.lock().unwrap();
            state.in_flight += 1;
            state.waiting > 0
        };
        if must_wait {
            self.park().await;
        }
        FetchPermit {
            coordinator: Arc::clone(self),
        }
    }

    /// Joins the waiting set (challenge observed) and parks until the next
    /// rotation completes. Call only while holding a [`FetchPermit`].
    pub async fn await_rotation(&self) {
        self.park().await;
    }

    async fn park(&self) {
        // the generation snapshot and the waiting increment happen under one
        // lock: a worker wiped into a new barrier by a concurrent reset reads
        // the already-bumped generation and keeps waiting for the next one
        let my_generation = {
            let mut state = self.state.lock().unwrap();
            state.waiting += 1;
            if state.waiting == state.in_flight {
                self.barrier_closed.notify_one();
            }
            state.generation
        };
        loop {
            let released = self.released.notified();
            tokio::pin!(released);
            // register interest before re-checking, a broadcast in between
            // must not be lost
            released.as_mut().enable();
            if self.state.lock().unwrap().generation > my_generation {
                return;
            }
            released.await;
        }
    }

    /// Number of completed rotations so far.
    pub fn generation(&self) -> u64 {
        self.state.lock().unwrap().generation
    }

    fn leave_fetch(&self) {
        let mut state = self.state.lock().unwrap();
        state.in_flight -= 1;
        if state.waiting > 0 && state.waiting == state.in_flight {
            self.barrier_closed.notify_one();
        }
    }

    /// The coordinator routine. Runs forever: waits for a barrier to close,
    /// asserts the barrier invariant, performs the rotation, releases the
    /// waiters. Spawn exactly one per coordinator instance.
    ///
    /// A signal observed while `waiting < in_flight` means a worker is still
    /// in transit between counters or the signal went stale after a reset;
    /// the barrier is simply not closed yet and the routine keeps waiting.
    /// `waiting > in_flight` can never happen with intact counters: rotating
    /// on corrupt counters would pull the identity out from under a live
    /// request, so the routine logs at error level and halts rotation
    /// permanently. Parked workers then stall by design.
    pub async fn run(self: Arc<Self>, rotator: Arc<dyn IdentityRotator>) {
        let mut rotation_cnt: u64 = 0;
        loop {
            self.barrier_closed.notified().await;
            {
                let state = self.state.lock().unwrap();
                if state.waiting > state.in_flight {
                    tracing::error!(
                        "rotation barrier corrupt: waiting={} in_flight={}; halting rotation",
                        state.waiting,
                        state.in_flight
                    );
                    return;
                }
                if state.waiting == 0 || state.waiting < state.in_flight {
                    continue;
                }
            }
            rotation_cnt += 1;
            tracing::info!("[{}] identity rotation start", rotation_cnt);
            rotator.rotate().await;
            tracing::info!("[{}] identity rotation end", rotation_cnt);
            {
                let mut state = self.state.lock().unwrap();
                state.waiting = 0;
                state.generation += 1;
            }
            self.released.notify_waiters();
        }
    }
}

/// RAII marker for one in-flight network call.
pub struct FetchPermit {
    coordinator: Arc<RotationCoordinator>,
}

impl Drop for FetchPermit {
    fn drop(&mut self) {
        self.coordinator.leave_fetch();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingRotator {
        rotations: AtomicUsize,
    }

    #[async_trait]
    impl IdentityRotator for CountingRotator {
        async fn rotate(&self) {
            // simulate the blocking interface reset
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.rotations.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn counting() -> (Arc<RotationCoordinator>, Arc<CountingRotator>) {
        let coordinator = Arc::new(RotationCoordinator::new());
        let rotator = Arc::new(CountingRotator {
            rotations: AtomicUsize::new(0),
        });
        (coordinator, rotator)
    }

    #[tokio::test]
    async fn test_all_waiters_trigger_exactly_one_rotation() {
        let (coordinator, rotator) = counting();
        tokio::spawn(Arc::clone(&coordinator).run(rotator.clone()));

        let workers = 4;
        let mut joins = Vec::new();
        for _ in 0..workers {
            let coordinator = Arc::clone(&coordinator);
            joins.push(tokio::spawn(async move {
                let permit = coordinator.begin_fetch().await;
                // every worker hits a challenge page
                coordinator.await_rotation().await;
                drop(permit);
            }));
        }
        for join in joins {
            join.await.unwrap();
        }

        assert_eq!(rotator.rotations.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.generation(), 1);
    }

    #[tokio::test]
    async fn test_last_leaving_worker_closes_barrier() {
        let (coordinator, rotator) = counting();
        tokio::spawn(Arc::clone(&coordinator).run(rotator.clone()));

        // one worker is mid-fetch while another hits a challenge and parks;
        // the barrier must stay open until the clean fetch finishes
        let permit = coordinator.begin_fetch().await;
        let waiter = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move {
                let permit = coordinator.begin_fetch().await;
                coordinator.await_rotation().await;
                drop(permit);
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(rotator.rotations.load(Ordering::SeqCst), 0);

        // the clean fetch completes; its exit closes the barrier
        drop(permit);
        waiter.await.unwrap();
        assert_eq!(rotator.rotations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_late_arrival_parks_until_rotation_completes() {
        let (coordinator, rotator) = counting();
        tokio::spawn(Arc::clone(&coordinator).run(rotator.clone()));

        let early = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move {
                let permit = coordinator.begin_fetch().await;
                coordinator.await_rotation().await;
                drop(permit);
            })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;

        // arrives while the barrier is forming: must not slip a fetch through
        let late = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move {
                let permit = coordinator.begin_fetch().await;
                assert!(coordinator.generation() >= 1);
                drop(permit);
            })
        };

        early.await.unwrap();
        late.await.unwrap();
        assert_eq!(rotator.rotations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_no_rotation_without_waiters() {
        let (coordinator, rotator) = counting();
        tokio::spawn(Arc::clone(&coordinator).run(rotator.clone()));

        for _ in 0..5 {
            let permit = coordinator.begin_fetch().await;
            drop(permit);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(rotator.rotations.load(Ordering::SeqCst), 0);
    }
}
