//! Single-flight request collapsing.
//!
//! Concurrent callers asking for the same key share one computation. The
//! computation is stored as a shared future, so a cancelled caller does not
//! cancel it: the next caller to poll the flight drives it to completion.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::{BoxFuture, FutureExt, Shared};

use crate::key::CacheKey;
use crate::lock::mutex_lock;

const LOCK_TARGET: &str = "edge_cache::flight";

type Flight<T, E> = Shared<BoxFuture<'static, Result<T, E>>>;
type FlightMap<T, E> = HashMap<CacheKey, (u64, Flight<T, E>)>;

/// Whether a caller started the computation or joined one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlightRole {
    Leader,
    Follower,
}

/// Collapses concurrent computations per key.
pub struct SingleFlight<T, E> {
    next_id: AtomicU64,
    flights: Arc<Mutex<FlightMap<T, E>>>,
}

impl<T, E> SingleFlight<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            flights: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Run `compute` unless a computation for `key` is already in flight,
    /// in which case wait for that one instead.
    ///
    /// Every caller receives the same outcome, success or failure.
    pub async fn run<F, Fut>(&self, key: &CacheKey, compute: F) -> (Result<T, E>, FlightRole)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let (flight, role) = {
            let mut flights = mutex_lock(&self.flights, LOCK_TARGET, "join");
            match flights.get(key) {
                Some((_, existing)) => (existing.clone(), FlightRole::Follower),
                None => {
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    let flight = Self::launch(Arc::clone(&self.flights), key.clone(), id, compute());
                    flights.insert(key.clone(), (id, flight.clone()));
                    (flight, FlightRole::Leader)
                }
            }
        };

        (flight.await, role)
    }

    fn launch<Fut>(flights: Arc<Mutex<FlightMap<T, E>>>, key: CacheKey, id: u64, work: Fut) -> Flight<T, E>
    where
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        async move {
            let outcome = work.await;
            {
                let mut flights = mutex_lock(&flights, LOCK_TARGET, "complete");
                if flights.get(&key).is_some_and(|(current, _)| *current == id) {
                    flights.remove(&key);
                }
            }
            outcome
        }
        .boxed()
        .shared()
    }

    /// Whether a computation for `key` is running.
    pub fn in_flight(&self, key: &CacheKey) -> bool {
        mutex_lock(&self.flights, LOCK_TARGET, "in_flight").contains_key(key)
    }

    /// Number of keys currently computing.
    pub fn len(&self) -> usize {
        mutex_lock(&self.flights, LOCK_TARGET, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T, E> Default for SingleFlight<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T, E> std::fmt::Debug for SingleFlight<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingleFlight").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    // === Collapsing ===

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_share_one_computation() {
        let flight: Arc<SingleFlight<String, String>> = Arc::new(SingleFlight::new());
        let runs = Arc::new(AtomicUsize::new(0));
        let key = CacheKey::from_raw("k");

        let mut handles = Vec::new();
        for _ in 0..50 {
            let flight = Arc::clone(&flight);
            let runs = Arc::clone(&runs);
            let key = key.clone();
            handles.push(tokio::spawn(async move {
                flight
                    .run(&key, move || async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok("value".to_string())
                    })
                    .await
            }));
        }

        let mut leaders = 0;
        for handle in handles {
            let (result, role) = handle.await.unwrap();
            assert_eq!(result.unwrap(), "value");
            if role == FlightRole::Leader {
                leaders += 1;
            }
        }

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(leaders, 1);
        assert!(flight.is_empty());
    }

    #[tokio::test]
    async fn test_failure_shared_with_followers() {
        let flight: Arc<SingleFlight<u32, String>> = Arc::new(SingleFlight::new());
        let key = CacheKey::from_raw("k");

        let leader = {
            let flight = Arc::clone(&flight);
            let key = key.clone();
            tokio::spawn(async move {
                flight
                    .run(&key, || async {
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        Err("boom".to_string())
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(flight.in_flight(&key));

        let (follower, role) = flight.run(&key, || async { Ok(1) }).await;
        assert_eq!(role, FlightRole::Follower);
        assert_eq!(follower, Err("boom".to_string()));
        assert_eq!(leader.await.unwrap().0, Err("boom".to_string()));
    }

    #[tokio::test]
    async fn test_sequential_calls_recompute() {
        let flight: SingleFlight<u32, ()> = SingleFlight::new();
        let key = CacheKey::from_raw("k");

        let (first, _) = flight.run(&key, || async { Ok(1) }).await;
        let (second, role) = flight.run(&key, || async { Ok(2) }).await;
        assert_eq!(first, Ok(1));
        assert_eq!(second, Ok(2));
        assert_eq!(role, FlightRole::Leader);
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_collapse() {
        let flight: SingleFlight<&'static str, ()> = SingleFlight::new();
        let (a, role_a) = flight.run(&CacheKey::from_raw("a"), || async { Ok("a") }).await;
        let (b, role_b) = flight.run(&CacheKey::from_raw("b"), || async { Ok("b") }).await;
        assert_eq!((a, b), (Ok("a"), Ok("b")));
        assert_eq!((role_a, role_b), (FlightRole::Leader, FlightRole::Leader));
    }

    // === Cancellation ===

    #[tokio::test]
    async fn test_cancelled_leader_resumed_by_follower() {
        let flight: Arc<SingleFlight<u32, ()>> = Arc::new(SingleFlight::new());
        let runs = Arc::new(AtomicUsize::new(0));
        let key = CacheKey::from_raw("k");

        let counted = Arc::clone(&runs);
        let leader = flight.run(&key, move || async move {
            counted.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(7)
        });
        // Poll the leader briefly, then drop it mid-computation.
        let _ = tokio::time::timeout(Duration::from_millis(5), leader).await;
        assert!(flight.in_flight(&key));

        let (result, role) = flight.run(&key, || async { Ok(0) }).await;
        assert_eq!(result, Ok(7));
        assert_eq!(role, FlightRole::Follower);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(!flight.in_flight(&key));
    }
}
