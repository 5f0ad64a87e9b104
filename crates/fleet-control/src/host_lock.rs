use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::{ExpiryPolicy, HostLockConfig};

/// Far enough ahead that a deadline built from it never fires in practice.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// `start + ttl`, saturating to a far-future instant when the sum would
/// overflow.
pub(crate) fn deadline_after(start: Instant, ttl: Duration) -> Instant {
    start
        .checked_add(ttl)
        .or_else(|| start.checked_add(FAR_FUTURE))
        .unwrap_or(start)
}

#[derive(Debug, Default)]
struct HostState {
    count: AtomicUsize,
    deadlines: Mutex<HashMap<String, Instant>>,
}

/// Bounds the number of in-flight requests per target host.
///
/// Every host owns its counter and its mutex, locking `a.com` never waits on
/// `b.com`. Grants are tracked per request id with a deadline so that the
/// sweeper can reclaim slots of requests nobody ever unlocked.
#[derive(Debug, Clone)]
pub struct HostLocker {
    limit: usize,
    default_ttl: Duration,
    on_expire: ExpiryPolicy,
    hosts: Arc<DashMap<String, Arc<HostState>>>,
}

impl HostLocker {
    pub fn new(config: &HostLockConfig) -> Self {
        Self {
            limit: config.max_per_host,
            default_ttl: config.default_ttl(),
            on_expire: config.on_expire,
            hosts: Arc::new(DashMap::new()),
        }
    }

    fn state(&self, host: &str) -> Arc<HostState> {
        if let Some(state) = self.hosts.get(host) {
            return state.value().clone();
        }
        self.hosts.entry(host.to_string()).or_default().value().clone()
    }

    /// Takes a slot of `host` for `req_id`, `None` ttl falls back to the
    /// configured default. Locking a request that already holds a slot only
    /// refreshes its deadline.
    pub fn lock(&self, host: &str, req_id: &str, ttl: Option<Duration>) -> bool {
        let deadline = deadline_after(Instant::now(), ttl.unwrap_or(self.default_ttl));
        let state = self.state(host);
        let mut deadlines = state
            .deadlines
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(held) = deadlines.get_mut(req_id) {
            *held = deadline;
            return true;
        }

        let limit = self.limit;
        let granted = state
            .count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| {
                (count < limit).then_some(count + 1)
            })
            .is_ok();
        if granted {
            deadlines.insert(req_id.to_string(), deadline);
        } else {
            log::debug!("Host {host} is at its limit of {limit}, denying {req_id}");
        }
        granted
    }

    /// Gives back the slot held by `req_id`, returns false if it held none.
    pub fn unlock(&self, host: &str, req_id: &str) -> bool {
        let Some(state) = self.hosts.get(host).map(|s| s.value().clone()) else {
            return false;
        };
        let mut deadlines = state
            .deadlines
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if deadlines.remove(req_id).is_some() {
            state.count.fetch_sub(1, Ordering::SeqCst);
            true
        } else {
            false
        }
    }

    /// Evicts every expired grant, returns how many were evicted.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let states: Vec<(String, Arc<HostState>)> = self
            .hosts
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let mut evicted = 0;
        for (host, state) in states {
            let mut deadlines = state
                .deadlines
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let before = deadlines.len();
            deadlines.retain(|_, deadline| *deadline > now);
            let expired = before - deadlines.len();
            if expired == 0 {
                continue;
            }
            if self.on_expire == ExpiryPolicy::Release {
                state.count.fetch_sub(expired, Ordering::SeqCst);
            }
            log::warn!("Reclaimed {expired} expired lock(s) on host {host}");
            evicted += expired;
        }
        evicted
    }

    /// Number of slots currently taken on `host`.
    pub fn in_flight(&self, host: &str) -> usize {
        self.hosts
            .get(host)
            .map(|s| s.count.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    pub fn spawn_sweeper(&self, every: Duration, token: CancellationToken) -> JoinHandle<()> {
        let locker = self.clone();
        tokio::spawn(async move {
            loop {
                match timeout(every, token.cancelled()).await {
                    Ok(()) => break,
                    Err(_) => {
                        locker.sweep();
                    }
                }
            }
        })
    }
}
