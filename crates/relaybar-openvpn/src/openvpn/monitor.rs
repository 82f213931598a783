//! Reference-counted ownership of the statistics poll loop.
//!
//! Every observer holds a [`MonitorLease`]. The first lease starts the
//! loop, dropping the last one stops it. Leases are plain values, so a
//! forgotten `stop` is impossible: the count follows ownership.

use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

type Starter = dyn Fn(CancellationToken) -> JoinHandle<()> + Send + Sync;

struct RunningLoop {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct MonitorState {
    leases: usize,
    running: Option<RunningLoop>,
}

/// Starts and stops one background loop according to outstanding leases.
pub struct Monitor {
    state: Mutex<MonitorState>,
    starter: Box<Starter>,
}

impl Monitor {
    /// `starter` spawns the loop; it must exit once the token is cancelled.
    pub fn new<F>(starter: F) -> Arc<Self>
    where
        F: Fn(CancellationToken) -> JoinHandle<()> + Send + Sync + 'static,
    {
        Arc::new(Self {
            state: Mutex::new(MonitorState::default()),
            starter: Box::new(starter),
        })
    }

    /// Take a lease, starting the loop if this is the first one.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn acquire(self: &Arc<Self>) -> MonitorLease {
        if let Ok(mut st) = self.state.lock() {
            st.leases += 1;
            let finished = st
                .running
                .as_ref()
                .map(|r| r.handle.is_finished())
                .unwrap_or(true);
            if finished {
                let token = CancellationToken::new();
                let handle = (self.starter)(token.clone());
                st.running = Some(RunningLoop { token, handle });
                log::debug!("Poll loop started");
            }
        }
        MonitorLease {
            monitor: Arc::clone(self),
        }
    }

    fn release(&self) {
        let stopped = match self.state.lock() {
            Ok(mut st) => {
                st.leases = st.leases.saturating_sub(1);
                if st.leases == 0 {
                    st.running.take()
                } else {
                    None
                }
            }
            Err(_) => None,
        };
        if let Some(r) = stopped {
            r.token.cancel();
            r.handle.abort();
            log::debug!("Poll loop stopped");
        }
    }

    pub fn lease_count(&self) -> usize {
        self.state.lock().map(|s| s.leases).unwrap_or(0)
    }

    pub fn is_active(&self) -> bool {
        self.state
            .lock()
            .map(|s| s.running.as_ref().map(|r| !r.handle.is_finished()).unwrap_or(false))
            .unwrap_or(false)
    }
}

impl fmt::Debug for Monitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Monitor")
            .field("leases", &self.lease_count())
            .field("active", &self.is_active())
            .finish()
    }
}

/// One observer's interest in the poll loop.
#[must_use = "the poll loop stops as soon as the lease is dropped"]
pub struct MonitorLease {
    monitor: Arc<Monitor>,
}

impl MonitorLease {
    /// Same as dropping the lease.
    pub fn release(self) {}
}

impl fmt::Debug for MonitorLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MonitorLease").finish_non_exhaustive()
    }
}

impl Drop for MonitorLease {
    fn drop(&mut self) {
        self.monitor.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn counting_monitor() -> (Arc<Monitor>, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let starts = Arc::new(AtomicUsize::new(0));
        let ticks = Arc::new(AtomicUsize::new(0));
        let (s, t) = (starts.clone(), ticks.clone());
        let monitor = Monitor::new(move |token| {
            s.fetch_add(1, Ordering::SeqCst);
            let t = t.clone();
            tokio::spawn(async move {
                while !token.is_cancelled() {
                    t.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
        });
        (monitor, starts, ticks)
    }

    #[tokio::test]
    async fn two_leases_one_loop() {
        let (m, starts, _) = counting_monitor();
        let a = m.acquire();
        let b = m.acquire();
        assert_eq!(starts.load(Ordering::SeqCst), 1);
        assert_eq!(m.lease_count(), 2);

        drop(a);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(m.is_active());

        b.release();
        assert_eq!(m.lease_count(), 0);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!m.is_active());
    }

    #[tokio::test]
    async fn loop_stops_ticking_after_last_release() {
        let (m, _, ticks) = counting_monitor();
        let lease = m.acquire();
        tokio::time::sleep(Duration::from_millis(30)).await;
        drop(lease);
        tokio::time::sleep(Duration::from_millis(10)).await;
        let frozen = ticks.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), frozen);
    }

    #[tokio::test]
    async fn reacquire_restarts() {
        let (m, starts, _) = counting_monitor();
        drop(m.acquire());
        let _again = m.acquire();
        assert_eq!(starts.load(Ordering::SeqCst), 2);
        assert!(m.is_active());
    }
}
