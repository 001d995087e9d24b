//! Distributed garbage collection. A collector thread per client sweeps the
//! registry for proxies whose local callers are gone and tells the owner to
//! drop its references. Sweeps are provoked by intercepted-call volume, a
//! periodic timer, or an explicit force; disconnect performs a final sweep
//! that reports everything held on the peer's behalf.

use crate::lock;
use crate::logging::{self, Logger};
use crate::proxy::CallRouter;
use crate::registry::InstanceRegistry;
use std::io;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Periodic sweep interval.
pub const GC_INTERVAL: Duration = Duration::from_secs(20);
/// A sweep is also requested after this many intercepted calls.
pub const GC_CALL_INTERVAL: u32 = 100;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SweepReason {
    Periodic,
    Forced,
    Shutdown,
}

struct TriggerState {
    calls: u32,
    forced: bool,
    shutdown: bool,
}

/// Condition the collector thread sleeps on.
pub struct GcTrigger {
    state: Mutex<TriggerState>,
    cond: Condvar,
}

impl GcTrigger {
    pub fn new() -> GcTrigger {
        GcTrigger {
            state: Mutex::new(TriggerState {
                calls: 0,
                forced: false,
                shutdown: false,
            }),
            cond: Condvar::new(),
        }
    }

    /// Account one intercepted call; every `GC_CALL_INTERVAL` calls request
    /// a sweep.
    pub fn bump_call(&self) {
        let mut state = lock(&self.state);
        state.calls += 1;

        if state.calls >= GC_CALL_INTERVAL {
            state.calls = 0;
            state.forced = true;
            self.cond.notify_all();
        }
    }

    /// Request a sweep without waiting for the timer.
    pub fn force(&self) {
        lock(&self.state).forced = true;
        self.cond.notify_all();
    }

    pub fn shutdown(&self) {
        lock(&self.state).shutdown = true;
        self.cond.notify_all();
    }

    /// Block until a sweep is due or `timeout` elapses.
    pub fn wait_sweep(&self, timeout: Duration) -> SweepReason {
        let mut state = lock(&self.state);
        let deadline = Instant::now() + timeout;

        loop {
            if state.shutdown {
                return SweepReason::Shutdown;
            }

            if state.forced {
                state.forced = false;
                return SweepReason::Forced;
            }

            let now = Instant::now();
            if now >= deadline {
                return SweepReason::Periodic;
            }

            state = match self.cond.wait_timeout(state, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }
}

pub struct MemoryCollector;

impl MemoryCollector {
    /// Spawn the collector thread for one outbound link.
    pub fn spawn(
        registry: Arc<InstanceRegistry>,
        router: Arc<dyn CallRouter>,
        trigger: Arc<GcTrigger>,
        log: &Logger,
    ) -> io::Result<thread::JoinHandle<()>> {
        let log = log.new(logging::o!("thread" => "memory-collector"));

        thread::Builder::new()
            .name("memory-collector".to_string())
            .spawn(move || loop {
                match trigger.wait_sweep(GC_INTERVAL) {
                    SweepReason::Shutdown => {
                        // Final sweep: report everything held on the peer's
                        // behalf, best effort.
                        let _ = registry.perform_gc(&router, true);
                        logging::debug!(log, "collector stopped");
                        break;
                    }
                    reason => match registry.perform_gc(&router, false) {
                        Ok(0) => (),
                        Ok(count) => {
                            logging::debug!(log, "remote references released";
                                            "count" => count,
                                            "reason" => ?reason);
                        }
                        Err(err) => {
                            logging::warn!(log, "sweep failed, stopping collector";
                                           "error" => ?err);
                            break;
                        }
                    },
                }
            })
    }
}
