//! Background poller that turns device events into callback invocations.
//!
//! Backends record one event per touched device after launching a group and
//! hand it over together with the callbacks of every rank on that device.
//! A dedicated thread polls pending events without blocking, fires callbacks
//! for the completed ones, and only exits once shutdown was requested and
//! the list is empty.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::backend::{Callback, Status};
use crate::error::{BoxingError, Result};
use crate::types::DeviceId;

/// Result of a non-blocking event query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventStatus {
    Pending,
    Complete,
}

/// A device-side completion marker that can be queried without blocking.
pub trait DeviceEvent: Send {
    fn query(&self) -> Result<EventStatus>;
}

struct PendingEvent {
    device_id: DeviceId,
    event: Box<dyn DeviceEvent>,
    callbacks: Vec<Callback>,
}

struct Shared {
    pending: Mutex<VecDeque<PendingEvent>>,
    shutdown: AtomicBool,
}

/// Owns the poller thread and its pending-event list.
pub struct CompletionTracker {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl CompletionTracker {
    /// Spawn the poller thread.
    pub fn start(name: impl Into<String>) -> Result<Self> {
        let shared = Arc::new(Shared {
            pending: Mutex::new(VecDeque::new()),
            shutdown: AtomicBool::new(false),
        });
        let poll_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name(name.into())
            .spawn(move || poll_loop(&poll_shared))?;
        Ok(Self {
            shared,
            worker: Some(worker),
        })
    }

    /// Queue an event; `callbacks` fire once it completes.
    pub fn submit(
        &self,
        device_id: DeviceId,
        event: Box<dyn DeviceEvent>,
        callbacks: Vec<Callback>,
    ) -> Result<()> {
        if self.shared.shutdown.load(Ordering::Acquire) {
            return Err(BoxingError::TrackerShutdown);
        }
        self.shared
            .pending
            .lock()
            .map_err(|_| BoxingError::LockPoisoned("completion list"))?
            .push_back(PendingEvent {
                device_id,
                event,
                callbacks,
            });
        Ok(())
    }

    /// Number of events not yet observed complete.
    pub fn pending(&self) -> usize {
        self.shared.pending.lock().map(|p| p.len()).unwrap_or(0)
    }

    /// Drain every pending event, then stop the poller.
    pub fn shutdown(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        if let Some(worker) = self.worker.take()
            && worker.join().is_err()
        {
            tracing::error!("completion poller panicked");
        }
    }
}

impl Drop for CompletionTracker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn poll_loop(shared: &Shared) {
    let mut idle_iters: u32 = 0;
    loop {
        let (ready, drained) = {
            let Ok(mut pending) = shared.pending.lock() else {
                tracing::error!("completion list lock poisoned, poller exiting");
                return;
            };
            if pending.is_empty() && shared.shutdown.load(Ordering::Acquire) {
                return;
            }
            let ready = take_completed(&mut pending);
            (ready, pending.is_empty())
        };

        // Callbacks may re-enter the executor, so they run outside the lock.
        let progressed = !ready.is_empty();
        for (status, callbacks) in ready {
            for callback in callbacks {
                callback(status.clone());
            }
        }

        if progressed {
            idle_iters = 0;
            continue;
        }
        backoff(idle_iters, drained);
        idle_iters = idle_iters.saturating_add(1);
    }
}

/// Remove every entry whose event has completed or failed, preserving list
/// order among the rest.
fn take_completed(pending: &mut VecDeque<PendingEvent>) -> Vec<(Status, Vec<Callback>)> {
    let mut ready = Vec::new();
    let mut idx = 0;
    while idx < pending.len() {
        let status = match pending[idx].event.query() {
            Ok(EventStatus::Pending) => {
                idx += 1;
                continue;
            }
            Ok(EventStatus::Complete) => Ok(()),
            Err(e) => {
                tracing::error!(
                    device_id = pending[idx].device_id,
                    error = %e,
                    "device event query failed"
                );
                Err(Arc::new(e))
            }
        };
        if let Some(entry) = pending.remove(idx) {
            ready.push((status, entry.callbacks));
        }
    }
    ready
}

fn backoff(iter: u32, drained: bool) {
    if drained {
        std::thread::sleep(Duration::from_micros(200));
    } else if iter < 1000 {
        std::hint::spin_loop();
    } else if iter < 5000 {
        std::thread::sleep(Duration::from_micros(10));
    } else {
        std::thread::sleep(Duration::from_micros(100));
    }
}
