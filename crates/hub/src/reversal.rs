//! Deferred reversal timers, one cancel handle per scheduled task.
//!
//! Timers run independently of the driver: stopping the driver or switching
//! presets leaves them armed unless the caller cancels explicitly.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::device::Device;

type Timers = HashMap<Device, Vec<(u64, JoinHandle<()>)>>;

#[derive(Default)]
pub struct ReversalQueue {
    next_id: AtomicU64,
    timers: Arc<Mutex<Timers>>,
}

impl ReversalQueue {
    /// Run `fire` once `after` has elapsed. The timer is no longer pending
    /// by the time `fire` starts.
    pub fn schedule<F>(&self, device: Device, after: Duration, fire: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let timers = Arc::clone(&self.timers);

        // Held across spawn and insert so the task cannot deregister first.
        let mut guard = self.timers.lock().unwrap_or_else(PoisonError::into_inner);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            remove(&timers, device, id);
            fire.await;
        });
        guard.entry(device).or_default().push((id, handle));
    }

    /// Abort every pending timer for `device`; returns how many were dropped.
    pub fn cancel(&self, device: Device) -> usize {
        let mut timers = self.timers.lock().unwrap_or_else(PoisonError::into_inner);
        let dropped = timers.remove(&device).unwrap_or_default();
        for (_, h) in &dropped {
            h.abort();
        }
        dropped.len()
    }

    pub fn cancel_all(&self) -> usize {
        Device::ALL.into_iter().map(|d| self.cancel(d)).sum()
    }

    pub fn pending(&self) -> usize {
        self.timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(Vec::len)
            .sum()
    }
}

fn remove(timers: &Mutex<Timers>, device: Device, id: u64) {
    let mut timers = timers.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(list) = timers.get_mut(&device) {
        list.retain(|(i, _)| *i != id);
        if list.is_empty() {
            timers.remove(&device);
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
