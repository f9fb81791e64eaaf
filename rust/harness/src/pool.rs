//! Accelerator device pool.
//!
//! Tracks which device ids are busy. All state lives behind one mutex so that
//! the free-check and the busy-mark of [`AcceleratorPool::allocate`] happen in
//! a single critical section. The pool is never persisted; after a restart it
//! is rebuilt all-free and [`AcceleratorPool::claim`] re-marks devices of runs
//! that survived.

use std::{
    process::Command,
    sync::{Mutex, MutexGuard, PoisonError},
};

use serde::Serialize;

/// Busy flag of one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeviceState {
    pub id: u32,
    pub busy: bool,
}

/// Point-in-time view of the pool.
#[derive(Debug, Clone, Serialize)]
pub struct PoolSnapshot {
    pub total: usize,
    pub free: usize,
    pub devices: Vec<DeviceState>,
}

/// Process-wide registry of accelerator devices.
#[derive(Debug)]
pub struct AcceleratorPool {
    /// `busy[id]` is true while device `id` is assigned to a run.
    busy: Mutex<Vec<bool>>,
}

impl AcceleratorPool {
    /// Create a pool of `total` devices, ids `0..total`, all free.
    #[must_use]
    pub fn new(total: u32) -> Self {
        Self {
            busy: Mutex::new(vec![false; total as usize]),
        }
    }

    // Every mutation leaves the vector consistent, so a poisoned lock is still usable.
    fn lock(&self) -> MutexGuard<'_, Vec<bool>> {
        self.busy.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reserve `n` devices, lowest ids first.
    ///
    /// Either all `n` devices are marked busy or nothing changes.
    pub fn allocate(&self, n: u32) -> Result<Vec<u32>, PoolError> {
        if n == 0 {
            return Err(PoolError::ZeroRequest);
        }

        let mut busy = self.lock();
        let free: Vec<u32> = busy
            .iter()
            .enumerate()
            .filter(|(_, b)| !**b)
            .map(|(id, _)| id as u32)
            .take(n as usize)
            .collect();

        if free.len() < n as usize {
            let available = busy.iter().filter(|b| !**b).count();
            return Err(PoolError::Insufficient {
                requested: n,
                available,
            });
        }

        for &id in &free {
            busy[id as usize] = true;
        }
        Ok(free)
    }

    /// Mark devices free. Already-free and unknown ids are ignored.
    pub fn release(&self, ids: &[u32]) {
        let mut busy = self.lock();
        for &id in ids {
            if let Some(slot) = busy.get_mut(id as usize) {
                *slot = false;
            }
        }
    }

    /// Mark specific devices busy on behalf of a run that survived a restart.
    ///
    /// Returns the ids that could not be claimed cleanly: unknown ids and ids
    /// that were already busy (claimed by another surviving run).
    pub fn claim(&self, ids: &[u32]) -> Vec<u32> {
        let mut busy = self.lock();
        let mut conflicts = Vec::new();
        for &id in ids {
            match busy.get_mut(id as usize) {
                Some(slot) if !*slot => *slot = true,
                _ => conflicts.push(id),
            }
        }
        conflicts
    }

    /// Number of devices in the pool.
    #[must_use]
    pub fn total(&self) -> usize {
        self.lock().len()
    }

    /// Number of devices not assigned to any run.
    #[must_use]
    pub fn free_count(&self) -> usize {
        self.lock().iter().filter(|b| !**b).count()
    }

    #[must_use]
    pub fn snapshot(&self) -> PoolSnapshot {
        let busy = self.lock();
        let devices: Vec<DeviceState> = busy
            .iter()
            .enumerate()
            .map(|(id, &busy)| DeviceState {
                id: id as u32,
                busy,
            })
            .collect();
        PoolSnapshot {
            total: devices.len(),
            free: devices.iter().filter(|d| !d.busy).count(),
            devices,
        }
    }
}

/// Count physically present NVIDIA devices via `nvidia-smi -L`.
///
/// Returns 0 when the tool is missing or fails.
#[must_use]
pub fn detect_device_count() -> u32 {
    match Command::new("nvidia-smi").arg("-L").output() {
        Ok(output) if output.status.success() => {
            let count = count_listed_devices(&String::from_utf8_lossy(&output.stdout));
            tracing::info!("Detected {count} accelerator device(s)");
            count
        }
        Ok(output) => {
            tracing::warn!(
                "nvidia-smi failed ({}), assuming no devices",
                String::from_utf8_lossy(&output.stderr).trim()
            );
            0
        }
        Err(e) => {
            tracing::warn!("nvidia-smi unavailable ({e}), assuming no devices");
            0
        }
    }
}

fn count_listed_devices(listing: &str) -> u32 {
    listing
        .lines()
        .filter(|line| {
            line.strip_prefix("GPU ")
                .and_then(|rest| rest.split(':').next())
                .is_some_and(|idx| idx.trim().parse::<u32>().is_ok())
        })
        .count() as u32
}

/// Errors that can occur when allocating devices.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("device request must be at least 1")]
    ZeroRequest,
    #[error("requested {requested} device(s), but only {available} available")]
    Insufficient { requested: u32, available: usize },
}
