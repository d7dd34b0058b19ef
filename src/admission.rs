//! Admission control for upgraded sessions
//!
//! A slot is taken once a handshake is authenticated and given back when the
//! session ends, however it ends. The status page reads the same counter.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Bounded counter of active sessions
#[derive(Debug)]
pub struct AdmissionController {
    active: AtomicUsize,
    max: usize,
}

/// Snapshot of the counter, as served on the status path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionStatus {
    pub current: usize,
    pub max: usize,
}

impl AdmissionStatus {
    /// Render as `{"data": "<current>/<max>"}`
    pub fn to_json(&self) -> String {
        format!("{{\"data\": \"{}/{}\"}}", self.current, self.max)
    }
}

impl AdmissionController {
    /// Create a controller allowing at most `max` sessions
    pub fn new(max: usize) -> Arc<Self> {
        Arc::new(Self {
            active: AtomicUsize::new(0),
            max,
        })
    }

    /// Take a slot if one is free.
    ///
    /// Never lets the counter go past `max`, even under concurrent callers.
    pub fn try_admit(self: &Arc<Self>) -> Option<AdmissionGuard> {
        let mut current = self.active.load(Ordering::Relaxed);

        loop {
            if current >= self.max {
                return None;
            }

            match self.active.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    return Some(AdmissionGuard {
                        controller: Arc::clone(self),
                        released: AtomicBool::new(false),
                    })
                }
                Err(observed) => current = observed,
            }
        }
    }

    /// Get the current active session count
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn max(&self) -> usize {
        self.max
    }

    pub fn status(&self) -> AdmissionStatus {
        AdmissionStatus {
            current: self.active(),
            max: self.max,
        }
    }
}

/// Proof of a held slot; the slot is returned exactly once
#[derive(Debug)]
pub struct AdmissionGuard {
    controller: Arc<AdmissionController>,
    released: AtomicBool,
}

impl AdmissionGuard {
    /// Return the slot now. Later calls and the eventual drop do nothing.
    pub fn release(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            self.controller.active.fetch_sub(1, Ordering::AcqRel);
        }
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

impl Drop for AdmissionGuard {
    fn drop(&mut self) {
        self.release();
    }
}
