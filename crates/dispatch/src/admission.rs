//! Backpressure gate in front of the task queue.
//!
//! The in-flight counter is the only piece of dispatcher state callers may
//! observe without taking the pairing lock. Reservation is a compare-and-swap
//! loop, so two callers racing for the last slot cannot both win.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::RejectReason;

/// Result of an admission attempt.
#[derive(Debug)]
pub enum Admission {
    /// The caller holds one in-flight slot until the permit is dropped.
    Accepted(AdmissionPermit),
    Rejected(RejectReason),
}

/// Counts admitted, unresolved tasks against a fixed ceiling.
#[derive(Debug)]
pub struct AdmissionController {
    ceiling: usize,
    in_flight: Arc<AtomicUsize>,
}

impl AdmissionController {
    pub fn new(ceiling: usize) -> Self {
        Self {
            ceiling,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Reserves one in-flight slot, or rejects without touching anything.
    pub fn try_admit(&self) -> Admission {
        let mut current = self.in_flight.load(Ordering::Acquire);
        loop {
            if current >= self.ceiling {
                return Admission::Rejected(RejectReason::CeilingReached);
            }
            match self.in_flight.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Admission::Accepted(AdmissionPermit {
                        counter: Arc::clone(&self.in_flight),
                    })
                }
                Err(actual) => current = actual,
            }
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling
    }
}

/// One reserved in-flight slot; released on drop.
#[derive(Debug)]
pub struct AdmissionPermit {
    counter: Arc<AtomicUsize>,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}
