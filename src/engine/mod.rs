mod availability;
mod booking;
mod doctors;
mod error;

pub use availability::free_slots;
pub use error::{ConflictCause, EngineError};

use std::sync::Arc;

use chrono::NaiveTime;

use crate::store::{DoctorDirectory, ReservationStore};

/// Daily bounds `[start, end)` every doctor's availability is computed within.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkingHours {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

const fn hour(h: u32) -> NaiveTime {
    match NaiveTime::from_hms_opt(h, 0, 0) {
        Some(t) => t,
        None => panic!("hour out of range"),
    }
}

impl WorkingHours {
    /// 09:00 to 17:00.
    pub const DEFAULT: WorkingHours = WorkingHours {
        start: hour(9),
        end: hour(17),
    };
}

impl Default for WorkingHours {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Booking and availability core.
///
/// Holds no locks of its own: every operation is an independent unit of work
/// against the store, and races on a slot are settled by the store's
/// uniqueness, version and range checks.
pub struct Engine {
    reservations: Arc<dyn ReservationStore>,
    doctors: Arc<dyn DoctorDirectory>,
    hours: WorkingHours,
}

impl Engine {
    pub fn new(
        reservations: Arc<dyn ReservationStore>,
        doctors: Arc<dyn DoctorDirectory>,
        hours: WorkingHours,
    ) -> Self {
        Self {
            reservations,
            doctors,
            hours,
        }
    }

    /// Engine over a store that serves both appointments and doctors.
    pub fn with_store<S>(store: Arc<S>, hours: WorkingHours) -> Self
    where
        S: ReservationStore + DoctorDirectory + 'static,
    {
        Self::new(store.clone(), store, hours)
    }

    pub fn working_hours(&self) -> WorkingHours {
        self.hours
    }
}
