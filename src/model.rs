use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, read as naive wall-clock time. The only time type.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// Touching endpoints do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Doctor {
    pub id: Ulid,
    pub name: String,
    pub specialization: String,
    pub contact_email: String,
    /// Fixed length of every appointment with this doctor.
    pub slot_minutes: u32,
}

impl Doctor {
    pub fn slot_ms(&self) -> Ms {
        Ms::from(self.slot_minutes) * MINUTE_MS
    }

    /// The interval an appointment starting at `start` would occupy.
    pub fn slot_at(&self, start: Ms) -> Span {
        Span::new(start, start + self.slot_ms())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AppointmentStatus {
    Confirmed,
    Cancelled,
}

impl AppointmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppointmentStatus::Confirmed => "CONFIRMED",
            AppointmentStatus::Cancelled => "CANCELLED",
        }
    }
}

impl std::fmt::Display for AppointmentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One appointment row. Rows are keyed by `(doctor_id, span.start)` and are
/// recycled rather than deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: Ulid,
    pub doctor_id: Ulid,
    pub patient_name: String,
    pub span: Span,
    pub status: AppointmentStatus,
    /// Optimistic-concurrency token; bumped by the store on every update.
    pub version: u64,
}

impl Appointment {
    pub fn confirmed(doctor_id: Ulid, patient_name: String, span: Span) -> Self {
        Self {
            id: Ulid::new(),
            doctor_id,
            patient_name,
            span,
            status: AppointmentStatus::Confirmed,
            version: 0,
        }
    }

    pub fn is_confirmed(&self) -> bool {
        self.status == AppointmentStatus::Confirmed
    }
}

/// Every appointment row of one doctor, CANCELLED rows included.
#[derive(Debug, Clone)]
pub struct DoctorLedger {
    pub doctor_id: Ulid,
    /// Sorted by `span.start`. Starts are unique within a ledger.
    pub appointments: Vec<Appointment>,
}

impl DoctorLedger {
    pub fn new(doctor_id: Ulid) -> Self {
        Self {
            doctor_id,
            appointments: Vec::new(),
        }
    }

    /// The row keyed by this exact start time, whatever its status.
    pub fn find_exact(&self, start: Ms) -> Option<&Appointment> {
        self.appointments
            .binary_search_by_key(&start, |a| a.span.start)
            .ok()
            .map(|pos| &self.appointments[pos])
    }

    pub fn get(&self, id: Ulid) -> Option<&Appointment> {
        self.appointments.iter().find(|a| a.id == id)
    }

    /// Insert a row keeping start order. Caller has checked the start is free.
    pub fn insert(&mut self, appointment: Appointment) {
        let pos = self
            .appointments
            .binary_search_by_key(&appointment.span.start, |a| a.span.start)
            .unwrap_or_else(|e| e);
        self.appointments.insert(pos, appointment);
    }

    /// Replace the row with the same id. Returns the previous image.
    pub fn replace(&mut self, appointment: Appointment) -> Option<Appointment> {
        let previous = self
            .appointments
            .iter()
            .position(|a| a.id == appointment.id)
            .map(|pos| self.appointments.remove(pos));
        self.insert(appointment);
        previous
    }

    /// Rows (any status) whose span overlaps the query window.
    /// Uses binary search to skip rows starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Appointment> {
        let right_bound = self
            .appointments
            .partition_point(|a| a.span.start < query.end);
        self.appointments[..right_bound]
            .iter()
            .filter(move |a| a.span.end > query.start)
    }

    /// First CONFIRMED row overlapping `span`, ignoring the row `except`.
    pub fn confirmed_overlap(&self, span: &Span, except: Option<Ulid>) -> Option<&Appointment> {
        self.overlapping(span)
            .find(|a| a.is_confirmed() && Some(a.id) != except)
    }
}

/// WAL record format. Flat, no nesting.
/// Appointment events carry the full row image after the write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    DoctorRegistered { doctor: Doctor },
    AppointmentInserted { appointment: Appointment },
    AppointmentUpdated { appointment: Appointment },
}
