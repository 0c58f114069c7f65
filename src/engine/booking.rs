use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::{BOOKINGS_TOTAL, CANCELLATIONS_TOTAL, CONFLICTS_TOTAL};
use crate::store::UnitOfWork;

use super::{ConflictCause, Engine, EngineError};

impl Engine {
    /// Reserve the slot of `doctor_id` starting at `start` for `patient_name`.
    ///
    /// Concurrent calls for the same start yield exactly one winner; the
    /// losers get `Conflict`. A CANCELLED row at the same start is recycled
    /// (same id) rather than duplicated.
    pub async fn book(
        &self,
        doctor_id: Ulid,
        patient_name: String,
        start: Ms,
    ) -> Result<Appointment, EngineError> {
        let result = self.try_book(doctor_id, patient_name, start).await;
        let outcome = match &result {
            Ok(appointment) => {
                info!(
                    "booked appointment {} for doctor {doctor_id} at {start}",
                    appointment.id
                );
                "booked"
            }
            Err(EngineError::Conflict(cause)) => {
                debug!("booking for doctor {doctor_id} at {start} lost: {}", cause.as_str());
                metrics::counter!(CONFLICTS_TOTAL, "cause" => cause.as_str()).increment(1);
                "conflict"
            }
            Err(EngineError::NotFound(_)) => "not_found",
            Err(_) => "error",
        };
        metrics::counter!(BOOKINGS_TOTAL, "outcome" => outcome).increment(1);
        result
    }

    async fn try_book(
        &self,
        doctor_id: Ulid,
        patient_name: String,
        start: Ms,
    ) -> Result<Appointment, EngineError> {
        let doctor = self
            .doctors
            .get_doctor(doctor_id)
            .await?
            .ok_or(EngineError::NotFound(doctor_id))?;
        if !(MIN_VALID_TIMESTAMP_MS..=MAX_VALID_TIMESTAMP_MS).contains(&start) {
            return Err(EngineError::Invalid(format!("start time {start} out of range")));
        }
        let span = doctor.slot_at(start);

        let mut uow = UnitOfWork::begin(self.reservations.clone(), "book");

        if !uow
            .find_overlapping(doctor_id, AppointmentStatus::Confirmed, span)
            .await?
            .is_empty()
        {
            return Err(EngineError::Conflict(ConflictCause::Overlap));
        }

        match uow.find_exact(doctor_id, start).await? {
            Some(existing) if existing.is_confirmed() => {
                return Err(EngineError::Conflict(ConflictCause::SlotTaken));
            }
            Some(mut recycled) => {
                let version = recycled.version;
                recycled.status = AppointmentStatus::Confirmed;
                recycled.patient_name = patient_name;
                recycled.span = span;
                uow.stage(recycled, Some(version));
            }
            None => {
                uow.stage(Appointment::confirmed(doctor_id, patient_name, span), None);
            }
        }

        Ok(uow.commit().await?)
    }

    /// Mark an appointment CANCELLED. Cancelling twice is allowed.
    ///
    /// The write carries the version that was read, so a rebook of the same
    /// row committing in between turns this into `Conflict` instead of
    /// overwriting it.
    pub async fn cancel(&self, appointment_id: Ulid) -> Result<Appointment, EngineError> {
        let mut uow = UnitOfWork::begin(self.reservations.clone(), "cancel");
        let mut appointment = uow
            .find_by_id(appointment_id)
            .await?
            .ok_or(EngineError::NotFound(appointment_id))?;
        let version = appointment.version;
        appointment.status = AppointmentStatus::Cancelled;
        uow.stage(appointment, Some(version));

        let cancelled = uow.commit().await.map_err(EngineError::from)?;
        metrics::counter!(CANCELLATIONS_TOTAL).increment(1);
        info!("cancelled appointment {appointment_id}");
        Ok(cancelled)
    }
}
