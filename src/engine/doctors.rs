use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::store::StoreError;

use super::{Engine, EngineError};

impl Engine {
    pub async fn create_doctor(
        &self,
        name: String,
        specialization: String,
        contact_email: String,
        slot_minutes: u32,
    ) -> Result<Doctor, EngineError> {
        if name.trim().is_empty() {
            return Err(EngineError::Invalid("doctor name must not be blank".into()));
        }
        if specialization.trim().is_empty() {
            return Err(EngineError::Invalid("specialization must not be blank".into()));
        }
        if !contact_email.contains('@') {
            return Err(EngineError::Invalid(format!("invalid contact email: {contact_email}")));
        }
        if name.len() > MAX_NAME_LEN
            || specialization.len() > MAX_NAME_LEN
            || contact_email.len() > MAX_NAME_LEN
        {
            return Err(EngineError::LimitExceeded("doctor field too long"));
        }
        if !(MIN_SLOT_MINUTES..=MAX_SLOT_MINUTES).contains(&slot_minutes) {
            return Err(EngineError::Invalid(format!(
                "slot_minutes must be between {MIN_SLOT_MINUTES} and {MAX_SLOT_MINUTES}"
            )));
        }

        let doctor = Doctor {
            id: Ulid::new(),
            name,
            specialization,
            contact_email,
            slot_minutes,
        };
        let doctor = self.doctors.insert_doctor(doctor).await.map_err(|e| match e {
            StoreError::UniqueViolation(msg) => EngineError::AlreadyExists(msg),
            other => other.into(),
        })?;
        info!("registered doctor {} ({})", doctor.id, doctor.specialization);
        Ok(doctor)
    }

    pub async fn get_doctor(&self, id: Ulid) -> Result<Doctor, EngineError> {
        self.doctors
            .get_doctor(id)
            .await?
            .ok_or(EngineError::NotFound(id))
    }

    /// Doctors ordered by id, optionally only those whose specialization
    /// matches ignoring case. A blank filter lists everyone.
    pub async fn list_doctors(&self, specialization: Option<&str>) -> Result<Vec<Doctor>, EngineError> {
        let doctors = self.doctors.list_doctors().await?;
        let filter = specialization
            .filter(|s| !s.trim().is_empty())
            .map(str::to_lowercase);
        Ok(match filter {
            Some(wanted) => doctors
                .into_iter()
                .filter(|d| d.specialization.to_lowercase() == wanted)
                .collect(),
            None => doctors,
        })
    }

    pub async fn get_appointment(&self, id: Ulid) -> Result<Appointment, EngineError> {
        self.reservations
            .find_by_id(id)
            .await?
            .ok_or(EngineError::NotFound(id))
    }
}
