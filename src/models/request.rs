use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::models::ambulance::Coordinate;

const MAX_PATIENT_AGE: u8 = 120;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RequestStatus {
    Pending,
    Accepted,
    #[serde(rename = "On The Way")]
    OnTheWay,
    Arrived,
    Completed,
    Cancelled,
}

impl RequestStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestStatus::Completed | RequestStatus::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Gender {
    Male,
    Female,
    Other,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum EmergencyType {
    Medical,
    Accident,
    Cardiac,
    Pregnancy,
    Covid,
    Other,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PatientInfo {
    pub name: String,
    pub age: u8,
    pub gender: Gender,
    pub emergency_type: EmergencyType,
    #[serde(default)]
    pub notes: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    pub id: String,
    pub user_id: String,
    pub ambulance_id: Option<String>,
    pub pickup: Coordinate,
    pub pickup_address: String,
    pub destination: String,
    #[serde(default)]
    pub contact_number: String,
    pub patient_info: PatientInfo,
    pub status: RequestStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Caller-supplied fields of a new request. Identity, status and timestamps
/// are filled in on creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewRequest {
    pub ambulance_id: String,
    pub pickup: Coordinate,
    pub pickup_address: String,
    pub destination: String,
    pub contact_number: String,
    pub patient_info: PatientInfo,
}

impl NewRequest {
    pub fn validate(&self) -> Result<(), AppError> {
        self.pickup.validate()?;

        let required = [
            ("ambulanceId", &self.ambulance_id),
            ("pickupAddress", &self.pickup_address),
            ("destination", &self.destination),
            ("contactNumber", &self.contact_number),
            ("patientInfo.name", &self.patient_info.name),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(AppError::Validation(format!("{field} cannot be empty")));
            }
        }

        if self.patient_info.age > MAX_PATIENT_AGE {
            return Err(AppError::Validation(format!(
                "patient age must be <= {MAX_PATIENT_AGE}"
            )));
        }

        Ok(())
    }
}
