use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Latitude/longitude pair in degrees.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Coordinate {
    pub lat: f64,
    pub lng: f64,
}

impl Coordinate {
    pub const fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if !self.lat.is_finite() || !(-90.0..=90.0).contains(&self.lat) {
            return Err(AppError::Validation(format!(
                "latitude {} is outside [-90, 90]",
                self.lat
            )));
        }
        if !self.lng.is_finite() || !(-180.0..=180.0).contains(&self.lng) {
            return Err(AppError::Validation(format!(
                "longitude {} is outside [-180, 180]",
                self.lng
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AmbulanceStatus {
    Available,
    #[serde(rename = "On Call")]
    OnCall,
    #[serde(rename = "Off Duty")]
    OffDuty,
}

impl AmbulanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AmbulanceStatus::Available => "Available",
            AmbulanceStatus::OnCall => "On Call",
            AmbulanceStatus::OffDuty => "Off Duty",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Ambulance {
    pub id: String,
    pub location: Coordinate,
    pub status: AmbulanceStatus,
    pub vehicle_number: String,
    #[serde(rename = "type", default)]
    pub vehicle_type: String,
    pub driver_name: String,
    pub driver_phone: String,
    #[serde(default)]
    pub current_request_id: Option<String>,
    pub last_updated: DateTime<Utc>,
}

/// An ambulance annotated with its distance from a search origin.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RankedAmbulance {
    #[serde(flatten)]
    pub ambulance: Ambulance,
    pub distance_km: f64,
}
