use serde::{Deserialize, Serialize};

use crate::geo::{eta_minutes, round_km};
use crate::models::ambulance::Ambulance;
use crate::models::request::RequestStatus;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EtaEstimate {
    pub minutes: u32,
    pub distance_km: f64,
    pub label: String,
}

impl EtaEstimate {
    pub fn from_distance(distance_km: f64, speed_kmh: f64) -> Self {
        let minutes = eta_minutes(distance_km, speed_kmh);
        let label = if minutes <= 1 {
            "Less than 1 minute".to_string()
        } else {
            format!("{minutes} minutes")
        };

        Self {
            minutes,
            distance_km: round_km(distance_km),
            label,
        }
    }
}

/// One emission of a request tracking stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TrackingUpdate {
    pub request_id: String,
    pub request_status: RequestStatus,
    pub ambulance: Option<Ambulance>,
    pub eta: Option<EtaEstimate>,
}

#[cfg(test)]
mod tests {
    use super::EtaEstimate;

    #[test]
    fn short_trips_read_as_less_than_a_minute() {
        assert_eq!(EtaEstimate::from_distance(0.5, 40.0).label, "Less than 1 minute");
        assert_eq!(EtaEstimate::from_distance(20.0, 40.0).label, "30 minutes");
    }
}
