//! Document store collaborator.
//!
//! The store owns ambulance and request documents, answers filtered batch
//! queries and point lookups, and pushes a full snapshot of a document to
//! every live watcher whenever it changes.

pub mod memory;

use std::pin::Pin;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_stream::Stream;

use crate::error::AppError;
use crate::models::ambulance::{Ambulance, AmbulanceStatus};
use crate::models::request::Request;

pub const AMBULANCES: &str = "ambulances";
pub const REQUESTS: &str = "requests";

/// Raw document as held by the store: its id plus the field map.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub data: Value,
}

impl Document {
    pub fn new(id: impl Into<String>, data: Value) -> Self {
        Self {
            id: id.into(),
            data,
        }
    }

    /// Decodes the document into a model, injecting the document id as `id`.
    /// A document missing required fields is reported as a retrieval error.
    pub fn decode<T: DeserializeOwned>(self, collection: &str) -> Result<T, AppError> {
        let Document { id, mut data } = self;

        let Some(fields) = data.as_object_mut() else {
            return Err(AppError::Retrieval(format!(
                "malformed {collection} document {id}: not an object"
            )));
        };
        fields.insert("id".to_string(), Value::String(id.clone()));

        serde_json::from_value(data).map_err(|err| {
            AppError::Retrieval(format!("malformed {collection} document {id}: {err}"))
        })
    }
}

/// Status filter plus limit; results come back most recently updated first.
#[derive(Debug, Clone, Copy)]
pub struct AmbulanceQuery {
    pub status: AmbulanceStatus,
    pub limit: usize,
}

/// Live snapshots of one document, current state first, until dropped.
/// The stream ending means the connection to the store was lost.
pub type SnapshotStream = Pin<Box<dyn Stream<Item = Result<Document, AppError>> + Send>>;

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn query_ambulances(&self, query: AmbulanceQuery) -> Result<Vec<Document>, AppError>;

    async fn get_ambulance(&self, id: &str) -> Result<Option<Document>, AppError>;

    async fn get_request(&self, id: &str) -> Result<Option<Document>, AppError>;

    /// Requests of one user, newest first.
    async fn query_requests_by_user(&self, user_id: &str) -> Result<Vec<Document>, AppError>;

    async fn watch_ambulance(&self, id: &str) -> Result<SnapshotStream, AppError>;

    async fn watch_request(&self, id: &str) -> Result<SnapshotStream, AppError>;

    /// Stores a new request under `id`, stamping `createdAt` and `updatedAt`
    /// with the server time. Fails with `Conflict` if the id is taken.
    async fn create_request(&self, id: &str, data: Value) -> Result<(), AppError>;

    /// Merges `fields` into an existing ambulance and refreshes `lastUpdated`.
    async fn update_ambulance(&self, id: &str, fields: Value) -> Result<(), AppError>;

    /// Creates or replaces an ambulance document as given.
    async fn put_ambulance(&self, id: &str, data: Value) -> Result<(), AppError>;

    /// Atomically moves an Available ambulance to On Call for `request_id`.
    /// Fails with `Conflict` when the ambulance is in any other status.
    async fn claim_ambulance(&self, id: &str, request_id: &str) -> Result<(), AppError>;

    /// Returns the ambulance to Available if it is still held for
    /// `request_id`; otherwise leaves it untouched.
    async fn release_ambulance(&self, id: &str, request_id: &str) -> Result<(), AppError>;
}

pub async fn load_ambulance(store: &dyn DocumentStore, id: &str) -> Result<Ambulance, AppError> {
    store
        .get_ambulance(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("ambulance {id} not found")))?
        .decode(AMBULANCES)
}

pub async fn load_request(store: &dyn DocumentStore, id: &str) -> Result<Request, AppError> {
    store
        .get_request(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("request {id} not found")))?
        .decode(REQUESTS)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{Document, AMBULANCES};
    use crate::error::AppError;
    use crate::models::ambulance::{Ambulance, AmbulanceStatus};

    #[test]
    fn decode_injects_document_id() {
        let doc = Document::new(
            "amb-7",
            json!({
                "location": { "lat": 25.1, "lng": 85.3 },
                "status": "On Call",
                "vehicleNumber": "BR-01-7777",
                "type": "Advanced Life Support",
                "driverName": "Arjun",
                "driverPhone": "+91 9000000007",
                "lastUpdated": "2024-05-01T10:00:00Z"
            }),
        );

        let ambulance: Ambulance = doc.decode(AMBULANCES).unwrap();
        assert_eq!(ambulance.id, "amb-7");
        assert_eq!(ambulance.status, AmbulanceStatus::OnCall);
        assert_eq!(ambulance.vehicle_type, "Advanced Life Support");
        assert!(ambulance.current_request_id.is_none());
    }

    #[test]
    fn non_object_document_is_a_retrieval_error() {
        let err = Document::new("amb-8", json!("garbage"))
            .decode::<Ambulance>(AMBULANCES)
            .unwrap_err();
        assert!(matches!(err, AppError::Retrieval(_)));
    }
}
