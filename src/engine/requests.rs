use std::sync::Arc;

use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::AppError;
use crate::identity::CurrentUser;
use crate::models::request::{NewRequest, Request, RequestStatus};
use crate::store::{load_request, DocumentStore, REQUESTS};

/// Request creation and lookup on behalf of an authenticated user.
pub struct RequestService {
    store: Arc<dyn DocumentStore>,
}

impl RequestService {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Records a pending request against an available ambulance and puts that
    /// ambulance on call. The ambulance is claimed before the request is
    /// written and released again if that write fails.
    pub async fn create_request(
        &self,
        user: &CurrentUser,
        new_request: NewRequest,
    ) -> Result<Request, AppError> {
        new_request.validate()?;

        let request_id = Uuid::new_v4().to_string();
        let ambulance_id = new_request.ambulance_id.clone();

        self.store
            .claim_ambulance(&ambulance_id, &request_id)
            .await?;

        let created = self
            .store
            .create_request(
                &request_id,
                json!({
                    "userId": user.uid,
                    "ambulanceId": ambulance_id,
                    "pickup": new_request.pickup,
                    "pickupAddress": new_request.pickup_address,
                    "destination": new_request.destination,
                    "contactNumber": new_request.contact_number,
                    "patientInfo": new_request.patient_info,
                    "status": RequestStatus::Pending,
                }),
            )
            .await;

        if let Err(err) = created {
            if let Err(release_err) = self
                .store
                .release_ambulance(&ambulance_id, &request_id)
                .await
            {
                warn!(
                    ambulance_id = %ambulance_id,
                    request_id = %request_id,
                    error = %release_err,
                    "failed to release ambulance after request write failed"
                );
            }
            return Err(err);
        }

        info!(
            request_id = %request_id,
            ambulance_id = %ambulance_id,
            user_id = %user.uid,
            "ambulance request created"
        );

        self.get_request(&request_id).await
    }

    pub async fn get_request(&self, request_id: &str) -> Result<Request, AppError> {
        load_request(self.store.as_ref(), request_id).await
    }

    /// The user's requests, newest first.
    pub async fn list_user_requests(&self, user_id: &str) -> Result<Vec<Request>, AppError> {
        self.store
            .query_requests_by_user(user_id)
            .await?
            .into_iter()
            .map(|doc| doc.decode(REQUESTS))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;
    use serde_json::{json, Value};

    use super::RequestService;
    use crate::error::AppError;
    use crate::identity::CurrentUser;
    use crate::models::ambulance::{AmbulanceStatus, Coordinate};
    use crate::models::request::{EmergencyType, Gender, NewRequest, PatientInfo, RequestStatus};
    use crate::store::memory::MemoryStore;
    use crate::store::{load_ambulance, AmbulanceQuery, Document, DocumentStore, SnapshotStream};

    /// Hands control back to the scheduler before every call, the way a
    /// remote store does, and can be told to reject request writes.
    struct RemoteLikeStore {
        inner: Arc<MemoryStore>,
        reject_request_writes: AtomicBool,
    }

    impl RemoteLikeStore {
        fn new(inner: Arc<MemoryStore>) -> Self {
            Self {
                inner,
                reject_request_writes: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl DocumentStore for RemoteLikeStore {
        async fn query_ambulances(&self, query: AmbulanceQuery) -> Result<Vec<Document>, AppError> {
            tokio::task::yield_now().await;
            self.inner.query_ambulances(query).await
        }

        async fn get_ambulance(&self, id: &str) -> Result<Option<Document>, AppError> {
            tokio::task::yield_now().await;
            self.inner.get_ambulance(id).await
        }

        async fn get_request(&self, id: &str) -> Result<Option<Document>, AppError> {
            tokio::task::yield_now().await;
            self.inner.get_request(id).await
        }

        async fn query_requests_by_user(&self, user_id: &str) -> Result<Vec<Document>, AppError> {
            tokio::task::yield_now().await;
            self.inner.query_requests_by_user(user_id).await
        }

        async fn watch_ambulance(&self, id: &str) -> Result<SnapshotStream, AppError> {
            tokio::task::yield_now().await;
            self.inner.watch_ambulance(id).await
        }

        async fn watch_request(&self, id: &str) -> Result<SnapshotStream, AppError> {
            tokio::task::yield_now().await;
            self.inner.watch_request(id).await
        }

        async fn create_request(&self, id: &str, data: Value) -> Result<(), AppError> {
            tokio::task::yield_now().await;
            if self.reject_request_writes.load(Ordering::SeqCst) {
                return Err(AppError::Retrieval("write rejected".to_string()));
            }
            self.inner.create_request(id, data).await
        }

        async fn update_ambulance(&self, id: &str, fields: Value) -> Result<(), AppError> {
            tokio::task::yield_now().await;
            self.inner.update_ambulance(id, fields).await
        }

        async fn put_ambulance(&self, id: &str, data: Value) -> Result<(), AppError> {
            tokio::task::yield_now().await;
            self.inner.put_ambulance(id, data).await
        }

        async fn claim_ambulance(&self, id: &str, request_id: &str) -> Result<(), AppError> {
            tokio::task::yield_now().await;
            self.inner.claim_ambulance(id, request_id).await
        }

        async fn release_ambulance(&self, id: &str, request_id: &str) -> Result<(), AppError> {
            tokio::task::yield_now().await;
            self.inner.release_ambulance(id, request_id).await
        }
    }

    fn user() -> CurrentUser {
        CurrentUser {
            uid: "user-42".to_string(),
        }
    }

    fn new_request(ambulance_id: &str) -> NewRequest {
        NewRequest {
            ambulance_id: ambulance_id.to_string(),
            pickup: Coordinate::new(25.0961, 85.3131),
            pickup_address: "Station Road, Nalanda".to_string(),
            destination: "District Hospital".to_string(),
            contact_number: "+91 9876543210".to_string(),
            patient_info: PatientInfo {
                name: "Sita Devi".to_string(),
                age: 54,
                gender: Gender::Female,
                emergency_type: EmergencyType::Cardiac,
                notes: "history of hypertension".to_string(),
            },
        }
    }

    async fn store_with_ambulance(status: &str) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::default());
        store
            .put_ambulance(
                "amb-1",
                json!({
                    "location": { "lat": 25.1, "lng": 85.31 },
                    "status": status,
                    "vehicleNumber": "BR-01-1111",
                    "driverName": "Ravi Kumar",
                    "driverPhone": "+91 9000000001",
                    "lastUpdated": "2024-05-01T10:00:00Z",
                }),
            )
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn creating_a_request_puts_the_ambulance_on_call() {
        let store = store_with_ambulance("Available").await;
        let service = RequestService::new(store.clone());

        let request = service
            .create_request(&user(), new_request("amb-1"))
            .await
            .unwrap();
        assert_eq!(request.user_id, "user-42");
        assert_eq!(request.status, RequestStatus::Pending);
        assert_eq!(request.ambulance_id.as_deref(), Some("amb-1"));
        assert_eq!(request.created_at, request.updated_at);

        let ambulance = load_ambulance(store.as_ref(), "amb-1").await.unwrap();
        assert_eq!(ambulance.status, AmbulanceStatus::OnCall);
        assert_eq!(ambulance.current_request_id, Some(request.id.clone()));
    }

    #[tokio::test]
    async fn busy_ambulance_is_a_conflict() {
        let store = store_with_ambulance("On Call").await;
        let service = RequestService::new(store);

        let err = service
            .create_request(&user(), new_request("amb-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[tokio::test]
    async fn unknown_ambulance_is_not_found() {
        let store = store_with_ambulance("Available").await;
        let service = RequestService::new(store);

        let err = service
            .create_request(&user(), new_request("amb-404"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn invalid_request_is_rejected_before_touching_the_store() {
        let store = store_with_ambulance("Available").await;
        let service = RequestService::new(store.clone());

        let mut bad = new_request("amb-1");
        bad.patient_info.name = String::new();
        let err = service.create_request(&user(), bad).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        assert!(store.query_requests_by_user("user-42").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn history_lists_only_the_users_requests() {
        let store = Arc::new(MemoryStore::default());
        for id in ["amb-1", "amb-2"] {
            store
                .put_ambulance(
                    id,
                    json!({
                        "location": { "lat": 25.1, "lng": 85.31 },
                        "status": "Available",
                        "vehicleNumber": format!("BR-{id}"),
                        "driverName": "Driver",
                        "driverPhone": "+91 9000000000",
                        "lastUpdated": "2024-05-01T10:00:00Z",
                    }),
                )
                .await
                .unwrap();
        }
        let service = RequestService::new(store);

        let older = service
            .create_request(&user(), new_request("amb-1"))
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let newer = service
            .create_request(&user(), new_request("amb-2"))
            .await
            .unwrap();

        let history = service.list_user_requests("user-42").await.unwrap();
        let ids: Vec<_> = history.iter().map(|r| r.id.clone()).collect();
        assert_eq!(ids, [newer.id, older.id]);

        assert!(service.list_user_requests("someone-else").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn concurrent_requests_for_one_ambulance_book_it_once() {
        let store = store_with_ambulance("Available").await;
        let service = RequestService::new(Arc::new(RemoteLikeStore::new(store.clone())));
        let other = CurrentUser {
            uid: "user-7".to_string(),
        };

        let first_user = user();
        let (first, second) = tokio::join!(
            service.create_request(&first_user, new_request("amb-1")),
            service.create_request(&other, new_request("amb-1")),
        );

        let (winner, refused, refused_user) = match (first, second) {
            (Ok(request), Err(err)) => (request, err, "user-7"),
            (Err(err), Ok(request)) => (request, err, "user-42"),
            (first, second) => panic!("expected one booking, got {first:?} and {second:?}"),
        };
        assert!(matches!(refused, AppError::Conflict(_)));
        assert!(store.query_requests_by_user(refused_user).await.unwrap().is_empty());

        let ambulance = load_ambulance(store.as_ref(), "amb-1").await.unwrap();
        assert_eq!(ambulance.status, AmbulanceStatus::OnCall);
        assert_eq!(ambulance.current_request_id, Some(winner.id));
    }

    #[tokio::test]
    async fn failed_request_write_frees_the_ambulance() {
        let store = store_with_ambulance("Available").await;
        let remote = Arc::new(RemoteLikeStore::new(store.clone()));
        remote.reject_request_writes.store(true, Ordering::SeqCst);
        let service = RequestService::new(remote.clone());

        let err = service
            .create_request(&user(), new_request("amb-1"))
            .await
            .unwrap_err();
        assert!(err.is_retryable());

        let ambulance = load_ambulance(store.as_ref(), "amb-1").await.unwrap();
        assert_eq!(ambulance.status, AmbulanceStatus::Available);
        assert!(ambulance.current_request_id.is_none());
        assert!(store.query_requests_by_user("user-42").await.unwrap().is_empty());

        remote.reject_request_writes.store(false, Ordering::SeqCst);
        assert!(service.create_request(&user(), new_request("amb-1")).await.is_ok());
    }
}
