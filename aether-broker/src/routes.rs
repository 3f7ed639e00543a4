//! Axum route handlers for the REST API.
//!
//! The API serialises all access to the engine through one mutex, the same
//! way the bus loop handles one message at a time.

use std::sync::Arc;

use aether_compute::{ComputeError, VmManager};
use aether_core::{CreateVmOptions, VmId, VmListing, VmStatus};
use async_trait::async_trait;
use axum::{
    extract::{rejection::JsonRejection, FromRequest, Path, Request, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use tokio::sync::Mutex;
use tower_http::trace::TraceLayer;

use crate::error::BrokerError;

/// VM operations exposed over HTTP.
#[async_trait]
pub trait VmApi: Send + Sync + 'static {
    async fn list(&self) -> Result<Vec<VmListing>, ComputeError>;
    async fn info(&self, vm_id: &VmId) -> Result<VmStatus, ComputeError>;
    async fn create(&self, options: &CreateVmOptions) -> Result<VmStatus, ComputeError>;
    async fn start(&self, vm_id: &VmId) -> Result<VmStatus, ComputeError>;
    async fn stop(&self, vm_id: &VmId, kill: bool) -> Result<VmStatus, ComputeError>;
    async fn delete(&self, vm_id: &VmId) -> Result<VmStatus, ComputeError>;
}

#[async_trait]
impl VmApi for VmManager {
    async fn list(&self) -> Result<Vec<VmListing>, ComputeError> {
        VmManager::list(self).await
    }

    async fn info(&self, vm_id: &VmId) -> Result<VmStatus, ComputeError> {
        VmManager::info(self, vm_id).await
    }

    async fn create(&self, options: &CreateVmOptions) -> Result<VmStatus, ComputeError> {
        VmManager::create(self, options).await
    }

    async fn start(&self, vm_id: &VmId) -> Result<VmStatus, ComputeError> {
        VmManager::start(self, vm_id).await
    }

    async fn stop(&self, vm_id: &VmId, kill: bool) -> Result<VmStatus, ComputeError> {
        VmManager::stop(self, vm_id, kill).await
    }

    async fn delete(&self, vm_id: &VmId) -> Result<VmStatus, ComputeError> {
        VmManager::delete(self, vm_id).await
    }
}

type Shared<A> = Arc<Mutex<A>>;

/// A JSON request body. Unreadable bodies are rejected as
/// [`BrokerError::InvalidRequest`] so they share the API's error format.
pub struct JsonBody<T>(pub T);

impl<S, T> FromRequest<S> for JsonBody<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = BrokerError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(Self(value)),
            Err(rejection) => Err(BrokerError::InvalidRequest(rejection.body_text())),
        }
    }
}

/// Target state in a `PATCH /vm/{id}` body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DesiredState {
    Started,
    Stopped,
}

#[derive(Debug, Deserialize)]
pub struct UpdateVmBody {
    pub status: DesiredState,
}

/// Build the application router around `api`.
pub fn create_router<A: VmApi>(api: A) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/vm", get(list_vms::<A>).post(create_vm::<A>))
        .route(
            "/vm/{id}",
            get(vm_info::<A>).patch(update_vm::<A>).delete(delete_vm::<A>),
        )
        .with_state(Arc::new(Mutex::new(api)))
        .layer(TraceLayer::new_for_http())
}

/// `GET /health`: liveness check.
pub async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({"status": "ok"})))
}

/// `GET /vm`: every running VM with its guest addresses.
///
/// # Errors
/// Returns an error if the process table cannot be read.
pub async fn list_vms<A: VmApi>(State(api): State<Shared<A>>) -> Result<impl IntoResponse, BrokerError> {
    Ok(Json(api.lock().await.list().await?))
}

/// `GET /vm/{id}`
///
/// # Errors
/// Returns [`BrokerError::Invalid`] for a malformed id and a 404 for an
/// unknown VM.
pub async fn vm_info<A: VmApi>(
    State(api): State<Shared<A>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, BrokerError> {
    let vm_id: VmId = id.parse()?;
    Ok(Json(api.lock().await.info(&vm_id).await?))
}

/// `POST /vm`: create and start a VM.
///
/// # Errors
/// Returns [`BrokerError::InvalidRequest`] for an unreadable body and
/// otherwise propagates the creation error; see [`VmManager::create`].
pub async fn create_vm<A: VmApi>(
    State(api): State<Shared<A>>,
    JsonBody(options): JsonBody<CreateVmOptions>,
) -> Result<impl IntoResponse, BrokerError> {
    Ok(Json(api.lock().await.create(&options).await?))
}

/// `PATCH /vm/{id}`: start or gracefully stop a VM.
///
/// # Errors
/// Returns [`BrokerError::Invalid`] for a malformed id,
/// [`BrokerError::InvalidRequest`] for a body without a known `status` and
/// a 404 for an unknown VM.
pub async fn update_vm<A: VmApi>(
    State(api): State<Shared<A>>,
    Path(id): Path<String>,
    JsonBody(body): JsonBody<UpdateVmBody>,
) -> Result<impl IntoResponse, BrokerError> {
    let vm_id: VmId = id.parse()?;
    let api = api.lock().await;
    let status = match body.status {
        DesiredState::Started => api.start(&vm_id).await?,
        DesiredState::Stopped => api.stop(&vm_id, false).await?,
    };
    Ok(Json(status))
}

/// `DELETE /vm/{id}`
///
/// # Errors
/// Returns [`BrokerError::Invalid`] for a malformed id and a 404 for an
/// unknown VM.
pub async fn delete_vm<A: VmApi>(
    State(api): State<Shared<A>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, BrokerError> {
    let vm_id: VmId = id.parse()?;
    Ok(Json(api.lock().await.delete(&vm_id).await?))
}
