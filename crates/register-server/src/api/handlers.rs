use std::sync::Arc;

use api_types::Application;
use api_types::ApplicationResources;
use api_types::Instance;
use api_types::MetadataBatch;
use api_types::RegistrationPayload;
use poem::handler;
use poem::http::StatusCode;
use poem::web::Data;
use poem::web::Json;
use poem::web::Path;
use poem::IntoResponse;
use poem::Response;
use serde::Serialize;
use tracing::debug;

use super::errors::invalid_body;
use super::errors::registration_error;
use crate::domain::ApplicationRepository;
use crate::domain::RegistrationService;

#[derive(Debug, Serialize)]
pub struct ApplicationResponse {
    pub application: Application,
}

/// Full application list.
#[handler]
pub async fn get_apps(
    repository: Data<&Arc<ApplicationRepository>>,
) -> Json<ApplicationResources> {
    Json(repository.get_application_resources())
}

/// Delta tracking is not implemented; always "no changes".
#[handler]
pub async fn get_apps_delta() -> Json<ApplicationResources> {
    Json(ApplicationResources::empty_delta())
}

/// UP instances of one application.
#[handler]
pub async fn get_app(
    Path(app): Path<String>,
    repository: Data<&Arc<ApplicationRepository>>,
) -> Json<ApplicationResponse> {
    let instances = repository.get_instances_by_service(&app);
    Json(ApplicationResponse {
        application: Application {
            name: app,
            instances,
        },
    })
}

#[handler]
pub async fn register_instance(
    Path(app): Path<String>,
    body: Vec<u8>,
    registration: Data<&Arc<RegistrationService>>,
) -> poem::Result<Response> {
    let payload: RegistrationPayload = serde_json::from_slice(&body).map_err(invalid_body)?;

    let stored = registration
        .register(&app, payload.into_instance())
        .await
        .map_err(registration_error)?;

    Ok(match stored {
        Some(_) => StatusCode::NO_CONTENT.into_response(),
        None => StatusCode::OK.into_response(),
    })
}

/// Heartbeat. Leases are not expired, so this only acknowledges.
#[handler]
pub async fn renew_instance(
    Path((app, instance_id)): Path<(String, String)>,
    repository: Data<&Arc<ApplicationRepository>>,
) -> StatusCode {
    let known = repository.renew(&app, &instance_id);
    debug!(app = %app, instance_id = %instance_id, legacy = !known.instance_id.is_empty(), "renew");
    StatusCode::OK
}

#[handler]
pub async fn delete_instance(
    Path((_app, instance_id)): Path<(String, String)>,
    registration: Data<&Arc<RegistrationService>>,
) -> poem::Result<StatusCode> {
    registration
        .delete(&instance_id)
        .await
        .map_err(registration_error)?;
    Ok(StatusCode::OK)
}

#[handler]
pub async fn update_metadata(
    body: Vec<u8>,
    registration: Data<&Arc<RegistrationService>>,
) -> poem::Result<Json<Vec<Instance>>> {
    let batch: MetadataBatch = serde_json::from_slice(&body).map_err(invalid_body)?;
    let updated = registration
        .update_metadata(&batch)
        .await
        .map_err(registration_error)?;
    Ok(Json(updated))
}
