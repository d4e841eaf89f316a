use std::sync::Arc;

use error_stack::Report;
use poem::get;
use poem::listener::TcpListener;
use poem::middleware::Tracing;
use poem::put;
use poem::Endpoint;
use poem::EndpointExt;
use poem::Route;
use poem::Server;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;

use super::errors::ApiError;
use super::handlers::delete_instance;
use super::handlers::get_app;
use super::handlers::get_apps;
use super::handlers::get_apps_delta;
use super::handlers::register_instance;
use super::handlers::renew_instance;
use super::handlers::update_metadata;
use crate::domain::ApplicationRepository;
use crate::domain::RegistrationService;

/// Eureka-compatible routes.
pub fn routes(
    repository: Arc<ApplicationRepository>,
    registration: Arc<RegistrationService>,
) -> impl Endpoint + 'static {
    Route::new()
        .at("/eureka/apps", get(get_apps))
        .at("/eureka/apps/delta", get(get_apps_delta))
        .at("/eureka/apps/metadata", put(update_metadata))
        .at("/eureka/apps/:app", get(get_app).post(register_instance))
        .at(
            "/eureka/apps/:app/:instance_id",
            put(renew_instance).delete(delete_instance),
        )
        .data(repository)
        .data(registration)
        .with(Tracing)
}

/// HTTP server for the Eureka API
pub struct ApiServer {
    repository: Arc<ApplicationRepository>,
    registration: Arc<RegistrationService>,
    listen_addr: String,
}

impl ApiServer {
    pub fn new(
        repository: Arc<ApplicationRepository>,
        registration: Arc<RegistrationService>,
        listen_addr: String,
    ) -> Self {
        Self {
            repository,
            registration,
            listen_addr,
        }
    }

    /// Start the API server
    ///
    /// # Errors
    ///
    /// - [`ApiError::ServerError`] if the server fails to start or bind to the address
    pub async fn run(
        &self,
        cancellation_token: CancellationToken,
    ) -> Result<(), Report<ApiError>> {
        info!("Starting HTTP API server on {}", self.listen_addr);

        let app = routes(self.repository.clone(), self.registration.clone());
        let listener = TcpListener::bind(self.listen_addr.clone());
        let server = Server::new(listener);

        tokio::select! {
            result = server.run(app) => {
                match result {
                    Ok(()) => {
                        info!("API server stopped normally");
                        Ok(())
                    }
                    Err(e) => {
                        error!("API server failed: {e}");
                        Err(Report::new(ApiError::ServerError {
                            message: format!("Server failed: {e}"),
                        }))
                    }
                }
            }
            _ = cancellation_token.cancelled() => {
                info!("API server shutdown requested");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use api_types::ApplicationResources;
    use api_types::Instance;
    use api_types::InstanceStatus;
    use api_types::Port;
    use api_types::METADATA_VERSION;
    use poem::http::StatusCode;
    use poem::test::TestClient;
    use poem::test::TestResponse;
    use serde_json::json;
    use serde_json::Value;
    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;
    use crate::domain::RegistryArchive;
    use crate::infrastructure::k8s::mock::InMemoryConfigMaps;
    use crate::infrastructure::k8s::mock::InMemoryPods;

    struct Fixture {
        config_maps: Arc<InMemoryConfigMaps>,
        repository: Arc<ApplicationRepository>,
        registration: Arc<RegistrationService>,
    }

    fn fixture() -> Fixture {
        let config_maps = Arc::new(InMemoryConfigMaps::new());
        let repository = Arc::new(ApplicationRepository::new());
        let archive = Arc::new(RegistryArchive::new(config_maps.clone(), "register-server"));
        let registration = Arc::new(RegistrationService::new(
            repository.clone(),
            archive,
            Arc::new(InMemoryPods::new()),
        ));
        Fixture {
            config_maps,
            repository,
            registration,
        }
    }

    impl Fixture {
        fn client(&self) -> TestClient<impl Endpoint> {
            TestClient::new(routes(self.repository.clone(), self.registration.clone()))
        }
    }

    async fn body_json(response: TestResponse) -> Value {
        let body = response
            .0
            .into_body()
            .into_string()
            .await
            .expect("body should be readable");
        serde_json::from_str(&body).expect("body should be JSON")
    }

    #[test(tokio::test)]
    async fn delta_is_always_empty() {
        let f = fixture();

        let response = f.client().get("/eureka/apps/delta").send().await;
        response.assert_status_is_ok();

        let value = body_json(response).await;
        assert_eq!(value["applications"]["versions__delta"], json!(2));
        assert_eq!(value["applications"]["apps__hashcode"], json!("app_hashcode"));
        assert_eq!(value["applications"]["application"], json!([]));
    }

    #[test(tokio::test)]
    async fn register_then_list() {
        let f = fixture();
        let client = f.client();

        let response = client
            .post("/eureka/apps/legacy-erp")
            .body_json(&json!({"instance": {"ipAddr": "192.168.1.9", "port": {"$": 7000, "@enabled": "true"}}}))
            .send()
            .await;
        response.assert_status(StatusCode::NO_CONTENT);

        let response = client.get("/eureka/apps").send().await;
        response.assert_status_is_ok();
        let value = body_json(response).await;
        let resources: ApplicationResources =
            serde_json::from_value(value).expect("should match the wire model");
        let instance = resources
            .find_instance("192.168.1.9:legacy-erp:7000")
            .expect("registered instance should be listed");
        assert_eq!(instance.status, InstanceStatus::Up);
    }

    #[test(tokio::test)]
    async fn zero_port_is_accepted_and_ignored() {
        let f = fixture();

        let response = f
            .client()
            .post("/eureka/apps/orders")
            .body_json(&json!({"ipAddr": "10.0.0.5", "port": {"port": 0}}))
            .send()
            .await;

        response.assert_status_is_ok();
        assert!(f.repository.custom_instance_ids().is_empty());
    }

    #[test(tokio::test)]
    async fn malformed_body_is_rejected() {
        let f = fixture();

        let response = f
            .client()
            .post("/eureka/apps/orders")
            .body("{not json")
            .send()
            .await;
        response.assert_status(StatusCode::BAD_REQUEST);

        let response = f
            .client()
            .put("/eureka/apps/metadata")
            .body("[1, 2]")
            .send()
            .await;
        response.assert_status(StatusCode::BAD_REQUEST);
    }

    #[test(tokio::test)]
    async fn persistence_failure_is_a_server_error() {
        let f = fixture();
        f.config_maps.set_fail_gets(true);

        let response = f
            .client()
            .post("/eureka/apps/orders")
            .body_json(&json!({"ipAddr": "10.0.0.5", "port": {"port": 8080}}))
            .send()
            .await;

        response.assert_status(StatusCode::INTERNAL_SERVER_ERROR);
        assert!(f.repository.custom_instance_ids().is_empty());
    }

    #[test(tokio::test)]
    async fn delete_removes_custom_instance() {
        let f = fixture();
        let client = f.client();
        client
            .post("/eureka/apps/orders")
            .body_json(&json!({"ipAddr": "10.0.0.5", "port": {"port": 8080}}))
            .send()
            .await
            .assert_status(StatusCode::NO_CONTENT);

        let response = client
            .delete("/eureka/apps/orders/10.0.0.5:orders:8080")
            .send()
            .await;
        response.assert_status_is_ok();

        let response = client.get("/eureka/apps/orders").send().await;
        let value = body_json(response).await;
        assert_eq!(value["application"]["instance"], json!([]));
    }

    #[test(tokio::test)]
    async fn renew_is_acknowledged() {
        let f = fixture();

        f.client()
            .put("/eureka/apps/orders/10.0.0.5:orders:8080")
            .send()
            .await
            .assert_status_is_ok();
    }

    #[test(tokio::test)]
    async fn metadata_update_returns_patched_instances() {
        let f = fixture();
        let mut pod = Instance {
            ip_addr: "10.0.0.5".to_string(),
            app: "orders".to_string(),
            port: Port::enabled(8080),
            metadata: BTreeMap::from([(METADATA_VERSION.to_string(), "v1".to_string())]),
            ..Default::default()
        };
        pod.assign_instance_id();
        f.repository.register(pod, "prod/orders-0");

        let response = f
            .client()
            .put("/eureka/apps/metadata")
            .body_json(&json!({"10.0.0.5:orders:8080": {"version": "v2", "zone": "b"}}))
            .send()
            .await;
        response.assert_status_is_ok();

        let value = body_json(response).await;
        assert_eq!(value[0]["metadata"]["version"], json!("v1"));
        assert_eq!(value[0]["metadata"]["zone"], json!("b"));
    }
}
