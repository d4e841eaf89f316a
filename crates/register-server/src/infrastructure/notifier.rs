//! Tells running instances to reload their configuration

use core::error::Error;
use std::time::Duration;

use api_types::Instance;
use api_types::METADATA_CONTEXT_PATH;
use async_trait::async_trait;
use error_stack::Report;
use error_stack::ResultExt;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, derive_more::Display)]
pub enum NotifyError {
    #[display("Failed to build refresh HTTP client")]
    ClientBuild,
    #[display("Failed to send refresh request to {instance_id}")]
    Request { instance_id: String },
    #[display("Instance {instance_id} answered refresh request with status {status}")]
    Rejected { instance_id: String, status: u16 },
}

impl Error for NotifyError {}

#[async_trait]
pub trait RefreshNotifier: Send + Sync {
    async fn notify(&self, instance: &Instance) -> Result<(), Report<NotifyError>>;
}

/// `http://ip:port[/context-path]/choerodon/config`
pub fn refresh_url(instance: &Instance) -> String {
    let mut url = format!("http://{}:{}", instance.ip_addr, instance.port.port);
    if let Some(context) = instance
        .metadata
        .get(METADATA_CONTEXT_PATH)
        .map(|path| path.trim_matches('/'))
        .filter(|path| !path.is_empty())
    {
        url.push('/');
        url.push_str(context);
    }
    url.push_str("/choerodon/config");
    url
}

/// Sends `PUT` refresh requests with an optional `Authorization` header.
pub struct HttpRefreshNotifier {
    client: reqwest::Client,
    authorization: Option<String>,
}

impl HttpRefreshNotifier {
    /// # Errors
    ///
    /// - [`NotifyError::ClientBuild`] if the TLS backend cannot be set up
    pub fn new(authorization: Option<String>) -> Result<Self, Report<NotifyError>> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .change_context(NotifyError::ClientBuild)?;
        Ok(Self {
            client,
            authorization,
        })
    }
}

#[async_trait]
impl RefreshNotifier for HttpRefreshNotifier {
    async fn notify(&self, instance: &Instance) -> Result<(), Report<NotifyError>> {
        let url = refresh_url(instance);
        let mut request = self.client.put(&url);
        if let Some(token) = &self.authorization {
            request = request.header(reqwest::header::AUTHORIZATION, token);
        }

        let response = request
            .send()
            .await
            .change_context_lazy(|| NotifyError::Request {
                instance_id: instance.instance_id.clone(),
            })
            .attach_printable_lazy(|| format!("url: {url}"))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Report::new(NotifyError::Rejected {
                instance_id: instance.instance_id.clone(),
                status: status.as_u16(),
            }));
        }
        Ok(())
    }
}
