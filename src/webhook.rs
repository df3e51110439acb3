//! HTTP gateway to content-processing webhooks.
//!
//! A call resolves the [`ServiceDescriptor`] to a URL through an injectable
//! resolver, enforces a per-call timeout and classifies the response:
//! `200` with a body is a success, `304` (or an empty `200`) means nothing
//! changed, `422` is a business rejection. Anything else is an error.

use std::sync::Arc;
use std::time::Duration;

use reqwest::multipart::Form;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{AssetError, Result};
use crate::model::ServiceDescriptor;

/// In-cluster service address template.
pub const CLUSTER_URL_TEMPLATE: &str = "http://{name}.{namespace}.svc.cluster.local{endpoint}";

/// Maps a service descriptor to the URL that is called.
pub type UrlResolver = Arc<dyn Fn(&ServiceDescriptor) -> String + Send + Sync>;

/// Resolver filling `{name}`, `{namespace}` and `{endpoint}` into `template`.
pub fn template_resolver(template: impl Into<String>) -> UrlResolver {
    let template = template.into();
    Arc::new(move |svc: &ServiceDescriptor| {
        template
            .replace("{name}", &svc.name)
            .replace("{namespace}", &svc.namespace)
            .replace("{endpoint}", &svc.endpoint)
    })
}

/// Request body of a webhook call.
pub enum Payload {
    Json(Vec<u8>),
    Multipart(Form),
}

impl Payload {
    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        serde_json::to_vec(value)
            .map(Payload::Json)
            .map_err(|e| AssetError::parsing("webhook request", e))
    }
}

/// Classified webhook response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// `200` with content.
    Success(Vec<u8>),
    /// `304`, or `200` without content.
    NotModified,
    /// `422`: the service rejected the input; body explains why.
    Rejected(Vec<u8>),
}

/// Decode a JSON body returned by `url`.
pub fn decode<T: DeserializeOwned>(body: &[u8], url: &str) -> Result<T> {
    serde_json::from_slice(body).map_err(|e| AssetError::parsing(format!("response from {url}"), e))
}

#[derive(Clone)]
pub struct WebhookGateway {
    client: Client,
    resolver: UrlResolver,
}

impl WebhookGateway {
    pub fn new(resolver: UrlResolver) -> Result<Self> {
        let client = Client::builder()
            .build()
            .map_err(|e| AssetError::config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, resolver })
    }

    pub fn url_for(&self, service: &ServiceDescriptor) -> String {
        (self.resolver)(service)
    }

    /// POST `payload` to `service` and classify the reply.
    pub async fn send(
        &self,
        service: &ServiceDescriptor,
        payload: Payload,
        timeout: Duration,
    ) -> Result<Reply> {
        let url = self.url_for(service);
        let request = self.client.post(&url).timeout(timeout);
        let request = match payload {
            Payload::Json(body) => request
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body),
            Payload::Multipart(form) => request.multipart(form),
        };

        debug!(url = %url, service = %service.key(), "Calling webhook");
        let response = request
            .send()
            .await
            .map_err(|e| AssetError::from_reqwest(&url, timeout, e))?;
        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| AssetError::from_reqwest(&url, timeout, e))?
            .to_vec();

        match status {
            StatusCode::OK if body.is_empty() => Ok(Reply::NotModified),
            StatusCode::OK => Ok(Reply::Success(body)),
            StatusCode::NOT_MODIFIED => Ok(Reply::NotModified),
            StatusCode::UNPROCESSABLE_ENTITY => Ok(Reply::Rejected(body)),
            other => {
                warn!(url = %url, status = %other, "Webhook returned unexpected status");
                Err(AssetError::Status {
                    url,
                    status: other.as_u16(),
                    body: String::from_utf8_lossy(&body).into_owned(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_resolver_fills_cluster_address() {
        let resolve = template_resolver(CLUSTER_URL_TEMPLATE);
        let svc = ServiceDescriptor {
            name: "lint".into(),
            namespace: "hooks".into(),
            endpoint: "/validate".into(),
            ..Default::default()
        };
        assert_eq!(resolve(&svc), "http://lint.hooks.svc.cluster.local/validate");
    }

    #[test]
    fn decode_failure_names_the_calling_url() {
        let err = decode::<serde_json::Value>(b"not json", "http://svc/run").unwrap_err();
        assert!(err.to_string().contains("http://svc/run"), "{err}");
    }
}
