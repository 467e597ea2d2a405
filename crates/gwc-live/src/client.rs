use crate::config::ConsoleConfig;
use gwc_core::wire::{ActionResponse, GatewayAction, ModelListResponse, PendingContacts, Snapshot};
use reqwest::header::{HeaderValue, CACHE_CONTROL};
use serde::de::DeserializeOwned;
use std::future::Future;
use thiserror::Error;
use tracing::debug;
use url::Url;
use uuid::Uuid;

const MAX_ERROR_BODY_CHARS: usize = 512;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("request failed: {0}")]
    Request(#[source] reqwest::Error),
    #[error("failed to read response body: {0}")]
    Read(#[source] reqwest::Error),
    #[error("gateway returned {status}: {body}")]
    Http { status: u16, body: String },
    #[error("invalid response json: {0}")]
    Decode(#[from] serde_json::Error),
}

impl ClientError {
    /// Short message suitable for an error state shown next to a retry action.
    pub fn user_message(&self) -> String {
        match self {
            ClientError::Request(err) if err.is_timeout() => "gateway timed out".to_string(),
            ClientError::Request(_) => "gateway unreachable".to_string(),
            ClientError::Read(_) => "gateway response was interrupted".to_string(),
            ClientError::Http { status, body } if body.is_empty() => {
                format!("gateway returned {status}")
            }
            ClientError::Http { status, body } => format!("gateway returned {status}: {body}"),
            ClientError::Decode(_) => "gateway sent an unexpected response".to_string(),
        }
    }
}

/// Request/response surface of the gateway used by the live views.
pub trait GatewayApi: Send + Sync + 'static {
    fn fetch_snapshot(&self) -> impl Future<Output = Result<Snapshot, ClientError>> + Send;

    fn probe_health(&self) -> impl Future<Output = Result<(), ClientError>> + Send;

    fn test_key(
        &self,
        provider: &str,
        token: &str,
    ) -> impl Future<Output = Result<ActionResponse, ClientError>> + Send;

    fn list_models(
        &self,
        provider: &str,
        token: &str,
    ) -> impl Future<Output = Result<ModelListResponse, ClientError>> + Send;

    fn add_channel(
        &self,
        channel: &str,
        token: &str,
    ) -> impl Future<Output = Result<ActionResponse, ClientError>> + Send;

    fn approve_dm(
        &self,
        channel: &str,
        code: &str,
    ) -> impl Future<Output = Result<ActionResponse, ClientError>> + Send;

    fn pending_contacts(&self) -> impl Future<Output = Result<PendingContacts, ClientError>> + Send;
}

#[derive(Debug, Clone)]
pub struct GatewayClient {
    http: reqwest::Client,
    config: ConsoleConfig,
}

impl GatewayClient {
    pub fn new(config: ConsoleConfig) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(ClientError::Request)?;
        Ok(Self { http, config })
    }

    pub fn config(&self) -> &ConsoleConfig {
        &self.config
    }

    /// Underlying connection pool; push transports reuse it.
    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    pub fn metric_stream_url(&self) -> String {
        self.config.endpoint(&self.config.metric_stream_path)
    }

    pub fn pairing_stream_url(
        &self,
        channel: &str,
        account: Option<&str>,
    ) -> Result<Url, url::ParseError> {
        let mut url = Url::parse(&self.config.endpoint(&self.config.pairing_stream_path))?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("channel", channel);
            if let Some(account) = account.filter(|value| !value.trim().is_empty()) {
                query.append_pair("account", account);
            }
        }
        Ok(url)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ClientError> {
        let request = self
            .http
            .get(self.config.endpoint(path))
            .header(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        self.send(request, path).await
    }

    async fn post_action<T: DeserializeOwned>(
        &self,
        action: &GatewayAction,
    ) -> Result<T, ClientError> {
        let request = self
            .http
            .post(self.config.endpoint(&self.config.action_path))
            .json(action);
        self.send(request, action.name()).await
    }

    async fn send<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
        label: &str,
    ) -> Result<T, ClientError> {
        let request_id = Uuid::new_v4().to_string();
        let response = request
            .header("x-request-id", &request_id)
            .send()
            .await
            .map_err(ClientError::Request)?;
        let status = response.status();
        let body = response.text().await.map_err(ClientError::Read)?;
        debug!(
            event = "gateway_response",
            request = label,
            request_id = %request_id,
            status = status.as_u16(),
            bytes = body.len()
        );
        if !status.is_success() {
            return Err(ClientError::Http {
                status: status.as_u16(),
                body: truncate_body(&body),
            });
        }
        Ok(serde_json::from_str(&body)?)
    }
}

impl GatewayApi for GatewayClient {
    async fn fetch_snapshot(&self) -> Result<Snapshot, ClientError> {
        self.get_json(&self.config.snapshot_path).await
    }

    async fn probe_health(&self) -> Result<(), ClientError> {
        let _: serde_json::Value = self.get_json(&self.config.health_path).await?;
        Ok(())
    }

    async fn test_key(&self, provider: &str, token: &str) -> Result<ActionResponse, ClientError> {
        self.post_action(&GatewayAction::TestKey {
            provider: provider.to_string(),
            token: token.to_string(),
        })
        .await
    }

    async fn list_models(
        &self,
        provider: &str,
        token: &str,
    ) -> Result<ModelListResponse, ClientError> {
        self.post_action(&GatewayAction::ListModels {
            provider: provider.to_string(),
            token: token.to_string(),
        })
        .await
    }

    async fn add_channel(&self, channel: &str, token: &str) -> Result<ActionResponse, ClientError> {
        self.post_action(&GatewayAction::Add {
            channel: channel.to_string(),
            token: token.to_string(),
        })
        .await
    }

    async fn approve_dm(&self, channel: &str, code: &str) -> Result<ActionResponse, ClientError> {
        self.post_action(&GatewayAction::ApproveDm {
            channel: channel.to_string(),
            code: code.to_string(),
        })
        .await
    }

    async fn pending_contacts(&self) -> Result<PendingContacts, ClientError> {
        self.post_action(&GatewayAction::ListPending).await
    }
}

fn truncate_body(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.chars().count() <= MAX_ERROR_BODY_CHARS {
        return trimmed.to_string();
    }
    let mut cut: String = trimmed.chars().take(MAX_ERROR_BODY_CHARS).collect();
    cut.push_str("...");
    cut
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pairing_url_carries_channel_and_account() {
        let client = GatewayClient::new(ConsoleConfig::default()).expect("client");
        let url = client
            .pairing_stream_url("whatsapp", Some("work phone"))
            .expect("url");
        assert_eq!(
            url.as_str(),
            "http://127.0.0.1:18789/api/channels/login?channel=whatsapp&account=work+phone"
        );

        let url = client.pairing_stream_url("signal", Some("  ")).expect("url");
        assert_eq!(url.query(), Some("channel=signal"));
    }

    #[test]
    fn error_bodies_are_truncated() {
        let long = "x".repeat(MAX_ERROR_BODY_CHARS + 10);
        let cut = truncate_body(&long);
        assert!(cut.ends_with("..."));
        assert_eq!(cut.chars().count(), MAX_ERROR_BODY_CHARS + 3);
        assert_eq!(truncate_body("  short \n"), "short");
    }

    #[test]
    fn http_errors_read_as_user_messages() {
        let err = ClientError::Http {
            status: 502,
            body: String::new(),
        };
        assert_eq!(err.user_message(), "gateway returned 502");
    }
}
