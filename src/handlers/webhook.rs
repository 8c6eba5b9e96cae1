//! `webhook.deliver`: POST a JSON body to a URL.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use crate::worker::{Handler, HandlerError, UnitContext};

pub const KIND: &str = "webhook.deliver";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookRequest {
    pub url: String,
    pub body: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookDelivery {
    pub status: u16,
}

pub struct WebhookHandler {
    client: reqwest::Client,
}

impl WebhookHandler {
    /// Client with a per-request `timeout`. Proxy environment variables are
    /// ignored unless `use_proxy` is set.
    pub fn new(timeout: Duration, use_proxy: bool) -> Result<Self, reqwest::Error> {
        let mut builder = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("jobgate/", env!("CARGO_PKG_VERSION")));
        if !use_proxy {
            builder = builder.no_proxy();
        }
        Ok(Self {
            client: builder.build()?,
        })
    }
}

/// 429 and 5xx may clear up on their own.
fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

#[async_trait]
impl Handler for WebhookHandler {
    type Input = WebhookRequest;
    type Output = WebhookDelivery;

    fn kind(&self) -> &'static str {
        KIND
    }

    async fn handle(
        &self,
        input: WebhookRequest,
        ctx: &UnitContext,
    ) -> Result<WebhookDelivery, HandlerError> {
        let url = reqwest::Url::parse(&input.url).map_err(|e| {
            HandlerError::permanent(anyhow::anyhow!("invalid webhook url {}: {e}", input.url))
        })?;

        let mut request = self
            .client
            .post(url)
            .header("x-jobgate-unit", ctx.unit_id.to_string())
            .json(&input.body);
        for (name, value) in input.headers.iter().flatten() {
            request = request.header(name, value);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_builder() {
                HandlerError::permanent(e)
            } else {
                HandlerError::retryable(e)
            }
        })?;

        let status = response.status();
        if status.is_success() {
            return Ok(WebhookDelivery {
                status: status.as_u16(),
            });
        }

        let err = anyhow::anyhow!("webhook {} answered {status}", input.url);
        if is_retryable_status(status) {
            Err(HandlerError::retryable(err))
        } else {
            Err(HandlerError::permanent(err))
        }
    }
}
