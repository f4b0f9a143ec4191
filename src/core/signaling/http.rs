//! Signaling over the mailbox service's HTTP API.
//!
//! | operation      | request                         |
//! |----------------|---------------------------------|
//! | create share   | `POST   {base}/share`           |
//! | fetch share    | `GET    {base}/share/{id}`      |
//! | update pin     | `PATCH  {base}/share/{id}`      |
//! | post envelope  | `POST   {base}/signal`          |
//! | drain mailbox  | `GET    {base}/signal/{peer}`   |
//! | ICE servers    | `GET    {base}/ice-servers`     |
//!
//! A missing share is `404`, an expired one `410`.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{
    IceServerList, ShareId, ShareRecord, SignalingBackend, SignalingEnvelope, SignalingError,
};
use crate::core::config::SIGNALING_HTTP_TIMEOUT;

pub struct HttpBackend {
    http: reqwest::Client,
    base_url: String,
}

#[derive(Deserialize)]
struct CreatedShare {
    id: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PinUpdate {
    pin_hash: Option<String>,
}

impl HttpBackend {
    pub fn new(base_url: &str) -> Result<Self, SignalingError> {
        let http = reqwest::Client::builder()
            .timeout(SIGNALING_HTTP_TIMEOUT)
            .user_agent(concat!("peerdrop/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Map a non-success response to an error, keeping the body for context.
    async fn check(resp: reqwest::Response) -> Result<reqwest::Response, SignalingError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        Err(match status {
            StatusCode::NOT_FOUND => SignalingError::NotFound,
            StatusCode::GONE => SignalingError::Expired,
            StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
                SignalingError::Validation(resp.text().await.unwrap_or_default())
            }
            _ => SignalingError::Api {
                status: status.as_u16(),
                body: resp.text().await.unwrap_or_default(),
            },
        })
    }
}

#[async_trait]
impl SignalingBackend for HttpBackend {
    async fn create_share(&self, record: &ShareRecord) -> Result<ShareId, SignalingError> {
        let resp = self.http.post(self.url("/share")).json(record).send().await?;
        let body = Self::check(resp).await?.bytes().await?;
        let created: CreatedShare = serde_json::from_slice(&body)?;
        ShareId::parse(&created.id)
    }

    async fn fetch_share(&self, id: &ShareId) -> Result<ShareRecord, SignalingError> {
        let resp = self
            .http
            .get(self.url(&format!("/share/{id}")))
            .send()
            .await?;
        let body = Self::check(resp).await?.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }

    async fn update_pin(&self, id: &ShareId, pin_hash: Option<String>) -> Result<(), SignalingError> {
        let resp = self
            .http
            .patch(self.url(&format!("/share/{id}")))
            .json(&PinUpdate { pin_hash })
            .send()
            .await?;
        Self::check(resp).await?;
        Ok(())
    }

    async fn post(&self, envelope: &SignalingEnvelope) -> Result<(), SignalingError> {
        let resp = self.http.post(self.url("/signal")).json(envelope).send().await?;
        Self::check(resp).await?;
        Ok(())
    }

    async fn drain(&self, receiver_id: &str) -> Result<Vec<SignalingEnvelope>, SignalingError> {
        let resp = self
            .http
            .get(self.url(&format!("/signal/{receiver_id}")))
            .send()
            .await?;
        let body = Self::check(resp).await?.bytes().await?;
        if body.is_empty() {
            return Ok(Vec::new());
        }
        let envelopes: Vec<SignalingEnvelope> = serde_json::from_slice(&body)?;
        if !envelopes.is_empty() {
            debug!(event = "mailbox_drained", count = envelopes.len(), receiver_id);
        }
        Ok(envelopes)
    }

    async fn ice_servers(&self) -> Result<IceServerList, SignalingError> {
        let resp = self.http.get(self.url("/ice-servers")).send().await?;
        let body = Self::check(resp).await?.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }
}
