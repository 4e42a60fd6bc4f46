//! Participant-side HTTP clients.
//!
//! An [`AliceClient`] registers inputs and signs the joint transaction; a
//! [`BobClient`] posts unblinded outputs. A wallet uses a separate
//! connection per role so the coordinator cannot link them.

pub mod alice;
pub mod bob;

pub use alice::{AliceClient, Coin};
pub use bob::BobClient;

use crate::core::types::RoundId;
use crate::round::{NonceInfo, RoundState};
use crate::rpc::types::{CoinjoinResponse, ErrorResponse, API_PREFIX};
use anyhow::{anyhow, Result};
use bitcoin::Transaction;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Non-success answer from the coordinator.
#[derive(Debug, thiserror::Error)]
#[error("coordinator returned {status}: {error}")]
pub struct ApiFailure {
    pub status: u16,
    pub error: String,
}

#[derive(Clone)]
pub struct CoordinatorClient {
    http: reqwest::Client,
    base_url: String,
}

impl CoordinatorClient {
    /// `base_url` is scheme and authority, e.g. `http://127.0.0.1:37127`.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}{}", self.base_url, API_PREFIX, path)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let error = match response.json::<ErrorResponse>().await {
            Ok(body) => body.error,
            Err(_) => status.canonical_reason().unwrap_or("unknown error").to_string(),
        };
        Err(ApiFailure { status: status.as_u16(), error }.into())
    }

    pub(crate) async fn get_json<R: DeserializeOwned>(&self, path: &str) -> Result<R> {
        let response = self.http.get(self.url(path)).send().await?;
        Ok(Self::check(response).await?.json().await?)
    }

    pub(crate) async fn post_json<B: Serialize, R: DeserializeOwned>(&self, path: &str, body: &B) -> Result<R> {
        let response = self.http.post(self.url(path)).json(body).send().await?;
        Ok(Self::check(response).await?.json().await?)
    }

    /// POST whose success answer carries no body.
    pub(crate) async fn post<B: Serialize>(&self, path: &str, body: &B) -> Result<()> {
        let response = self.http.post(self.url(path)).json(body).send().await?;
        Self::check(response).await?;
        Ok(())
    }

    pub(crate) async fn post_query<Q: Serialize, R: DeserializeOwned>(&self, path: &str, query: &Q) -> Result<R> {
        let response = self.http.post(self.url(path)).query(query).send().await?;
        Ok(Self::check(response).await?.json().await?)
    }

    pub(crate) async fn post_query_empty<Q: Serialize>(&self, path: &str, query: &Q) -> Result<()> {
        let response = self.http.post(self.url(path)).query(query).send().await?;
        Self::check(response).await?;
        Ok(())
    }

    pub async fn states(&self) -> Result<Vec<RoundState>> {
        self.get_json("/states").await
    }

    pub async fn round_state(&self, round_id: RoundId) -> Result<RoundState> {
        self.get_json(&format!("/round-state/{}", round_id)).await
    }

    /// Fresh signer nonces for `round_id`, one per level.
    pub async fn nonces(&self, round_id: RoundId) -> Result<Vec<NonceInfo>> {
        let response = self.http.post(self.url(&format!("/nonces/{}", round_id))).send().await?;
        Ok(Self::check(response).await?.json().await?)
    }

    pub async fn unsigned_coinjoin(&self, round_id: RoundId) -> Result<Transaction> {
        let body: CoinjoinResponse = self.get_json(&format!("/coinjoin/{}", round_id)).await?;
        let bytes = hex::decode(&body.transaction)?;
        bitcoin::consensus::deserialize(&bytes).map_err(|e| anyhow!("malformed coinjoin: {}", e))
    }
}
