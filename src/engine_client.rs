//! HTTP client for the external matching engine.
//!
//! The engine speaks a session/token protocol: create a session with the static
//! credential, create a token scoped to one operation (`addPatient` or
//! `readPatients`) with a use budget, then call `/patients?tokenId=…`. The client
//! holds no state beyond the base URL and credential.

use log::{info, warn};
use reqwest::{Client, StatusCode};
use std::time::{Duration, Instant};

use crate::config::INTERNAL_ID_TYPE;
use crate::error::EngineError;
use crate::types::{BlindedFields, Pseudonym};

/// Header carrying the static credential.
pub const API_KEY_HEADER: &str = "mainzellisteApiKey";

/// Bounded health poll: retry every `interval` until `timeout` has elapsed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HealthPolicy {
    pub timeout: Duration,
    pub interval: Duration,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            interval: Duration::from_secs(2),
        }
    }
}

/// Token request body for `POST /sessions/{id}/tokens`.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenRequest {
    #[serde(rename = "type")]
    pub token_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_uses: Option<usize>,
    pub data: serde_json::Value,
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdEntry {
    pub id_type: String,
    pub id_string: String,
}

/// Data section of a `readPatients` token.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadRequest {
    pub search_ids: Vec<IdEntry>,
    pub result_fields: Vec<String>,
    pub result_ids: Vec<String>,
}

impl TokenRequest {
    /// Token for `uses` submissions, answering with the internal id type.
    pub fn add_patient(uses: usize) -> Self {
        Self {
            token_type: "addPatient".into(),
            allowed_uses: Some(uses),
            data: serde_json::json!({ "idTypes": [INTERNAL_ID_TYPE] }),
        }
    }

    /// Token for one batch read of `result_fields` for the given pseudonyms.
    pub fn read_patients<'a>(
        pseudonyms: impl IntoIterator<Item = &'a Pseudonym>,
        result_fields: Vec<String>,
    ) -> Result<Self, EngineError> {
        let read = ReadRequest {
            search_ids: pseudonyms
                .into_iter()
                .map(|p| IdEntry {
                    id_type: INTERNAL_ID_TYPE.into(),
                    id_string: p.0.clone(),
                })
                .collect(),
            result_fields,
            result_ids: vec![INTERNAL_ID_TYPE.into()],
        };
        Ok(Self {
            token_type: "readPatients".into(),
            allowed_uses: None,
            data: serde_json::to_value(read)?,
        })
    }
}

/// One entry of a `readPatients` answer.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct PatientRecord {
    pub ids: Vec<IdEntry>,
    #[serde(default)]
    pub fields: BlindedFields,
}

impl PatientRecord {
    /// The internal-id pseudonym of this entry, if present.
    pub fn pseudonym(&self) -> Option<Pseudonym> {
        self.ids
            .iter()
            .find(|id| id.id_type == INTERNAL_ID_TYPE)
            .or_else(|| self.ids.first())
            .map(|id| Pseudonym(id.id_string.clone()))
    }
}

/// Outcome of one `addPatient` call that the contract does not treat as a hard failure.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// 201: engine assigned (or re-used) a pseudonym.
    Linked(Pseudonym),
    /// 409: engine suspects a duplicate it cannot decide on.
    PossibleDuplicate,
}

#[derive(serde::Deserialize)]
struct TokenResponse {
    id: String,
}

/// Upper bound for any single engine request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Client for one engine instance.
#[derive(Clone, Debug)]
pub struct MatchingEngineClient {
    base_url: String,
    api_key: String,
    http: Client,
}

impl MatchingEngineClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            http: Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_else(|e| {
                    warn!("http client setup failed, using defaults: {}", e);
                    Client::new()
                }),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// `GET /health` answered 200.
    pub async fn is_healthy(&self) -> bool {
        self.check_health(REQUEST_TIMEOUT).await
    }

    /// One health request that gives up after `limit`.
    async fn check_health(&self, limit: Duration) -> bool {
        let response = self
            .http
            .get(format!("{}/health", self.base_url))
            .timeout(limit)
            .send()
            .await;
        matches!(response, Ok(r) if r.status() == StatusCode::OK)
    }

    /// Polls `/health` until it answers 200 or the policy's deadline passes.
    ///
    /// Each attempt is cut off at `min(interval, remaining)`, so an engine that
    /// accepts connections but never answers cannot hold the poll past the deadline.
    pub async fn wait_until_healthy(&self, policy: HealthPolicy) -> Result<(), EngineError> {
        let started = Instant::now();
        let deadline = started + policy.timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let limit = if policy.interval.is_zero() {
                remaining
            } else {
                policy.interval.min(remaining)
            };
            let attempt = Instant::now();
            if self.check_health(limit).await {
                info!("engine healthy url={}", self.base_url);
                return Ok(());
            }
            info!("waiting for engine url={}", self.base_url);
            let next = (attempt + policy.interval).min(deadline);
            tokio::time::sleep_until(tokio::time::Instant::from_std(next)).await;
        }
        warn!("engine unavailable url={} timeout={:?}", self.base_url, policy.timeout);
        Err(EngineError::Unavailable {
            url: self.base_url.clone(),
            waited_secs: started.elapsed().as_secs(),
        })
    }

    /// `POST /sessions`; returns the session id.
    pub async fn create_session(&self) -> Result<String, EngineError> {
        let response = self
            .http
            .post(format!("{}/sessions", self.base_url))
            .header(API_KEY_HEADER, &self.api_key)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(EngineError::Rejected {
                operation: "create_session",
                status: status.as_u16(),
            });
        }
        let body: serde_json::Value = response.json().await?;
        session_id_from(&body).ok_or_else(|| EngineError::Malformed {
            operation: "create_session",
            detail: body.to_string(),
        })
    }

    /// `POST /sessions/{id}/tokens`; returns the token id.
    pub async fn create_token(
        &self,
        session_id: &str,
        request: &TokenRequest,
    ) -> Result<String, EngineError> {
        let response = self
            .http
            .post(format!("{}/sessions/{}/tokens", self.base_url, session_id))
            .header(API_KEY_HEADER, &self.api_key)
            .json(request)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(EngineError::Rejected {
                operation: "create_token",
                status: status.as_u16(),
            });
        }
        let token: TokenResponse = response.json().await?;
        Ok(token.id)
    }

    /// Fresh session plus one token for `request`.
    pub async fn session_token(&self, request: &TokenRequest) -> Result<String, EngineError> {
        let session = self.create_session().await?;
        self.create_token(&session, request).await
    }

    /// `POST /patients?tokenId=…` with the record's fields.
    ///
    /// 201 ⇒ [`SubmitOutcome::Linked`], 409 ⇒ [`SubmitOutcome::PossibleDuplicate`];
    /// any other status is an error.
    pub async fn add_patient<T: serde::Serialize + ?Sized>(
        &self,
        token_id: &str,
        fields: &T,
    ) -> Result<SubmitOutcome, EngineError> {
        let response = self
            .http
            .post(format!("{}/patients?tokenId={}", self.base_url, token_id))
            .header(API_KEY_HEADER, &self.api_key)
            .json(fields)
            .send()
            .await?;
        match response.status() {
            StatusCode::CREATED => {
                let body: Vec<IdEntryLoose> = response.json().await?;
                let id = body
                    .into_iter()
                    .next()
                    .and_then(|entry| entry.id_string)
                    .ok_or(EngineError::Malformed {
                        operation: "add_patient",
                        detail: "no idString in response".into(),
                    })?;
                Ok(SubmitOutcome::Linked(Pseudonym(id)))
            }
            StatusCode::CONFLICT => Ok(SubmitOutcome::PossibleDuplicate),
            other => Err(EngineError::Rejected {
                operation: "add_patient",
                status: other.as_u16(),
            }),
        }
    }

    /// `GET /patients?tokenId=…` for a `readPatients` token.
    pub async fn read_patients(&self, token_id: &str) -> Result<Vec<PatientRecord>, EngineError> {
        let response = self
            .http
            .get(format!("{}/patients?tokenId={}", self.base_url, token_id))
            .header(API_KEY_HEADER, &self.api_key)
            .send()
            .await?;
        let status = response.status();
        if status != StatusCode::OK {
            return Err(EngineError::Rejected {
                operation: "read_patients",
                status: status.as_u16(),
            });
        }
        let records: Option<Vec<PatientRecord>> = response.json().await?;
        Ok(records.unwrap_or_default())
    }
}

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct IdEntryLoose {
    id_string: Option<String>,
}

/// Session id from a `POST /sessions` answer: `sessionId` if present, else the first string value.
fn session_id_from(body: &serde_json::Value) -> Option<String> {
    let object = body.as_object()?;
    if let Some(id) = object.get("sessionId").and_then(|v| v.as_str()) {
        return Some(id.to_string());
    }
    object
        .values()
        .find_map(|v| v.as_str())
        .map(|s| s.to_string())
}
