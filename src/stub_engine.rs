//! In-process matching engine speaking the session/token/patient contract.
//!
//! Used by the binary when no engine URLs are configured and by integration
//! tests. Create with [`StubEngine::new`], then [`StubEngine::router`] or
//! [`StubEngine::spawn`]. Uses Extension for state so the router is `Router<()>`
//! and works with `into_make_service()`.
//!
//! Linking rules:
//! - every field equal to a stored patient ⇒ that patient's pseudonym (201);
//! - all but one field equal ⇒ possible duplicate (409);
//! - otherwise a new pseudonym `P000001`, `P000002`, … (201).
//!
//! Read-back serves `<field>_bigram_bloom` as salted SHA-256 digests of the
//! field's bigrams, so equal values blind equally under the same salt.

use axum::{
    extract::{Extension, Path, Query},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use log::{debug, info};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::config::INTERNAL_ID_TYPE;
use crate::engine_client::API_KEY_HEADER;

/// Suffix of blinded read-back fields.
pub const BLOOM_SUFFIX: &str = "_bigram_bloom";

const DEFAULT_SALT: &str = "stub-engine-salt";

struct Token {
    token_type: String,
    remaining: Option<usize>,
    data: serde_json::Value,
}

struct StoredPatient {
    pseudonym: String,
    fields: BTreeMap<String, serde_json::Value>,
}

struct StubState {
    api_key: String,
    salt: String,
    healthy: bool,
    next_id: u64,
    sessions: BTreeSet<String>,
    tokens: BTreeMap<String, Token>,
    patients: Vec<StoredPatient>,
}

impl StubState {
    fn fresh_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}{:06}", prefix, self.next_id)
    }
}

/// Handle to one stub engine. Clones share state.
#[derive(Clone)]
pub struct StubEngine {
    state: Arc<Mutex<StubState>>,
}

impl StubEngine {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            state: Arc::new(Mutex::new(StubState {
                api_key: api_key.into(),
                salt: DEFAULT_SALT.to_string(),
                healthy: true,
                next_id: 0,
                sessions: BTreeSet::new(),
                tokens: BTreeMap::new(),
                patients: Vec::new(),
            })),
        }
    }

    /// Salt used for read-back blinding. Engines whose results are compared must share it.
    pub fn with_salt(self, salt: impl Into<String>) -> Self {
        self.lock().salt = salt.into();
        self
    }

    /// Toggles `/health` between 200 and 503.
    pub fn set_healthy(&self, healthy: bool) {
        self.lock().healthy = healthy;
    }

    pub fn patient_count(&self) -> usize {
        self.lock().patients.len()
    }

    fn lock(&self) -> MutexGuard<'_, StubState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Builds the router. Returns `Router<()>` so you can call `.into_make_service()` for `axum::serve`.
    pub fn router(&self) -> Router<()> {
        Router::new()
            .route("/health", get(health))
            .route("/sessions", post(create_session))
            .route("/sessions/:session_id/tokens", post(create_token))
            .route("/patients", post(add_patient).get(read_patients))
            .layer(Extension(self.clone()))
    }

    /// Serves the router on `addr` (port 0 for an ephemeral port).
    pub async fn spawn(&self, addr: &str) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        let app = self.router();
        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app.into_make_service()).await {
                log::error!("stub engine stopped: {}", e);
            }
        });
        info!("stub engine listening on http://{}", local);
        Ok((local, handle))
    }
}

fn authorized(engine: &StubEngine, headers: &HeaderMap) -> bool {
    let expected = engine.lock().api_key.clone();
    headers
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim() == expected)
        .unwrap_or(false)
}

fn unauthorized() -> Response {
    (StatusCode::UNAUTHORIZED, "invalid api key").into_response()
}

async fn health(Extension(engine): Extension<StubEngine>) -> Response {
    if engine.lock().healthy {
        (StatusCode::OK, "ok").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "starting").into_response()
    }
}

async fn create_session(Extension(engine): Extension<StubEngine>, headers: HeaderMap) -> Response {
    if !authorized(&engine, &headers) {
        return unauthorized();
    }
    let mut state = engine.lock();
    let id = state.fresh_id("S");
    state.sessions.insert(id.clone());
    (
        StatusCode::CREATED,
        Json(serde_json::json!({ "sessionId": id, "uri": format!("/sessions/{id}") })),
    )
        .into_response()
}

async fn create_token(
    Extension(engine): Extension<StubEngine>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> Response {
    if !authorized(&engine, &headers) {
        return unauthorized();
    }
    let mut state = engine.lock();
    if !state.sessions.contains(&session_id) {
        return (StatusCode::NOT_FOUND, "unknown session").into_response();
    }
    let token_type = match body.get("type").and_then(|t| t.as_str()) {
        Some(t @ ("addPatient" | "readPatients")) => t.to_string(),
        _ => return (StatusCode::BAD_REQUEST, "unsupported token type").into_response(),
    };
    let remaining = body
        .get("allowedUses")
        .and_then(|u| u.as_u64())
        .map(|u| u as usize);
    let id = state.fresh_id("T");
    debug!("stub token={} type={} uses={:?}", id, token_type, remaining);
    state.tokens.insert(
        id.clone(),
        Token {
            token_type: token_type.clone(),
            remaining,
            data: body.get("data").cloned().unwrap_or(serde_json::Value::Null),
        },
    );
    (
        StatusCode::CREATED,
        Json(serde_json::json!({ "id": id, "type": token_type })),
    )
        .into_response()
}

#[derive(serde::Deserialize)]
struct TokenQuery {
    #[serde(rename = "tokenId")]
    token_id: String,
}

/// Consumes one use of `token_id` if it exists and has type `token_type`.
fn redeem(state: &mut StubState, token_id: &str, token_type: &str) -> Result<serde_json::Value, Response> {
    let token = match state.tokens.get_mut(token_id) {
        Some(t) if t.token_type == token_type => t,
        _ => return Err((StatusCode::UNAUTHORIZED, "invalid token").into_response()),
    };
    match token.remaining {
        Some(0) => return Err((StatusCode::UNAUTHORIZED, "token used up").into_response()),
        Some(ref mut n) => *n -= 1,
        None => {}
    }
    Ok(token.data.clone())
}

async fn add_patient(
    Extension(engine): Extension<StubEngine>,
    Query(query): Query<TokenQuery>,
    Json(fields): Json<BTreeMap<String, serde_json::Value>>,
) -> Response {
    let mut state = engine.lock();
    if let Err(response) = redeem(&mut state, &query.token_id, "addPatient") {
        return response;
    }
    if let Some(existing) = state.patients.iter().find(|p| p.fields == fields) {
        return linked(&existing.pseudonym);
    }
    let near_miss = state
        .patients
        .iter()
        .any(|p| fields.len() > 1 && differing_fields(&p.fields, &fields) == Some(1));
    if near_miss {
        return (StatusCode::CONFLICT, "possible duplicate").into_response();
    }
    let pseudonym = state.fresh_id("P");
    state.patients.push(StoredPatient {
        pseudonym: pseudonym.clone(),
        fields,
    });
    linked(&pseudonym)
}

fn linked(pseudonym: &str) -> Response {
    (
        StatusCode::CREATED,
        Json(serde_json::json!([{ "idType": INTERNAL_ID_TYPE, "idString": pseudonym }])),
    )
        .into_response()
}

/// Number of differing values when both records carry the same field names.
fn differing_fields(
    a: &BTreeMap<String, serde_json::Value>,
    b: &BTreeMap<String, serde_json::Value>,
) -> Option<usize> {
    if a.len() != b.len() || a.keys().ne(b.keys()) {
        return None;
    }
    Some(a.values().zip(b.values()).filter(|(x, y)| x != y).count())
}

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReadData {
    #[serde(default)]
    search_ids: Vec<SearchId>,
    #[serde(default)]
    result_fields: Vec<String>,
}

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchId {
    id_string: String,
}

async fn read_patients(
    Extension(engine): Extension<StubEngine>,
    Query(query): Query<TokenQuery>,
) -> Response {
    let mut state = engine.lock();
    let data = match redeem(&mut state, &query.token_id, "readPatients") {
        Ok(d) => d,
        Err(response) => return response,
    };
    let request: ReadData = match serde_json::from_value(data) {
        Ok(r) => r,
        Err(_) => return (StatusCode::BAD_REQUEST, "malformed read request").into_response(),
    };
    let out: Vec<serde_json::Value> = request
        .search_ids
        .iter()
        .filter_map(|search| state.patients.iter().find(|p| p.pseudonym == search.id_string))
        .map(|patient| {
            let fields: serde_json::Map<String, serde_json::Value> = request
                .result_fields
                .iter()
                .filter_map(|name| blinded_field(&state.salt, patient, name).map(|v| (name.clone(), v)))
                .collect();
            serde_json::json!({
                "ids": [{ "idType": INTERNAL_ID_TYPE, "idString": patient.pseudonym }],
                "fields": fields,
            })
        })
        .collect();
    (StatusCode::OK, Json(out)).into_response()
}

fn blinded_field(salt: &str, patient: &StoredPatient, name: &str) -> Option<serde_json::Value> {
    match name.strip_suffix(BLOOM_SUFFIX) {
        Some(base) => {
            let value = patient.fields.get(base)?;
            let text = match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            Some(serde_json::Value::String(bigram_digest(salt, &text)))
        }
        None => patient.fields.get(name).cloned(),
    }
}

/// Comma-joined salted digests of the padded, lower-cased value's bigrams, sorted.
pub fn bigram_digest(salt: &str, value: &str) -> String {
    let padded: Vec<char> = format!(" {} ", value.trim().to_lowercase()).chars().collect();
    let bigrams: BTreeSet<String> = padded.windows(2).map(|w| w.iter().collect()).collect();
    bigrams
        .iter()
        .map(|bigram| {
            let mut hasher = Sha256::new();
            hasher.update(salt.as_bytes());
            hasher.update(bigram.as_bytes());
            hex::encode(&hasher.finalize()[..8])
        })
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_salted_and_case_insensitive() {
        assert_eq!(bigram_digest("s", "Anna"), bigram_digest("s", " anna"));
        assert_ne!(bigram_digest("s", "Anna"), bigram_digest("t", "Anna"));
        assert_eq!(bigram_digest("s", "ab").split(',').count(), 3);
    }

    #[test]
    fn differing_fields_requires_same_schema() {
        let a: BTreeMap<String, serde_json::Value> =
            [("x".to_string(), "1".into()), ("y".to_string(), "2".into())].into();
        let mut b = a.clone();
        b.insert("y".into(), "3".into());
        assert_eq!(differing_fields(&a, &b), Some(1));
        b.insert("z".into(), "4".into());
        assert_eq!(differing_fields(&a, &b), None);
    }
}
