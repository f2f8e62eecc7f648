//! PostgREST-backed remote store (Supabase REST + RPC).

use std::fmt;

use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};

use super::record::parse_timestamp;
use super::{LockGrant, RemoteError, RemoteResult, RemoteStore};
use crate::util::{compact_text, is_http_url, millis_to_rfc3339};

const ACQUIRE_LOCK_RPC: &str = "acquire_feature_lock";
const RELEASE_LOCK_RPC: &str = "release_feature_lock";

/// Remote store speaking to a PostgREST endpoint.
#[derive(Clone)]
pub struct PostgrestRemoteStore {
    rest_url: String,
    api_key: String,
    access_token: Option<String>,
    client: Client,
}

impl fmt::Debug for PostgrestRemoteStore {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("PostgrestRemoteStore")
            .field("rest_url", &self.rest_url)
            .field("api_key", &"[REDACTED]")
            .field(
                "access_token",
                &self.access_token.as_ref().map(|_| "[REDACTED]"),
            )
            .finish_non_exhaustive()
    }
}

impl PostgrestRemoteStore {
    pub fn new(url: impl AsRef<str>, api_key: impl Into<String>) -> RemoteResult<Self> {
        let rest_url = normalize_rest_url(url.as_ref())?;
        let api_key = api_key.into().trim().to_string();
        if api_key.is_empty() {
            return Err(RemoteError::InvalidPayload(
                "API key must not be empty".to_string(),
            ));
        }

        Ok(Self {
            rest_url,
            api_key,
            access_token: None,
            client: Client::builder().build()?,
        })
    }

    /// Authenticate requests as a signed-in user instead of the anon role.
    #[must_use]
    pub fn with_access_token(mut self, access_token: impl Into<String>) -> Self {
        self.access_token = crate::util::normalize_text_option(Some(access_token.into()));
        self
    }

    pub fn rest_url(&self) -> &str {
        &self.rest_url
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        let bearer = self.access_token.as_deref().unwrap_or(&self.api_key);
        request
            .header("apikey", &self.api_key)
            .header("Authorization", format!("Bearer {bearer}"))
            .header("Accept", "application/json")
    }

    fn table_url(&self, collection: &str) -> String {
        format!("{}/{collection}", self.rest_url)
    }

    async fn send(&self, request: RequestBuilder) -> RemoteResult<Response> {
        let response = self.authorized(request).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, &body));
        }
        Ok(response)
    }

    async fn exists(&self, collection: &str, id: &str) -> RemoteResult<bool> {
        let response = self
            .send(
                self.client
                    .get(self.table_url(collection))
                    .query(&[("select", "id".to_string()), ("id", format!("eq.{id}"))]),
            )
            .await?;
        let rows: Vec<Value> = response.json().await?;
        Ok(!rows.is_empty())
    }

    async fn rpc(&self, name: &str, args: &Value) -> RemoteResult<Value> {
        let response = self
            .send(
                self.client
                    .post(format!("{}/rpc/{name}", self.rest_url))
                    .json(args),
            )
            .await?;
        let body = response.text().await?;
        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body).map_err(|error| RemoteError::InvalidPayload(error.to_string()))
    }
}

impl RemoteStore for PostgrestRemoteStore {
    async fn insert(&self, collection: &str, record: &Value) -> RemoteResult<Value> {
        let response = self
            .send(
                self.client
                    .post(self.table_url(collection))
                    .header("Prefer", "return=representation,resolution=ignore-duplicates")
                    .json(record),
            )
            .await?;
        let rows: Vec<Value> = response.json().await?;
        // Empty when the id already existed and the duplicate was ignored
        Ok(rows.into_iter().next().unwrap_or_else(|| record.clone()))
    }

    async fn update(
        &self,
        collection: &str,
        id: &str,
        patch: &Value,
        base_updated_at: Option<i64>,
    ) -> RemoteResult<Option<i64>> {
        let response = self
            .send(
                self.client
                    .patch(self.table_url(collection))
                    .query(&update_filter(id, base_updated_at))
                    .header("Prefer", "return=representation")
                    .json(patch),
            )
            .await?;
        let rows: Vec<Value> = response.json().await?;
        if let Some(row) = rows.first() {
            return Ok(row.get("updated_at").and_then(parse_timestamp));
        }

        // No row matched: either it is gone or the guard rejected it
        let exists = match base_updated_at {
            Some(_) => self.exists(collection, id).await?,
            None => false,
        };
        Err(unmatched_update(collection, id, base_updated_at, exists))
    }

    async fn delete(&self, collection: &str, id: &str) -> RemoteResult<()> {
        self.send(
            self.client
                .delete(self.table_url(collection))
                .query(&[("id", format!("eq.{id}"))]),
        )
        .await?;
        Ok(())
    }

    async fn query_changed_since(
        &self,
        collection: &str,
        since_millis: i64,
        layer_ids: &[String],
    ) -> RemoteResult<Vec<Value>> {
        let response = self
            .send(
                self.client
                    .get(self.table_url(collection))
                    .query(&changed_since_filter(since_millis, layer_ids)),
            )
            .await?;
        Ok(response.json().await?)
    }

    async fn acquire_lock(&self, feature_id: &str, holder_id: &str) -> RemoteResult<LockGrant> {
        let result = self
            .rpc(
                ACQUIRE_LOCK_RPC,
                &json!({"p_feature_id": feature_id, "p_holder_id": holder_id}),
            )
            .await?;
        parse_lock_grant(&result, holder_id)
    }

    async fn release_lock(&self, feature_id: &str) -> RemoteResult<()> {
        self.rpc(RELEASE_LOCK_RPC, &json!({"p_feature_id": feature_id}))
            .await?;
        Ok(())
    }
}

/// Normalize a project URL to its REST root (`…/rest/v1`).
pub fn normalize_rest_url(url: &str) -> RemoteResult<String> {
    let trimmed = url.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(RemoteError::InvalidPayload(
            "REST URL must not be empty".to_string(),
        ));
    }
    if !is_http_url(trimmed) {
        return Err(RemoteError::InvalidPayload(
            "REST URL must include http:// or https://".to_string(),
        ));
    }
    if trimmed.ends_with("/rest/v1") {
        Ok(trimmed.to_string())
    } else {
        Ok(format!("{trimmed}/rest/v1"))
    }
}

/// Row filter for a guarded update.
///
/// Remote timestamps carry microseconds while the base is in milliseconds,
/// so "not modified after base" becomes `updated_at < base + 1ms`.
fn update_filter(id: &str, base_updated_at: Option<i64>) -> Vec<(&'static str, String)> {
    let mut filter = vec![("id", format!("eq.{id}"))];
    if let Some(base) = base_updated_at {
        filter.push((
            "updated_at",
            format!("lt.{}", millis_to_rfc3339(base.saturating_add(1))),
        ));
    }
    filter
}

/// Error for an update that matched no row. Only a row that exists but
/// failed the `updated_at` guard is a conflict.
fn unmatched_update(
    collection: &str,
    id: &str,
    base_updated_at: Option<i64>,
    exists: bool,
) -> RemoteError {
    match base_updated_at {
        Some(base) if exists => RemoteError::Conflict(format!(
            "{collection}/{id} changed after {}",
            millis_to_rfc3339(base)
        )),
        _ => RemoteError::Rejected {
            status: StatusCode::NOT_FOUND.as_u16(),
            message: format!("{collection}/{id} not found"),
        },
    }
}

fn changed_since_filter(since_millis: i64, layer_ids: &[String]) -> Vec<(&'static str, String)> {
    let mut filter = vec![
        ("select", "*".to_string()),
        ("updated_at", format!("gte.{}", millis_to_rfc3339(since_millis))),
        ("order", "updated_at.asc,id.asc".to_string()),
    ];
    if !layer_ids.is_empty() {
        let quoted: Vec<String> = layer_ids
            .iter()
            .map(|id| format!("\"{}\"", id.replace('"', "")))
            .collect();
        filter.push(("layer_id", format!("in.({})", quoted.join(","))));
    }
    filter
}

#[derive(Debug, Deserialize)]
struct LockRpcResponse {
    #[serde(alias = "acquired")]
    success: bool,
    #[serde(default, alias = "holder_id")]
    locked_by: Option<String>,
    #[serde(default, alias = "expires_at")]
    lock_expires_at: Option<Value>,
}

/// The lock RPC may answer with a bare boolean, an object, or a
/// single-row array holding that object.
fn parse_lock_grant(result: &Value, holder_id: &str) -> RemoteResult<LockGrant> {
    match result {
        Value::Bool(acquired) => Ok(LockGrant {
            acquired: *acquired,
            holder: acquired.then(|| holder_id.to_string()),
            expires_at: None,
        }),
        Value::Array(rows) => match rows.first() {
            Some(row) => parse_lock_grant(row, holder_id),
            None => Err(RemoteError::InvalidPayload("empty lock response".into())),
        },
        Value::Object(_) => {
            let response = LockRpcResponse::deserialize(result)
                .map_err(|error| RemoteError::InvalidPayload(error.to_string()))?;
            Ok(LockGrant {
                acquired: response.success,
                holder: response
                    .locked_by
                    .or_else(|| response.success.then(|| holder_id.to_string())),
                expires_at: response.lock_expires_at.as_ref().and_then(parse_timestamp),
            })
        }
        other => Err(RemoteError::InvalidPayload(format!(
            "unexpected lock response: {}",
            compact_text(&other.to_string())
        ))),
    }
}

#[derive(Debug, Deserialize)]
struct PostgrestErrorResponse {
    message: Option<String>,
    details: Option<String>,
    hint: Option<String>,
    code: Option<String>,
}

/// Map an unsuccessful HTTP response to the error the sync engine acts on.
fn status_error(status: StatusCode, body: &str) -> RemoteError {
    let message = parse_api_error(status, body);
    match status {
        StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED => RemoteError::Conflict(message),
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            RemoteError::Transient(message)
        }
        status if status.is_server_error() => RemoteError::Transient(message),
        status => RemoteError::Rejected {
            status: status.as_u16(),
            message,
        },
    }
}

fn parse_api_error(status: StatusCode, body: &str) -> String {
    if let Ok(payload) = serde_json::from_str::<PostgrestErrorResponse>(body) {
        if let Some(message) = payload.message.or(payload.details).or(payload.hint) {
            return match payload.code {
                Some(code) => format!("{} [{code}] ({})", message.trim(), status.as_u16()),
                None => format!("{} ({})", message.trim(), status.as_u16()),
            };
        }
    }

    let trimmed = compact_text(body);
    if trimmed.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        format!("{} ({})", trimmed, status.as_u16())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn normalize_rest_url_appends_rest_path() {
        assert_eq!(
            normalize_rest_url("https://demo.supabase.co/").unwrap(),
            "https://demo.supabase.co/rest/v1"
        );
        assert_eq!(
            normalize_rest_url("http://localhost:3000/rest/v1").unwrap(),
            "http://localhost:3000/rest/v1"
        );
        assert!(normalize_rest_url("demo.supabase.co").is_err());
        assert!(normalize_rest_url("  ").is_err());
    }

    #[test]
    fn debug_redacts_secrets() {
        let store = PostgrestRemoteStore::new("https://demo.supabase.co", "anon-secret")
            .unwrap()
            .with_access_token("user-secret");
        let rendered = format!("{store:?}");
        assert!(!rendered.contains("anon-secret"));
        assert!(!rendered.contains("user-secret"));
        assert!(rendered.contains("https://demo.supabase.co/rest/v1"));
    }

    #[test]
    fn empty_api_key_is_rejected() {
        assert!(PostgrestRemoteStore::new("https://demo.supabase.co", " ").is_err());
    }

    #[test]
    fn update_filter_guards_on_base_plus_one_milli() {
        assert_eq!(
            update_filter("f-1", Some(1_500)),
            vec![
                ("id", "eq.f-1".to_string()),
                ("updated_at", "lt.1970-01-01T00:00:01.501Z".to_string()),
            ]
        );
        assert_eq!(update_filter("f-1", None), vec![("id", "eq.f-1".to_string())]);
    }

    #[test]
    fn changed_since_filter_lists_layers() {
        let filter = changed_since_filter(0, &["parcels".to_string(), "roads".to_string()]);
        assert_eq!(
            filter,
            vec![
                ("select", "*".to_string()),
                ("updated_at", "gte.1970-01-01T00:00:00.000Z".to_string()),
                ("order", "updated_at.asc,id.asc".to_string()),
                ("layer_id", "in.(\"parcels\",\"roads\")".to_string()),
            ]
        );
        assert_eq!(changed_since_filter(0, &[]).len(), 3);
    }

    #[test]
    fn unmatched_update_is_a_conflict_only_for_existing_rows() {
        assert!(unmatched_update("features", "f-1", Some(1_500), true).is_conflict());

        let missing = unmatched_update("features", "f-1", Some(1_500), false);
        assert!(!missing.is_conflict());
        assert!(matches!(missing, RemoteError::Rejected { status: 404, .. }));

        let unguarded = unmatched_update("features", "f-1", None, false);
        assert!(matches!(unguarded, RemoteError::Rejected { status: 404, .. }));
    }

    #[test]
    fn status_codes_map_to_sync_errors() {
        assert!(status_error(StatusCode::CONFLICT, "").is_conflict());
        assert!(status_error(StatusCode::PRECONDITION_FAILED, "").is_conflict());
        assert!(status_error(StatusCode::BAD_GATEWAY, "").is_transient());
        assert!(status_error(StatusCode::TOO_MANY_REQUESTS, "").is_transient());
        assert!(matches!(
            status_error(StatusCode::FORBIDDEN, ""),
            RemoteError::Rejected { status: 403, .. }
        ));
    }

    #[test]
    fn parse_api_error_prefers_postgrest_message() {
        let body = r#"{"code":"23505","message":"duplicate key value","details":null,"hint":null}"#;
        assert_eq!(
            parse_api_error(StatusCode::CONFLICT, body),
            "duplicate key value [23505] (409)"
        );
        assert_eq!(parse_api_error(StatusCode::BAD_GATEWAY, ""), "HTTP 502");
        assert_eq!(
            parse_api_error(StatusCode::BAD_REQUEST, "  nope "),
            "nope (400)"
        );
    }

    #[test]
    fn parses_lock_responses() {
        let granted = parse_lock_grant(&Value::Bool(true), "agent-a").unwrap();
        assert!(granted.acquired);
        assert_eq!(granted.holder.as_deref(), Some("agent-a"));

        let denied = parse_lock_grant(
            &json!([{"success": false, "locked_by": "agent-b", "lock_expires_at": 9_000}]),
            "agent-a",
        )
        .unwrap();
        assert_eq!(
            denied,
            LockGrant {
                acquired: false,
                holder: Some("agent-b".into()),
                expires_at: Some(9_000),
            }
        );

        assert!(parse_lock_grant(&json!("yes"), "agent-a").is_err());
        assert!(parse_lock_grant(&json!([]), "agent-a").is_err());
    }
}
