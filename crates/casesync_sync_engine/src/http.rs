//! HTTP gateway implementation.
//!
//! Maps the gateway contract onto a PostgREST-style REST API plus an
//! object-storage API. The actual HTTP client is abstracted via a trait so
//! any library (reqwest, ureq, hyper, a platform bridge) can carry it.

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::gateway::{BlobStore, RemoteGateway};
use casesync_model::{Row, Table, Tombstone, TOMBSTONE_TABLE};
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::RwLock;
use serde_json::Value;

/// HTTP method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// GET
    Get,
    /// POST
    Post,
    /// DELETE
    Delete,
}

/// An outgoing request.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    /// Method.
    pub method: Method,
    /// Absolute URL.
    pub url: String,
    /// Header pairs.
    pub headers: Vec<(String, String)>,
    /// Body bytes.
    pub body: Vec<u8>,
}

/// A received response.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    /// Status code.
    pub status: u16,
    /// Body bytes.
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Creates a response.
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    /// Returns true for 2xx statuses.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// HTTP client abstraction.
///
/// Implement this trait to provide the actual HTTP transport. A returned
/// `Err` means no response was received at all (DNS, TLS, connection).
pub trait HttpClient: Send + Sync {
    /// Sends a request and returns the response.
    fn send(&self, request: HttpRequest) -> Result<HttpResponse, String>;
}

/// Rows requested per page; PostgREST servers commonly cap responses here.
const DEFAULT_PAGE_SIZE: usize = 1000;

/// Remote gateway over HTTP.
pub struct HttpGateway<C: HttpClient> {
    base_url: String,
    api_key: String,
    bucket: String,
    page_size: usize,
    client: C,
    last_error: RwLock<Option<String>>,
}

impl<C: HttpClient> HttpGateway<C> {
    /// Creates a gateway for `base_url` authenticating with `api_key`.
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, client: C) -> Self {
        let base_url: String = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            bucket: "case-documents".to_string(),
            page_size: DEFAULT_PAGE_SIZE,
            client,
            last_error: RwLock::new(None),
        }
    }

    /// Creates a gateway for the configured remote endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Configuration`] if no endpoint is configured.
    pub fn from_config(config: &SyncConfig, api_key: impl Into<String>, client: C) -> SyncResult<Self> {
        match config.remote_url.as_deref() {
            Some(url) if !url.trim().is_empty() => Ok(Self::new(url, api_key, client)),
            _ => Err(SyncError::Configuration("no remote url configured".into())),
        }
    }

    /// Sets how many rows each read requests at a time.
    #[must_use]
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Sets the storage bucket holding attachment content.
    #[must_use]
    pub fn with_bucket(mut self, bucket: impl Into<String>) -> Self {
        self.bucket = bucket.into();
        self
    }

    /// Returns the base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Returns the last error message.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    fn request(&self, method: Method, path: &str, body: Vec<u8>) -> HttpRequest {
        HttpRequest {
            method,
            url: format!("{}{}", self.base_url, path),
            headers: vec![
                ("apikey".to_string(), self.api_key.clone()),
                (
                    "Authorization".to_string(),
                    format!("Bearer {}", self.api_key),
                ),
                ("Content-Type".to_string(), "application/json".to_string()),
            ],
            body,
        }
    }

    fn send(&self, request: HttpRequest) -> SyncResult<HttpResponse> {
        match self.client.send(request) {
            Ok(response) => {
                *self.last_error.write() = None;
                Ok(response)
            }
            Err(e) => {
                *self.last_error.write() = Some(e.clone());
                Err(SyncError::transport_retryable(e))
            }
        }
    }

    fn expect_success(&self, what: &str, response: HttpResponse) -> SyncResult<HttpResponse> {
        if response.is_success() {
            return Ok(response);
        }
        let message = format!("{what}: HTTP {} {}", response.status, response.text());
        *self.last_error.write() = Some(message.clone());
        Err(SyncError::Transport {
            message,
            retryable: is_retryable_status(response.status),
        })
    }

    fn values_from(body: &[u8]) -> SyncResult<Vec<Value>> {
        if body.is_empty() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_slice(body)?)
    }

    fn rows_from(body: &[u8]) -> SyncResult<Vec<Row>> {
        Ok(Self::values_from(body)?
            .into_iter()
            .filter_map(Row::from_value)
            .collect())
    }

    /// Reads `query` page by page in `order` until a short page arrives.
    fn read_all(&self, what: &str, query: &str, order: &str) -> SyncResult<Vec<Value>> {
        let mut values = Vec::new();
        loop {
            let path = format!(
                "{query}&order={order}.asc&limit={}&offset={}",
                self.page_size,
                values.len()
            );
            let response = self.send(self.request(Method::Get, &path, Vec::new()))?;
            let response = self.expect_success(what, response)?;
            let page = Self::values_from(&response.body)?;
            let short = page.len() < self.page_size;
            values.extend(page);
            if short {
                break;
            }
        }
        tracing::debug!(what, rows = values.len(), "read remote pages");
        Ok(values)
    }

    fn object_path(&self, path: &str) -> String {
        format!("/storage/v1/object/{}/{}", self.bucket, path)
    }
}

fn is_retryable_status(status: u16) -> bool {
    status >= 500 || status == 408 || status == 429
}

fn is_missing_relation(response: &HttpResponse) -> bool {
    let text = response.text();
    response.status == 404 || text.contains("42P01") || text.contains("PGRST205")
}

fn is_missing_object(response: &HttpResponse) -> bool {
    response.status == 404 || (response.status == 400 && response.text().contains("not_found"))
}

/// Renders ids as a PostgREST `in.(...)` list.
fn in_list(ids: &[String]) -> String {
    let quoted: Vec<String> = ids
        .iter()
        .map(|id| format!("\"{}\"", id.replace('"', "\\\"")))
        .collect();
    format!("in.({})", quoted.join(","))
}

impl<C: HttpClient> RemoteGateway for HttpGateway<C> {
    fn select(&self, table: Table) -> SyncResult<Vec<Row>> {
        let query = format!("/rest/v1/{table}?select=*");
        Ok(self
            .read_all(table.remote_name(), &query, table.key_column())?
            .into_iter()
            .filter_map(Row::from_value)
            .collect())
    }

    fn upsert(&self, table: Table, rows: &[Row]) -> SyncResult<Vec<Row>> {
        let body = serde_json::to_vec(rows)?;
        let path = format!("/rest/v1/{table}?on_conflict={}", table.key_column());
        let mut request = self.request(Method::Post, &path, body);
        request.headers.push((
            "Prefer".to_string(),
            "resolution=merge-duplicates,return=representation".to_string(),
        ));
        let response = self.send(request)?;
        let response = self.expect_success(table.remote_name(), response)?;
        Self::rows_from(&response.body)
    }

    fn delete(&self, table: Table, ids: &[String]) -> SyncResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let path = format!("/rest/v1/{table}?{}={}", table.key_column(), in_list(ids));
        let response = self.send(self.request(Method::Delete, &path, Vec::new()))?;
        self.expect_success(table.remote_name(), response)?;
        Ok(())
    }

    fn table_exists(&self, table: Table) -> SyncResult<bool> {
        let path = format!("/rest/v1/{table}?select=*&limit=0");
        let response = self.send(self.request(Method::Get, &path, Vec::new()))?;
        if response.is_success() {
            return Ok(true);
        }
        if is_missing_relation(&response) {
            tracing::debug!(%table, status = response.status, "probe reports missing table");
            return Ok(false);
        }
        self.expect_success(table.remote_name(), response).map(|_| true)
    }

    fn tombstones_since(&self, since: DateTime<Utc>) -> SyncResult<Vec<Tombstone>> {
        let since = since.to_rfc3339_opts(SecondsFormat::Millis, true);
        let query = format!("/rest/v1/{TOMBSTONE_TABLE}?select=*&deleted_at=gte.{since}");
        let values = self.read_all(TOMBSTONE_TABLE, &query, "deleted_at")?;
        Ok(serde_json::from_value(Value::Array(values))?)
    }

    fn insert_tombstones(&self, tombstones: &[Tombstone]) -> SyncResult<()> {
        if tombstones.is_empty() {
            return Ok(());
        }
        let body = serde_json::to_vec(tombstones)?;
        let path = format!("/rest/v1/{TOMBSTONE_TABLE}");
        let response = self.send(self.request(Method::Post, &path, body))?;
        self.expect_success(TOMBSTONE_TABLE, response)?;
        Ok(())
    }
}

impl<C: HttpClient> BlobStore for HttpGateway<C> {
    fn put(&self, path: &str, bytes: &[u8]) -> SyncResult<()> {
        let mut request = self.request(Method::Post, &self.object_path(path), bytes.to_vec());
        request.headers.retain(|(name, _)| name != "Content-Type");
        request.headers.push((
            "Content-Type".to_string(),
            "application/octet-stream".to_string(),
        ));
        request
            .headers
            .push(("x-upsert".to_string(), "true".to_string()));
        let response = self.send(request)?;
        self.expect_success(path, response)?;
        Ok(())
    }

    fn get(&self, path: &str) -> SyncResult<Option<Vec<u8>>> {
        let response = self.send(self.request(Method::Get, &self.object_path(path), Vec::new()))?;
        if is_missing_object(&response) {
            return Ok(None);
        }
        let response = self.expect_success(path, response)?;
        Ok(Some(response.body))
    }

    fn remove(&self, paths: &[String]) -> SyncResult<()> {
        if paths.is_empty() {
            return Ok(());
        }
        let body = serde_json::to_vec(&serde_json::json!({ "prefixes": paths }))?;
        let path = format!("/storage/v1/object/{}", self.bucket);
        let response = self.send(self.request(Method::Delete, &path, body))?;
        if is_missing_object(&response) {
            return Ok(());
        }
        self.expect_success(&self.bucket, response)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    #[derive(Default)]
    struct TestClient {
        responses: RwLock<VecDeque<Result<HttpResponse, String>>>,
        requests: RwLock<Vec<HttpRequest>>,
    }

    impl TestClient {
        fn respond(&self, response: Result<HttpResponse, String>) {
            self.responses.write().push_back(response);
        }

        fn last(&self) -> HttpRequest {
            self.requests.read().last().cloned().unwrap()
        }
    }

    impl HttpClient for &TestClient {
        fn send(&self, request: HttpRequest) -> Result<HttpResponse, String> {
            self.requests.write().push(request);
            self.responses
                .write()
                .pop_front()
                .unwrap_or_else(|| Err("no response queued".into()))
        }
    }

    fn gateway(client: &TestClient) -> HttpGateway<&TestClient> {
        HttpGateway::new("https://db.example.com/", "key", client)
    }

    #[test]
    fn select_parses_rows() {
        let client = TestClient::default();
        client.respond(Ok(HttpResponse::new(200, r#"[{"id":1},{"id":"2"},3]"#)));
        let gw = gateway(&client);

        let rows = gw.select(Table::Cases).unwrap();
        assert_eq!(rows.len(), 2);
        let request = client.last();
        assert_eq!(request.method, Method::Get);
        assert_eq!(
            request.url,
            "https://db.example.com/rest/v1/cases?select=*&order=id.asc&limit=1000&offset=0"
        );
    }

    #[test]
    fn select_reads_every_page() {
        let client = TestClient::default();
        client.respond(Ok(HttpResponse::new(200, r#"[{"id":"1"},{"id":"2"}]"#)));
        client.respond(Ok(HttpResponse::new(200, r#"[{"id":"3"},{"id":"4"}]"#)));
        client.respond(Ok(HttpResponse::new(200, r#"[{"id":"5"}]"#)));
        let gw = gateway(&client).with_page_size(2);

        let rows = gw.select(Table::Clients).unwrap();
        assert_eq!(rows.len(), 5);
        let urls: Vec<String> = client.requests.read().iter().map(|r| r.url.clone()).collect();
        assert_eq!(urls.len(), 3);
        assert!(urls[1].ends_with("order=id.asc&limit=2&offset=2"));
        assert!(urls[2].ends_with("limit=2&offset=4"));
    }

    #[test]
    fn full_last_page_needs_one_more_read() {
        let client = TestClient::default();
        client.respond(Ok(HttpResponse::new(200, r#"[{"id":"1"},{"id":"2"}]"#)));
        client.respond(Ok(HttpResponse::new(200, "[]")));
        let gw = gateway(&client).with_page_size(2);

        assert_eq!(gw.select(Table::Clients).unwrap().len(), 2);
        assert_eq!(client.requests.read().len(), 2);
    }

    #[test]
    fn page_failure_fails_the_read() {
        let client = TestClient::default();
        client.respond(Ok(HttpResponse::new(200, r#"[{"id":"1"},{"id":"2"}]"#)));
        client.respond(Ok(HttpResponse::new(503, "unavailable")));
        let gw = gateway(&client).with_page_size(2);

        assert!(gw.select(Table::Clients).unwrap_err().is_retryable());
    }

    #[test]
    fn gateway_from_config_needs_url() {
        let client = TestClient::default();
        let missing = SyncConfig::new("o", "u");
        assert!(matches!(
            HttpGateway::from_config(&missing, "key", &client),
            Err(SyncError::Configuration(_))
        ));

        let config = missing.with_remote_url("https://db.example.com/");
        let gw = HttpGateway::from_config(&config, "key", &client).unwrap();
        assert_eq!(gw.base_url(), "https://db.example.com");
    }

    #[test]
    fn upsert_uses_table_key() {
        let client = TestClient::default();
        client.respond(Ok(HttpResponse::new(201, r#"[{"name":"Hind"}]"#)));
        let gw = gateway(&client);

        let out = gw
            .upsert(Table::Assistants, &[Row::new().with("name", "Hind")])
            .unwrap();
        assert_eq!(out.len(), 1);
        let request = client.last();
        assert!(request.url.ends_with("/rest/v1/assistants?on_conflict=name"));
        assert!(request
            .headers
            .iter()
            .any(|(k, v)| k == "Prefer" && v.contains("merge-duplicates")));
    }

    #[test]
    fn delete_builds_in_filter() {
        let client = TestClient::default();
        client.respond(Ok(HttpResponse::new(204, "")));
        let gw = gateway(&client);

        gw.delete(Table::Stages, &["a".into(), "b".into()]).unwrap();
        assert_eq!(
            client.last().url,
            "https://db.example.com/rest/v1/stages?id=in.(\"a\",\"b\")"
        );
    }

    #[test]
    fn probe_classifies_missing_relations() {
        let client = TestClient::default();
        client.respond(Ok(HttpResponse::new(200, "[]")));
        client.respond(Ok(HttpResponse::new(404, "")));
        client.respond(Ok(HttpResponse::new(
            400,
            r#"{"code":"PGRST205","message":"Could not find the table"}"#,
        )));
        client.respond(Ok(HttpResponse::new(503, "unavailable")));
        let gw = gateway(&client);

        assert!(gw.table_exists(Table::Clients).unwrap());
        assert!(!gw.table_exists(Table::Clients).unwrap());
        assert!(!gw.table_exists(Table::Clients).unwrap());
        let err = gw.table_exists(Table::Clients).unwrap_err();
        assert!(err.is_retryable());
        assert!(client.last().url.ends_with("limit=0"));
    }

    #[test]
    fn client_errors_are_not_retryable() {
        let client = TestClient::default();
        client.respond(Ok(HttpResponse::new(403, "forbidden")));
        client.respond(Err("connection refused".into()));
        let gw = gateway(&client);

        assert!(!gw.select(Table::Clients).unwrap_err().is_retryable());
        assert!(gw.select(Table::Clients).unwrap_err().is_retryable());
        assert_eq!(gw.last_error().as_deref(), Some("connection refused"));
    }

    #[test]
    fn blob_not_found_is_none() {
        let client = TestClient::default();
        client.respond(Ok(HttpResponse::new(400, r#"{"error":"not_found"}"#)));
        client.respond(Ok(HttpResponse::new(200, "bytes")));
        let gw = gateway(&client).with_bucket("docs");

        assert_eq!(gw.get("u/c/d").unwrap(), None);
        assert_eq!(gw.get("u/c/d").unwrap(), Some(b"bytes".to_vec()));
        assert_eq!(
            client.last().url,
            "https://db.example.com/storage/v1/object/docs/u/c/d"
        );
    }

    #[test]
    fn tombstones_round_trip_json() {
        let client = TestClient::default();
        client.respond(Ok(HttpResponse::new(
            200,
            r#"[{"table_name":"cases","record_id":"11","deleted_at":"2024-06-01T09:30:00Z","actor_id":"u2"}]"#,
        )));
        let gw = gateway(&client);

        let since = DateTime::parse_from_rfc3339("2024-05-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let tombstones = gw.tombstones_since(since).unwrap();
        assert_eq!(tombstones[0].record_id, "11");
        assert!(client
            .last()
            .url
            .ends_with("sync_deletions?select=*&deleted_at=gte.2024-05-01T00:00:00.000Z&order=deleted_at.asc&limit=1000&offset=0"));
    }
}
