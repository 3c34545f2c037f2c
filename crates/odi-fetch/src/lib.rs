//! Paginated HTTP retrieval against Socrata-style `{base}/{resource}.json` endpoints.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use odi_core::{Page, PageSource, Record, Resource};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::StatusCode;
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument, Span};

pub const CRATE_NAME: &str = "odi-fetch";

pub const LIMIT_PARAM: &str = "$limit";
pub const OFFSET_PARAM: &str = "$offset";
pub const ORDER_PARAM: &str = "$order";
pub const DEFAULT_ORDER: &str = ":id";
pub const DEFAULT_PAGE_SIZE: u64 = 1000;

const RESERVED_PARAMS: [&str; 3] = [LIMIT_PARAM, OFFSET_PARAM, ORDER_PARAM];

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// `None` leaves the transport default in place.
    pub timeout: Option<Duration>,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: None,
            user_agent: Some(format!("odi/{}", env!("CARGO_PKG_VERSION"))),
        }
    }
}

/// HTTP basic-auth pair attached to every request when present.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

/// Parameters of one paginated traversal.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub credentials: Option<Credentials>,
    /// Caller filters such as `$where`. Reserved pagination keys are dropped.
    pub query: BTreeMap<String, String>,
    pub page_size: u64,
    pub start_offset: u64,
    pub max_pages: Option<u64>,
    pub headers: BTreeMap<String, String>,
    pub order: String,
}

impl Default for FetchRequest {
    fn default() -> Self {
        Self {
            credentials: None,
            query: BTreeMap::new(),
            page_size: DEFAULT_PAGE_SIZE,
            start_offset: 0,
            max_pages: None,
            headers: BTreeMap::new(),
            order: DEFAULT_ORDER.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("response from {url} is not a JSON array of objects: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("page from {url} holds {records} records, more than the limit of {limit}")]
    OversizedPage { url: String, records: usize, limit: u64 },
    #[error("invalid fetch request: {0}")]
    InvalidRequest(String),
}

#[derive(Debug, Clone)]
pub struct PageFetcher {
    client: reqwest::Client,
}

impl PageFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder().gzip(true).brotli(true);

        if let Some(timeout) = config.timeout {
            builder = builder.timeout(timeout);
        }
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    /// Opens a lazy cursor over `resource`. No request is issued until the first `next_page`.
    pub fn fetch(&self, resource: &Resource, request: FetchRequest) -> Result<PageCursor, FetchError> {
        if request.page_size == 0 {
            return Err(FetchError::InvalidRequest("page_size must be > 0".into()));
        }
        let order = request.order.trim();
        if order.is_empty() {
            return Err(FetchError::InvalidRequest("order clause must not be empty".into()));
        }

        let mut filters = request.query;
        for key in RESERVED_PARAMS {
            if let Some(value) = filters.remove(key) {
                warn!(
                    resource = %resource.resource_id,
                    param = key,
                    value = %value,
                    "dropping caller query parameter reserved for pagination"
                );
            }
        }

        let headers = build_headers(&request.headers)?;
        let span = info_span!(
            "page_fetch",
            resource = %resource.resource_id,
            page_size = request.page_size,
            start_offset = request.start_offset
        );

        Ok(PageCursor {
            client: self.client.clone(),
            url: resource.endpoint(),
            resource_id: resource.resource_id.clone(),
            credentials: request.credentials,
            filters,
            headers,
            order: order.to_string(),
            page_size: request.page_size,
            max_pages: request.max_pages,
            next_offset: request.start_offset,
            pages_fetched: 0,
            finished: false,
            span,
        })
    }
}

fn build_headers(headers: &BTreeMap<String, String>) -> Result<HeaderMap, FetchError> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|err| FetchError::InvalidRequest(format!("header name {name:?}: {err}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|err| FetchError::InvalidRequest(format!("header {name} value: {err}")))?;
        map.insert(name, value);
    }
    Ok(map)
}

/// Resumable position in a paginated traversal.
///
/// Fused: once it returns `Ok(None)` or an error, later calls return `Ok(None)`.
/// Resume after a failure with a fresh [`PageFetcher::fetch`] starting at [`PageCursor::next_offset`].
#[derive(Debug)]
pub struct PageCursor {
    client: reqwest::Client,
    url: String,
    resource_id: String,
    credentials: Option<Credentials>,
    filters: BTreeMap<String, String>,
    headers: HeaderMap,
    order: String,
    page_size: u64,
    max_pages: Option<u64>,
    next_offset: u64,
    pages_fetched: u64,
    finished: bool,
    span: Span,
}

impl PageCursor {
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn next_offset(&self) -> u64 {
        self.next_offset
    }

    pub fn pages_fetched(&self) -> u64 {
        self.pages_fetched
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Caller filters first, then the pipeline's own limit/offset/order.
    pub fn query_for_offset(&self, offset: u64) -> Vec<(String, String)> {
        let mut query: Vec<(String, String)> = self
            .filters
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        query.push((LIMIT_PARAM.to_string(), self.page_size.to_string()));
        query.push((OFFSET_PARAM.to_string(), offset.to_string()));
        query.push((ORDER_PARAM.to_string(), self.order.clone()));
        query
    }

    pub async fn next_page(&mut self) -> Result<Option<Page>, FetchError> {
        if self.finished {
            return Ok(None);
        }
        if self.max_pages.is_some_and(|max| self.pages_fetched >= max) {
            info!(parent: &self.span, pages = self.pages_fetched, "max pages reached");
            self.finished = true;
            return Ok(None);
        }

        let span = self.span.clone();
        let result = self.fetch_current().instrument(span).await;
        match result {
            Ok(Some(page)) => Ok(Some(page)),
            Ok(None) => {
                self.finished = true;
                Ok(None)
            }
            Err(err) => {
                self.finished = true;
                Err(err)
            }
        }
    }

    async fn fetch_current(&mut self) -> Result<Option<Page>, FetchError> {
        let offset = self.next_offset;
        let mut request = self
            .client
            .get(&self.url)
            .query(&self.query_for_offset(offset))
            .headers(self.headers.clone());
        if let Some(credentials) = &self.credentials {
            request = request.basic_auth(&credentials.username, Some(&credentials.password));
        }

        let resp = request.send().await?;
        let status = resp.status();
        if status != StatusCode::OK {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: resp.url().to_string(),
            });
        }

        let final_url = resp.url().to_string();
        let body = resp.bytes().await?;
        let records: Vec<Record> = serde_json::from_slice(&body).map_err(|source| FetchError::Decode {
            url: final_url.clone(),
            source,
        })?;
        if records.len() as u64 > self.page_size {
            return Err(FetchError::OversizedPage {
                url: final_url,
                records: records.len(),
                limit: self.page_size,
            });
        }

        if records.is_empty() {
            info!(offset, pages = self.pages_fetched, "empty page, traversal complete");
            return Ok(None);
        }

        let page = Page::new(offset, records);
        self.pages_fetched += 1;
        self.next_offset = offset + self.page_size;
        info!(
            resource = %self.resource_id,
            offset,
            records = page.len(),
            next_offset = self.next_offset,
            "page fetched"
        );
        Ok(Some(page))
    }
}

#[async_trait]
impl PageSource for PageCursor {
    type Error = FetchError;

    async fn next_page(&mut self) -> Result<Option<Page>, Self::Error> {
        PageCursor::next_page(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{basic_auth, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const RESOURCE: &str = "wujg-7c2s";

    fn resource_for(server: &MockServer) -> Resource {
        Resource::new(format!("{}/resource", server.uri()), RESOURCE)
    }

    fn fetcher() -> PageFetcher {
        PageFetcher::new(HttpClientConfig::default()).expect("client")
    }

    async fn mount_page(server: &MockServer, offset: u64, body: serde_json::Value) {
        Mock::given(method("GET"))
            .and(path(format!("/resource/{RESOURCE}.json")))
            .and(query_param(OFFSET_PARAM, offset.to_string()))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .expect(1)
            .mount(server)
            .await;
    }

    async fn drain(cursor: &mut PageCursor) -> Result<Vec<Page>, FetchError> {
        let mut pages = Vec::new();
        while let Some(page) = cursor.next_page().await? {
            pages.push(page);
        }
        Ok(pages)
    }

    #[tokio::test]
    async fn stops_on_empty_page_with_offsets_advancing_by_page_size() {
        let server = MockServer::start().await;
        mount_page(&server, 0, json!([{"id": 1}, {"id": 2}])).await;
        mount_page(&server, 2, json!([{"id": 3}])).await;
        mount_page(&server, 4, json!([])).await;

        let request = FetchRequest {
            page_size: 2,
            ..Default::default()
        };
        let mut cursor = fetcher()
            .fetch(&resource_for(&server), request)
            .expect("cursor");
        let pages = drain(&mut cursor).await.expect("pages");

        assert_eq!(pages.len(), 2);
        assert_eq!(pages.iter().map(|p| p.offset).collect::<Vec<_>>(), vec![0, 2]);
        assert_eq!(pages.iter().map(Page::len).sum::<usize>(), 3);
        assert_eq!(cursor.url(), format!("{}/resource/{RESOURCE}.json", server.uri()));
        assert!(cursor.is_finished());
        assert!(cursor.next_page().await.expect("fused").is_none());
    }

    #[tokio::test]
    async fn max_pages_bounds_a_server_that_never_empties() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(format!("/resource/{RESOURCE}.json")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"id": 1}, {"id": 2}])))
            .expect(3)
            .mount(&server)
            .await;

        let request = FetchRequest {
            page_size: 2,
            max_pages: Some(3),
            ..Default::default()
        };
        let mut cursor = fetcher()
            .fetch(&resource_for(&server), request)
            .expect("cursor");
        let pages = drain(&mut cursor).await.expect("pages");

        assert_eq!(pages.len(), 3);
        assert!(pages.iter().all(|p| p.len() <= 2));
        assert_eq!(cursor.pages_fetched(), 3);
        assert_eq!(cursor.next_offset(), 6);
    }

    #[tokio::test]
    async fn resumes_from_start_offset() {
        let server = MockServer::start().await;
        mount_page(&server, 20, json!([{"id": 21}])).await;
        mount_page(&server, 30, json!([])).await;

        let request = FetchRequest {
            page_size: 10,
            start_offset: 20,
            max_pages: Some(5),
            ..Default::default()
        };
        let mut cursor = fetcher()
            .fetch(&resource_for(&server), request)
            .expect("cursor");
        let pages = drain(&mut cursor).await.expect("pages");

        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].offset, 20);
        assert_eq!(cursor.next_offset(), 30);
    }

    #[tokio::test]
    async fn sends_pagination_order_auth_and_headers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(format!("/resource/{RESOURCE}.json")))
            .and(query_param(LIMIT_PARAM, "5"))
            .and(query_param(OFFSET_PARAM, "0"))
            .and(query_param(ORDER_PARAM, "transit_timestamp DESC"))
            .and(query_param("$where", "transit_timestamp >= \"2024-01-01T00:00:00.000\""))
            .and(basic_auth("key", "secret"))
            .and(header("x-app-token", "token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .expect(1)
            .mount(&server)
            .await;

        let request = FetchRequest {
            credentials: Some(Credentials::new("key", "secret")),
            query: BTreeMap::from([
                (
                    "$where".to_string(),
                    "transit_timestamp >= \"2024-01-01T00:00:00.000\"".to_string(),
                ),
                (LIMIT_PARAM.to_string(), "99999".to_string()),
            ]),
            page_size: 5,
            headers: BTreeMap::from([("X-App-Token".to_string(), "token".to_string())]),
            order: "transit_timestamp DESC".to_string(),
            ..Default::default()
        };
        let mut cursor = fetcher()
            .fetch(&resource_for(&server), request)
            .expect("cursor");
        assert!(cursor.next_page().await.expect("ok").is_none());
    }

    #[tokio::test]
    async fn non_success_status_fails_fast() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429))
            .expect(1)
            .mount(&server)
            .await;

        let mut cursor = fetcher()
            .fetch(&resource_for(&server), FetchRequest::default())
            .expect("cursor");
        let err = cursor.next_page().await.expect_err("429");
        assert!(matches!(err, FetchError::HttpStatus { status: 429, .. }));
        assert!(cursor.next_page().await.expect("fused").is_none());
    }

    #[tokio::test]
    async fn non_200_success_status_is_still_a_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(202).set_body_json(json!([])))
            .expect(1)
            .mount(&server)
            .await;

        let mut cursor = fetcher()
            .fetch(&resource_for(&server), FetchRequest::default())
            .expect("cursor");
        let err = cursor.next_page().await.expect_err("202");
        assert!(matches!(err, FetchError::HttpStatus { status: 202, .. }));
    }

    #[tokio::test]
    async fn page_larger_than_limit_fails_fast() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param(LIMIT_PARAM, "2"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!([{"id": 1}, {"id": 2}, {"id": 3}])),
            )
            .expect(1)
            .mount(&server)
            .await;

        let request = FetchRequest {
            page_size: 2,
            ..Default::default()
        };
        let mut cursor = fetcher()
            .fetch(&resource_for(&server), request)
            .expect("cursor");
        let err = cursor.next_page().await.expect_err("oversized");
        assert!(matches!(
            err,
            FetchError::OversizedPage { records: 3, limit: 2, .. }
        ));
        assert_eq!(cursor.next_offset(), 0);
        assert!(cursor.next_page().await.expect("fused").is_none());
    }

    #[test]
    fn credentials_debug_hides_the_secret() {
        let rendered = format!("{:?}", Credentials::new("key", "hunter2"));
        assert!(rendered.contains("key"));
        assert!(!rendered.contains("hunter2"));
    }

    #[tokio::test]
    async fn undecodable_body_is_a_decode_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>maintenance</html>"))
            .mount(&server)
            .await;

        let mut cursor = fetcher()
            .fetch(&resource_for(&server), FetchRequest::default())
            .expect("cursor");
        let err = cursor.next_page().await.expect_err("decode");
        assert!(matches!(err, FetchError::Decode { .. }));
    }

    #[tokio::test]
    async fn reserved_params_are_owned_by_the_pipeline() {
        let request = FetchRequest {
            query: BTreeMap::from([
                (OFFSET_PARAM.to_string(), "500".to_string()),
                (ORDER_PARAM.to_string(), "name".to_string()),
                ("borough".to_string(), "Manhattan".to_string()),
            ]),
            page_size: 100,
            start_offset: 200,
            ..Default::default()
        };
        let cursor = fetcher()
            .fetch(&Resource::new("http://localhost", "x"), request)
            .expect("cursor");
        let query = cursor.query_for_offset(cursor.next_offset());
        assert_eq!(
            query,
            vec![
                ("borough".to_string(), "Manhattan".to_string()),
                (LIMIT_PARAM.to_string(), "100".to_string()),
                (OFFSET_PARAM.to_string(), "200".to_string()),
                (ORDER_PARAM.to_string(), DEFAULT_ORDER.to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn zero_page_size_is_rejected() {
        let request = FetchRequest {
            page_size: 0,
            ..Default::default()
        };
        let err = fetcher()
            .fetch(&Resource::new("http://localhost", "x"), request)
            .expect_err("invalid");
        assert!(matches!(err, FetchError::InvalidRequest(_)));
    }
}
