//! The HTTP edge: routes requests into the worker and turns its responses
//! into wire responses, including range serving over cached blobs.

use crate::asyncio::BodyStream;
use crate::pages::Pages;
use hoard::proxy::response::BlobBody;
use hoard::proxy::{Body as ProxyBody, ResponseWrapper, Worker};
use poem::http::{header, Method, StatusCode};
use poem::{Body, Endpoint, Request, Response};
use std::collections::BTreeMap;
use std::io::{Read, Seek, SeekFrom};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::spawn_blocking;
use tracing::{debug, error, warn};

const ROBOTS_TXT: &str = "User-agent: *\nDisallow: /\n";

pub struct ProxyApp {
    worker: Arc<Worker>,
    pages: Pages,
}

impl ProxyApp {
    pub fn new(worker: Arc<Worker>, pages: Pages) -> Self {
        ProxyApp { worker, pages }
    }

    async fn dispatch(&self, req: Request) -> Response {
        if self.worker.is_closed() {
            return Response::builder()
                .status(StatusCode::SERVICE_UNAVAILABLE)
                .finish();
        }
        let path = req.uri().path().to_owned();
        if path == "/robots.txt" {
            return Response::builder()
                .content_type("text/plain")
                .body(ROBOTS_TXT);
        }
        if req.method() != Method::GET && req.method() != Method::HEAD {
            return Response::builder()
                .status(StatusCode::METHOD_NOT_ALLOWED)
                .header(header::ALLOW, "GET, HEAD")
                .content_type("text/plain")
                .body("Method Not Allowed");
        }

        let request_uri = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_owned())
            .unwrap_or_else(|| path.clone());
        let Some((target, child)) = self.worker.route(&request_uri) else {
            if path == "/" {
                return html(
                    StatusCode::OK,
                    self.pages.index(&self.worker.target_names()),
                );
            }
            return html(
                StatusCode::NOT_FOUND,
                self.pages.error(&path, "no such target"),
            );
        };

        // Only Range travels to the origin: forwarding negotiation headers
        // would let encoded or partial variants leak into the cache.
        let range = req
            .headers()
            .get(header::RANGE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);
        let request_headers: Vec<(String, String)> = range
            .iter()
            .map(|value| ("Range".to_owned(), value.clone()))
            .collect();
        let is_head = req.method() == Method::HEAD;

        let forwarded = spawn_blocking(move || target.forward(&child, &request_headers)).await;
        match forwarded {
            Err(err) => {
                error!(path = %path, error = %err, "request handler panicked");
                Response::builder()
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .finish()
            }
            Ok(Err(err)) => {
                debug!(path = %path, error = %err, "fetch failed");
                html(
                    StatusCode::NOT_FOUND,
                    self.pages.error(&path, &err.to_string()),
                )
            }
            Ok(Ok(response)) => build_response(response, &path, is_head, range.as_deref()),
        }
    }
}

impl Endpoint for ProxyApp {
    type Output = Response;

    async fn call(&self, req: Request) -> poem::Result<Self::Output> {
        Ok(self.dispatch(req).await)
    }
}

fn html(status: StatusCode, body: String) -> Response {
    Response::builder()
        .status(status)
        .content_type("text/html; charset=utf-8")
        .body(body)
}

fn build_response(
    response: ResponseWrapper,
    path: &str,
    is_head: bool,
    range: Option<&str>,
) -> Response {
    let ResponseWrapper {
        status,
        headers,
        body,
    } = response;
    match body {
        ProxyBody::Seekable(blob) => serve_seekable(headers, blob, path, is_head, range),
        ProxyBody::Stream(reader) => {
            let mut builder = Response::builder().status(status_code(status));
            for (name, value) in &headers {
                builder = builder.header(name.as_str(), value.as_str());
            }
            if is_head {
                builder.body(Body::empty())
            } else {
                builder.body(Body::from_bytes_stream(BodyStream::pump(
                    path.to_owned(),
                    reader,
                )))
            }
        }
        ProxyBody::Empty => {
            let mut builder = Response::builder().status(status_code(status));
            for (name, value) in &headers {
                builder = builder.header(name.as_str(), value.as_str());
            }
            builder.body(Body::empty())
        }
    }
}

/// Serves a cached blob, honoring single `bytes=` ranges.
///
/// Multi-part and syntactically invalid ranges fall back to the full body;
/// a well-formed range outside the blob is answered with 416.
fn serve_seekable(
    headers: BTreeMap<String, String>,
    mut blob: BlobBody,
    path: &str,
    is_head: bool,
    range: Option<&str>,
) -> Response {
    let size = match blob.len() {
        Ok(size) => size,
        Err(err) => {
            warn!(error = %err, "cannot stat cached blob");
            return Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .finish();
        }
    };
    let mut builder = Response::builder();
    for (name, value) in &headers {
        // The stored length is replaced by whatever window we serve.
        if name.eq_ignore_ascii_case("Content-Length") {
            continue;
        }
        builder = builder.header(name.as_str(), value.as_str());
    }
    builder = builder.header(header::ACCEPT_RANGES, "bytes");

    match range.and_then(|header| parse_range(header, size)) {
        None => {
            let builder = builder
                .status(StatusCode::OK)
                .header(header::CONTENT_LENGTH, size);
            if is_head {
                builder.body(Body::empty())
            } else {
                builder.body(Body::from_bytes_stream(BodyStream::pump(
                    path.to_owned(),
                    blob,
                )))
            }
        }
        Some(ByteRange::Satisfiable { start, end }) => {
            let window = end - start + 1;
            let builder = builder
                .status(StatusCode::PARTIAL_CONTENT)
                .header(
                    header::CONTENT_RANGE,
                    format!("bytes {start}-{end}/{size}"),
                )
                .header(header::CONTENT_LENGTH, window);
            if is_head {
                return builder.body(Body::empty());
            }
            if let Err(err) = blob.seek(SeekFrom::Start(start)) {
                warn!(error = %err, "cannot seek cached blob");
                return Response::builder()
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .finish();
            }
            builder.body(Body::from_bytes_stream(BodyStream::pump(
                path.to_owned(),
                blob.take(window),
            )))
        }
        Some(ByteRange::Unsatisfiable) => builder
            .status(StatusCode::RANGE_NOT_SATISFIABLE)
            .header(header::CONTENT_RANGE, format!("bytes */{size}"))
            .body(Body::empty()),
    }
}

fn status_code(status: u16) -> StatusCode {
    StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY)
}

#[derive(Debug, PartialEq, Eq)]
enum ByteRange {
    Satisfiable { start: u64, end: u64 },
    Unsatisfiable,
}

/// Parses a single-range `bytes=` header against a body of `size` bytes.
///
/// `None` means "ignore the header and serve the full body", which covers
/// multi-part ranges and syntax errors.
fn parse_range(header: &str, size: u64) -> Option<ByteRange> {
    let spec = header.strip_prefix("bytes=")?;
    if spec.contains(',') {
        return None;
    }
    let (start, end) = spec.split_once('-')?;
    let (start, end) = (start.trim(), end.trim());
    if start.is_empty() {
        // Suffix form: the last N bytes.
        let suffix: u64 = end.parse().ok()?;
        if suffix == 0 || size == 0 {
            return Some(ByteRange::Unsatisfiable);
        }
        return Some(ByteRange::Satisfiable {
            start: size.saturating_sub(suffix),
            end: size - 1,
        });
    }
    let start: u64 = start.parse().ok()?;
    if start >= size {
        return Some(ByteRange::Unsatisfiable);
    }
    let end = if end.is_empty() {
        size - 1
    } else {
        let end: u64 = end.parse().ok()?;
        if end < start {
            return None;
        }
        end.min(size - 1)
    };
    Some(ByteRange::Satisfiable { start, end })
}

/// Starts the periodic meta and blob sweeps.
pub fn spawn_gc_tasks(worker: Arc<Worker>, meta_interval: Duration, blob_interval: Duration) {
    spawn_gc_task(worker.clone(), meta_interval, "meta", |worker| {
        worker.meta_gc()
    });
    spawn_gc_task(worker, blob_interval, "blob", |worker| worker.blob_gc());
}

fn spawn_gc_task(worker: Arc<Worker>, interval: Duration, kind: &'static str, run: fn(&Worker)) {
    if interval.is_zero() {
        warn!(kind, "gc interval is zero, sweep disabled");
        return;
    }
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // the first tick completes immediately
        loop {
            ticker.tick().await;
            if worker.is_closed() {
                break;
            }
            let worker = worker.clone();
            if spawn_blocking(move || run(&worker)).await.is_err() {
                error!(kind, "gc sweep panicked");
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;
    use hoard::proxy::TargetConfig;
    use hoard::test_util::upstream::{MockResponse, UpstreamServer};
    use poem::test::TestClient;
    use tempfile::{tempdir, TempDir};

    const LAST_MODIFIED: &str = "Mon, 01 Jan 2024 00:00:00 GMT";

    struct AppFixture {
        client: TestClient<ProxyApp>,
        worker: Arc<Worker>,
        _tempdir: TempDir,
    }

    fn serve_target(url: &str) -> AppFixture {
        let tempdir = tempdir().unwrap();
        let worker = Arc::new(Worker::open(tempdir.path()).unwrap());
        let mut config = TargetConfig::new([url]);
        config
            .add_rule(".*", TimeDelta::hours(2), TimeDelta::hours(1))
            .unwrap();
        worker.bind("t", config).unwrap();
        let app = ProxyApp::new(worker.clone(), Pages::load(None).unwrap());
        AppFixture {
            client: TestClient::new(app),
            worker,
            _tempdir: tempdir,
        }
    }

    fn hundred_bytes_origin() -> UpstreamServer {
        UpstreamServer::start(|req| {
            if req.header("Range").is_some() {
                MockResponse::status(206)
                    .header("Content-Range", "bytes 0-10/100")
                    .body(b"partial con")
            } else {
                MockResponse::ok(&[b'x'; 100]).header("Last-Modified", LAST_MODIFIED)
            }
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_range_on_uncached_path_bypasses_the_cache() {
        let origin = hundred_bytes_origin();
        let fixture = serve_target(&origin.base_url());

        let response = fixture
            .client
            .get("/t/file-1")
            .header("Range", "bytes=0-10")
            .send()
            .await;
        response.assert_status(StatusCode::PARTIAL_CONTENT);
        response.assert_header("Content-Range", "bytes 0-10/100");
        response.assert_text("partial con").await;

        // The partial fetch must not have populated the cache.
        let full = fixture.client.get("/t/file-1").send().await;
        full.assert_status_is_ok();
        full.assert_header("X-Cache", "WAIT");
        assert_eq!(origin.hits(), 2);
    }

    #[tokio::test]
    async fn test_range_over_cached_blob_is_served_locally() {
        let origin = hundred_bytes_origin();
        let fixture = serve_target(&origin.base_url());

        let warmup = fixture.client.get("/t/file-2").send().await;
        warmup.assert_status_is_ok();
        warmup.assert_header("X-Cache", "WAIT");
        warmup.assert_text("x".repeat(100)).await;

        let sanity = fixture.client.get("/t/file-2").send().await;
        sanity.assert_header("X-Cache", "HIT");
        sanity.assert_text("x".repeat(100)).await;

        let ranged = fixture
            .client
            .get("/t/file-2")
            .header("Range", "bytes=0-9")
            .send()
            .await;
        ranged.assert_status(StatusCode::PARTIAL_CONTENT);
        ranged.assert_header("Content-Range", "bytes 0-9/100");
        ranged.assert_header("Content-Length", "10");
        ranged.assert_text("x".repeat(10)).await;

        // Only the warmup reached the origin.
        assert_eq!(origin.hits(), 1);
    }

    #[tokio::test]
    async fn test_suffix_and_unbounded_ranges() {
        let origin = hundred_bytes_origin();
        let fixture = serve_target(&origin.base_url());
        // Reading the warmup body to the end commits the cache entry.
        fixture
            .client
            .get("/t/file")
            .send()
            .await
            .assert_text("x".repeat(100))
            .await;

        let suffix = fixture
            .client
            .get("/t/file")
            .header("Range", "bytes=-10")
            .send()
            .await;
        suffix.assert_status(StatusCode::PARTIAL_CONTENT);
        suffix.assert_header("Content-Range", "bytes 90-99/100");

        let tail = fixture
            .client
            .get("/t/file")
            .header("Range", "bytes=95-")
            .send()
            .await;
        tail.assert_status(StatusCode::PARTIAL_CONTENT);
        tail.assert_header("Content-Range", "bytes 95-99/100");
        tail.assert_header("Content-Length", "5");
    }

    #[tokio::test]
    async fn test_unsatisfiable_range_is_416() {
        let origin = hundred_bytes_origin();
        let fixture = serve_target(&origin.base_url());
        // Reading the warmup body to the end commits the cache entry.
        fixture
            .client
            .get("/t/file")
            .send()
            .await
            .assert_text("x".repeat(100))
            .await;

        let response = fixture
            .client
            .get("/t/file")
            .header("Range", "bytes=200-300")
            .send()
            .await;
        response.assert_status(StatusCode::RANGE_NOT_SATISFIABLE);
        response.assert_header("Content-Range", "bytes */100");
    }

    #[tokio::test]
    async fn test_head_request_returns_headers_without_body() {
        let origin = hundred_bytes_origin();
        let fixture = serve_target(&origin.base_url());
        // Reading the warmup body to the end commits the cache entry.
        fixture
            .client
            .get("/t/file")
            .send()
            .await
            .assert_text("x".repeat(100))
            .await;

        let response = fixture.client.head("/t/file").send().await;
        response.assert_status_is_ok();
        response.assert_header("X-Cache", "HIT");
        response.assert_header("Content-Length", "100");
        response.assert_text("").await;
    }

    #[tokio::test]
    async fn test_method_not_allowed() {
        let origin = hundred_bytes_origin();
        let fixture = serve_target(&origin.base_url());
        let response = fixture.client.post("/t/file").send().await;
        response.assert_status(StatusCode::METHOD_NOT_ALLOWED);
        response.assert_header("Allow", "GET, HEAD");
    }

    #[tokio::test]
    async fn test_robots_txt_forbids_crawling() {
        let origin = hundred_bytes_origin();
        let fixture = serve_target(&origin.base_url());
        let response = fixture.client.get("/robots.txt").send().await;
        response.assert_status_is_ok();
        response.assert_text(ROBOTS_TXT).await;
    }

    #[tokio::test]
    async fn test_index_page_lists_targets() {
        let origin = hundred_bytes_origin();
        let fixture = serve_target(&origin.base_url());
        let response = fixture.client.get("/").send().await;
        response.assert_status_is_ok();
        response
            .assert_text(Pages::load(None).unwrap().index(&["t".to_string()]))
            .await;
    }

    #[tokio::test]
    async fn test_unknown_prefix_renders_error_page() {
        let origin = hundred_bytes_origin();
        let fixture = serve_target(&origin.base_url());
        let response = fixture.client.get("/unknown/file").send().await;
        response.assert_status(StatusCode::NOT_FOUND);
        response.assert_content_type("text/html; charset=utf-8");
    }

    #[tokio::test]
    async fn test_failed_fetch_renders_error_page() {
        let fixture = serve_target("http://127.0.0.1:1");
        let response = fixture.client.get("/t/file").send().await;
        response.assert_status(StatusCode::NOT_FOUND);
        response.assert_content_type("text/html; charset=utf-8");
    }

    #[tokio::test]
    async fn test_closed_worker_returns_503() {
        let origin = hundred_bytes_origin();
        let fixture = serve_target(&origin.base_url());
        fixture.worker.close();
        let response = fixture.client.get("/t/file").send().await;
        response.assert_status(StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_parse_range_forms() {
        assert_eq!(
            parse_range("bytes=0-9", 100),
            Some(ByteRange::Satisfiable { start: 0, end: 9 })
        );
        assert_eq!(
            parse_range("bytes=95-", 100),
            Some(ByteRange::Satisfiable { start: 95, end: 99 })
        );
        assert_eq!(
            parse_range("bytes=-10", 100),
            Some(ByteRange::Satisfiable { start: 90, end: 99 })
        );
        assert_eq!(
            parse_range("bytes=0-500", 100),
            Some(ByteRange::Satisfiable { start: 0, end: 99 })
        );
        // Range covering exactly the last byte.
        assert_eq!(
            parse_range("bytes=99-99", 100),
            Some(ByteRange::Satisfiable { start: 99, end: 99 })
        );
        assert_eq!(parse_range("bytes=100-", 100), Some(ByteRange::Unsatisfiable));
        assert_eq!(parse_range("bytes=-0", 100), Some(ByteRange::Unsatisfiable));
        assert_eq!(parse_range("bytes=0-0", 0), Some(ByteRange::Unsatisfiable));
        // Ignored: multi-part, inverted and malformed ranges.
        assert_eq!(parse_range("bytes=0-1,5-6", 100), None);
        assert_eq!(parse_range("bytes=9-5", 100), None);
        assert_eq!(parse_range("items=0-9", 100), None);
        assert_eq!(parse_range("bytes=abc", 100), None);
    }
}
