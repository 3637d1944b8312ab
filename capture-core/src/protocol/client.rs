//! Multipart protocol client
//!
//! Async client for the signing server using reqwest. Part bytes go
//! straight to object storage through presigned URLs.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{header, Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use super::types::{
    AbortRequest, CompleteRequest, CompleteResponse, CompletedPart, InitiateRequest,
    InitiateResponse, PartUrl, PartUrlRequest,
};
use crate::config::ClientConfig;
use crate::error::{CaptureError, Result};

/// Remote multipart operations used by both coordinators
#[async_trait]
pub trait MultipartApi: Send + Sync {
    /// Open a multipart upload
    async fn initiate(&self, request: &InitiateRequest) -> Result<InitiateResponse>;

    /// Fetch a fresh single-use URL for one part
    async fn part_upload_url(&self, upload_id: &str, key: &str, part_number: u32)
        -> Result<PartUrl>;

    /// PUT part bytes to a presigned URL, returning the ETag
    async fn put_part(&self, upload_url: &str, body: Bytes, content_type: &str) -> Result<String>;

    /// Assemble the uploaded parts into the final object
    async fn complete(
        &self,
        upload_id: &str,
        key: &str,
        parts: &[CompletedPart],
    ) -> Result<CompleteResponse>;

    /// Release server-side multipart state
    async fn abort(&self, upload_id: &str, key: &str) -> Result<()>;
}

/// Abort during cleanup: failures are logged and never replace the original error
pub async fn abort_best_effort(api: &dyn MultipartApi, upload_id: &str, key: &str) {
    match api.abort(upload_id, key).await {
        Ok(()) => debug!("Aborted multipart upload {} ({})", upload_id, key),
        Err(e) => warn!("Abort of multipart upload {} failed: {}", upload_id, e),
    }
}

/// reqwest-backed client for the signing server
pub struct HttpMultipartClient {
    client: Client,
    config: ClientConfig,
}

impl HttpMultipartClient {
    /// Create a new client
    pub fn new(config: ClientConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| CaptureError::Internal {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        Ok(Self { client, config })
    }

    fn endpoint(&self, operation: &str) -> String {
        format!("{}/api/s3/multipart/{}", self.config.api_base, operation)
    }

    async fn post<B: Serialize + ?Sized>(&self, operation: &'static str, body: &B) -> Result<Response> {
        let resp = self
            .client
            .post(self.endpoint(operation))
            .bearer_auth(&self.config.auth_token)
            .json(body)
            .send()
            .await
            .map_err(|e| network_error(operation, e))?;

        match resp.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(CaptureError::Auth {
                message: format!("{} rejected with status {}", operation, resp.status()),
            }),
            _ => Ok(resp),
        }
    }

    async fn decode<T: DeserializeOwned>(operation: &'static str, resp: Response) -> Result<T> {
        let body = resp.bytes().await.map_err(|e| network_error(operation, e))?;
        serde_json::from_slice(&body).map_err(|e| CaptureError::InvalidResponse {
            operation,
            reason: e.to_string(),
        })
    }
}

#[async_trait]
impl MultipartApi for HttpMultipartClient {
    async fn initiate(&self, request: &InitiateRequest) -> Result<InitiateResponse> {
        let resp = self.post("initiate", request).await?;
        if !resp.status().is_success() {
            return Err(status_error("initiate", resp).await);
        }
        let parsed: InitiateResponse = Self::decode("initiate", resp).await?;
        let parsed = parsed.validate()?;
        debug!("Initiated upload {} for {}", parsed.upload_id, parsed.key);
        Ok(parsed)
    }

    async fn part_upload_url(
        &self,
        upload_id: &str,
        key: &str,
        part_number: u32,
    ) -> Result<PartUrl> {
        let request = PartUrlRequest {
            upload_id,
            key,
            part_number,
        };
        let resp = self.post("part-url", &request).await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(CaptureError::PresignedUrl {
                part_number,
                message: format!("status {}: {}", status, text),
            });
        }
        let url: PartUrl = Self::decode("part-url", resp).await?;
        url.validate()
    }

    async fn put_part(&self, upload_url: &str, body: Bytes, content_type: &str) -> Result<String> {
        let size = body.len();
        let resp = self
            .client
            .put(upload_url)
            .header(header::CONTENT_TYPE, content_type)
            .body(body)
            .send()
            .await
            .map_err(|e| network_error("put-part", e))?;

        if !resp.status().is_success() {
            return Err(status_error("put-part", resp).await);
        }

        let etag = resp
            .headers()
            .get(header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .ok_or_else(|| CaptureError::InvalidResponse {
                operation: "put-part",
                reason: "missing ETag header".into(),
            })?;

        debug!("Put part ({} bytes) complete, etag={}", size, etag);
        Ok(etag)
    }

    async fn complete(
        &self,
        upload_id: &str,
        key: &str,
        parts: &[CompletedPart],
    ) -> Result<CompleteResponse> {
        let request = CompleteRequest::new(upload_id, key, parts);
        let resp = self.post("complete", &request).await?;
        if !resp.status().is_success() {
            return Err(status_error("complete", resp).await);
        }
        let done: CompleteResponse = Self::decode("complete", resp).await?;
        done.validate()
    }

    async fn abort(&self, upload_id: &str, key: &str) -> Result<()> {
        let resp = self.post("abort", &AbortRequest { upload_id, key }).await?;
        if !resp.status().is_success() && resp.status() != StatusCode::NOT_FOUND {
            return Err(status_error("abort", resp).await);
        }
        Ok(())
    }
}

fn network_error(operation: &str, e: reqwest::Error) -> CaptureError {
    CaptureError::Network {
        message: format!("{} failed: {}", operation, e),
    }
}

async fn status_error(operation: &str, resp: Response) -> CaptureError {
    let status = resp.status().as_u16();
    let text = resp.text().await.unwrap_or_default();
    CaptureError::Upload {
        status,
        message: format!("{}: {}", operation, text),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
    use tokio::net::{TcpListener, TcpStream};

    use super::*;

    const TOKEN: &str = "secret-token";

    /// Fixed answer for one method and path
    #[derive(Clone, Copy)]
    struct Route {
        method: &'static str,
        path: &'static str,
        status: u16,
        etag: Option<&'static str>,
        body: &'static str,
    }

    impl Route {
        fn new(method: &'static str, path: &'static str, status: u16, body: &'static str) -> Self {
            Self {
                method,
                path,
                status,
                etag: None,
                body,
            }
        }

        fn with_etag(mut self, etag: &'static str) -> Self {
            self.etag = Some(etag);
            self
        }
    }

    /// Request line and auth header of one received request
    #[derive(Debug, Clone)]
    struct Seen {
        method: String,
        path: String,
        authorization: Option<String>,
    }

    /// Local HTTP server replaying canned routes; unknown routes get 404
    struct CannedServer {
        base: String,
        seen: Arc<Mutex<Vec<Seen>>>,
    }

    impl CannedServer {
        async fn start(routes: Vec<Route>) -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let base = format!("http://{}", listener.local_addr().unwrap());
            let seen = Arc::new(Mutex::new(Vec::new()));
            let routes = Arc::new(routes);

            let log = seen.clone();
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let routes = routes.clone();
                    let log = log.clone();
                    tokio::spawn(async move {
                        let _ = answer(stream, &routes, &log).await;
                    });
                }
            });
            Self { base, seen }
        }

        fn client(&self) -> HttpMultipartClient {
            // loopback only, ignore any proxy in the environment
            HttpMultipartClient {
                client: Client::builder().no_proxy().build().unwrap(),
                config: ClientConfig {
                    api_base: self.base.clone(),
                    auth_token: TOKEN.into(),
                    ..Default::default()
                },
            }
        }

        fn url(&self, path: &str) -> String {
            format!("{}{}", self.base, path)
        }

        fn seen(&self) -> Vec<Seen> {
            self.seen.lock().clone()
        }
    }

    async fn answer(stream: TcpStream, routes: &[Route], log: &Mutex<Vec<Seen>>) -> std::io::Result<()> {
        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        reader.read_line(&mut line).await?;
        let mut request_line = line.split_whitespace();
        let method = request_line.next().unwrap_or_default().to_string();
        let path = request_line.next().unwrap_or_default().to_string();

        let mut length = 0usize;
        let mut authorization = None;
        loop {
            line.clear();
            reader.read_line(&mut line).await?;
            let header = line.trim_end();
            if header.is_empty() {
                break;
            }
            if let Some((name, value)) = header.split_once(':') {
                let value = value.trim();
                if name.eq_ignore_ascii_case("content-length") {
                    length = value.parse().unwrap_or(0);
                } else if name.eq_ignore_ascii_case("authorization") {
                    authorization = Some(value.to_string());
                }
            }
        }
        let mut body = vec![0u8; length];
        reader.read_exact(&mut body).await?;

        let route = routes
            .iter()
            .find(|r| r.method == method && r.path == path)
            .copied()
            .unwrap_or_else(|| Route::new("", "", 404, ""));
        log.lock().push(Seen {
            method,
            path,
            authorization,
        });

        let mut response = format!(
            "HTTP/1.1 {} Canned\r\nContent-Length: {}\r\nConnection: close\r\n",
            route.status,
            route.body.len()
        );
        if let Some(etag) = route.etag {
            response.push_str(&format!("ETag: {}\r\n", etag));
        }
        response.push_str("\r\n");
        response.push_str(route.body);

        let mut stream = reader.into_inner();
        stream.write_all(response.as_bytes()).await?;
        stream.shutdown().await
    }

    fn initiate_request() -> InitiateRequest {
        InitiateRequest {
            file_name: "talk.webm".into(),
            file_type: "video/webm".into(),
            file_size: 4096,
            upload_path: "recordings".into(),
            part_size: Some(25 * 1024 * 1024),
        }
    }

    #[test]
    fn test_endpoints() {
        let client = HttpMultipartClient::new(ClientConfig {
            api_base: "https://api.example.com".into(),
            auth_token: "t".into(),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(
            client.endpoint("part-url"),
            "https://api.example.com/api/s3/multipart/part-url"
        );
    }

    #[tokio::test]
    async fn test_rejected_credentials_map_to_auth() {
        let server = CannedServer::start(vec![
            Route::new("POST", "/api/s3/multipart/initiate", 401, "expired"),
            Route::new("POST", "/api/s3/multipart/complete", 403, "forbidden"),
        ])
        .await;
        let client = server.client();

        let err = client.initiate(&initiate_request()).await.unwrap_err();
        assert!(matches!(err, CaptureError::Auth { .. }));

        let err = client.complete("u-1", "recordings/talk.webm", &[]).await.unwrap_err();
        assert!(matches!(err, CaptureError::Auth { .. }));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_part_url_failure_maps_to_presigned_url() {
        let server = CannedServer::start(vec![Route::new(
            "POST",
            "/api/s3/multipart/part-url",
            500,
            "signer down",
        )])
        .await;

        let err = server
            .client()
            .part_upload_url("u-1", "recordings/talk.webm", 3)
            .await
            .unwrap_err();
        assert!(matches!(err, CaptureError::PresignedUrl { part_number: 3, .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_put_status_maps_to_upload() {
        let server = CannedServer::start(vec![Route::new("PUT", "/bucket/part-1", 503, "slow down")]).await;

        let err = server
            .client()
            .put_part(&server.url("/bucket/part-1"), Bytes::from_static(b"abc"), "video/webm")
            .await
            .unwrap_err();
        assert!(matches!(err, CaptureError::Upload { status: 503, .. }));
    }

    #[tokio::test]
    async fn test_put_without_etag_is_invalid() {
        let server = CannedServer::start(vec![Route::new("PUT", "/bucket/part-1", 200, "")]).await;

        let err = server
            .client()
            .put_part(&server.url("/bucket/part-1"), Bytes::from_static(b"abc"), "video/webm")
            .await
            .unwrap_err();
        assert!(matches!(err, CaptureError::InvalidResponse { operation: "put-part", .. }));
    }

    #[tokio::test]
    async fn test_bearer_only_on_signing_calls() {
        let server = CannedServer::start(vec![
            Route::new(
                "POST",
                "/api/s3/multipart/initiate",
                200,
                r#"{"uploadId":"u-1","key":"recordings/talk.webm","totalParts":1}"#,
            ),
            Route::new("PUT", "/bucket/part-1", 200, "").with_etag("\"abc123\""),
        ])
        .await;
        let client = server.client();

        let initiated = client.initiate(&initiate_request()).await.unwrap();
        assert_eq!(initiated.upload_id, "u-1");
        assert_eq!(initiated.total_parts, Some(1));

        let etag = client
            .put_part(&server.url("/bucket/part-1"), Bytes::from_static(b"abc"), "video/webm")
            .await
            .unwrap();
        assert_eq!(etag, "\"abc123\"");

        let seen = server.seen();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].method, "POST");
        assert_eq!(seen[0].authorization.as_deref(), Some("Bearer secret-token"));
        assert_eq!(seen[1].method, "PUT");
        assert_eq!(seen[1].path, "/bucket/part-1");
        assert_eq!(seen[1].authorization, None);
    }

    #[tokio::test]
    async fn test_abort_tolerates_missing_upload() {
        let server = CannedServer::start(vec![Route::new(
            "POST",
            "/api/s3/multipart/abort",
            404,
            "NoSuchUpload",
        )])
        .await;
        server.client().abort("u-1", "recordings/talk.webm").await.unwrap();

        let failing = CannedServer::start(vec![Route::new("POST", "/api/s3/multipart/abort", 500, "")]).await;
        let err = failing
            .client()
            .abort("u-1", "recordings/talk.webm")
            .await
            .unwrap_err();
        assert!(matches!(err, CaptureError::Upload { status: 500, .. }));
    }

    #[tokio::test]
    async fn test_malformed_initiate_body_is_invalid() {
        let server = CannedServer::start(vec![Route::new(
            "POST",
            "/api/s3/multipart/initiate",
            200,
            "<html>gateway</html>",
        )])
        .await;

        let err = server.client().initiate(&initiate_request()).await.unwrap_err();
        assert!(matches!(err, CaptureError::InvalidResponse { operation: "initiate", .. }));
    }
}
