//! HTTP gateway to the attendance backend.
//!
//! Thin JSON wrapper around `reqwest` that keeps a cookie jar for the
//! authenticated browser session and attaches the anti-forgery token to
//! every state-changing request.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use backoff::{future::retry_notify, ExponentialBackoff};
use reqwest::cookie::{CookieStore, Jar};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Serialize;
use tracing::{debug, instrument, warn};
use url::Url;

use super::{
    decode_envelope, decode_face_verdict, Acknowledgement, AttendanceGateway, AttendanceId,
    ClassroomId, ExportPayload, FaceVerdict, RegisterFaceRequest, ScanAcceptance, SessionGrant,
    SessionId, TokenGrant, ValidateTokenRequest, VerifyFaceRequest,
};
use crate::camera::EncodedImage;
use crate::config::{expand_template, ClientConfig};
use crate::error::{Result, RollcallError};

/// Attendance backend client over HTTP/JSON.
pub struct HttpGateway {
    client: Client,
    jar: Arc<Jar>,
    base: Url,
    config: ClientConfig,
}

impl HttpGateway {
    /// Create a gateway from configuration, seeding the cookie jar from
    /// `config.cookie`.
    #[instrument(level = "debug", skip_all, fields(base_url = %config.base_url))]
    pub fn new(config: ClientConfig) -> Result<Self> {
        let base = Url::parse(&config.base_url)
            .map_err(|e| RollcallError::Config(format!("Invalid base URL: {e}")))?;

        let jar = Arc::new(Jar::default());
        if let Some(cookie) = &config.cookie {
            for pair in cookie.split(';').map(str::trim).filter(|p| !p.is_empty()) {
                jar.add_cookie_str(pair, &base);
            }
        }

        let client = Client::builder()
            .timeout(config.timeout)
            .cookie_provider(jar.clone())
            .build()?;

        debug!("HTTP gateway created");
        Ok(Self {
            client,
            jar,
            base,
            config,
        })
    }

    /// Backend origin this gateway talks to.
    pub fn base_url(&self) -> &Url {
        &self.base
    }

    /// Current anti-forgery token from the cookie jar.
    pub fn csrf_token(&self) -> Option<String> {
        let header = self.jar.cookies(&self.base)?;
        let header = header.to_str().ok()?;
        cookie_value(header, &self.config.csrf_cookie)
    }

    fn url(&self, path: &str) -> Result<Url> {
        let joined = format!("{}{}", self.base.as_str().trim_end_matches('/'), path);
        Url::parse(&joined)
            .map_err(|e| RollcallError::Config(format!("Invalid endpoint {path}: {e}")))
    }

    fn post(&self, url: Url) -> RequestBuilder {
        let builder = self.client.post(url);
        match self.csrf_token() {
            Some(token) => builder.header(self.config.csrf_header.as_str(), token),
            None => {
                warn!(
                    cookie = %self.config.csrf_cookie,
                    "No anti-forgery cookie; sending request without it"
                );
                builder
            }
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<(u16, Vec<u8>)> {
        let start = Instant::now();
        let response = request.send().await.map_err(|e| {
            warn!(error = %e, latency_ms = start.elapsed().as_millis() as u64, "Request failed");
            e
        })?;
        let status = response.status().as_u16();
        let body = response.bytes().await?.to_vec();
        debug!(
            status,
            latency_ms = start.elapsed().as_millis() as u64,
            "Received HTTP response"
        );
        Ok((status, body))
    }

    async fn post_json<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: Option<&B>,
    ) -> Result<(u16, Vec<u8>)> {
        let mut request = self.post(self.url(path)?);
        if let Some(body) = body {
            request = request.json(body);
        }
        self.send(request).await
    }

    async fn fetch_export_once(
        &self,
        url: &Url,
    ) -> std::result::Result<ExportPayload, backoff::Error<RollcallError>> {
        let response = self.client.get(url.clone()).send().await.map_err(|e| {
            if is_transient_error(&e) {
                warn!(error = %e, "Transient error, will retry");
                backoff::Error::transient(RollcallError::Http(e))
            } else {
                backoff::Error::permanent(RollcallError::Http(e))
            }
        })?;

        let status = response.status();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = response
            .bytes()
            .await
            .map_err(|e| backoff::Error::permanent(RollcallError::Http(e)))?
            .to_vec();

        let is_json = content_type
            .as_deref()
            .is_some_and(|ct| ct.contains("application/json"));
        if !status.is_success() || is_json {
            let error = serde_json::from_slice::<serde_json::Value>(&bytes)
                .ok()
                .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string));
            let err = RollcallError::Status {
                status: status.as_u16(),
                error,
            };
            return if is_transient_status(status) {
                Err(backoff::Error::transient(err))
            } else {
                Err(backoff::Error::permanent(err))
            };
        }

        Ok(ExportPayload {
            bytes,
            content_type,
        })
    }
}

#[async_trait]
impl AttendanceGateway for HttpGateway {
    #[instrument(level = "debug", skip(self))]
    async fn start_session(&self, classroom: ClassroomId) -> Result<SessionGrant> {
        let path = expand_template(&self.config.endpoints.start_session, classroom);
        let (status, body) = self.post_json::<()>(&path, None).await?;
        decode_envelope(status, &body)
    }

    #[instrument(level = "debug", skip(self))]
    async fn refresh_token(&self, session: &SessionId) -> Result<TokenGrant> {
        let path = expand_template(&self.config.endpoints.refresh_token, session);
        let (status, body) = self.send(self.client.get(self.url(&path)?)).await?;
        decode_envelope(status, &body)
    }

    #[instrument(level = "debug", skip(self))]
    async fn stop_session(&self, session: &SessionId) -> Result<()> {
        let path = expand_template(&self.config.endpoints.stop_session, session);
        let (status, body) = self.post_json::<()>(&path, None).await?;
        decode_envelope::<Acknowledgement>(status, &body).map(|_| ())
    }

    #[instrument(level = "debug", skip(self, token))]
    async fn validate_token(&self, token: &str, classroom: ClassroomId) -> Result<ScanAcceptance> {
        let request = ValidateTokenRequest {
            token,
            classroom_id: classroom,
        };
        let (status, body) = self
            .post_json(&self.config.endpoints.validate_token, Some(&request))
            .await?;
        decode_envelope(status, &body)
    }

    #[instrument(level = "debug", skip_all, fields(image_len = image.as_str().len()))]
    async fn register_face(&self, image: &EncodedImage) -> Result<()> {
        let request = RegisterFaceRequest {
            image: image.as_str(),
        };
        let (status, body) = self
            .post_json(&self.config.endpoints.register_face, Some(&request))
            .await?;
        decode_envelope::<Acknowledgement>(status, &body).map(|_| ())
    }

    #[instrument(level = "debug", skip(self, image), fields(image_len = image.as_str().len()))]
    async fn verify_face(
        &self,
        image: &EncodedImage,
        attendance: &AttendanceId,
    ) -> Result<FaceVerdict> {
        let request = VerifyFaceRequest {
            image: image.as_str(),
            attendance_id: attendance,
        };
        let (status, body) = self
            .post_json(&self.config.endpoints.verify_face, Some(&request))
            .await?;
        decode_face_verdict(status, &body)
    }

    #[instrument(level = "debug", skip(self))]
    async fn download_export(&self, classroom: ClassroomId) -> Result<ExportPayload> {
        let path = expand_template(&self.config.endpoints.download_export, classroom);
        let url = self.url(&path)?;

        let backoff = ExponentialBackoff {
            initial_interval: Duration::from_millis(200),
            max_interval: Duration::from_secs(2),
            max_elapsed_time: Some(self.config.timeout * self.config.max_retries.max(1)),
            ..Default::default()
        };

        retry_notify(
            backoff,
            || async { self.fetch_export_once(&url).await },
            |err: RollcallError, duration: Duration| {
                warn!(
                    error = %err,
                    retry_after_ms = duration.as_millis() as u64,
                    "Retry scheduled"
                );
            },
        )
        .await
    }
}

/// Find a cookie's value in a `name=value; name2=value2` header.
fn cookie_value(header: &str, name: &str) -> Option<String> {
    header.split(';').map(str::trim).find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key == name).then(|| value.to_string())
    })
}

/// Check if a reqwest error is transient and should be retried.
pub fn is_transient_error(error: &reqwest::Error) -> bool {
    error.is_timeout() || error.is_connect() || error.is_request()
}

/// Check if an HTTP status code indicates a transient error.
pub fn is_transient_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::TOO_MANY_REQUESTS
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
            | StatusCode::BAD_GATEWAY
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cookie_value() {
        let header = "sessionid=abc123; csrftoken=tok; theme=dark";
        assert_eq!(cookie_value(header, "csrftoken"), Some("tok".into()));
        assert_eq!(cookie_value(header, "sessionid"), Some("abc123".into()));
        assert_eq!(cookie_value(header, "missing"), None);
        assert_eq!(cookie_value(header, "csrf"), None);
    }

    #[test]
    fn test_csrf_token_read_from_seeded_jar() {
        let gateway = HttpGateway::new(ClientConfig {
            base_url: "http://127.0.0.1:8000".into(),
            cookie: Some("sessionid=abc; csrftoken=secret-token".into()),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(gateway.csrf_token(), Some("secret-token".into()));
    }

    #[test]
    fn test_csrf_token_absent_without_cookie() {
        let gateway = HttpGateway::new(ClientConfig::default()).unwrap();
        assert_eq!(gateway.csrf_token(), None);
    }

    #[test]
    fn test_invalid_base_url() {
        let result = HttpGateway::new(ClientConfig {
            base_url: "not a url".into(),
            ..Default::default()
        });
        assert!(matches!(result, Err(RollcallError::Config(_))));
    }

    #[test]
    fn test_url_keeps_base_prefix() {
        let gateway = HttpGateway::new(ClientConfig {
            base_url: "https://school.example/app/".into(),
            ..Default::default()
        })
        .unwrap();
        let url = gateway.url("/student/attendance/scan/").unwrap();
        assert_eq!(url.as_str(), "https://school.example/app/student/attendance/scan/");
    }

    #[test]
    fn test_transient_status_codes() {
        assert!(is_transient_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_transient_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(!is_transient_status(StatusCode::NOT_FOUND));
        assert!(!is_transient_status(StatusCode::FORBIDDEN));
    }
}
