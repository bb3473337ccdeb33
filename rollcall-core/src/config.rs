//! Client configuration.
//!
//! Loads backend location, endpoint templates and protocol timings from
//! environment variables with sensible defaults.

use std::time::Duration;

/// Placeholder replaced by a classroom or session identifier in endpoint templates.
pub const ID_PLACEHOLDER: &str = "{id}";

/// Backend endpoint paths, relative to the base URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointTemplates {
    /// POST, `{id}` = classroom
    pub start_session: String,
    /// GET, `{id}` = session
    pub refresh_token: String,
    /// POST, `{id}` = session
    pub stop_session: String,
    /// GET, `{id}` = classroom
    pub download_export: String,
    pub validate_token: String,
    pub register_face: String,
    pub verify_face: String,
}

impl Default for EndpointTemplates {
    fn default() -> Self {
        Self {
            start_session: "/teacher/attendance/{id}/start/".into(),
            refresh_token: "/teacher/attendance/session/{id}/qr/".into(),
            stop_session: "/teacher/attendance/session/{id}/stop/".into(),
            download_export: "/teacher/attendance/{id}/download/".into(),
            validate_token: "/student/attendance/scan/".into(),
            register_face: "/student/face/register/".into(),
            verify_face: "/student/attendance/verify/".into(),
        }
    }
}

impl EndpointTemplates {
    fn from_env() -> Self {
        let defaults = Self::default();
        let var = |name: &str, default: String| std::env::var(name).unwrap_or(default);
        Self {
            start_session: var("ROLLCALL_START_PATH", defaults.start_session),
            refresh_token: var("ROLLCALL_REFRESH_PATH", defaults.refresh_token),
            stop_session: var("ROLLCALL_STOP_PATH", defaults.stop_session),
            download_export: var("ROLLCALL_EXPORT_PATH", defaults.download_export),
            validate_token: var("ROLLCALL_SCAN_PATH", defaults.validate_token),
            register_face: var("ROLLCALL_REGISTER_PATH", defaults.register_face),
            verify_face: var("ROLLCALL_VERIFY_PATH", defaults.verify_face),
        }
    }
}

/// Substitute an identifier into an endpoint template.
pub fn expand_template(template: &str, id: impl std::fmt::Display) -> String {
    template.replace(ID_PLACEHOLDER, &id.to_string())
}

/// HTTP client configuration loaded from environment variables.
#[derive(Clone)]
pub struct ClientConfig {
    /// Backend origin (default: http://127.0.0.1:8000)
    pub base_url: String,
    /// Raw `name=value; ...` cookie header seeding the cookie jar
    pub cookie: Option<String>,
    /// Per-request timeout (default: 10s)
    pub timeout: Duration,
    /// Cookie holding the anti-forgery token (default: csrftoken)
    pub csrf_cookie: String,
    /// Header carrying the anti-forgery token (default: X-CSRFToken)
    pub csrf_header: String,
    pub endpoints: EndpointTemplates,
    /// Retries for idempotent downloads (default: 3)
    pub max_retries: u32,
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("base_url", &self.base_url)
            .field("cookie", &self.cookie.as_ref().map(|_| "[REDACTED]"))
            .field("timeout", &self.timeout)
            .field("csrf_cookie", &self.csrf_cookie)
            .field("csrf_header", &self.csrf_header)
            .field("endpoints", &self.endpoints)
            .field("max_retries", &self.max_retries)
            .finish()
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8000".into(),
            cookie: None,
            timeout: Duration::from_secs(10),
            csrf_cookie: "csrftoken".into(),
            csrf_header: "X-CSRFToken".into(),
            endpoints: EndpointTemplates::default(),
            max_retries: 3,
        }
    }
}

impl ClientConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let base_url = std::env::var("ROLLCALL_BASE_URL")
            .map(|u| u.trim_end_matches('/').to_string())
            .unwrap_or(defaults.base_url);

        let cookie = std::env::var("ROLLCALL_COOKIE")
            .ok()
            .filter(|c| !c.trim().is_empty());

        let timeout = std::env::var("ROLLCALL_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.timeout);

        let csrf_cookie = std::env::var("ROLLCALL_CSRF_COOKIE").unwrap_or(defaults.csrf_cookie);
        let csrf_header = std::env::var("ROLLCALL_CSRF_HEADER").unwrap_or(defaults.csrf_header);

        let max_retries = std::env::var("ROLLCALL_MAX_RETRIES")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.max_retries);

        Self {
            base_url,
            cookie,
            timeout,
            csrf_cookie,
            csrf_header,
            endpoints: EndpointTemplates::from_env(),
            max_retries,
        }
    }
}

/// Teacher-side timer settings.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionTiming {
    /// Token refresh poll period (default: 3000ms)
    pub poll_interval: Duration,
    /// Countdown redraw period (default: 500ms)
    pub countdown_tick: Duration,
    /// Upper bound for the poll delay after consecutive refresh failures.
    /// `None` keeps the fixed poll cadence regardless of failures.
    pub refresh_backoff_cap: Option<Duration>,
}

impl Default for SessionTiming {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(3000),
            countdown_tick: Duration::from_millis(500),
            refresh_backoff_cap: Some(Duration::from_secs(30)),
        }
    }
}

/// Student-side delays between protocol steps.
#[derive(Debug, Clone, PartialEq)]
pub struct VerificationTiming {
    /// Delay between opening the scan surface and starting the scanner (300ms)
    pub scan_warmup: Duration,
    /// Delay between opening the capture surface and starting the camera (250ms)
    pub camera_warmup: Duration,
    /// Time the "QR accepted" status stays visible before hand-off (600ms)
    pub handoff_delay: Duration,
    /// Delay before the post-registration reload (900ms)
    pub registration_reload_delay: Duration,
    /// Delay before the capture surface closes after a verdict (1200ms)
    pub result_close_delay: Duration,
}

impl Default for VerificationTiming {
    fn default() -> Self {
        Self {
            scan_warmup: Duration::from_millis(300),
            camera_warmup: Duration::from_millis(250),
            handoff_delay: Duration::from_millis(600),
            registration_reload_delay: Duration::from_millis(900),
            result_close_delay: Duration::from_millis(1200),
        }
    }
}

impl VerificationTiming {
    /// All delays zero; useful for scripted clients.
    pub fn immediate() -> Self {
        Self {
            scan_warmup: Duration::ZERO,
            camera_warmup: Duration::ZERO,
            handoff_delay: Duration::ZERO,
            registration_reload_delay: Duration::ZERO,
            result_close_delay: Duration::ZERO,
        }
    }
}
