//! Automation driver boundary.
//!
//! The concrete browser driver is an external collaborator. The orchestrator
//! only relies on the [`AutomationDriver`] trait and the uniform
//! [`DriverResponse`] envelope `{ success, code?, error?, ...data }`. A
//! `success: false` response is an in-band tool error that flows through the
//! loop guards; a [`DriverError`] means the driver itself could not be
//! reached and is surfaced as a tool error with code `ERROR`.

pub mod cache;

use std::time::Duration;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::tools::args::{BrowserAction, ReadPageArgs, ScreenshotArgs};

/// Future returned by driver calls.
pub type DriverFuture<'a, T> = BoxFuture<'a, Result<T, DriverError>>;

// ── Errors ─────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("driver disconnected: {0}")]
    Disconnected(String),
    #[error("driver call timed out after {0:?}")]
    Timeout(Duration),
    #[error("driver error: {0}")]
    Other(String),
}

/// Classified tool error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    #[serde(rename = "MISSING_TARGET")]
    TargetMissing,
    #[serde(rename = "INVALID_TARGET")]
    InvalidTarget,
    #[serde(rename = "ELEMENT_VANISHED")]
    Vanished,
    #[serde(rename = "INVALID_ACTION")]
    InvalidAction,
    #[serde(rename = "WAIT_TIMEOUT")]
    WaitTimeout,
    #[serde(rename = "CONTRACT_FAILED")]
    ContractFailed,
    #[serde(rename = "ABORTED_BY_NAVIGATION")]
    AbortedByNavigation,
    #[serde(rename = "INVALID_ARGUMENTS")]
    InvalidArguments,
    #[serde(rename = "PERMISSION_DENIED")]
    PermissionDenied,
    #[serde(rename = "ERROR")]
    Other,
}

/// Error families share a recovery strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorFamily {
    /// Target id unknown or not interactable.
    Target,
    /// Element existed but detached before the action landed.
    Vanished,
    /// Action not applicable to the element or page.
    InvalidAction,
    WaitTimeout,
    Contract,
    Other,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::TargetMissing => "MISSING_TARGET",
            ErrorCode::InvalidTarget => "INVALID_TARGET",
            ErrorCode::Vanished => "ELEMENT_VANISHED",
            ErrorCode::InvalidAction => "INVALID_ACTION",
            ErrorCode::WaitTimeout => "WAIT_TIMEOUT",
            ErrorCode::ContractFailed => "CONTRACT_FAILED",
            ErrorCode::AbortedByNavigation => "ABORTED_BY_NAVIGATION",
            ErrorCode::InvalidArguments => "INVALID_ARGUMENTS",
            ErrorCode::PermissionDenied => "PERMISSION_DENIED",
            ErrorCode::Other => "ERROR",
        }
    }

    /// Parse a driver code, accepting common aliases.
    pub fn parse(code: &str) -> Self {
        match code.trim().to_ascii_uppercase().replace(['-', ' '], "_").as_str() {
            "MISSING_TARGET" | "TARGET_NOT_FOUND" | "NOT_FOUND" | "ELEMENT_NOT_FOUND" => {
                ErrorCode::TargetMissing
            }
            "INVALID_TARGET" | "NOT_INTERACTABLE" | "NOT_CLICKABLE" => ErrorCode::InvalidTarget,
            "ELEMENT_VANISHED" | "VANISHED" | "STALE_ELEMENT" | "DETACHED" => ErrorCode::Vanished,
            "INVALID_ACTION" | "UNSUPPORTED_ACTION" => ErrorCode::InvalidAction,
            "WAIT_TIMEOUT" | "TIMEOUT" => ErrorCode::WaitTimeout,
            "CONTRACT_FAILED" => ErrorCode::ContractFailed,
            "ABORTED_BY_NAVIGATION" => ErrorCode::AbortedByNavigation,
            "INVALID_ARGUMENTS" | "BAD_ARGUMENTS" => ErrorCode::InvalidArguments,
            "PERMISSION_DENIED" | "FORBIDDEN" | "BLOCKED" => ErrorCode::PermissionDenied,
            _ => ErrorCode::Other,
        }
    }

    pub fn family(&self) -> ErrorFamily {
        match self {
            ErrorCode::TargetMissing | ErrorCode::InvalidTarget => ErrorFamily::Target,
            ErrorCode::Vanished => ErrorFamily::Vanished,
            ErrorCode::InvalidAction | ErrorCode::InvalidArguments => ErrorFamily::InvalidAction,
            ErrorCode::WaitTimeout => ErrorFamily::WaitTimeout,
            ErrorCode::ContractFailed => ErrorFamily::Contract,
            ErrorCode::AbortedByNavigation | ErrorCode::PermissionDenied | ErrorCode::Other => {
                ErrorFamily::Other
            }
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Response envelope ──────────────────────────────────────────────

/// Uniform result of every driver call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(flatten)]
    pub data: Map<String, Value>,
}

impl DriverResponse {
    /// Success carrying the fields of `data` (non-objects land under `result`).
    pub fn ok(data: Value) -> Self {
        let data = match data {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("result".to_string(), other);
                map
            }
        };
        Self {
            success: true,
            code: None,
            error: None,
            data,
        }
    }

    pub fn failure(code: ErrorCode, error: impl Into<String>) -> Self {
        Self {
            success: false,
            code: Some(code.as_str().to_string()),
            error: Some(error.into()),
            data: Map::new(),
        }
    }

    /// Set a data field.
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.data.insert(key.to_string(), value.into());
        self
    }

    /// Classified code for a failed response.
    pub fn error_code(&self) -> Option<ErrorCode> {
        if self.success {
            return None;
        }
        Some(self.code.as_deref().map_or(ErrorCode::Other, ErrorCode::parse))
    }

    /// Whether the driver reported that the action started a navigation.
    pub fn navigated(&self) -> bool {
        self.data.get("navigated").and_then(Value::as_bool) == Some(true)
    }

    /// Inline screenshot (`data:` URL or base64), when present.
    pub fn screenshot(&self) -> Option<&str> {
        self.data
            .get("screenshot")
            .or_else(|| self.data.get("image"))
            .and_then(Value::as_str)
    }

    /// Serialized form appended to the conversation as the tool result.
    pub fn to_tool_content(&self) -> String {
        let mut copy = self.clone();
        // Images travel as separate vision messages, never inline.
        copy.data.remove("screenshot");
        copy.data.remove("image");
        serde_json::to_string(&copy).unwrap_or_else(|_| {
            format!(
                r#"{{"success":{},"error":"unserializable driver response"}}"#,
                self.success
            )
        })
    }
}

// ── Page state ─────────────────────────────────────────────────────

/// Identity of the active page.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PageInfo {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tab_id: Option<String>,
}

impl PageInfo {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Cache key for observations of this page.
    pub fn identity(&self) -> String {
        format!("{}|{}", self.tab_id.as_deref().unwrap_or("main"), self.url)
    }

    /// Whether a real document is loaded.
    pub fn is_blank(&self) -> bool {
        self.url.is_empty() || self.url == "about:blank"
    }

    /// Lowercase host of the URL, without port.
    pub fn domain(&self) -> Option<String> {
        let rest = self.url.split_once("://").map_or(self.url.as_str(), |(_, r)| r);
        let host = rest.split(['/', '?', '#']).next()?;
        let host = host.rsplit_once('@').map_or(host, |(_, h)| h);
        let host = host.split(':').next()?;
        (!host.is_empty()).then(|| host.to_ascii_lowercase())
    }
}

/// Human-only blockers detected on the page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterventionKind {
    Captcha,
    Login,
    JsDomainPermission,
}

// ── Timeouts ───────────────────────────────────────────────────────

/// Default and clamp window for a caller-tunable timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutBounds {
    pub default_ms: u64,
    pub min_ms: u64,
    pub max_ms: u64,
}

pub const NAVIGATION_TIMEOUT: TimeoutBounds = TimeoutBounds {
    default_ms: 10_000,
    min_ms: 1_000,
    max_ms: 30_000,
};

pub const CONDITION_TIMEOUT: TimeoutBounds = TimeoutBounds {
    default_ms: 5_000,
    min_ms: 100,
    max_ms: 30_000,
};

pub const HTTP_TIMEOUT: TimeoutBounds = TimeoutBounds {
    default_ms: 15_000,
    min_ms: 1_000,
    max_ms: 60_000,
};

/// Requested timeout clamped to `bounds`, or the default.
pub fn clamp_timeout(requested_ms: Option<u64>, bounds: TimeoutBounds) -> Duration {
    Duration::from_millis(
        requested_ms
            .unwrap_or(bounds.default_ms)
            .clamp(bounds.min_ms, bounds.max_ms),
    )
}

// ── Trait ──────────────────────────────────────────────────────────

/// A browser automation backend.
pub trait AutomationDriver: Send + Sync {
    /// Execute one action. In-band failures come back as `success: false`.
    fn execute<'a>(&'a self, action: &'a BrowserAction) -> DriverFuture<'a, DriverResponse>;

    /// URL and title of the active page.
    fn current_page(&self) -> DriverFuture<'_, PageInfo>;

    /// Detect a CAPTCHA or login wall on the active page.
    fn detect_intervention(&self) -> DriverFuture<'_, Option<InterventionKind>>;

    /// Block until a pending navigation settles or `timeout` elapses.
    fn wait_for_navigation(&self, timeout: Duration) -> DriverFuture<'_, DriverResponse>;

    /// Structural read of the active page.
    fn observe(&self) -> DriverFuture<'_, DriverResponse> {
        Box::pin(async move {
            let action = BrowserAction::ReadPage(ReadPageArgs::default());
            self.execute(&action).await
        })
    }

    /// Viewport screenshot.
    fn capture_screenshot(&self) -> DriverFuture<'_, DriverResponse> {
        Box::pin(async move {
            let action = BrowserAction::Screenshot(ScreenshotArgs::default());
            self.execute(&action).await
        })
    }
}
