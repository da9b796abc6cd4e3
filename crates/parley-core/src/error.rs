use std::fmt;

use thiserror::Error;

const UNKNOWN_ERROR: &str = "Unknown error";

#[derive(Error, Debug)]
pub enum ParleyError {
    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Cancelled")]
    Cancelled,
}

impl ParleyError {
    pub fn api(&self) -> Option<&ApiError> {
        match self {
            Self::Api(err) => Some(err),
            _ => None,
        }
    }
}

/// Closed set of remote-call failure kinds.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    #[error("Authentication failed ({status}): {message}")]
    AuthFailure { status: u16, message: String },

    #[error("Rate limited: {message}")]
    RateLimited { message: String },

    #[error("Service error ({status}): {message}")]
    ServiceFailure { status: u16, message: String },

    #[error("Invalid request ({status}): {message}")]
    InvalidRequest { status: u16, message: String },

    #[error("Connection failed ({code}): {message}")]
    ConnectivityFailure { code: TransportCode, message: String },

    #[error("{message}")]
    UnknownFailure { message: String },
}

impl ApiError {
    /// Rate limits and transient service/network failures are expected to
    /// clear on their own; everything else is deterministic.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::ServiceFailure { .. } | Self::ConnectivityFailure { .. }
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::AuthFailure { .. } => "auth_failure",
            Self::RateLimited { .. } => "rate_limited",
            Self::ServiceFailure { .. } => "service_failure",
            Self::InvalidRequest { .. } => "invalid_request",
            Self::ConnectivityFailure { .. } => "connectivity_failure",
            Self::UnknownFailure { .. } => "unknown_failure",
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::AuthFailure { status, .. }
            | Self::ServiceFailure { status, .. }
            | Self::InvalidRequest { status, .. } => Some(*status),
            Self::RateLimited { .. } => Some(429),
            Self::ConnectivityFailure { .. } | Self::UnknownFailure { .. } => None,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::AuthFailure { message, .. }
            | Self::RateLimited { message }
            | Self::ServiceFailure { message, .. }
            | Self::InvalidRequest { message, .. }
            | Self::ConnectivityFailure { message, .. }
            | Self::UnknownFailure { message } => message,
        }
    }

    /// Short user-facing guidance for each kind.
    pub fn hint(&self) -> &'static str {
        match self {
            Self::AuthFailure { .. } => {
                "Check your API key (PARLEY_API_KEY / ANTHROPIC_API_KEY or config `api_key`)."
            }
            Self::RateLimited { .. } => "Rate limit still exceeded after retries. Wait a moment and try again.",
            Self::ServiceFailure { .. } => "The service is having trouble. Try again shortly.",
            Self::InvalidRequest { .. } => "The request was rejected. Check the model id and max_tokens settings.",
            Self::ConnectivityFailure { .. } => "Could not reach the API. Check your network or `base_url`.",
            Self::UnknownFailure { .. } => "Run with --debug for more detail.",
        }
    }
}

/// Low-level transport failure code, independent of any HTTP library.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TransportCode {
    ConnectionRefused,
    TimedOut,
    Other(String),
}

impl From<&str> for TransportCode {
    fn from(code: &str) -> Self {
        match code.trim().to_ascii_lowercase().as_str() {
            "connection-refused" | "econnrefused" => Self::ConnectionRefused,
            "timed-out" | "etimedout" => Self::TimedOut,
            other => Self::Other(other.to_string()),
        }
    }
}

impl fmt::Display for TransportCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionRefused => write!(f, "connection-refused"),
            Self::TimedOut => write!(f, "timed-out"),
            Self::Other(code) => write!(f, "{code}"),
        }
    }
}

/// Unclassified failure as reported by a transport.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawFailure {
    pub status: Option<u16>,
    pub transport: Option<TransportCode>,
    pub message: Option<String>,
}

impl RawFailure {
    pub fn status(status: u16) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn transport(code: impl Into<TransportCode>) -> Self {
        Self {
            transport: Some(code.into()),
            ..Default::default()
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Failure {
    Classified(ApiError),
    Raw(RawFailure),
}

impl From<ApiError> for Failure {
    fn from(err: ApiError) -> Self {
        Self::Classified(err)
    }
}

impl From<RawFailure> for Failure {
    fn from(raw: RawFailure) -> Self {
        Self::Raw(raw)
    }
}

/// Map a failure onto the taxonomy. First matching rule wins; never fails.
pub fn classify(failure: Option<Failure>) -> ApiError {
    let raw = match failure {
        None => {
            return ApiError::UnknownFailure {
                message: UNKNOWN_ERROR.into(),
            }
        }
        Some(Failure::Classified(err)) => return err,
        Some(Failure::Raw(raw)) => raw,
    };

    let RawFailure {
        status,
        transport,
        message,
    } = raw;
    let message = message.filter(|m| !m.trim().is_empty());
    let text = |fallback: &str| message.clone().unwrap_or_else(|| fallback.to_string());

    match status {
        Some(status @ (401 | 403)) => {
            return ApiError::AuthFailure {
                status,
                message: text("Authentication failed"),
            }
        }
        Some(429) => {
            return ApiError::RateLimited {
                message: text("Too many requests"),
            }
        }
        Some(status @ 500..=599) => {
            return ApiError::ServiceFailure {
                status,
                message: text("Service unavailable"),
            }
        }
        Some(status @ 400..=499) => {
            return ApiError::InvalidRequest {
                status,
                message: text("Bad request"),
            }
        }
        _ => {}
    }

    match transport {
        Some(code @ (TransportCode::ConnectionRefused | TransportCode::TimedOut)) => {
            let fallback = code.to_string();
            ApiError::ConnectivityFailure {
                message: text(&fallback),
                code,
            }
        }
        _ => ApiError::UnknownFailure {
            message: text(UNKNOWN_ERROR),
        },
    }
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error at {path}: {message}")]
    Io { path: String, message: String },

    #[error("Serialization error: {0}")]
    Serialization(String),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file error: {0}")]
    File(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Missing API key. Set PARLEY_API_KEY or ANTHROPIC_API_KEY, or add `api_key` to the config file.")]
    MissingApiKey,

    #[error("No pricing configured for model: {0}")]
    MissingPricing(String),
}
