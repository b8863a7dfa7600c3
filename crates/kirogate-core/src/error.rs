use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("missing or invalid proxy key")]
    Unauthorized,

    #[error("unknown model: {0}")]
    UnknownModel(String),

    #[error("upstream authentication unavailable: {0}")]
    AuthUnavailable(String),

    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("upstream rejected request ({status}): {message}")]
    UpstreamRejected { status: u16, message: String },

    #[error("parse error: {0}")]
    Parse(String),

    #[error("client disconnected")]
    ClientDisconnected,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl GatewayError {
    /// Short error code string included in JSON error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::Unauthorized => "UNAUTHORIZED",
            GatewayError::UnknownModel(_) => "UNKNOWN_MODEL",
            GatewayError::AuthUnavailable(_) => "AUTH_UNAVAILABLE",
            GatewayError::UpstreamUnavailable(_) => "UPSTREAM_UNAVAILABLE",
            GatewayError::UpstreamRejected { .. } => "UPSTREAM_REJECTED",
            GatewayError::Parse(_) => "PARSE_ERROR",
            GatewayError::ClientDisconnected => "CLIENT_DISCONNECTED",
            GatewayError::Config(_) => "CONFIG_ERROR",
            GatewayError::Io(_) => "IO_ERROR",
            GatewayError::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }

    /// HTTP status this error surfaces as. `UpstreamRejected` passes the
    /// upstream status through unchanged.
    pub fn http_status(&self) -> u16 {
        match self {
            GatewayError::Unauthorized => 401,
            GatewayError::UnknownModel(_) => 400,
            GatewayError::AuthUnavailable(_) => 502,
            GatewayError::UpstreamUnavailable(_) => 502,
            GatewayError::UpstreamRejected { status, .. } => *status,
            GatewayError::Parse(_) => 502,
            GatewayError::ClientDisconnected => 499,
            GatewayError::Config(_) => 500,
            GatewayError::Io(_) => 500,
            GatewayError::Serialization(_) => 500,
        }
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
