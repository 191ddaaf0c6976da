use snafu::Snafu;

/// Push-channel failures. Recovered by the session driver through
/// reconnect; the UI only ever sees the resulting connection state.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum TransportError {
    #[snafu(display("push endpoint '{url}' is invalid: {details}"))]
    InvalidEndpoint {
        stage: &'static str,
        url: String,
        details: String,
    },
    #[snafu(display("failed to connect push channel at {url}"))]
    Connect {
        stage: &'static str,
        url: String,
        source: tokio_tungstenite::tungstenite::Error,
    },
    #[snafu(display("failed to send channel signal"))]
    Send {
        stage: &'static str,
        source: tokio_tungstenite::tungstenite::Error,
    },
    #[snafu(display("push channel receive failed"))]
    Receive {
        stage: &'static str,
        source: tokio_tungstenite::tungstenite::Error,
    },
    #[snafu(display("failed to encode channel signal"))]
    EncodeSignal {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("cannot join room {room}: {details}"))]
    InvalidRoom {
        stage: &'static str,
        room: String,
        details: String,
    },
    #[snafu(display("push channel unavailable: {reason}"))]
    Unavailable { stage: &'static str, reason: String },
}

/// A frame that could not be turned into a typed push event. Never escapes
/// the channel boundary: the frame is dropped and logged.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ProtocolError {
    #[snafu(display("push frame is not valid JSON"))]
    DecodeFrame {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("unknown push event '{event}'"))]
    UnknownEvent { stage: &'static str, event: String },
    #[snafu(display("payload of '{event}' is malformed"))]
    DecodePayload {
        stage: &'static str,
        event: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("payload of '{event}' rejected: {details}"))]
    InvalidPayload {
        stage: &'static str,
        event: &'static str,
        details: String,
    },
}

/// Failure reported by the request/response collaborator.
#[derive(Debug, Clone, Snafu)]
#[snafu(visibility(pub))]
pub enum ApiError {
    #[snafu(display("collaborator unreachable: {message}"))]
    Unreachable { message: String },
    #[snafu(display("collaborator answered {status}: {message}"))]
    Status { status: u16, message: String },
    #[snafu(display("collaborator response could not be decoded: {message}"))]
    Decode { message: String },
    #[snafu(display("session is not authorized"))]
    Unauthorized,
}

impl ApiError {
    /// Whether repeating the same call can reasonably succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ApiError::Unreachable { .. } | ApiError::Decode { .. } => true,
            ApiError::Status { status, .. } => *status >= 500 || *status == 429,
            ApiError::Unauthorized => false,
        }
    }
}

/// History or listing load failure. Nothing is merged when this is returned.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum FetchError {
    #[snafu(display("{stage} request failed"))]
    Request {
        stage: &'static str,
        source: ApiError,
    },
    #[snafu(display("{stage} returned a malformed page: {details}"))]
    MalformedPage {
        stage: &'static str,
        details: String,
    },
}

impl FetchError {
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Request { source, .. } => source.is_retryable(),
            FetchError::MalformedPage { .. } => true,
        }
    }
}

/// Persisting read state failed. Local state is kept and the ids stay
/// queued for the next reconciliation pass.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[snafu(display("failed to persist read state for {count} id(s)"))]
pub struct MarkReadError {
    pub(crate) stage: &'static str,
    pub(crate) count: usize,
    pub(crate) source: ApiError,
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SendError {
    #[snafu(display("message rejected: {details}"))]
    InvalidDraft {
        stage: &'static str,
        details: String,
    },
    #[snafu(display("{stage} request failed"))]
    Deliver {
        stage: &'static str,
        source: ApiError,
    },
    #[snafu(display("server acknowledged a message for another conversation"))]
    MismatchedAck { stage: &'static str },
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ConfigError {
    #[snafu(display("could not determine the platform config directory"))]
    NoConfigDir { stage: &'static str },
    #[snafu(display("failed to create config directory {path}"))]
    CreateDir {
        stage: &'static str,
        path: String,
        source: std::io::Error,
    },
    #[snafu(display("failed to read config file {path}"))]
    Read {
        stage: &'static str,
        path: String,
        source: std::io::Error,
    },
    #[snafu(display("failed to write config file {path}"))]
    Write {
        stage: &'static str,
        path: String,
        source: std::io::Error,
    },
    #[snafu(display("config file {path} is not valid JSON"))]
    Parse {
        stage: &'static str,
        path: String,
        source: serde_json::Error,
    },
    #[snafu(display("failed to encode config"))]
    Encode {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("invalid config value for {field}: {details}"))]
    Invalid {
        stage: &'static str,
        field: &'static str,
        details: String,
    },
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum LoggingError {
    #[snafu(display("could not determine the platform data directory"))]
    NoDataDir { stage: &'static str },
    #[snafu(display("failed to create log directory {path}"))]
    CreateLogDir {
        stage: &'static str,
        path: String,
        source: std::io::Error,
    },
    #[snafu(display("failed to spawn log writer thread"))]
    SpawnWriter {
        stage: &'static str,
        source: std::io::Error,
    },
    #[snafu(display("a global tracing subscriber is already installed"))]
    AlreadyInstalled { stage: &'static str },
}

pub type FetchResult<T> = Result<T, FetchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_error_retryability() {
        assert!(ApiError::Unreachable { message: "timeout".into() }.is_retryable());
        assert!(ApiError::Status { status: 503, message: "busy".into() }.is_retryable());
        assert!(ApiError::Status { status: 429, message: "slow down".into() }.is_retryable());
        assert!(!ApiError::Status { status: 404, message: "gone".into() }.is_retryable());
        assert!(!ApiError::Unauthorized.is_retryable());
    }

    #[test]
    fn test_fetch_error_display_names_stage() {
        let err = FetchError::MalformedPage {
            stage: "fetch_message_page",
            details: "not ascending".into(),
        };
        assert_eq!(
            err.to_string(),
            "fetch_message_page returned a malformed page: not ascending"
        );
        assert!(err.is_retryable());
    }
}
