use thiserror::Error;

/// errors surfaced while connecting, speaking http or driving a gateway session
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid uri `{0}`")]
    InvalidUri(String),
    #[error("dns resolution failed for `{0}`")]
    ResolveFailed(String),
    #[error("connection failed `{0}`")]
    ConnectionFailed(String),
    #[error("tls failure `{0}`")]
    Tls(String),
    #[error("io error {0:?}")]
    Io(#[from] std::io::Error),
    #[error("json error {0}")]
    Json(#[from] serde_json::Error),
    #[error("{0}")]
    HandshakeFailed(String),
    #[error("{error}")]
    Protocol {
        /// close code the connection should fail with (1002 for frame violations)
        close_code: u16,
        #[source]
        error: ProtocolError,
    },
    #[error("gateway error: {0}")]
    Gateway(String),
    #[error("gateway closed the session with unrecoverable code {code}")]
    FatalClose {
        code: u16,
        /// utf-8 reason text from the close frame, possibly empty
        reason: String,
    },
    #[error("io on invalid connection state {0:?}")]
    InvalidConnState(crate::protocol::ConnectionState),
}

impl Error {
    pub(crate) fn protocol(error: ProtocolError) -> Self {
        Error::Protocol {
            close_code: 1002,
            error,
        }
    }

    /// whether the underlying io failure is a peer abort that a socket-level
    /// reconnect may transparently recover from
    pub(crate) fn is_peer_abort(kind: std::io::ErrorKind) -> bool {
        use std::io::ErrorKind::*;
        matches!(kind, ConnectionReset | ConnectionAborted | BrokenPipe)
    }
}

/// wire-level violations while decoding http responses or websocket frames
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid leading bits {0:b}")]
    InvalidLeadingBits(u8),
    #[error("invalid opcode {0}")]
    InvalidOpcode(u8),
    #[error("masked frame received from server")]
    MaskedFrameFromServer,
    #[error("missing init fragmented frame")]
    MissInitialFragmentedFrame,
    #[error("not continue frame after init fragmented frame")]
    NotContinueFrameAfterFragmented,
    #[error("fragmented control frame")]
    FragmentedControlFrame,
    #[error("control frame is too big {0}")]
    ControlFrameTooBig(usize),
    #[error("invalid close frame payload len, expect 0 or >= 2")]
    InvalidCloseFramePayload,
    #[error("invalid close code {0}")]
    InvalidCloseCode(u16),
    #[error("invalid status line")]
    InvalidStatusLine,
    #[error("invalid header line")]
    InvalidHeaderLine,
    #[error("request header exceeds {0} bytes")]
    HeaderTooLarge(usize),
    #[error("too many raw headers, max {0}")]
    TooManyHeaders(usize),
    #[error("too many query params, max {0}")]
    TooManyQueryParams(usize),
    #[error("missing chunk size")]
    MissingChunkSize,
    #[error("invalid chunk size `{0}`")]
    InvalidChunkSize(String),
    #[error("content length {expected} smaller than buffered body {buffered}")]
    ContentLengthMismatch { expected: usize, buffered: usize },
    #[error("peer closed connection mid body")]
    UnexpectedEof,
}
