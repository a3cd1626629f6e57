use thiserror::Error;

/// Errors arising from wire protocol parsing and encoding.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("header too short ({len} bytes, need 5)")]
    HeaderTooShort { len: usize },

    #[error("unknown opcode 0x{code:02X} ('{}')", char::from(*code))]
    UnknownOpcode { code: u8 },

    #[error("unexpected response opcode: sent {sent}, got {got}")]
    UnexpectedOpcode { sent: &'static str, got: &'static str },

    #[error("payload too short for {msg_type}: need {need} bytes, got {got}{}", format_raw_suffix(raw))]
    PayloadTooShort {
        msg_type: &'static str,
        need: usize,
        got: usize,
        /// Raw payload bytes for debug context.
        raw: Vec<u8>,
    },

    #[error("invalid length for {msg_type}: {len}")]
    InvalidLength { msg_type: &'static str, len: i64 },

    #[error("invalid string payload: {0}")]
    InvalidString(#[from] std::string::FromUtf8Error),
}

impl WireError {
    /// Create a `PayloadTooShort` error (raw bytes filled in later via `with_raw`).
    pub(crate) fn payload_too_short(msg_type: &'static str, need: usize, got: usize) -> Self {
        Self::PayloadTooShort { msg_type, need, got, raw: Vec::new() }
    }

    pub(crate) fn invalid_length(msg_type: &'static str, len: impl Into<i64>) -> Self {
        Self::InvalidLength { msg_type, len: len.into() }
    }

    /// Attach raw payload bytes to decode-phase errors for diagnostics.
    pub fn with_raw(self, payload: &[u8]) -> Self {
        match self {
            Self::PayloadTooShort { msg_type, need, got, .. } => {
                Self::PayloadTooShort { msg_type, need, got, raw: payload.to_vec() }
            }
            other => other,
        }
    }
}

/// Format raw bytes as a suffix like " | 43 00 01..." (empty if no bytes).
fn format_raw_suffix(raw: &[u8]) -> String {
    if raw.is_empty() {
        return String::new();
    }
    let limit = 16;
    let hex = raw.iter().take(limit).map(|b| format!("{b:02X}")).collect::<Vec<_>>().join(" ");
    let ellipsis = if raw.len() > limit { "..." } else { "" };
    format!(" | {hex}{ellipsis}")
}

pub type Result<T> = std::result::Result<T, WireError>;
