//! Server side of the authentication handshake.
//!
//! The handshake runs on the raw byte stream before message framing starts:
//!
//! ```text
//! client -> 0x00
//! client -> AUTH <mechanism...>\r\n
//! server -> OK <token>\r\n
//! client -> BEGIN\r\n
//! ```
//!
//! No credentials are checked: any line starting with `AUTH ` is accepted.
//! [`ServerAuth::advance`] is non-blocking. It consumes whatever complete
//! input is buffered and returns [`AuthStatus::Pending`] when it needs more.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use thiserror::Error;

/// Longest handshake line accepted before the terminator.
pub const MAX_AUTH_LINE: usize = 16 * 1024;

/// Handshake state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    /// Waiting for the leading NUL byte.
    NullWait,
    /// Waiting for the `AUTH` line.
    AuthWait,
    /// Waiting for the `BEGIN` line.
    BeginWait,
    /// Handshake done, message framing has started.
    Complete,
    /// Handshake failed. Terminal.
    Failed,
}

impl fmt::Display for AuthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AuthState::NullWait => "NullWait",
            AuthState::AuthWait => "AuthWait",
            AuthState::BeginWait => "BeginWait",
            AuthState::Complete => "Complete",
            AuthState::Failed => "Failed",
        };
        f.write_str(s)
    }
}

/// Result of one [`ServerAuth::advance`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStatus {
    /// More input is needed.
    Pending,
    /// The handshake is complete.
    Complete,
}

/// Handshake protocol errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandshakeError {
    /// First byte was not NUL.
    #[error("{state}: client didn't start with NUL byte (got 0x{byte:02x})")]
    MissingNul { state: AuthState, byte: u8 },

    /// Line did not match what the state expects.
    #[error("{state}: {expected} command expected: {line:?}")]
    UnexpectedLine {
        state: AuthState,
        expected: &'static str,
        line: String,
    },

    /// Line exceeded [`MAX_AUTH_LINE`] without a terminator.
    #[error("{state}: handshake line exceeds {MAX_AUTH_LINE} bytes")]
    LineTooLong { state: AuthState },

    /// `advance` called after a failure.
    #[error("handshake already failed")]
    Failed,
}

/// Server handshake state machine for one connection.
#[derive(Debug, Clone)]
pub struct ServerAuth {
    state: AuthState,
    token: String,
}

impl ServerAuth {
    /// Create a handshake that answers `AUTH` with `OK <token>`.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            state: AuthState::NullWait,
            token: token.into(),
        }
    }

    /// Get the current state.
    #[must_use]
    pub fn state(&self) -> AuthState {
        self.state
    }

    /// Whether the handshake has completed.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.state == AuthState::Complete
    }

    /// Consume buffered input and advance as far as it allows.
    ///
    /// Replies for the client are appended to `output`. On completion every
    /// byte after the `BEGIN` line is left in `input` for message framing.
    ///
    /// # Errors
    ///
    /// Returns an error, and moves to [`AuthState::Failed`], on any
    /// deviation from the expected handshake.
    pub fn advance(
        &mut self,
        input: &mut BytesMut,
        output: &mut BytesMut,
    ) -> Result<AuthStatus, HandshakeError> {
        let result = self.step_all(input, output);
        if result.is_err() {
            self.state = AuthState::Failed;
        }
        result
    }

    fn step_all(
        &mut self,
        input: &mut BytesMut,
        output: &mut BytesMut,
    ) -> Result<AuthStatus, HandshakeError> {
        loop {
            match self.state {
                AuthState::Failed => return Err(HandshakeError::Failed),
                AuthState::Complete => return Ok(AuthStatus::Complete),
                AuthState::NullWait => {
                    let Some(&byte) = input.first() else {
                        return Ok(AuthStatus::Pending);
                    };
                    if byte != 0 {
                        return Err(HandshakeError::MissingNul {
                            state: self.state,
                            byte,
                        });
                    }
                    input.advance(1);
                    self.state = AuthState::AuthWait;
                }
                AuthState::AuthWait => {
                    let Some(line) = take_line(input, self.state)? else {
                        return Ok(AuthStatus::Pending);
                    };
                    if !starts_with_ignore_case(&line, b"AUTH ") {
                        return Err(self.unexpected("AUTH", &line));
                    }
                    output.put_slice(b"OK ");
                    output.put_slice(self.token.as_bytes());
                    output.put_slice(b"\r\n");
                    self.state = AuthState::BeginWait;
                }
                AuthState::BeginWait => {
                    let Some(line) = take_line(input, self.state)? else {
                        return Ok(AuthStatus::Pending);
                    };
                    if !line.eq_ignore_ascii_case(b"BEGIN") {
                        return Err(self.unexpected("BEGIN", &line));
                    }
                    self.state = AuthState::Complete;
                }
            }
        }
    }

    fn unexpected(&self, expected: &'static str, line: &[u8]) -> HandshakeError {
        HandshakeError::UnexpectedLine {
            state: self.state,
            expected,
            line: String::from_utf8_lossy(line).into_owned(),
        }
    }
}

/// Split one LF-terminated line off `input`, without its CR-LF or LF.
fn take_line(input: &mut BytesMut, state: AuthState) -> Result<Option<Bytes>, HandshakeError> {
    let Some(pos) = input.iter().position(|&b| b == b'\n') else {
        if input.len() > MAX_AUTH_LINE {
            return Err(HandshakeError::LineTooLong { state });
        }
        return Ok(None);
    };

    let mut line = input.split_to(pos + 1);
    line.truncate(pos);
    if line.last() == Some(&b'\r') {
        line.truncate(pos - 1);
    }
    Ok(Some(line.freeze()))
}

fn starts_with_ignore_case(line: &[u8], prefix: &[u8]) -> bool {
    line.len() >= prefix.len() && line[..prefix.len()].eq_ignore_ascii_case(prefix)
}

/// Bytes a client sends to authenticate with `mechanism` and start framing.
///
/// The server processes buffered input in order, so the `BEGIN` line may be
/// sent before the `OK` reply has been read.
#[must_use]
pub fn client_preamble(mechanism: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(mechanism.len() + 16);
    buf.put_u8(0);
    buf.put_slice(b"AUTH ");
    buf.put_slice(mechanism.as_bytes());
    buf.put_slice(b"\r\nBEGIN\r\n");
    buf.freeze()
}

/// Client side: read the server's `OK <token>` line from `input`.
///
/// Returns `Ok(None)` until a complete line is buffered.
///
/// # Errors
///
/// Returns an error if the line is not an `OK` line.
pub fn read_ok_line(input: &mut BytesMut) -> Result<Option<String>, HandshakeError> {
    let Some(line) = take_line(input, AuthState::AuthWait)? else {
        return Ok(None);
    };
    if !starts_with_ignore_case(&line, b"OK ") {
        return Err(HandshakeError::UnexpectedLine {
            state: AuthState::AuthWait,
            expected: "OK",
            line: String::from_utf8_lossy(&line).into_owned(),
        });
    }
    Ok(Some(String::from_utf8_lossy(&line[3..]).into_owned()))
}
