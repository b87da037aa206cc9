//! Wire format of the control plane.
//!
//! Requests are compact JSON documents with all fields present. Replies to registration-class
//! requests are fixed-layout binary records, little-endian, behind a common header:
//!
//! ```text
//! [version:u8][type:u8][success:u8][reserved:u8]
//! client   : header [comm_file:256 NUL-padded][file_size:u32][hash_code:u32]   268 bytes
//! journal  : header [comm_idx:i32]                                                8 bytes
//! exit     : header                                                               4 bytes
//! ```
//!
//! The reply to a clock query is JSON again, `{"secDiff":..,"nano":..}`.
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::MESSAGE_MAX_LENGTH;

/// Version byte leading every binary reply.
pub const PROTOCOL_VERSION: u8 = 1;
/// Bytes reserved for the comm file path, including its terminator.
pub const COMM_FILE_MAX_LENGTH: usize = 256;

const HEADER_LEN: usize = 4;
const CLIENT_REPLY_LEN: usize = HEADER_LEN + COMM_FILE_MAX_LENGTH + 8;
const JOURNAL_REPLY_LEN: usize = HEADER_LEN + 4;
const EXIT_REPLY_LEN: usize = HEADER_LEN;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed JSON message: {0}")]
    Json(#[from] serde_json::Error),
    #[error("message of {len} bytes exceeds the limit of {max}")]
    TooLarge { len: usize, max: usize },
    #[error("reply of {actual} bytes, expected {expected}")]
    Length { expected: usize, actual: usize },
    #[error("unsupported protocol version {0}")]
    Version(u8),
    #[error("unknown request type {0}")]
    UnknownType(u8),
    #[error("reply for {actual:?} does not answer a {expected:?} request")]
    Mismatch {
        expected: RequestType,
        actual: RequestType,
    },
    #[error("invalid success flag {0}")]
    Flag(u8),
    #[error("comm file path of {len} bytes exceeds the limit of {max}")]
    PathTooLong { len: usize, max: usize },
    #[error("comm file path is not NUL-free UTF-8")]
    InvalidPath,
}

/// Request kinds, with their wire values.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum RequestType {
    ClockQuery,
    WriterRegister,
    ReaderRegister,
    JournalRegister,
    ClientExit,
}

impl From<RequestType> for u8 {
    fn from(kind: RequestType) -> u8 {
        match kind {
            RequestType::ClockQuery => 0,
            RequestType::WriterRegister => 11,
            RequestType::ReaderRegister => 12,
            RequestType::JournalRegister => 13,
            RequestType::ClientExit => 19,
        }
    }
}

impl TryFrom<u8> for RequestType {
    type Error = ProtocolError;

    fn try_from(raw: u8) -> Result<Self, ProtocolError> {
        Ok(match raw {
            0 => RequestType::ClockQuery,
            11 => RequestType::WriterRegister,
            12 => RequestType::ReaderRegister,
            13 => RequestType::JournalRegister,
            19 => RequestType::ClientExit,
            other => return Err(ProtocolError::UnknownType(other)),
        })
    }
}

/// The request envelope, identical for every kind.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    #[serde(rename = "type")]
    pub kind: RequestType,
    /// Name of the client sending the request.
    pub name: String,
    pub pid: u32,
    /// Zero until the client is registered.
    pub hash_code: u32,
    pub source: i32,
}

impl Request {
    pub fn new(kind: RequestType, name: &str) -> Self {
        Request {
            kind,
            name: name.to_owned(),
            pid: 0,
            hash_code: 0,
            source: 0,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let bytes = serde_json::to_vec(self)?;
        check_len(bytes.len())?;
        Ok(bytes)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        check_len(bytes.len())?;
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Reply to `WriterRegister` and `ReaderRegister`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientReply {
    pub kind: RequestType,
    pub success: bool,
    /// Path of the comm file to map. Empty when unsuccessful.
    pub comm_file: String,
    pub file_size: u32,
    pub hash_code: u32,
}

impl ClientReply {
    pub fn refused(kind: RequestType) -> Self {
        ClientReply {
            kind,
            success: false,
            comm_file: String::new(),
            file_size: 0,
            hash_code: 0,
        }
    }
}

/// Reply to `JournalRegister`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct JournalReply {
    pub success: bool,
    /// Slot index in the comm table, negative when unsuccessful.
    pub comm_idx: i32,
}

/// Reply to `ClientExit`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExitReply {
    pub success: bool,
}

/// Reply to `ClockQuery`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClockReply {
    /// Offset in nanoseconds from the engine's monotonic clock to the wall clock.
    #[serde(rename = "secDiff")]
    pub sec_diff: i64,
    /// Wall-aligned, high resolution timestamp in nanoseconds.
    pub nano: i64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reply {
    Client(ClientReply),
    Journal(JournalReply),
    Exit(ExitReply),
    Clock(ClockReply),
}

impl Reply {
    /// The request kind this reply answers.
    pub fn kind(&self) -> RequestType {
        match self {
            Reply::Client(client) => client.kind,
            Reply::Journal(_) => RequestType::JournalRegister,
            Reply::Exit(_) => RequestType::ClientExit,
            Reply::Clock(_) => RequestType::ClockQuery,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut buf = Vec::with_capacity(CLIENT_REPLY_LEN);

        match self {
            Reply::Clock(clock) => return Ok(serde_json::to_vec(clock)?),
            Reply::Client(client) => {
                let path = client.comm_file.as_bytes();
                if path.len() >= COMM_FILE_MAX_LENGTH {
                    return Err(ProtocolError::PathTooLong {
                        len: path.len(),
                        max: COMM_FILE_MAX_LENGTH - 1,
                    });
                }

                if path.contains(&0) {
                    return Err(ProtocolError::InvalidPath);
                }

                push_header(&mut buf, client.kind, client.success);
                buf.extend_from_slice(path);
                buf.resize(HEADER_LEN + COMM_FILE_MAX_LENGTH, 0);
                buf.extend_from_slice(&client.file_size.to_le_bytes());
                buf.extend_from_slice(&client.hash_code.to_le_bytes());
            }
            Reply::Journal(journal) => {
                push_header(&mut buf, RequestType::JournalRegister, journal.success);
                buf.extend_from_slice(&journal.comm_idx.to_le_bytes());
            }
            Reply::Exit(exit) => {
                push_header(&mut buf, RequestType::ClientExit, exit.success);
            }
        }

        Ok(buf)
    }

    /// Decode the reply to a request of kind `expected`.
    ///
    /// The length, version and kind are validated before any field is read.
    pub fn decode(expected: RequestType, bytes: &[u8]) -> Result<Self, ProtocolError> {
        check_len(bytes.len())?;

        let expected_len = match expected {
            RequestType::ClockQuery => return Ok(Reply::Clock(serde_json::from_slice(bytes)?)),
            RequestType::WriterRegister | RequestType::ReaderRegister => CLIENT_REPLY_LEN,
            RequestType::JournalRegister => JOURNAL_REPLY_LEN,
            RequestType::ClientExit => EXIT_REPLY_LEN,
        };

        if bytes.len() != expected_len {
            return Err(ProtocolError::Length {
                expected: expected_len,
                actual: bytes.len(),
            });
        }

        let (header, body) = bytes.split_at(HEADER_LEN);
        if header[0] != PROTOCOL_VERSION {
            return Err(ProtocolError::Version(header[0]));
        }

        let actual = RequestType::try_from(header[1])?;
        if actual != expected {
            return Err(ProtocolError::Mismatch { expected, actual });
        }

        let success = match header[2] {
            0 => false,
            1 => true,
            other => return Err(ProtocolError::Flag(other)),
        };

        Ok(match expected {
            RequestType::JournalRegister => Reply::Journal(JournalReply {
                success,
                comm_idx: i32::from_le_bytes(word(body, 0)),
            }),
            RequestType::ClientExit => Reply::Exit(ExitReply { success }),
            _ => {
                let (path, tail) = body.split_at(COMM_FILE_MAX_LENGTH);
                let end = path.iter().position(|&b| b == 0).unwrap_or(path.len());
                let comm_file = core::str::from_utf8(&path[..end])
                    .map_err(|_| ProtocolError::InvalidPath)?
                    .to_owned();

                Reply::Client(ClientReply {
                    kind: actual,
                    success,
                    comm_file,
                    file_size: u32::from_le_bytes(word(tail, 0)),
                    hash_code: u32::from_le_bytes(word(tail, 4)),
                })
            }
        })
    }
}

fn push_header(buf: &mut Vec<u8>, kind: RequestType, success: bool) {
    buf.extend_from_slice(&[PROTOCOL_VERSION, kind.into(), u8::from(success), 0]);
}

/// Four bytes at `at`, the caller validated the length.
fn word(bytes: &[u8], at: usize) -> [u8; 4] {
    let mut word = [0; 4];
    word.copy_from_slice(&bytes[at..at + 4]);
    word
}

fn check_len(len: usize) -> Result<(), ProtocolError> {
    if len > MESSAGE_MAX_LENGTH {
        return Err(ProtocolError::TooLarge {
            len,
            max: MESSAGE_MAX_LENGTH,
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_is_compact_json() {
        let mut request = Request::new(RequestType::WriterRegister, "W1");
        request.pid = 1234;

        let text = String::from_utf8(request.encode().unwrap()).unwrap();
        assert_eq!(
            text,
            r#"{"type":11,"name":"W1","pid":1234,"hash_code":0,"source":0}"#
        );
        assert_eq!(Request::decode(text.as_bytes()).unwrap(), request);
    }

    #[test]
    fn request_requires_every_field() {
        let missing = br#"{"type":13,"name":"W1","pid":1234,"source":0}"#;
        assert!(matches!(
            Request::decode(missing),
            Err(ProtocolError::Json(_))
        ));

        let unknown = br#"{"type":42,"name":"W1","pid":1,"hash_code":0,"source":0}"#;
        assert!(Request::decode(unknown).is_err());
    }

    #[test]
    fn client_reply_keeps_path_and_size() {
        let reply = Reply::Client(ClientReply {
            kind: RequestType::WriterRegister,
            success: true,
            comm_file: "/tmp/paged/PAGE_ENGINE_COMM".into(),
            file_size: 176_000,
            hash_code: 0xdead_beef,
        });

        let bytes = reply.encode().unwrap();
        assert_eq!(bytes.len(), CLIENT_REPLY_LEN);
        assert_eq!(
            Reply::decode(RequestType::WriterRegister, &bytes).unwrap(),
            reply
        );
    }

    #[test]
    fn client_reply_path_limit() {
        let mut client = ClientReply::refused(RequestType::ReaderRegister);
        client.comm_file = "p".repeat(COMM_FILE_MAX_LENGTH);

        assert!(matches!(
            Reply::Client(client).encode(),
            Err(ProtocolError::PathTooLong { .. })
        ));
    }

    #[test]
    fn reply_validated_before_reading() {
        let journal = Reply::Journal(JournalReply {
            success: true,
            comm_idx: 3,
        })
        .encode()
        .unwrap();

        // Wrong expectation: a journal reply is not a client reply.
        assert!(matches!(
            Reply::decode(RequestType::WriterRegister, &journal),
            Err(ProtocolError::Length { .. })
        ));

        let exit = Reply::Exit(ExitReply { success: true }).encode().unwrap();
        assert!(matches!(
            Reply::decode(RequestType::ClientExit, &exit[..2]),
            Err(ProtocolError::Length { .. })
        ));

        let mut version = exit.clone();
        version[0] = 9;
        assert!(matches!(
            Reply::decode(RequestType::ClientExit, &version),
            Err(ProtocolError::Version(9))
        ));

        let mut mismatched = exit;
        mismatched[1] = RequestType::JournalRegister.into();
        assert!(matches!(
            Reply::decode(RequestType::ClientExit, &mismatched),
            Err(ProtocolError::Mismatch { .. })
        ));

        let mut flag = journal;
        flag[2] = 2;
        assert!(matches!(
            Reply::decode(RequestType::JournalRegister, &flag),
            Err(ProtocolError::Flag(2))
        ));
    }

    #[test]
    fn clock_reply_is_json() {
        let reply = Reply::Clock(ClockReply {
            sec_diff: -5,
            nano: 1_700_000_000_000_000_000,
        });

        let bytes = reply.encode().unwrap();
        assert_eq!(
            std::str::from_utf8(&bytes).unwrap(),
            r#"{"secDiff":-5,"nano":1700000000000000000}"#
        );
        assert_eq!(Reply::decode(RequestType::ClockQuery, &bytes).unwrap(), reply);
    }
}
