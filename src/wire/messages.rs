//! Frame kinds and their payloads.
//!
//! Each payload type implements [`Payload`], which ties it to exactly one
//! [`FrameKind`]. [`Message`] is the closed set of everything that can
//! travel over a session.

use bytes::BytesMut;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::engine::checkpoint::CheckpointDecision;
use crate::engine::run::RunStatus;
use crate::engine::time_flow::TimeFlow;
use crate::target::InputEvent;
use crate::wire::serial;
use crate::{AppError, Result};

/// Protocol version negotiated in `Hello`.
pub const PROTOCOL_VERSION: u32 = 1;

/// One-byte frame discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameKind {
    /// Client greeting carrying version and token.
    Hello = 1,
    /// Handshake accepted.
    HelloAck = 2,
    /// Handshake rejected.
    HelloNack = 3,
    /// Raw code image plus optional debug symbols.
    CodeImage = 10,
    /// Entry-point catalog of the current image.
    Catalog = 11,
    /// Code image could not be loaded.
    LoadFailed = 12,
    /// Request the current catalog again.
    ListCatalog = 13,
    /// Run one catalog entry.
    RunEntryPoint = 20,
    /// A run was accepted and started.
    RunStarted = 21,
    /// Cooperative stop request for a run.
    StopRun = 22,
    /// Terminal report of a run.
    RunResult = 23,
    /// One log line.
    Log = 30,
    /// Interactive checkpoint awaiting an operator decision.
    CheckpointPrompt = 40,
    /// Operator decision for a checkpoint.
    CheckpointAnswer = 41,
    /// Input event forwarded to the target.
    SimulateInput = 50,
    /// Orderly or diagnostic disconnect notice.
    Disconnect = 60,
}

impl FrameKind {
    /// Parse a discriminator byte; unknown bytes yield `None`.
    #[must_use]
    pub fn from_byte(byte: u8) -> Option<Self> {
        let kind = match byte {
            1 => Self::Hello,
            2 => Self::HelloAck,
            3 => Self::HelloNack,
            10 => Self::CodeImage,
            11 => Self::Catalog,
            12 => Self::LoadFailed,
            13 => Self::ListCatalog,
            20 => Self::RunEntryPoint,
            21 => Self::RunStarted,
            22 => Self::StopRun,
            23 => Self::RunResult,
            30 => Self::Log,
            40 => Self::CheckpointPrompt,
            41 => Self::CheckpointAnswer,
            50 => Self::SimulateInput,
            60 => Self::Disconnect,
            _ => return None,
        };
        Some(kind)
    }

    /// Discriminator byte written on the wire.
    #[must_use]
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// A typed payload bound to a single frame kind.
pub trait Payload: Serialize + DeserializeOwned {
    /// Frame kind carrying this payload.
    const KIND: FrameKind;

    /// Append the serialized payload to `dst`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Protocol` if serialization fails.
    fn encode(&self, dst: &mut BytesMut) -> Result<()> {
        serial::encode_into(self, dst)
    }

    /// Decode a payload that must span `bytes` exactly.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Protocol` on malformed or trailing bytes.
    fn decode(bytes: &[u8]) -> Result<Self> {
        serial::from_slice(bytes, bytes.len())
    }
}

/// Client greeting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    /// Protocol version spoken by the client.
    pub protocol_version: u32,
    /// Free-form client identification.
    pub client: String,
    /// Shared secret.
    pub token: String,
}

/// Handshake accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloAck {
    /// Identifier the host assigned to the session.
    pub session_id: String,
    /// Host identification.
    pub server: String,
}

/// Handshake rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloNack {
    /// Why the handshake was rejected.
    pub reason: String,
}

/// Raw code image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeImage {
    /// Image bytes.
    pub image: Vec<u8>,
    /// Optional debug symbols for the image.
    pub symbols: Option<Vec<u8>>,
}

/// One catalog row as presented to the operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryPointInfo {
    /// Position in the catalog; used to select the entry point.
    pub index: u32,
    /// Declaring type.
    pub type_name: String,
    /// Method name.
    pub method: String,
    /// Human-readable summary from the entry-point marker.
    pub summary: String,
    /// Ordering key from the entry-point marker.
    pub order: i32,
}

/// Catalog of the session's current code image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Catalog {
    /// Image name.
    pub image: String,
    /// SHA-256 of the raw image bytes, hex encoded.
    pub digest: String,
    /// Entry points sorted by ordering key.
    pub entries: Vec<EntryPointInfo>,
    /// Types or methods skipped during discovery, with reasons.
    pub skipped: Vec<String>,
}

/// Code image could not be loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadFailed {
    /// Load error description.
    pub reason: String,
}

/// Request for the current catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListCatalog;

/// Run one catalog entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEntryPoint {
    /// Catalog index of the entry point.
    pub index: u32,
    /// Time-flow policy active for the run.
    pub time_flow: TimeFlow,
}

/// A run was started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStarted {
    /// Run identifier.
    pub run_id: String,
    /// `Type.method` of the entry point.
    pub entry: String,
}

/// Cooperative stop request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopRun {
    /// Run identifier.
    pub run_id: String,
}

/// Terminal report of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunResult {
    /// Run identifier.
    pub run_id: String,
    /// `Type.method` of the entry point.
    pub entry: String,
    /// Terminal status.
    pub status: RunStatus,
    /// True only when the entry point finished cleanly.
    pub completed: bool,
    /// Wall-clock duration of the run.
    pub duration_ms: u64,
    /// Fault or abort description.
    pub message: Option<String>,
    /// RFC 3339 start timestamp.
    pub started_at: String,
    /// RFC 3339 stop timestamp.
    pub finished_at: String,
}

/// Log severity carried in [`Log`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    /// Informational output.
    Info,
    /// Something unexpected that did not stop the run.
    Warn,
    /// A failure.
    Error,
}

/// One log line, optionally tied to a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Log {
    /// Run that produced the line, if any.
    pub run_id: Option<String>,
    /// Severity.
    pub level: LogLevel,
    /// Text.
    pub line: String,
}

/// Interactive checkpoint prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointPrompt {
    /// Run that is waiting.
    pub run_id: String,
    /// Identifier to echo back in the answer.
    pub prompt_id: String,
    /// Question shown to the operator.
    pub message: String,
    /// Decisions the operator may choose from.
    pub choices: Vec<CheckpointDecision>,
}

/// Operator answer to a checkpoint prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointAnswer {
    /// Prompt being answered.
    pub prompt_id: String,
    /// Chosen decision.
    pub decision: CheckpointDecision,
}

/// Input event to forward to the target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulateInput {
    /// The event.
    pub event: InputEvent,
}

/// Disconnect notice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Disconnect {
    /// Why the connection is ending.
    pub reason: String,
}

macro_rules! bind_payloads {
    ($($ty:ident),* $(,)?) => {
        $(impl Payload for $ty {
            const KIND: FrameKind = FrameKind::$ty;
        })*

        /// Every message that can travel over a session.
        #[derive(Debug, Clone, PartialEq)]
        #[allow(missing_docs)]
        pub enum Message {
            $($ty($ty),)*
        }

        impl Message {
            /// Frame kind of this message.
            #[must_use]
            pub fn kind(&self) -> FrameKind {
                match self {
                    $(Self::$ty(_) => FrameKind::$ty,)*
                }
            }

            /// Append the payload bytes (without kind or length) to `dst`.
            ///
            /// # Errors
            ///
            /// Returns `AppError::Protocol` if serialization fails.
            pub fn encode_payload(&self, dst: &mut BytesMut) -> Result<()> {
                match self {
                    $(Self::$ty(payload) => payload.encode(dst),)*
                }
            }

            /// Decode the payload of a frame of the given kind.
            ///
            /// # Errors
            ///
            /// Returns `AppError::Protocol` on malformed payload bytes.
            pub fn decode_payload(kind: FrameKind, bytes: &[u8]) -> Result<Self> {
                match kind {
                    $(FrameKind::$ty => $ty::decode(bytes).map(Self::$ty),)*
                }
            }
        }

        $(impl From<$ty> for Message {
            fn from(payload: $ty) -> Self {
                Self::$ty(payload)
            }
        })*
    };
}

bind_payloads!(
    Hello,
    HelloAck,
    HelloNack,
    CodeImage,
    Catalog,
    LoadFailed,
    ListCatalog,
    RunEntryPoint,
    RunStarted,
    StopRun,
    RunResult,
    Log,
    CheckpointPrompt,
    CheckpointAnswer,
    SimulateInput,
    Disconnect,
);

impl Message {
    /// Construct a log message.
    #[must_use]
    pub fn log(run_id: Option<&str>, level: LogLevel, line: impl Into<String>) -> Self {
        Self::Log(Log {
            run_id: run_id.map(str::to_owned),
            level,
            line: line.into(),
        })
    }

    /// Construct a disconnect notice.
    #[must_use]
    pub fn disconnect(reason: impl Into<String>) -> Self {
        Self::Disconnect(Disconnect {
            reason: reason.into(),
        })
    }
}

impl TryFrom<u8> for FrameKind {
    type Error = AppError;

    fn try_from(byte: u8) -> Result<Self> {
        Self::from_byte(byte)
            .ok_or_else(|| AppError::Protocol(format!("unknown frame kind {byte}")))
    }
}
