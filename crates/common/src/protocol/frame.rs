// Binary frame layout shared by relay and clients.
//
// Frames are single y-sync messages:
//   sync step 1  00 00 varuint(len) state_vector
//   sync step 2  00 01 varuint(len) update
//   update       00 02 varuint(len) update
//   awareness    01 varuint(len) awareness_update
//
// Encoding and varuint reads come from `yrs`; this module adds the
// exact-length and leaked-text checks on top.

use thiserror::Error;
use yrs::encoding::read::{self, Cursor, Read};
use yrs::encoding::write::Write;
use yrs::sync::{Message, SyncMessage};
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{StateVector, Update};

use super::presence::{parse_text, TextMessage};

pub use yrs::sync::protocol::{
    MSG_AWARENESS, MSG_SYNC, MSG_SYNC_STEP_1 as SYNC_STEP_1, MSG_SYNC_STEP_2 as SYNC_STEP_2,
    MSG_SYNC_UPDATE as SYNC_UPDATE,
};

/// Step 1 with an empty state vector: "send me everything".
pub const SYNC_REQUEST_SENTINEL: [u8; 4] = [MSG_SYNC, SYNC_STEP_1, 1, 0];

/// Anything this short cannot carry a document change.
pub const MIN_FRAME_LEN: usize = 3;

const TEXT_SIGNATURES: &[&str] =
    &["\"type\"", "\"clientId\"", "\"timestamp\"", "\"shardId\"", "\"slideId\""];

/// Why a binary frame was refused before touching a document.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame too short ({len} bytes)")]
    TooShort { len: usize },
    #[error("unknown frame prefix {tag:#04x} {sub:#04x}")]
    UnknownPrefix { tag: u8, sub: u8 },
    #[error("frame length does not match its header: {0}")]
    LengthMismatch(String),
    #[error("update payload is empty")]
    EmptyPayload,
    #[error("frame carries leaked text message")]
    TextContamination,
    #[error("payload is not a valid update: {0}")]
    UndecodableUpdate(String),
}

impl FrameError {
    /// Stable label for logs and metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::TooShort { .. } => "too_short",
            Self::UnknownPrefix { .. } => "unknown_prefix",
            Self::LengthMismatch(_) => "length_mismatch",
            Self::EmptyPayload => "empty_payload",
            Self::TextContamination => "text_contamination",
            Self::UndecodableUpdate(_) => "undecodable_update",
        }
    }
}

impl From<read::Error> for FrameError {
    fn from(error: read::Error) -> Self {
        Self::LengthMismatch(error.to_string())
    }
}

/// Ephemeral payloads; never merged into a document.
#[derive(Debug, Clone, PartialEq)]
pub enum PresenceFrame {
    Awareness(Vec<u8>),
    Text(String),
}

/// An inbound message, classified once on receipt.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    /// Step 1 from a peer. `None` means an empty or unreadable state
    /// vector, answered with the full state.
    SyncRequest { state_vector: Option<Vec<u8>> },
    /// Anything that would mutate the document; must pass validation first.
    DocumentUpdate(Vec<u8>),
    Presence(PresenceFrame),
    /// Text that is not presence (hints, leave notices, unknown types).
    Control(String),
}

impl InboundFrame {
    pub fn from_binary(frame: Vec<u8>) -> Self {
        if frame.as_slice() == SYNC_REQUEST_SENTINEL {
            return Self::SyncRequest { state_vector: None };
        }
        match frame.first() {
            Some(&MSG_AWARENESS) => Self::Presence(PresenceFrame::Awareness(frame)),
            // Shorter step-1 prefixes fall through to the guard and get rejected there.
            Some(&MSG_SYNC) if frame.len() >= MIN_FRAME_LEN && frame[1] == SYNC_STEP_1 => {
                let state_vector = split_frame(&frame)
                    .ok()
                    .map(|raw| raw.payload)
                    .filter(|sv| StateVector::decode_v1(sv).is_ok_and(|sv| !sv.is_empty()));
                Self::SyncRequest { state_vector: state_vector.map(<[u8]>::to_vec) }
            }
            _ => Self::DocumentUpdate(frame),
        }
    }

    pub fn from_text(text: String) -> Self {
        match parse_text(&text) {
            Ok(TextMessage::Presence(_)) => Self::Presence(PresenceFrame::Text(text)),
            _ => Self::Control(text),
        }
    }
}

/// A sync frame as seen by a client receiving from the relay.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncFrame {
    Step1(Vec<u8>),
    Step2(Vec<u8>),
    Update(Vec<u8>),
    Awareness(Vec<u8>),
}

impl SyncFrame {
    pub fn decode(frame: &[u8]) -> Result<Self, FrameError> {
        if frame.len() < 2 {
            return Err(FrameError::TooShort { len: frame.len() });
        }
        let raw = split_frame(frame)?;
        if raw.tag == MSG_AWARENESS {
            // Kept as bytes so peers relay exactly what the sender wrote.
            return Ok(Self::Awareness(raw.payload.to_vec()));
        }
        match Message::decode_v1(frame)? {
            Message::Sync(SyncMessage::SyncStep1(sv)) => Ok(Self::Step1(sv.encode_v1())),
            Message::Sync(SyncMessage::SyncStep2(update)) => Ok(Self::Step2(update)),
            Message::Sync(SyncMessage::Update(update)) => Ok(Self::Update(update)),
            _ => Err(FrameError::UnknownPrefix { tag: frame[0], sub: frame[1] }),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::Step1(sv) => encode_sync_step1(sv),
            Self::Step2(update) => encode_sync_step2(update),
            Self::Update(update) => encode_update(update),
            // An awareness frame is a tagged buffer, which is exactly how yrs
            // writes a custom message.
            Self::Awareness(payload) => Message::Custom(MSG_AWARENESS, payload.clone()).encode_v1(),
        }
    }
}

/// Frame an already encoded state vector without decoding it first.
pub fn encode_sync_step1(state_vector: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(state_vector.len() + 3);
    out.write_var(MSG_SYNC);
    out.write_var(SYNC_STEP_1);
    out.write_buf(state_vector);
    out
}

pub fn encode_sync_step2(update: &[u8]) -> Vec<u8> {
    Message::Sync(SyncMessage::SyncStep2(update.to_vec())).encode_v1()
}

pub fn encode_update(update: &[u8]) -> Vec<u8> {
    Message::Sync(SyncMessage::Update(update.to_vec())).encode_v1()
}

/// Run the structural checks on a frame that claims to carry a document
/// update. Returns the embedded update on success.
pub fn validate_document_frame(frame: &[u8]) -> Result<&[u8], FrameError> {
    if frame.len() < MIN_FRAME_LEN {
        return Err(FrameError::TooShort { len: frame.len() });
    }
    if looks_like_leaked_text(frame) {
        return Err(FrameError::TextContamination);
    }
    if frame[0] != MSG_SYNC || !matches!(frame[1], SYNC_STEP_2 | SYNC_UPDATE) {
        return Err(FrameError::UnknownPrefix { tag: frame[0], sub: frame[1] });
    }

    let payload = split_frame(frame)?.payload;
    if payload.len() <= crate::crdt::EMPTY_UPDATE_LEN {
        return Err(FrameError::EmptyPayload);
    }
    if looks_like_leaked_text(payload) {
        return Err(FrameError::TextContamination);
    }
    Update::decode_v1(payload).map_err(|error| FrameError::UndecodableUpdate(error.to_string()))?;
    Ok(payload)
}

/// True for printable UTF-8 carrying a JSON message signature.
pub fn looks_like_leaked_text(bytes: &[u8]) -> bool {
    let Ok(text) = std::str::from_utf8(bytes) else {
        return false;
    };
    let printable = text.chars().all(|ch| !ch.is_control() || matches!(ch, '\t' | '\n' | '\r'));
    printable && TEXT_SIGNATURES.iter().any(|signature| text.contains(signature))
}

struct RawFrame<'a> {
    tag: u8,
    payload: &'a [u8],
}

/// Read the tag, the sync subtag and the length-prefixed payload, and
/// require that the payload ends exactly at the end of the frame.
fn split_frame(frame: &[u8]) -> Result<RawFrame<'_>, FrameError> {
    let mut cursor = Cursor::new(frame);
    let tag: u8 = cursor.read_var()?;
    match tag {
        MSG_SYNC => {
            let sub: u8 = cursor.read_var()?;
            if !matches!(sub, SYNC_STEP_1 | SYNC_STEP_2 | SYNC_UPDATE) {
                return Err(FrameError::UnknownPrefix { tag, sub });
            }
        }
        MSG_AWARENESS => {}
        tag => {
            return Err(FrameError::UnknownPrefix { tag, sub: frame.get(1).copied().unwrap_or(0) })
        }
    }
    let len = cursor.read_buf()?.len();
    let end = cursor.next;
    if cursor.has_content() {
        return Err(FrameError::LengthMismatch(format!(
            "{} trailing bytes after payload",
            frame.len() - end
        )));
    }
    Ok(RawFrame { tag, payload: &frame[end - len..end] })
}
