//! Error taxonomy for the replication layer.
//!
//! Every error here is recoverable at the connection level. Frame errors may
//! cost the connection; everything else costs at most the single message.

use thiserror::Error;

use crate::object::{ClientId, ObjectId};

/// Framing failures. `Desync` is the only one that drops a connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame start signature mismatch")]
    BadStartSignature,
    #[error("frame end signature mismatch")]
    BadEndSignature,
    #[error("frame declares {declared} payload bytes but only {available} are available")]
    LengthOverrun { declared: usize, available: usize },
    #[error("frame payload of {0} bytes exceeds the transmission limit")]
    PayloadTooLarge(usize),
    #[error("frame shorter than the fixed framing overhead ({0} bytes)")]
    TooShort(usize),
    #[error("no valid frame found within {0} discarded bytes")]
    Desync(usize),
}

/// Payload decoding failures. The offending message is dropped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("payload truncated: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },
    #[error("{0} trailing bytes after payload")]
    TrailingBytes(usize),
    #[error("slot count mismatch: payload has {received}, component has {expected}")]
    SlotCountMismatch { expected: usize, received: usize },
    #[error("unknown message type {0}")]
    UnknownMessageType(u8),
    #[error("unexpected message type {0}")]
    UnexpectedMessageType(u8),
    #[error("unknown component type {0}")]
    UnknownComponentType(u16),
    #[error("unknown template {0}")]
    UnknownTemplate(u16),
    #[error("invalid utf-8 in string field")]
    InvalidUtf8,
    #[error("payload type does not match the registered handler")]
    PayloadTypeMismatch,
    #[error("handler target is not the declaring component type")]
    ComponentTypeMismatch,
}

/// Authority violations. Rejected locally, never applied.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthorityError {
    #[error("client {client:?} does not own object {object}")]
    NotOwner { client: ClientId, object: ObjectId },
    #[error("object {0} is dormant")]
    Dormant(ObjectId),
    #[error("{0} invoked on the wrong side")]
    WrongSide(&'static str),
    #[error("not joined to a game")]
    NotJoined,
}

/// Lookup failures. Expected during disconnect/destroy races.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UnknownTargetError {
    #[error("unknown object {0}")]
    Object(ObjectId),
    #[error("unknown component {component} on object {object}")]
    Component { object: ObjectId, component: u32 },
    #[error("unknown request {request} on object {object}")]
    Request { object: ObjectId, request: u32 },
    #[error("unknown event {event} on object {object}")]
    Event { object: ObjectId, event: u32 },
    #[error("unknown client {0:?}")]
    Client(ClientId),
}

/// Component/template registration mistakes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("component type `{0}` is already registered")]
    DuplicateType(&'static str),
    #[error("template `{0}` is already registered")]
    DuplicateTemplate(String),
    #[error("component type `{name}` declares {slots} slots, the limit is {max}")]
    TooManySlots {
        name: &'static str,
        slots: usize,
        max: usize,
    },
    #[error("component type `{0}` is not registered")]
    UnknownType(&'static str),
    #[error("template `{0}` is not registered")]
    UnknownTemplate(String),
    #[error("component type id {0} is not registered")]
    UnknownTypeId(u16),
    #[error("component type `{component}` declares channel `{channel}` twice")]
    DuplicateChannel {
        component: &'static str,
        channel: &'static str,
    },
}

/// Umbrella error for replication operations.
#[derive(Debug, Error)]
pub enum NetError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Authority(#[from] AuthorityError),
    #[error(transparent)]
    UnknownTarget(#[from] UnknownTargetError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("outbound queue full for client {0:?}")]
    QueueFull(ClientId),
    #[error("connection closed")]
    Closed,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}
