//! Message payloads.
//!
//! Each message type has a fixed payload layout; `Message::to_frame` wraps
//! the encoded payload in a frame tagged with the message type.

use bytes::Bytes;

use crate::{
    codec::{encode_frame, MessageType, Reader, WireValue, Writer, MAX_PAYLOAD_SIZE},
    error::{DecodeError, FrameError},
    object::{ClientId, ObjectId, Owner},
    registry::{ComponentTypeId, TemplateId},
};

/// Both peers must run the same protocol build.
pub const PROTOCOL_VERSION: u32 = 1;

/// A payload with a known frame type.
pub trait Message: WireValue {
    fn kind(&self) -> MessageType;

    /// Payloads above `MAX_PAYLOAD_SIZE` are returned as an error.
    fn to_frame(&self) -> Result<Bytes, FrameError> {
        let payload = self.to_wire();
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(FrameError::PayloadTooLarge(payload.len()));
        }
        encode_frame(self.kind(), &payload)
    }
}

/// Raw bytes that run to the end of the payload.
fn rest(r: &mut Reader<'_>) -> Bytes {
    Bytes::copy_from_slice(r.rest())
}

macro_rules! empty_message {
    ($($name:ident => $kind:ident;)*) => {
        $(
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
            pub struct $name;

            impl WireValue for $name {
                fn encode(&self, _w: &mut Writer) {}

                fn decode(_r: &mut Reader<'_>) -> Result<Self, DecodeError> {
                    Ok($name)
                }
            }

            impl Message for $name {
                fn kind(&self) -> MessageType {
                    MessageType::$kind
                }
            }
        )*
    };
}

empty_message! {
    GameStarted => GameStarted;
    ClientLoaded => ClientLoaded;
    ReplayComplete => ReplayComplete;
}

/// Free-form diagnostics. The server echoes it back unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugMessage {
    pub payload: Bytes,
}

impl WireValue for DebugMessage {
    fn encode(&self, w: &mut Writer) {
        w.put_slice(&self.payload);
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self { payload: rest(r) })
    }
}

impl Message for DebugMessage {
    fn kind(&self) -> MessageType {
        MessageType::Debug
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    pub protocol: u32,
}

impl WireValue for Handshake {
    fn encode(&self, w: &mut Writer) {
        w.put_u32(self.protocol);
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            protocol: r.read_u32()?,
        })
    }
}

impl Message for Handshake {
    fn kind(&self) -> MessageType {
        MessageType::Handshake
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Welcome {
    pub client: ClientId,
}

impl WireValue for Welcome {
    fn encode(&self, w: &mut Writer) {
        self.client.encode(w);
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self { client: r.read()? })
    }
}

impl Message for Welcome {
    fn kind(&self) -> MessageType {
        MessageType::Welcome
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disconnect {
    pub reason: String,
}

impl WireValue for Disconnect {
    fn encode(&self, w: &mut Writer) {
        self.reason.encode(w);
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self { reason: r.read()? })
    }
}

impl Message for Disconnect {
    fn kind(&self) -> MessageType {
        MessageType::Disconnect
    }
}

/// `[4B object][4B component][component payload]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateObject {
    pub object: ObjectId,
    pub component: u32,
    pub payload: Bytes,
}

impl WireValue for UpdateObject {
    fn encode(&self, w: &mut Writer) {
        self.object.encode(w);
        w.put_u32(self.component);
        w.put_slice(&self.payload);
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            object: r.read()?,
            component: r.read_u32()?,
            payload: rest(r),
        })
    }
}

impl Message for UpdateObject {
    fn kind(&self) -> MessageType {
        MessageType::UpdateObject
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OwnerChanged {
    pub object: ObjectId,
    pub owner: Owner,
}

impl WireValue for OwnerChanged {
    fn encode(&self, w: &mut Writer) {
        self.object.encode(w);
        self.owner.encode(w);
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            object: r.read()?,
            owner: r.read()?,
        })
    }
}

impl Message for OwnerChanged {
    fn kind(&self) -> MessageType {
        MessageType::OwnerChanged
    }
}

/// One component inside a spawn message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentSnapshot {
    pub local: u32,
    pub kind: ComponentTypeId,
    /// Full component payload.
    pub payload: Bytes,
}

impl WireValue for ComponentSnapshot {
    fn encode(&self, w: &mut Writer) {
        w.put_u32(self.local);
        self.kind.encode(w);
        w.put_u32(self.payload.len() as u32);
        w.put_slice(&self.payload);
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let local = r.read_u32()?;
        let kind = r.read()?;
        let len = r.read_u32()? as usize;
        Ok(Self {
            local,
            kind,
            payload: Bytes::copy_from_slice(r.take(len)?),
        })
    }
}

/// `[4B object][4B owner][2B template][2B count][components...]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnObject {
    pub object: ObjectId,
    pub owner: Owner,
    pub template: TemplateId,
    pub components: Vec<ComponentSnapshot>,
}

impl WireValue for SpawnObject {
    fn encode(&self, w: &mut Writer) {
        self.object.encode(w);
        self.owner.encode(w);
        self.template.encode(w);
        w.put_u16(self.components.len() as u16);
        for c in &self.components {
            c.encode(w);
        }
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let object = r.read()?;
        let owner = r.read()?;
        let template = r.read()?;
        let count = r.read_u16()? as usize;
        let mut components = Vec::with_capacity(count.min(r.remaining()));
        for _ in 0..count {
            components.push(r.read()?);
        }
        Ok(Self {
            object,
            owner,
            template,
            components,
        })
    }
}

impl Message for SpawnObject {
    fn kind(&self) -> MessageType {
        MessageType::SpawnObject
    }
}

/// `[4B object][4B local][2B type][full payload]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnComponent {
    pub object: ObjectId,
    pub local: u32,
    pub kind: ComponentTypeId,
    pub payload: Bytes,
}

impl WireValue for SpawnComponent {
    fn encode(&self, w: &mut Writer) {
        self.object.encode(w);
        w.put_u32(self.local);
        self.kind.encode(w);
        w.put_slice(&self.payload);
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            object: r.read()?,
            local: r.read_u32()?,
            kind: r.read()?,
            payload: rest(r),
        })
    }
}

impl Message for SpawnComponent {
    fn kind(&self) -> MessageType {
        MessageType::SpawnComponent
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DestroyObject {
    pub object: ObjectId,
}

impl WireValue for DestroyObject {
    fn encode(&self, w: &mut Writer) {
        self.object.encode(w);
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self { object: r.read()? })
    }
}

impl Message for DestroyObject {
    fn kind(&self) -> MessageType {
        MessageType::DestroyObject
    }
}

/// Request or event call: `[1B type][4B object][4B id][payload]`.
///
/// The type byte repeats the frame type so the payload is self-describing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelCall {
    pub kind: MessageType,
    pub object: ObjectId,
    pub id: u32,
    pub payload: Bytes,
}

impl ChannelCall {
    pub fn request(object: ObjectId, id: u32, payload: Bytes) -> Self {
        Self {
            kind: MessageType::ClientRequest,
            object,
            id,
            payload,
        }
    }

    pub fn event(object: ObjectId, id: u32, payload: Bytes) -> Self {
        Self {
            kind: MessageType::ServerEvent,
            object,
            id,
            payload,
        }
    }

    /// Decodes a call, requiring the given type byte.
    pub fn decode_as(kind: MessageType, bytes: &[u8]) -> Result<Self, DecodeError> {
        let call = Self::from_wire(bytes)?;
        if call.kind != kind {
            return Err(DecodeError::UnexpectedMessageType(call.kind.into()));
        }
        Ok(call)
    }
}

impl WireValue for ChannelCall {
    fn encode(&self, w: &mut Writer) {
        w.put_u8(self.kind.into());
        self.object.encode(w);
        w.put_u32(self.id);
        w.put_slice(&self.payload);
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let kind = MessageType::try_from(r.read_u8()?)?;
        if !matches!(kind, MessageType::ClientRequest | MessageType::ServerEvent) {
            return Err(DecodeError::UnexpectedMessageType(kind.into()));
        }
        Ok(Self {
            kind,
            object: r.read()?,
            id: r.read_u32()?,
            payload: rest(r),
        })
    }
}

impl Message for ChannelCall {
    fn kind(&self) -> MessageType {
        self.kind
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::decode_frame;

    #[test]
    fn oversized_message_is_an_error() {
        let msg = Disconnect {
            reason: "x".repeat(MAX_PAYLOAD_SIZE),
        };
        assert!(matches!(
            msg.to_frame(),
            Err(FrameError::PayloadTooLarge(n)) if n > MAX_PAYLOAD_SIZE
        ));
    }

    #[test]
    fn spawn_layout() {
        let spawn = SpawnObject {
            object: ObjectId(1),
            owner: Owner::Client(ClientId(2)),
            template: TemplateId(3),
            components: vec![ComponentSnapshot {
                local: 0,
                kind: ComponentTypeId(4),
                payload: Bytes::from_static(&[1, 0b1, 0, 1, 1]),
            }],
        };
        let bytes = spawn.to_wire();
        assert_eq!(
            &bytes[..],
            &[
                0, 0, 0, 1, // object
                0, 0, 0, 2, // owner
                0, 3, // template
                0, 1, // count
                0, 0, 0, 0, // local
                0, 4, // type
                0, 0, 0, 5, // length
                1, 1, 0, 1, 1,
            ]
        );
        assert_eq!(SpawnObject::from_wire(&bytes).unwrap(), spawn);
    }

    #[test]
    fn channel_call_layout() {
        let call = ChannelCall::request(ObjectId(9), 2, Bytes::from_static(b"xy"));
        let frame = call.to_frame().unwrap();
        let (kind, payload) = decode_frame(&frame).unwrap();
        assert_eq!(kind, MessageType::ClientRequest as u8);
        assert_eq!(payload, &[100, 0, 0, 0, 9, 0, 0, 0, 2, b'x', b'y']);

        assert_eq!(
            ChannelCall::decode_as(MessageType::ServerEvent, payload),
            Err(DecodeError::UnexpectedMessageType(100))
        );
        assert_eq!(
            ChannelCall::from_wire(&[21, 0, 0, 0, 9, 0, 0, 0, 2]),
            Err(DecodeError::UnexpectedMessageType(21))
        );
    }

    #[test]
    fn spawn_with_truncated_component_is_rejected() {
        let mut w = Writer::new();
        ObjectId(1).encode(&mut w);
        Owner::Server.encode(&mut w);
        TemplateId(0).encode(&mut w);
        w.put_u16(1);
        w.put_u32(0);
        w.put_u16(0);
        w.put_u32(50);
        w.put_slice(&[1, 2, 3]);
        assert!(matches!(
            SpawnObject::from_wire(w.as_slice()),
            Err(DecodeError::Truncated { .. })
        ));
    }

    #[test]
    fn empty_messages_have_empty_payloads() {
        let frame = GameStarted.to_frame().unwrap();
        let (kind, payload) = decode_frame(&frame).unwrap();
        assert_eq!(kind, MessageType::GameStarted as u8);
        assert!(payload.is_empty());
        assert!(ReplayComplete::from_wire(&[1]).is_err());
    }
}
