//! Minimal framed message channel standing in for the core stream/message/
//! broker layer that the rest of this crate is built against.
//!
//! Every peer connection — master to direct child, or the in-process pair
//! used to drive a [`crate::router::Router`] in tests — is, at this layer,
//! a length-prefixed `bincode` frame over a `UnixStream`. Higher layers
//! (handshake, routing, module forwarding) only ever see [`Envelope`] and
//! [`MessageKind`].

use crate::error::Error;
use nix::unistd::getpid;
use serde::{Deserialize, Serialize};
use std::{convert::TryFrom, mem};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::UnixStream,
    sync::Mutex,
};
use zerocopy::{AsBytes, FromBytes};

/// Routing and control message kinds exchanged between parent and child.
///
/// IDs below [`Header::RESERVED`] are reserved for this control plane;
/// application payloads (module forwarding replies, user RPCs) use higher
/// IDs and are opaque to the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    /// `proxy_connect` request/reply pair, addressed by context id.
    Connect,
    /// `ALLOCATE_ID` request/response, addressed to context 0.
    AllocateId,
    /// Route announcement: payload is `"<id>"` or `"<id>:<name>"`.
    AddRoute,
    /// Route retraction: payload is `"<id>"`.
    DelRoute,
    /// Module blob push, addressed back to the requester.
    LoadModule,
    /// Graceful shutdown request.
    Shutdown,
    /// Application payload, opaque to the routing layer.
    Data,
}

impl MessageKind {
    const RESERVED: u32 = 10;

    fn discriminant(self) -> u32 {
        match self {
            Self::Connect => 1,
            Self::AllocateId => 2,
            Self::AddRoute => 3,
            Self::DelRoute => 4,
            Self::LoadModule => 5,
            Self::Shutdown => 6,
            Self::Data => Self::RESERVED,
        }
    }
}

/// Fixed-size wire header, identical in spirit to `imsg`'s `Message`: a
/// request type, payload length and the source/destination context IDs
/// needed to route without deserialising the payload.
#[derive(Debug, AsBytes, FromBytes, Default, Clone, Copy)]
#[repr(C)]
struct Header {
    kind: u32,
    length: u32,
    source_id: u32,
    dest_id: u32,
    pid: libc::pid_t,
}

impl Header {
    const LENGTH: usize = mem::size_of::<Self>();
}

/// A decoded frame: its kind, routing endpoints, and raw payload bytes.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub kind: MessageKind,
    pub source_id: u32,
    pub dest_id: u32,
    pub payload: Vec<u8>,
}

impl Envelope {
    pub fn new(kind: MessageKind, source_id: u32, dest_id: u32, payload: Vec<u8>) -> Self {
        Self {
            kind,
            source_id,
            dest_id,
            payload,
        }
    }

    pub fn decode<T: for<'de> Deserialize<'de>>(&self) -> Result<T, Error> {
        bincode::deserialize(&self.payload)
            .map_err(|err| Error::ProtocolViolation(err.to_string().into()))
    }
}

/// Async send/receive half over a single `UnixStream`, mirroring `imsg`'s
/// `Handler` but without ancillary fd-passing: this crate's spawner owns
/// child file descriptors directly via fork/exec, so no fd needs to cross
/// an already-connected socket.
pub struct Handler {
    socket: Mutex<UnixStream>,
}

impl Handler {
    pub fn new(socket: UnixStream) -> Self {
        Self {
            socket: Mutex::new(socket),
        }
    }

    pub fn pair() -> std::io::Result<(Self, Self)> {
        let (a, b) = UnixStream::pair()?;
        Ok((Self::new(a), Self::new(b)))
    }

    pub async fn send(&self, envelope: &Envelope) -> Result<(), Error> {
        let length = u32::try_from(envelope.payload.len())
            .map_err(|_| Error::ProtocolViolation("payload too large".into()))?;
        let header = Header {
            kind: envelope.kind.discriminant(),
            length,
            source_id: envelope.source_id,
            dest_id: envelope.dest_id,
            pid: getpid().as_raw(),
        };

        let mut socket = self.socket.lock().await;
        socket.write_all(header.as_bytes()).await?;
        if !envelope.payload.is_empty() {
            socket.write_all(&envelope.payload).await?;
        }
        Ok(())
    }

    pub async fn send_kind(&self, kind: MessageKind, source_id: u32, dest_id: u32) -> Result<(), Error> {
        self.send(&Envelope::new(kind, source_id, dest_id, Vec::new()))
            .await
    }

    pub async fn send_data<T: Serialize>(
        &self,
        kind: MessageKind,
        source_id: u32,
        dest_id: u32,
        data: &T,
    ) -> Result<(), Error> {
        let payload = bincode::serialize(data)
            .map_err(|err| Error::ProtocolViolation(err.to_string().into()))?;
        self.send(&Envelope::new(kind, source_id, dest_id, payload))
            .await
    }

    /// Returns `None` on a clean EOF (the peer closed the stream).
    pub async fn recv(&self) -> Result<Option<Envelope>, Error> {
        let mut socket = self.socket.lock().await;

        let mut header_buf = [0u8; Header::LENGTH];
        if let Err(err) = socket.read_exact(&mut header_buf).await {
            return if err.kind() == std::io::ErrorKind::UnexpectedEof {
                Ok(None)
            } else {
                Err(err.into())
            };
        }
        let header = *zerocopy::LayoutVerified::<_, Header>::new(&header_buf[..])
            .ok_or_else(|| Error::ProtocolViolation("truncated header".into()))?;

        let mut payload = vec![0u8; header.length as usize];
        if !payload.is_empty() {
            socket.read_exact(&mut payload).await?;
        }

        let kind = match header.kind {
            1 => MessageKind::Connect,
            2 => MessageKind::AllocateId,
            3 => MessageKind::AddRoute,
            4 => MessageKind::DelRoute,
            5 => MessageKind::LoadModule,
            6 => MessageKind::Shutdown,
            _ => MessageKind::Data,
        };

        Ok(Some(Envelope {
            kind,
            source_id: header.source_id,
            dest_id: header.dest_id,
            payload,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_data_payload() {
        let (a, b) = Handler::pair().unwrap();
        a.send_data(MessageKind::Data, 1, 2, &"hello".to_string())
            .await
            .unwrap();

        let envelope = b.recv().await.unwrap().unwrap();
        assert_eq!(envelope.source_id, 1);
        assert_eq!(envelope.dest_id, 2);
        let decoded: String = envelope.decode().unwrap();
        assert_eq!(decoded, "hello");
    }

    #[tokio::test]
    async fn recv_returns_none_on_eof() {
        let (a, b) = Handler::pair().unwrap();
        drop(a);
        assert!(b.recv().await.unwrap().is_none());
    }
}
