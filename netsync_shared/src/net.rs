//! Networking primitives.
//!
//! One TCP stream per peer, carrying frames from `codec`. Each connection
//! gets a reader task (socket to `FrameDecoder` to an inbound queue shared by
//! all connections) and a writer task (bounded outbound queue to socket).
//! Neither task touches replication state; the tick loop does.

use std::{fmt, net::SocketAddr};

use anyhow::Context;
use bytes::Bytes;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener, TcpStream,
    },
    sync::mpsc,
    task::JoinHandle,
};
use tracing::{debug, warn};

use crate::codec::{FrameDecoder, RawFrame, MAX_TRANSMISSION_SIZE};

/// Capacity of the queue shared by all reader tasks.
pub const INBOUND_QUEUE_FRAMES: usize = 1024;

/// What a reader or writer task reports to the tick loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Frame(RawFrame),
    Closed { reason: String },
}

pub type Inbound<K> = (K, LinkEvent);

/// Handles of one connection's I/O tasks.
pub struct Connection {
    peer: SocketAddr,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Connection {
    /// Splits the stream and starts both tasks.
    ///
    /// Frames and the close notice are tagged with `key`.
    pub fn spawn<K>(
        stream: TcpStream,
        key: K,
        inbound: mpsc::Sender<Inbound<K>>,
        outbound: mpsc::Receiver<Bytes>,
    ) -> anyhow::Result<Self>
    where
        K: Clone + Send + fmt::Debug + 'static,
    {
        let peer = stream.peer_addr().context("tcp peer_addr")?;
        stream.set_nodelay(true).context("tcp set_nodelay")?;
        let (rd, wr) = stream.into_split();
        let reader = tokio::spawn(read_loop(rd, key.clone(), inbound.clone()));
        let writer = tokio::spawn(write_loop(wr, key, inbound, outbound));
        Ok(Self {
            peer,
            reader,
            writer,
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Stops both tasks; queued outbound frames are lost.
    pub fn abort(&self) {
        self.reader.abort();
        self.writer.abort();
    }

    /// Stops reading; the writer drains what is queued, then exits once the
    /// sending side of its queue is dropped.
    pub fn close(&self) {
        self.reader.abort();
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_loop<K>(mut rd: OwnedReadHalf, key: K, inbound: mpsc::Sender<Inbound<K>>)
where
    K: Clone + Send + fmt::Debug + 'static,
{
    let mut decoder = FrameDecoder::new();
    let reason = loop {
        decoder.buffer_mut().reserve(MAX_TRANSMISSION_SIZE);
        match rd.read_buf(decoder.buffer_mut()).await {
            Ok(0) => break "connection closed by peer".to_string(),
            Ok(_) => {}
            Err(e) => break format!("tcp read: {e}"),
        }

        let mut failed = None;
        loop {
            match decoder.next_frame() {
                Ok(Some(frame)) => {
                    if inbound.send((key.clone(), LinkEvent::Frame(frame))).await.is_err() {
                        debug!(peer = ?key, "inbound queue closed");
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(peer = ?key, error = %e, "dropping connection");
                    failed = Some(e.to_string());
                    break;
                }
            }
        }
        if let Some(reason) = failed {
            break reason;
        }
    };

    let _ = inbound
        .send((key, LinkEvent::Closed { reason }))
        .await;
}

async fn write_loop<K>(
    mut wr: OwnedWriteHalf,
    key: K,
    inbound: mpsc::Sender<Inbound<K>>,
    mut outbound: mpsc::Receiver<Bytes>,
) where
    K: Clone + Send + fmt::Debug + 'static,
{
    while let Some(frame) = outbound.recv().await {
        if let Err(e) = wr.write_all(&frame).await {
            let _ = inbound
                .send((
                    key,
                    LinkEvent::Closed {
                        reason: format!("tcp write: {e}"),
                    },
                ))
                .await;
            return;
        }
    }
    let _ = wr.shutdown().await;
}

/// TCP server listener.
pub struct ReliableListener {
    listener: TcpListener,
}

impl ReliableListener {
    pub async fn bind(addr: SocketAddr) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr).await.context("tcp bind")?;
        Ok(Self { listener })
    }

    pub async fn accept(&self) -> anyhow::Result<(TcpStream, SocketAddr)> {
        let (stream, addr) = self.listener.accept().await.context("tcp accept")?;
        Ok((stream, addr))
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts forever, handing sockets to `tx` until it closes.
    pub fn spawn_accept_loop(self, tx: mpsc::UnboundedSender<(TcpStream, SocketAddr)>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match self.accept().await {
                    Ok(conn) => {
                        if tx.send(conn).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                }
            }
        })
    }
}

/// Opens a client connection.
pub async fn connect(addr: SocketAddr) -> anyhow::Result<TcpStream> {
    TcpStream::connect(addr).await.context("tcp connect")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{encode_frame, MessageType};

    #[tokio::test]
    async fn frames_cross_a_socket_in_order() -> anyhow::Result<()> {
        let listener = ReliableListener::bind("127.0.0.1:0".parse()?).await?;
        let addr = listener.local_addr()?;

        let client = tokio::spawn(async move {
            let mut stream = connect(addr).await?;
            let mut bytes = Vec::new();
            for text in [&b"one"[..], b"two", b"three"] {
                bytes.extend_from_slice(&encode_frame(MessageType::Debug, text)?);
            }
            // Garbage between frames is skipped by the decoder.
            bytes.extend_from_slice(b"zzzz");
            bytes.extend_from_slice(&encode_frame(MessageType::Debug, b"four")?);
            stream.write_all(&bytes).await?;
            Ok::<_, anyhow::Error>(())
        });

        let (stream, _) = listener.accept().await?;
        let (in_tx, mut in_rx) = mpsc::channel(16);
        let (_out_tx, out_rx) = mpsc::channel(16);
        let _conn = Connection::spawn(stream, 1u32, in_tx, out_rx)?;
        client.await??;

        let mut got = Vec::new();
        while let Some((key, event)) = in_rx.recv().await {
            assert_eq!(key, 1);
            match event {
                LinkEvent::Frame(f) => got.push(f.payload),
                LinkEvent::Closed { .. } => break,
            }
        }
        assert_eq!(got, vec!["one", "two", "three", "four"]);
        Ok(())
    }
}
