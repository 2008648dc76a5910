//! Bus transports
//!
//! A transport moves [`Envelope`]s to the other side of a link. Outbound
//! goes through [`Transport::send`]; inbound envelopes arrive on the
//! [`Inbound`] receiver returned alongside the transport. Dropping every
//! sender of that receiver (the link closing) ends the stream.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tracing::{debug, warn};

use crate::module::bus::error::BusError;
use crate::module::bus::protocol::Envelope;

/// Envelopes arriving from the other side of a link
pub type Inbound = mpsc::UnboundedReceiver<Envelope>;

pub trait Transport: Send + Sync + 'static {
    fn send(&self, envelope: Envelope) -> Result<(), BusError>;
}

/// In-memory transport, one half of [`memory_pair`]
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<Envelope>,
}

impl Transport for ChannelTransport {
    fn send(&self, envelope: Envelope) -> Result<(), BusError> {
        self.tx
            .send(envelope)
            .map_err(|_| BusError::transport("link closed"))
    }
}

/// Two cross-wired in-memory transports
///
/// What is sent on the first transport arrives on the second inbound, and
/// the reverse.
pub fn memory_pair() -> ((ChannelTransport, Inbound), (ChannelTransport, Inbound)) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    (
        (ChannelTransport { tx: b_tx }, a_rx),
        (ChannelTransport { tx: a_tx }, b_rx),
    )
}

/// Length-delimited JSON frames over a byte stream
///
/// Used between the coordinator and its worker processes over the worker's
/// stdin/stdout. Each frame is a 4-byte big-endian length followed by one
/// JSON-encoded envelope.
#[derive(Debug, Clone)]
pub struct FramedTransport {
    frames: mpsc::UnboundedSender<Bytes>,
}

impl FramedTransport {
    /// Start the reader and writer tasks for a stream pair
    ///
    /// Must be called inside a tokio runtime.
    pub fn spawn<R, W>(reader: R, writer: W) -> (Self, Inbound)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (frame_tx, mut frame_rx) = mpsc::unbounded_channel::<Bytes>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let mut sink = FramedWrite::new(writer, LengthDelimitedCodec::new());
            while let Some(frame) = frame_rx.recv().await {
                if let Err(e) = sink.send(frame).await {
                    debug!("Transport write failed: {}", e);
                    break;
                }
            }
        });

        tokio::spawn(async move {
            let mut stream = FramedRead::new(reader, LengthDelimitedCodec::new());
            while let Some(frame) = stream.next().await {
                let bytes = match frame {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        debug!("Transport read failed: {}", e);
                        break;
                    }
                };
                match serde_json::from_slice::<Envelope>(&bytes) {
                    Ok(envelope) => {
                        if inbound_tx.send(envelope).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("Dropping undecodable frame ({} bytes): {}", bytes.len(), e),
                }
            }
        });

        (Self { frames: frame_tx }, inbound_rx)
    }
}

impl Transport for FramedTransport {
    fn send(&self, envelope: Envelope) -> Result<(), BusError> {
        let bytes = serde_json::to_vec(&envelope)
            .map_err(|e| BusError::transport(format!("encode failed: {}", e)))?;
        self.frames
            .send(Bytes::from(bytes))
            .map_err(|_| BusError::transport("link closed"))
    }
}
