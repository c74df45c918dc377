use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;

/// One application-visible frame on the signaling transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    Ping,
    Pong,
    Close,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,
    #[error("websocket error: {0}")]
    Ws(#[from] axum::Error),
}

/// Write half of a signaling transport. One frame per call; frames go out in
/// the order callers hand them over under the connection's write lock.
#[async_trait]
pub trait FrameSink: Send {
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError>;
}

/// Read half of a signaling transport. `None` means end of stream.
#[async_trait]
pub trait FrameSource: Send {
    async fn next(&mut self) -> Option<Result<Frame, TransportError>>;
}

/// Splits an upgraded websocket into the sink/source pair a connection owns.
pub fn split_socket(socket: WebSocket) -> (Box<dyn FrameSink>, Box<dyn FrameSource>) {
    let (sink, stream) = socket.split();
    (Box::new(WsSink(sink)), Box::new(WsSource(stream)))
}

struct WsSink(SplitSink<WebSocket, Message>);

#[async_trait]
impl FrameSink for WsSink {
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        let message = match frame {
            Frame::Text(text) => Message::Text(text),
            Frame::Binary(data) => Message::Binary(data),
            Frame::Ping => Message::Ping(Vec::new()),
            Frame::Pong => Message::Pong(Vec::new()),
            Frame::Close => Message::Close(None),
        };
        self.0.send(message).await.map_err(TransportError::from)
    }
}

struct WsSource(SplitStream<WebSocket>);

#[async_trait]
impl FrameSource for WsSource {
    async fn next(&mut self) -> Option<Result<Frame, TransportError>> {
        let message = match self.0.next().await? {
            Ok(message) => message,
            Err(error) => return Some(Err(error.into())),
        };
        Some(Ok(match message {
            Message::Text(text) => Frame::Text(text),
            Message::Binary(data) => Frame::Binary(data),
            Message::Ping(_) => Frame::Ping,
            Message::Pong(_) => Frame::Pong,
            Message::Close(_) => Frame::Close,
        }))
    }
}

/// In-memory frame channel: whatever goes into the sink comes out of the
/// source. Used as a stand-in transport in tests and loopback tooling; the
/// sink reports `Closed` once the source end is gone.
pub fn pipe() -> (PipeSink, PipeSource) {
    let (tx, rx) = mpsc::unbounded_channel();
    (PipeSink { tx }, PipeSource { rx })
}

pub struct PipeSink {
    tx: mpsc::UnboundedSender<Frame>,
}

pub struct PipeSource {
    rx: mpsc::UnboundedReceiver<Frame>,
}

#[async_trait]
impl FrameSink for PipeSink {
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        self.tx.send(frame).map_err(|_| TransportError::Closed)
    }
}

#[async_trait]
impl FrameSource for PipeSource {
    async fn next(&mut self) -> Option<Result<Frame, TransportError>> {
        self.rx.recv().await.map(Ok)
    }
}
