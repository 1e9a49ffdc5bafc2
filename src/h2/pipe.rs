//! An in-memory frame codec pair.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::{Sink, Stream};
use tokio::sync::mpsc;

use super::frame::Frame;

/// Create a connected pair: a [`FramePipe`] for the session, and the
/// [`PipePeer`] playing the server.
pub fn pipe() -> (FramePipe, PipePeer) {
    let (to_peer, from_client) = mpsc::unbounded_channel();
    let (to_client, from_peer) = mpsc::unbounded_channel();
    (
        FramePipe {
            tx: Some(to_peer),
            rx: from_peer,
        },
        PipePeer {
            tx: Some(to_client),
            rx: from_client,
        },
    )
}

fn broken_pipe() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "frame pipe closed")
}

/// The session end of a [`pipe`].
#[derive(Debug)]
pub struct FramePipe {
    tx: Option<mpsc::UnboundedSender<Frame>>,
    rx: mpsc::UnboundedReceiver<Frame>,
}

impl Stream for FramePipe {
    type Item = io::Result<Frame>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx).map(|frame| frame.map(Ok))
    }
}

impl Sink<Frame> for FramePipe {
    type Error = io::Error;

    fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        match &self.tx {
            Some(tx) if !tx.is_closed() => Poll::Ready(Ok(())),
            _ => Poll::Ready(Err(broken_pipe())),
        }
    }

    fn start_send(self: Pin<&mut Self>, item: Frame) -> Result<(), Self::Error> {
        self.tx
            .as_ref()
            .ok_or_else(broken_pipe)?
            .send(item)
            .map_err(|_| broken_pipe())
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.tx.take();
        Poll::Ready(Ok(()))
    }
}

/// The server end of a [`pipe`].
#[derive(Debug)]
pub struct PipePeer {
    tx: Option<mpsc::UnboundedSender<Frame>>,
    rx: mpsc::UnboundedReceiver<Frame>,
}

impl PipePeer {
    /// Send a frame to the session. Returns the frame if the session end is
    /// gone.
    pub fn send(&self, frame: Frame) -> Result<(), Frame> {
        match &self.tx {
            Some(tx) => tx.send(frame).map_err(|error| error.0),
            None => Err(frame),
        }
    }

    /// Next frame written by the session, or `None` once it closed its end.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.rx.recv().await
    }

    /// A frame written by the session, if one is waiting.
    pub fn try_recv(&mut self) -> Option<Frame> {
        self.rx.try_recv().ok()
    }

    /// Close the server end, as if the transport dropped.
    pub fn close(&mut self) {
        self.tx.take();
    }
}
