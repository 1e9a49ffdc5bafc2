use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::{Bytes, BytesMut};
use http::HeaderMap;
use tokio::sync::oneshot;

use super::{CapacityChannel, DataChannel, ExchangeHandler, HttpContext, RequestHead};
use crate::cancel::CancellableHandle;
use crate::Error;

/// The request half of a [`BasicExchange`].
pub trait RequestProducer: Send + 'static {
    /// Produce the request head.
    fn produce_request(&mut self, context: &mut HttpContext) -> Result<RequestHead, Error>;

    /// Number of body bytes ready to be written right now.
    fn available(&self) -> usize;

    /// Write request body data into `channel`.
    fn produce(&mut self, channel: &mut DataChannel) -> Result<(), Error>;

    /// The exchange failed.
    fn failed(&mut self, error: &Error) {
        let _ = error;
    }

    /// The exchange is over.
    fn release_resources(&mut self) {}
}

/// The response half of a [`BasicExchange`], which builds a value from the
/// response.
pub trait ResponseConsumer: Send + 'static {
    /// The value produced from a complete response.
    type Output: Send + 'static;

    /// An informational (1xx) response arrived.
    fn consume_information(&mut self, response: &http::response::Parts) -> Result<(), Error> {
        let _ = response;
        Ok(())
    }

    /// The final response head arrived.
    fn consume_response(&mut self, response: http::response::Parts) -> Result<(), Error>;

    /// Decide how much receive credit to return to the peer.
    fn update_capacity(&mut self, channel: &mut CapacityChannel) {
        let consumed = channel.consumed();
        channel.update(consumed);
    }

    /// A chunk of the response body arrived.
    fn consume(&mut self, data: Bytes) -> Result<(), Error>;

    /// The response is complete; build the output.
    fn finish(&mut self, trailers: Option<HeaderMap>) -> Result<Self::Output, Error>;

    /// The exchange failed.
    fn failed(&mut self, error: &Error) {
        let _ = error;
    }

    /// The exchange is over.
    fn release_resources(&mut self) {}
}

/// An [`ExchangeHandler`] built from a producer and a consumer, whose
/// outcome is delivered to a [`ResponseFuture`].
pub struct BasicExchange<P, C>
where
    C: ResponseConsumer,
{
    producer: P,
    consumer: C,
    result: Option<oneshot::Sender<Result<C::Output, Error>>>,
}

impl<P, C> fmt::Debug for BasicExchange<P, C>
where
    C: ResponseConsumer,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BasicExchange")
            .field("complete", &self.result.is_none())
            .finish()
    }
}

impl<P, C> BasicExchange<P, C>
where
    P: RequestProducer,
    C: ResponseConsumer,
{
    /// Create the exchange and the receiver for its outcome.
    pub fn new(producer: P, consumer: C) -> (Self, oneshot::Receiver<Result<C::Output, Error>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                producer,
                consumer,
                result: Some(tx),
            },
            rx,
        )
    }

    fn complete(&mut self, result: Result<C::Output, Error>) {
        if let Some(tx) = self.result.take() {
            let _ = tx.send(result);
        }
    }
}

impl<P, C> ExchangeHandler for BasicExchange<P, C>
where
    P: RequestProducer,
    C: ResponseConsumer,
{
    fn produce_request(&mut self, context: &mut HttpContext) -> Result<RequestHead, Error> {
        self.producer.produce_request(context)
    }

    fn available(&self) -> usize {
        self.producer.available()
    }

    fn produce(&mut self, channel: &mut DataChannel) -> Result<(), Error> {
        self.producer.produce(channel)
    }

    fn consume_information(&mut self, response: &http::response::Parts) -> Result<(), Error> {
        self.consumer.consume_information(response)
    }

    fn consume_response(
        &mut self,
        response: http::response::Parts,
        end_stream: bool,
    ) -> Result<(), Error> {
        self.consumer.consume_response(response)?;
        if end_stream {
            let output = self.consumer.finish(None)?;
            self.complete(Ok(output));
        }
        Ok(())
    }

    fn update_capacity(&mut self, channel: &mut CapacityChannel) {
        self.consumer.update_capacity(channel)
    }

    fn consume(&mut self, data: Bytes) -> Result<(), Error> {
        self.consumer.consume(data)
    }

    fn stream_end(&mut self, trailers: Option<HeaderMap>) -> Result<(), Error> {
        let output = self.consumer.finish(trailers)?;
        self.complete(Ok(output));
        Ok(())
    }

    fn cancel(&mut self) {
        self.complete(Err(Error::Cancelled));
    }

    fn failed(&mut self, error: Error) {
        self.producer.failed(&error);
        self.consumer.failed(&error);
        self.complete(Err(error));
    }

    fn release_resources(&mut self) {
        self.producer.release_resources();
        self.consumer.release_resources();
        self.complete(Err(Error::ConnectionClosed));
    }
}

/// The outcome of an exchange submitted with
/// [`Requester::execute_with`](crate::Requester::execute_with).
///
/// Resolves exactly once, to the consumer's output, the failure cause, or
/// [`Error::Cancelled`]. Dropping an unresolved future cancels the exchange.
#[derive(Debug)]
pub struct ResponseFuture<T> {
    rx: oneshot::Receiver<Result<T, Error>>,
    handle: CancellableHandle,
    done: bool,
}

impl<T> ResponseFuture<T> {
    pub(crate) fn new(rx: oneshot::Receiver<Result<T, Error>>, handle: CancellableHandle) -> Self {
        Self {
            rx,
            handle,
            done: false,
        }
    }

    /// Cancel the exchange.
    pub fn cancel(&self) -> bool {
        self.handle.cancel()
    }

    /// The exchange's cancellation handle.
    pub fn handle(&self) -> &CancellableHandle {
        &self.handle
    }
}

impl<T> Future for ResponseFuture<T> {
    type Output = Result<T, Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let outcome = ready!(Pin::new(&mut self.rx).poll(cx));
        self.done = true;
        Poll::Ready(outcome.unwrap_or(Err(Error::ConnectionClosed)))
    }
}

impl<T> Drop for ResponseFuture<T> {
    fn drop(&mut self) {
        if !self.done {
            self.handle.cancel();
        }
    }
}

/// Request producer for a request with an in-memory body.
#[derive(Debug)]
pub struct BytesRequest {
    parts: Option<http::request::Parts>,
    body: Bytes,
}

impl BytesRequest {
    /// Wrap a request.
    pub fn new(request: http::Request<Bytes>) -> Self {
        let (parts, body) = request.into_parts();
        Self {
            parts: Some(parts),
            body,
        }
    }
}

impl From<http::Request<Bytes>> for BytesRequest {
    fn from(request: http::Request<Bytes>) -> Self {
        Self::new(request)
    }
}

impl RequestProducer for BytesRequest {
    fn produce_request(&mut self, _context: &mut HttpContext) -> Result<RequestHead, Error> {
        let parts = self
            .parts
            .take()
            .ok_or_else(|| Error::protocol("request head already produced"))?;
        Ok(RequestHead::new(parts, !self.body.is_empty()))
    }

    fn available(&self) -> usize {
        self.body.len()
    }

    fn produce(&mut self, channel: &mut DataChannel) -> Result<(), Error> {
        channel.write(&mut self.body);
        if self.body.is_empty() {
            channel.end_stream(None);
        }
        Ok(())
    }
}

/// Response trailers, attached to the extensions of a buffered response.
#[derive(Debug, Clone)]
pub struct Trailers(pub HeaderMap);

/// Response consumer which buffers the whole body.
#[derive(Debug, Default)]
pub struct BytesResponse {
    parts: Option<http::response::Parts>,
    body: BytesMut,
}

impl BytesResponse {
    /// Create an empty consumer.
    pub fn new() -> Self {
        Self::default()
    }
}

impl ResponseConsumer for BytesResponse {
    type Output = http::Response<Bytes>;

    fn consume_response(&mut self, response: http::response::Parts) -> Result<(), Error> {
        self.parts = Some(response);
        Ok(())
    }

    fn consume(&mut self, data: Bytes) -> Result<(), Error> {
        self.body.extend_from_slice(&data);
        Ok(())
    }

    fn finish(&mut self, trailers: Option<HeaderMap>) -> Result<Self::Output, Error> {
        let mut parts = self
            .parts
            .take()
            .ok_or_else(|| Error::protocol("response finished before its head arrived"))?;
        if let Some(trailers) = trailers {
            parts.extensions.insert(Trailers(trailers));
        }
        Ok(http::Response::from_parts(parts, self.body.split().freeze()))
    }
}
