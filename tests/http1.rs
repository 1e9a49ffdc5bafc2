use std::convert::Infallible;
use std::future::{ready, Ready};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use http::StatusCode;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use tokio::io::DuplexStream;

use switchyard::bridge::HyperIo;
use switchyard::conn::HttpConnector;
use switchyard::exchange::{ExchangeHandler, HttpContext, RequestHead};
use switchyard::{Error, Requester, Target, VersionPolicy};

/// Connects to an in-process hyper server, one per connection.
#[derive(Debug, Clone, Default)]
struct ServerTransport {
    connects: Arc<AtomicUsize>,
}

impl ServerTransport {
    fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

async fn echo(request: http::Request<Incoming>) -> Result<http::Response<Full<Bytes>>, Infallible> {
    let method = request.method().to_string();
    let path = request.uri().to_string();
    let body = request.into_body().collect().await.unwrap().to_bytes();
    Ok(http::Response::builder()
        .header("x-method", method)
        .header("x-path", path)
        .body(Full::new(body))
        .unwrap())
}

impl tower::Service<Target> for ServerTransport {
    type Response = DuplexStream;
    type Error = Infallible;
    type Future = Ready<Result<DuplexStream, Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _target: Target) -> Self::Future {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let (client, server) = tokio::io::duplex(64 * 1024);
        tokio::spawn(async move {
            let _ = hyper::server::conn::http1::Builder::new()
                .serve_connection(HyperIo::new(server), service_fn(echo))
                .await;
        });
        ready(Ok(client))
    }
}

/// Rejects whatever response arrives.
struct RejectResponse {
    request: Option<http::Request<()>>,
}

impl ExchangeHandler for RejectResponse {
    fn produce_request(&mut self, _context: &mut HttpContext) -> Result<RequestHead, Error> {
        let request = self
            .request
            .take()
            .ok_or_else(|| Error::protocol("produced twice"))?;
        Ok(RequestHead::new(request.into_parts().0, false))
    }

    fn consume_response(&mut self, _: http::response::Parts, _: bool) -> Result<(), Error> {
        Err(Error::handler("response rejected"))
    }

    fn consume(&mut self, _data: Bytes) -> Result<(), Error> {
        Ok(())
    }

    fn stream_end(&mut self, _trailers: Option<http::HeaderMap>) -> Result<(), Error> {
        Ok(())
    }

    fn cancel(&mut self) {}

    fn failed(&mut self, _error: Error) {}

    fn release_resources(&mut self) {}
}

fn requester(transport: &ServerTransport, policy: VersionPolicy) -> Requester<HttpConnector<ServerTransport>> {
    Requester::builder()
        .with_transport(transport.clone())
        .with_version_policy(policy)
        .build()
}

#[tokio::test]
async fn negotiate_without_tls_speaks_http1() {
    let _ = tracing_subscriber::fmt::try_init();
    let transport = ServerTransport::default();
    let requester = requester(&transport, VersionPolicy::Negotiate);

    let response = requester
        .send(
            http::Request::get("http://example.com/path?q=1")
                .body(Bytes::new())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.version(), http::Version::HTTP_11);
    assert_eq!(response.headers()["x-path"], "/path?q=1");
}

#[tokio::test]
async fn request_body_is_sent() {
    let transport = ServerTransport::default();
    let requester = requester(&transport, VersionPolicy::ForceHttp1);

    let response = requester
        .send(
            http::Request::post("http://example.com/upload")
                .body(Bytes::from_static(b"payload"))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.headers()["x-method"], "POST");
    assert_eq!(response.body(), &Bytes::from_static(b"payload"));
}

#[tokio::test]
async fn sequential_requests_reuse_the_connection() {
    let transport = ServerTransport::default();
    let requester = requester(&transport, VersionPolicy::ForceHttp1);
    let target: Target = "http://example.com".parse().unwrap();

    for path in ["/one", "/two", "/three"] {
        let response = requester
            .send(
                http::Request::get(format!("http://example.com{path}"))
                    .body(Bytes::new())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.headers()["x-path"], path);

        // The session is returned once the exchange releases it.
        for _ in 0..100 {
            if requester.pool().stats(&target).available == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }
    }

    assert_eq!(transport.connects(), 1);
}

#[tokio::test]
async fn concurrent_requests_open_separate_connections() {
    let transport = ServerTransport::default();
    let requester = requester(&transport, VersionPolicy::ForceHttp1);

    let first = requester.send(http::Request::get("http://example.com/a").body(Bytes::new()).unwrap());
    let second = requester.send(http::Request::get("http://example.com/b").body(Bytes::new()).unwrap());
    let (first, second) = tokio::join!(first, second);

    assert_eq!(first.unwrap().headers()["x-path"], "/a");
    assert_eq!(second.unwrap().headers()["x-path"], "/b");
    assert_eq!(transport.connects(), 2);
}

#[tokio::test]
async fn failed_exchange_does_not_return_its_connection() {
    let transport = ServerTransport::default();
    let requester = Requester::builder()
        .with_transport(transport.clone())
        .with_version_policy(VersionPolicy::ForceHttp1)
        .with_max_per_route(1)
        .build();

    let failing = RejectResponse {
        request: Some(http::Request::get("http://example.com/first").body(()).unwrap()),
    };
    let handle = requester.execute(failing, None, None, HttpContext::new());
    let second = requester.send(http::Request::get("http://example.com/second").body(Bytes::new()).unwrap());

    let response = second.await.unwrap();
    assert_eq!(response.headers()["x-path"], "/second");
    assert!(handle.is_completed());
    assert_eq!(transport.connects(), 2);
}

#[tokio::test]
async fn https_without_tls_strategy_fails() {
    let transport = ServerTransport::default();
    let requester = requester(&transport, VersionPolicy::Negotiate);

    let error = requester
        .send(http::Request::get("https://example.com/").body(Bytes::new()).unwrap())
        .await
        .unwrap_err();
    assert!(matches!(error, switchyard::Error::NoTlsStrategy));
}
