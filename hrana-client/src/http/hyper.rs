use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::Stream;
use http::header::{AUTHORIZATION, CONTENT_TYPE};

use super::{HttpResponse, HttpSend};
use crate::{Error, Result};

#[cfg(feature = "tls")]
type Connector = hyper_rustls::HttpsConnector<hyper::client::HttpConnector>;
#[cfg(not(feature = "tls"))]
type Connector = hyper::client::HttpConnector;

/// The built-in [`HttpSend`] implementation over a hyper client.
#[derive(Clone, Debug)]
pub struct HttpSender {
    client: hyper::Client<Connector, hyper::Body>,
}

impl HttpSender {
    pub fn new() -> Self {
        #[cfg(feature = "tls")]
        let connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .build();
        #[cfg(not(feature = "tls"))]
        let connector = hyper::client::HttpConnector::new();

        HttpSender {
            client: hyper::Client::builder().build(connector),
        }
    }
}

impl Default for HttpSender {
    fn default() -> Self {
        HttpSender::new()
    }
}

impl HttpSend for HttpSender {
    type Stream = BodyStream;

    fn http_send(
        &self,
        method: http::Method,
        url: Arc<str>,
        auth: Option<Arc<str>>,
        body: Bytes,
        content_type: &'static str,
    ) -> BoxFuture<'static, Result<HttpResponse<BodyStream>>> {
        let client = self.client.clone();
        Box::pin(async move {
            let mut builder = hyper::Request::builder()
                .method(method)
                .uri(&*url)
                .header(CONTENT_TYPE, content_type);
            if let Some(auth) = &auth {
                builder = builder.header(AUTHORIZATION, &**auth);
            }
            let request = builder
                .body(hyper::Body::from(body))
                .map_err(|err| Error::HttpTransport(err.to_string()))?;
            let response = client
                .request(request)
                .await
                .map_err(|err| Error::HttpTransport(err.to_string()))?;
            Ok(HttpResponse {
                status: response.status(),
                body: BodyStream(response.into_body()),
            })
        })
    }
}

/// A hyper response body as a stream of byte chunks.
pub struct BodyStream(hyper::Body);

impl Stream for BodyStream {
    type Item = Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.0)
            .poll_next(cx)
            .map(|chunk| chunk.map(|chunk| chunk.map_err(|err| Error::HttpTransport(err.to_string()))))
    }
}
