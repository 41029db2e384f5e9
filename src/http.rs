use std::pin::Pin;
use std::task::{Context, Poll};
use std::{cmp, fmt, io};

use futures::Stream;
use hyper::body::HttpBody;

use crate::executor::Parker;

pub use hyper::body::Bytes;

/// An HTTP request carrying a [`Body`].
pub type Request = hyper::Request<Body>;

/// An HTTP response carrying a [`Body`].
///
/// ```
/// # use ship::{Response, Body};
/// let response = Response::new(Body::new("Hello world!"));
/// assert_eq!(response.status(), 200);
/// ```
pub type Response = hyper::Response<Body>;

/// A builder of [`Response`]s.
///
/// ```
/// # use ship::{ResponseBuilder, Body};
/// let response = ResponseBuilder::new()
///     .status(404)
///     .header("X-Custom-Foo", "Bar")
///     .body(Body::new("Page not found."))
///     .unwrap();
/// assert_eq!(response.status(), 404);
/// ```
pub type ResponseBuilder = hyper::http::response::Builder;

/// A request or response body.
///
/// Handlers run synchronously, so the body of a request is consumed as an
/// [`Iterator`] of chunks or through [`Body::reader`]; both block the worker
/// thread until the next chunk arrives.
///
/// ```
/// # use ship::Body;
/// # use std::io::Read;
/// let mut body = Body::new("Hello world!");
/// let mut text = String::new();
/// body.reader().read_to_string(&mut text).unwrap();
/// assert_eq!(text, "Hello world!");
/// ```
pub struct Body(pub(crate) hyper::Body);

impl Body {
    /// Creates a body from a string or bytes.
    pub fn new(data: impl Into<Bytes>) -> Body {
        Body(hyper::Body::from(data.into()))
    }

    pub fn empty() -> Body {
        Body(hyper::Body::empty())
    }

    /// Returns a blocking [`io::Read`] over the remaining chunks.
    pub fn reader(&mut self) -> BodyReader<'_> {
        BodyReader {
            body: self,
            pending: Bytes::new(),
        }
    }
}

impl<T> From<T> for Body
where
    Bytes: From<T>,
{
    fn from(data: T) -> Body {
        Body::new(data)
    }
}

impl Iterator for Body {
    type Item = io::Result<Bytes>;

    fn next(&mut self) -> Option<Self::Item> {
        Parker::new()
            .block_on(self.0.data())
            .map(|chunk| chunk.map_err(|err| io::Error::new(io::ErrorKind::Other, err)))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        Stream::size_hint(&self.0)
    }
}

/// The blocking reader returned by [`Body::reader`].
pub struct BodyReader<'b> {
    body: &'b mut Body,
    pending: Bytes,
}

impl io::Read for BodyReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.pending.is_empty() {
            match self.body.next() {
                Some(chunk) => self.pending = chunk?,
                None => return Ok(0),
            }
        }

        let n = cmp::min(buf.len(), self.pending.len());
        buf[..n].copy_from_slice(&self.pending.split_to(n));
        Ok(n)
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl Default for Body {
    fn default() -> Self {
        Self::empty()
    }
}

impl HttpBody for Body {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_data(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Self::Data, Self::Error>>> {
        Pin::new(&mut self.0).poll_data(cx)
    }

    fn poll_trailers(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<Option<hyper::HeaderMap>, Self::Error>> {
        Pin::new(&mut self.0).poll_trailers(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.0.is_end_stream()
    }

    fn size_hint(&self) -> hyper::body::SizeHint {
        HttpBody::size_hint(&self.0)
    }
}
