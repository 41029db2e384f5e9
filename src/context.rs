use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::io::Read;
use std::mem;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::header::{self, HeaderMap, HeaderName, HeaderValue};
use hyper::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::binder::Binder;
use crate::error::{Error, HttpError, Result};
use crate::handler::{self, Handler};
use crate::http::{Body, Request, Response};
use crate::logger::Logger;
use crate::pool::{BufferPool, PooledBuffer};
use crate::render::Renderer;
use crate::router::{Params, Router};
use crate::server::ConnectionInfo;
use crate::session::Session;

pub const MIME_TEXT_PLAIN: &str = "text/plain; charset=UTF-8";
pub const MIME_TEXT_HTML: &str = "text/html; charset=UTF-8";
pub const MIME_APPLICATION_JSON: &str = "application/json; charset=UTF-8";

/// The collaborators a [`Ship`](crate::Ship) hands to every context.
#[derive(Clone)]
pub struct Shared {
    pub(crate) debug: bool,
    pub(crate) logger: Option<Arc<dyn Logger>>,
    pub(crate) renderer: Option<Arc<dyn Renderer>>,
    pub(crate) binder: Option<Arc<dyn Binder>>,
    pub(crate) session: Option<Arc<dyn Session>>,
    pub(crate) buffers: Arc<BufferPool>,
    pub(crate) store_size: usize,
    pub(crate) not_found: Handler,
    pub(crate) method_not_allowed: Handler,
    pub(crate) options: Handler,
}

impl Shared {
    /// Creates the set without any collaborator installed.
    pub fn new(debug: bool, buffer_size: usize, store_size: usize) -> Self {
        Shared {
            debug,
            logger: None,
            renderer: None,
            binder: None,
            session: None,
            buffers: Arc::new(BufferPool::new(buffer_size)),
            store_size,
            not_found: handler::not_found_handler(),
            method_not_allowed: handler::method_not_allowed_handler(),
            options: handler::options_handler(),
        }
    }
}

/// The response being assembled for a request.
///
/// The status line is fixed by the first write; later status changes are
/// ignored.
#[derive(Debug, Default)]
pub struct ResponseWriter {
    status: StatusCode,
    headers: HeaderMap,
    body: Vec<u8>,
    committed: bool,
}

impl ResponseWriter {
    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Reports whether the status has been written.
    pub fn is_committed(&self) -> bool {
        self.committed
    }

    pub fn write_header(&mut self, status: StatusCode) {
        if !self.committed {
            self.status = status;
            self.committed = true;
        }
    }

    /// Appends to the body, committing a 200 status first if none was written.
    pub fn write(&mut self, data: &[u8]) {
        self.write_header(StatusCode::OK);
        self.body.extend_from_slice(data);
    }

    /// Replaces the body written so far, keeping the status and headers.
    pub fn replace_body(&mut self, data: &[u8]) {
        self.body.clear();
        self.body.extend_from_slice(data);
    }

    fn reset(&mut self) {
        self.status = StatusCode::OK;
        self.headers.clear();
        self.body.clear();
        self.committed = false;
    }

    /// Moves the assembled response out, leaving the writer reset.
    pub(crate) fn take(&mut self) -> Response {
        let mut response = Response::new(Body::new(mem::take(&mut self.body)));
        *response.status_mut() = self.status;
        *response.headers_mut() = mem::take(&mut self.headers);
        self.reset();
        response
    }
}

/// The per-request state passed through the middleware chain to the handler.
///
/// Contexts are pooled: a handler owns its context only for the duration of
/// the request and must not keep anything borrowed from it.
pub struct Context {
    pub(crate) request: Request,
    pub(crate) response: ResponseWriter,
    pub(crate) params: Params,
    pub(crate) router: Option<Arc<Router>>,
    pub(crate) error: Option<Error>,
    pub(crate) info: Option<ConnectionInfo>,
    pub(crate) shared: Arc<Shared>,
    store: HashMap<String, Box<dyn Any + Send + Sync>>,
}

impl Context {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Context {
            request: Request::default(),
            response: ResponseWriter::default(),
            params: Params::default(),
            router: None,
            error: None,
            info: None,
            store: HashMap::with_capacity(shared.store_size),
            shared,
        }
    }

    /// Clears the request state, keeping the allocated storage.
    pub(crate) fn reset(&mut self) {
        self.request = Request::default();
        self.response.reset();
        self.params.clear();
        self.store.clear();
        self.router = None;
        self.error = None;
        self.info = None;
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn request_mut(&mut self) -> &mut Request {
        &mut self.request
    }

    pub fn method(&self) -> &Method {
        self.request.method()
    }

    pub fn path(&self) -> &str {
        self.request.uri().path()
    }

    /// Returns the request header `name` if it is valid UTF-8.
    pub fn header(&self, name: impl header::AsHeaderName) -> Option<&str> {
        self.request
            .headers()
            .get(name)
            .and_then(|value| value.to_str().ok())
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header(header::CONTENT_TYPE)
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.info.as_ref().and_then(ConnectionInfo::peer_addr)
    }

    /// Returns the value of the path parameter `name`.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name)
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    /// Reads the whole request body.
    pub fn body_bytes(&mut self) -> Result<Vec<u8>> {
        let mut data = Vec::new();
        self.request.body_mut().reader().read_to_end(&mut data)?;
        Ok(data)
    }

    /// Decodes the request into `T` through the configured binder.
    ///
    /// A body that the binder accepts but which does not fit `T` is a
    /// "400 Bad Request".
    pub fn bind<T: DeserializeOwned>(&mut self) -> Result<T> {
        let binder = self
            .shared
            .binder
            .clone()
            .ok_or_else(|| Error::msg("no binder is configured"))?;
        let value = binder.bind(self)?;
        serde_json::from_value(value)
            .map_err(|err| HttpError::bad_request().with_cause(err).into())
    }

    pub fn response(&self) -> &ResponseWriter {
        &self.response
    }

    pub fn response_mut(&mut self) -> &mut ResponseWriter {
        &mut self.response
    }

    /// Sets a response header, replacing any previous value.
    pub fn set_header(&mut self, name: &str, value: &str) -> Result {
        let name = HeaderName::from_bytes(name.as_bytes()).map_err(Error::other)?;
        let value = HeaderValue::from_str(value).map_err(Error::other)?;
        self.response.headers.insert(name, value);
        Ok(())
    }

    /// Writes `data` with the given status and content type.
    pub fn blob(&mut self, status: StatusCode, content_type: &str, data: impl AsRef<[u8]>) -> Result {
        let value = HeaderValue::from_str(content_type).map_err(Error::other)?;
        self.response.headers.insert(header::CONTENT_TYPE, value);
        self.response.write_header(status);
        self.response.write(data.as_ref());
        Ok(())
    }

    pub fn text(&mut self, status: StatusCode, text: impl AsRef<str>) -> Result {
        self.blob(status, MIME_TEXT_PLAIN, text.as_ref())
    }

    pub fn html(&mut self, status: StatusCode, html: impl AsRef<str>) -> Result {
        self.blob(status, MIME_TEXT_HTML, html.as_ref())
    }

    /// Serializes `data` as the JSON body.
    pub fn json<T: Serialize + ?Sized>(&mut self, status: StatusCode, data: &T) -> Result {
        let mut buf = self.acquire_buffer();
        serde_json::to_writer(&mut *buf, data)?;
        self.blob(status, MIME_APPLICATION_JSON, &buf[..])
    }

    /// Renders `data` with the renderer registered as `name`.
    pub fn render<T: Serialize + ?Sized>(&mut self, name: &str, status: StatusCode, data: &T) -> Result {
        let renderer = self
            .shared
            .renderer
            .clone()
            .ok_or_else(|| Error::msg("no renderer is configured"))?;
        let value = serde_json::to_value(data)?;
        renderer.render(self, name, status, &value)
    }

    pub fn no_content(&mut self, status: StatusCode) -> Result {
        self.response.write_header(status);
        Ok(())
    }

    /// Redirects the client to `location`.
    pub fn redirect(&mut self, status: StatusCode, location: &str) -> Result {
        if !status.is_redirection() {
            return Err(HttpError::internal()
                .with_message(format!("invalid redirect status code {}", status.as_u16()))
                .into());
        }
        self.set_header(header::LOCATION.as_str(), location)?;
        self.response.write_header(status);
        Ok(())
    }

    /// Stores a value for the later middlewares and the handler of this
    /// request.
    pub fn set<T: Any + Send + Sync>(&mut self, key: impl Into<String>, value: T) {
        self.store.insert(key.into(), Box::new(value));
    }

    pub fn get<T: Any>(&self, key: &str) -> Option<&T> {
        self.store.get(key).and_then(|value| value.downcast_ref())
    }

    pub fn remove<T: Any>(&mut self, key: &str) -> Option<T> {
        let value = self.store.remove(key)?;
        value.downcast().ok().map(|value| *value)
    }

    /// Leaves an error for the error handler, for a handler that has
    /// nothing to return it through.
    pub fn set_error(&mut self, err: Error) {
        self.error = Some(err);
    }

    pub fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    pub fn is_debug(&self) -> bool {
        self.shared.debug
    }

    pub fn logger(&self) -> Option<&dyn Logger> {
        self.shared.logger.as_deref()
    }

    pub fn get_session(&self, id: &str) -> Result<Option<Value>> {
        match &self.shared.session {
            Some(session) => session.get_session(id),
            None => Err(Error::msg("no session store is configured")),
        }
    }

    pub fn set_session(&self, id: &str, value: Value) -> Result {
        match &self.shared.session {
            Some(session) => session.set_session(id, value),
            None => Err(Error::msg("no session store is configured")),
        }
    }

    /// Borrows a scratch buffer from the buffer pool of the router.
    pub fn acquire_buffer(&self) -> PooledBuffer {
        self.shared.buffers.get()
    }

    /// Builds the path of the named route. See [`Router::url`].
    pub fn url(&self, name: &str, params: &[&dyn fmt::Display]) -> Option<String> {
        self.router.as_ref()?.url(name, params)
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("method", self.request.method())
            .field("uri", self.request.uri())
            .field("params", &self.params)
            .field("status", &self.response.status)
            .finish()
    }
}
