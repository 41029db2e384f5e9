use std::sync::Arc;

use hyper::StatusCode;

use crate::context::Context;
use crate::error::{Error, Result};

/// A handler of the HTTP request.
///
/// Handlers write the response through the [`Context`] and return an error
/// to let the error handler of the [`Ship`](crate::Ship) produce it instead.
pub type Handler = Arc<dyn Fn(&mut Context) -> Result + Send + Sync>;

/// A middleware wraps a handler into another handler.
pub type Middleware = Arc<dyn Fn(Handler) -> Handler + Send + Sync>;

/// Turns the error left by the pipeline into the final response.
pub type ErrorHandler = Arc<dyn Fn(&mut Context, Error) + Send + Sync>;

/// Boxes a closure into a [`Handler`].
pub fn handler<F>(f: F) -> Handler
where
    F: Fn(&mut Context) -> Result + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Boxes a closure into a [`Middleware`].
pub fn middleware<F>(f: F) -> Middleware
where
    F: Fn(Handler) -> Handler + Send + Sync + 'static,
{
    Arc::new(f)
}

/// A handler doing nothing.
pub fn nothing_handler() -> Handler {
    handler(|_| Ok(()))
}

/// A handler only sending "200 OK".
pub fn ok_handler() -> Handler {
    handler(|ctx| ctx.text(StatusCode::OK, "OK"))
}

/// The default handler for requests without a matching route.
pub fn not_found_handler() -> Handler {
    handler(|ctx| ctx.text(StatusCode::NOT_FOUND, "Not Found"))
}

/// The default handler for paths registered under other methods only.
pub fn method_not_allowed_handler() -> Handler {
    handler(|ctx| ctx.no_content(StatusCode::METHOD_NOT_ALLOWED))
}

/// The default handler for OPTIONS requests on paths registered under other
/// methods.
pub fn options_handler() -> Handler {
    handler(|ctx| ctx.no_content(StatusCode::OK))
}
