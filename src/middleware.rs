//! Middleware composition and the stock middlewares.

use std::any::Any;
use std::io::Write;
use std::panic::{self, AssertUnwindSafe};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use flate2::write::GzEncoder;
use flate2::Compression;
use hyper::header::{self, HeaderValue};
use thiserror::Error;

use crate::context::Context;
use crate::error::HttpError;
use crate::handler::{handler, Handler, Middleware};

/// Wraps `terminal` with `middlewares` so that the first one runs first on
/// the way in and last on the way out.
pub fn compose(terminal: Handler, middlewares: &[Middleware]) -> Handler {
    middlewares
        .iter()
        .rev()
        .fold(terminal, |next, middleware| middleware(next))
}

/// Logs every request once its handler returns, through the logger of the
/// context.
pub fn logger() -> Middleware {
    crate::handler::middleware(|next: Handler| {
        handler(move |ctx: &mut Context| {
            let started = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default();
            let start = Instant::now();
            let result = next(ctx);
            let cost = start.elapsed();

            if let Some(logger) = ctx.logger() {
                let uri = ctx.request().uri();
                let target = uri.path_and_query().map_or_else(|| uri.path(), |pq| pq.as_str());
                let err = match &result {
                    Ok(()) => "none".to_owned(),
                    Err(err) => err.to_string(),
                };
                logger.info(format_args!(
                    "method={}, url={}, starttime={}, cost={:?}, err={}",
                    ctx.method(),
                    target,
                    started,
                    cost,
                    err
                ));
            }
            result
        })
    })
}

/// The fault caught by [`recover`].
#[derive(Debug, Error)]
#[error("panic: {0}")]
pub struct Panic(pub String);

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_owned()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_owned()
    }
}

/// Converts a panic of the inner handlers into a "500 Internal Server Error"
/// handled, and logged, like any other error.
///
/// Install it as the first pre-middleware so that it covers the whole chain.
pub fn recover() -> Middleware {
    crate::handler::middleware(|next: Handler| {
        handler(move |ctx: &mut Context| {
            match panic::catch_unwind(AssertUnwindSafe(|| next(ctx))) {
                Ok(result) => result,
                Err(payload) => {
                    let fault = Panic(panic_message(payload.as_ref()));
                    Err(HttpError::internal().with_cause(fault).into())
                }
            }
        })
    })
}

fn accepts_gzip(ctx: &Context) -> bool {
    ctx.header(header::ACCEPT_ENCODING).map_or(false, |accepted| {
        accepted.split(',').any(|coding| {
            let coding = coding.split(';').next().unwrap_or_default().trim();
            coding.eq_ignore_ascii_case("gzip")
        })
    })
}

/// Compresses the response body with gzip at the default level when the
/// client accepts it.
pub fn gzip() -> Middleware {
    gzip_with(Compression::default())
}

/// Compresses the response body with gzip at `level` when the client
/// accepts it.
///
/// Empty bodies and bodies that already have a `Content-Encoding` are sent
/// as is. Nothing is compressed when the inner handlers fail, since the
/// error handler writes that response after the chain returns.
pub fn gzip_with(level: Compression) -> Middleware {
    crate::handler::middleware(move |next: Handler| {
        handler(move |ctx: &mut Context| {
            if !accepts_gzip(ctx) {
                return next(ctx);
            }
            next(ctx)?;

            let response = ctx.response();
            if response.body().is_empty() || response.headers().contains_key(header::CONTENT_ENCODING) {
                return Ok(());
            }

            let mut buf = ctx.acquire_buffer();
            let mut encoder = GzEncoder::new(&mut *buf, level);
            encoder.write_all(ctx.response().body())?;
            encoder.finish()?;

            let response = ctx.response_mut();
            response.replace_body(&buf[..]);
            let headers = response.headers_mut();
            headers.remove(header::CONTENT_LENGTH);
            headers.insert(header::CONTENT_ENCODING, HeaderValue::from_static("gzip"));
            headers.append(header::VARY, HeaderValue::from_static("Accept-Encoding"));
            Ok(())
        })
    })
}
