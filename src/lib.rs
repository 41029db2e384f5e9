#![allow(clippy::return_self_not_must_use)]
#![doc = include_str!("../README.md")]

pub use crate::binder::{Binder, JsonBinder};
pub use crate::config::{Config, Signal};
pub use crate::context::{
    Context, ResponseWriter, Shared, MIME_APPLICATION_JSON, MIME_TEXT_HTML, MIME_TEXT_PLAIN,
};
pub use crate::error::{
    Error, ExecutorError, HttpError, ReactorError, Result, RouteError, ServerError,
};
pub use crate::handler::{
    handler, method_not_allowed_handler, middleware, not_found_handler, nothing_handler,
    ok_handler, options_handler, ErrorHandler, Handler, Middleware,
};
pub use crate::http::{Body, BodyReader, Bytes, Request, Response, ResponseBuilder};
pub use crate::lifecycle::Lifecycle;
pub use crate::logger::{LogLogger, Logger};
pub use crate::pool::{BufferPool, ContextPool, PooledBuffer, PooledContext};
pub use crate::render::{default_renderer, JsonRenderer, MuxRenderer, Renderer};
pub use crate::route::{Group, Route};
pub use crate::router::{Params, RouteInfo, Router};
pub use crate::server::{ConnectionInfo, Handle, Server, Service};
pub use crate::session::{MemorySession, Session};
pub use crate::ship::{default_error_handler, Ship};

mod binder;
mod config;
mod context;
mod error;
mod executor;
mod handler;
mod http;
mod lifecycle;
mod logger;
pub mod middleware;
mod net;
mod pool;
mod render;
mod route;
mod router;
mod server;
mod session;
mod ship;

// Re-export common types
pub use hyper;
pub use hyper::{Method, StatusCode};
