use std::collections::HashMap;
use std::fmt;
use std::net::{SocketAddr, TcpListener, ToSocketAddrs};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use hyper::header::{self, HeaderValue};
use hyper::{Method, StatusCode};

use crate::binder::{Binder, JsonBinder};
use crate::config::Config;
use crate::context::{Context, Shared};
use crate::error::{Error, Result, RouteError, ServerError};
use crate::handler::{handler, ErrorHandler, Handler, Middleware};
use crate::http::{Request, Response};
use crate::lifecycle::{self, Lifecycle};
use crate::logger::{LogLogger, Logger};
use crate::middleware::compose;
use crate::pool::{BufferPool, ContextPool, PooledBuffer, PooledContext};
use crate::render::{default_renderer, Renderer};
use crate::route::{Group, Route};
use crate::router::{RouteInfo, Router};
use crate::server::{ConnectionInfo, Server};
use crate::session::{MemorySession, Session};

/// The router and dispatcher of an application.
///
/// Routes and middlewares are registered through `&mut Ship`; the finished
/// router is then shared as `Arc<Ship>` to serve requests, either through
/// [`Ship::handle`] or by starting the built-in server with
/// [`Ship::start`].
///
/// ```
/// use ship::{Body, Ship, StatusCode};
///
/// let mut ship = Ship::new();
/// ship.route("/hello/:name")
///     .get(|ctx| {
///         let greeting = format!("Hello, {}!", ctx.param("name").unwrap_or("world"));
///         ctx.text(StatusCode::OK, greeting)
///     })
///     .unwrap();
///
/// let request = ship::hyper::Request::get("/hello/ship").body(Body::empty()).unwrap();
/// let response = ship.handle(request);
/// assert_eq!(response.status(), StatusCode::OK);
/// ```
pub struct Ship {
    config: Config,
    shared: Arc<Shared>,
    router: Arc<Router>,
    pool: ContextPool,
    handler: Handler,
    pre_middlewares: Vec<Middleware>,
    middlewares: Vec<Middleware>,
    error_handler: ErrorHandler,
    /// `None` for a virtual host.
    vhosts: Option<HashMap<String, Ship>>,
    lifecycle: Arc<Lifecycle>,
    max_params: usize,
}

impl Default for Ship {
    fn default() -> Self {
        Self::new()
    }
}

impl Ship {
    /// Creates a router with the default configuration.
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    /// Creates a router from the configuration file and environment; see
    /// [`Config::new`].
    pub fn from_env() -> std::result::Result<Self, config::ConfigError> {
        Config::new().map(Self::with_config)
    }

    /// Creates a router with the logger, renderer, binder and session store
    /// of the framework installed.
    pub fn with_config(config: Config) -> Self {
        let config = config.normalize();

        let mut shared = Shared::new(config.debug, config.buffer_size, config.context_store_size);
        shared.logger = Some(Arc::new(LogLogger));
        shared.renderer = Some(Arc::new(default_renderer()));
        shared.binder = Some(Arc::new(JsonBinder));
        shared.session = Some(Arc::new(MemorySession::new()));

        Ship {
            router: Arc::new(Router::new(&config)),
            shared: Arc::new(shared),
            pool: ContextPool::new(),
            handler: handler(route_request),
            pre_middlewares: Vec::new(),
            middlewares: Vec::new(),
            error_handler: default_error_handler(),
            vhosts: Some(HashMap::new()),
            lifecycle: Lifecycle::new(config.shutdown_timeout()),
            max_params: 0,
            config,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Replaces the configuration.
    ///
    /// The route table is rebuilt empty for the new prefix and limits, so
    /// routes must be registered again. Must not be called while serving.
    pub fn reset_config(&mut self, config: Config) -> &mut Self {
        let config = config.normalize();

        let shared = Arc::make_mut(&mut self.shared);
        shared.debug = config.debug;
        shared.store_size = config.context_store_size;
        if shared.buffers.size() != config.buffer_size {
            shared.buffers = Arc::new(BufferPool::new(config.buffer_size));
        }

        self.router = Arc::new(Router::new(&config));
        self.max_params = 0;
        self.lifecycle.set_grace(config.shutdown_timeout());
        self.config = config;
        self
    }

    pub fn logger(&self) -> Option<&dyn Logger> {
        self.shared.logger.as_deref()
    }

    /// Sets the logger; `None` silences the router.
    pub fn set_logger(&mut self, logger: Option<Arc<dyn Logger>>) -> &mut Self {
        Arc::make_mut(&mut self.shared).logger = logger;
        self
    }

    pub fn set_renderer(&mut self, renderer: Option<Arc<dyn Renderer>>) -> &mut Self {
        Arc::make_mut(&mut self.shared).renderer = renderer;
        self
    }

    pub fn set_binder(&mut self, binder: Option<Arc<dyn Binder>>) -> &mut Self {
        Arc::make_mut(&mut self.shared).binder = binder;
        self
    }

    pub fn set_session(&mut self, session: Option<Arc<dyn Session>>) -> &mut Self {
        Arc::make_mut(&mut self.shared).session = session;
        self
    }

    /// Sets the handler for requests matching no route.
    pub fn set_not_found(&mut self, handler: Handler) -> &mut Self {
        Arc::make_mut(&mut self.shared).not_found = handler;
        self
    }

    /// Sets the handler for paths registered only under other methods.
    pub fn set_method_not_allowed(&mut self, handler: Handler) -> &mut Self {
        Arc::make_mut(&mut self.shared).method_not_allowed = handler;
        self
    }

    /// Sets the handler for OPTIONS requests on paths without an OPTIONS
    /// route.
    pub fn set_options(&mut self, handler: Handler) -> &mut Self {
        Arc::make_mut(&mut self.shared).options = handler;
        self
    }

    pub fn set_error_handler(&mut self, handler: ErrorHandler) -> &mut Self {
        self.error_handler = handler;
        self
    }

    pub(crate) fn check_middlewares(&self, count: usize) -> Result<(), RouteError> {
        if count > self.config.max_middlewares {
            return Err(RouteError::TooManyMiddlewares {
                count,
                max: self.config.max_middlewares,
            });
        }
        Ok(())
    }

    /// Appends middlewares run before the route lookup, for every request.
    pub fn pre<I>(&mut self, middlewares: I) -> Result<&mut Self, RouteError>
    where
        I: IntoIterator<Item = Middleware>,
    {
        let middlewares: Vec<_> = middlewares.into_iter().collect();
        self.check_middlewares(self.pre_middlewares.len() + middlewares.len())?;
        self.pre_middlewares.extend(middlewares);
        self.handler = compose(handler(route_request), &self.pre_middlewares);
        Ok(self)
    }

    /// Appends middlewares wrapping the routes registered afterwards.
    pub fn use_middleware<I>(&mut self, middlewares: I) -> Result<&mut Self, RouteError>
    where
        I: IntoIterator<Item = Middleware>,
    {
        let middlewares: Vec<_> = middlewares.into_iter().collect();
        self.check_middlewares(self.middlewares.len() + middlewares.len())?;
        self.middlewares.extend(middlewares);
        Ok(self)
    }

    /// Starts the registration of the routes of `path`.
    pub fn route(&mut self, path: &str) -> Route<'_> {
        let middlewares = self.middlewares.clone();
        Route::new(self, path.to_owned(), middlewares)
    }

    pub fn route_without_middleware(&mut self, path: &str) -> Route<'_> {
        Route::new(self, path.to_owned(), Vec::new())
    }

    /// Creates a group of routes under `prefix`, inheriting the middlewares.
    pub fn group(&mut self, prefix: &str) -> Group<'_> {
        let middlewares = self.middlewares.clone();
        Group::new(self, prefix.to_owned(), middlewares)
    }

    pub fn group_without_middleware(&mut self, prefix: &str) -> Group<'_> {
        Group::new(self, prefix.to_owned(), Vec::new())
    }

    /// Registers `handler` wrapped by `middlewares` under the configured
    /// prefix.
    pub fn add_route(
        &mut self,
        name: &str,
        method: &Method,
        path: &str,
        handler: Handler,
        middlewares: &[Middleware],
    ) -> Result<(), RouteError> {
        self.check_middlewares(middlewares.len())?;

        let path = format!("{}{}", self.config.prefix, path);
        let handler = compose(handler, middlewares);
        let params = Arc::make_mut(&mut self.router).add(name, method.as_str(), &path, handler)?;
        self.max_params = self.max_params.max(params);
        Ok(())
    }

    pub fn routes(&self) -> &[RouteInfo] {
        self.router.routes()
    }

    /// Visits the routes as `(name, method, path)`, in registration order.
    pub fn traverse<F>(&self, visit: F)
    where
        F: FnMut(&str, &str, &str),
    {
        self.router.each(visit)
    }

    /// Builds the path of the route named `name`.
    pub fn url(&self, name: &str, params: &[&dyn fmt::Display]) -> Option<String> {
        self.router.url(name, params)
    }

    /// Returns the virtual host serving requests whose `Host` is `host`,
    /// creating it with the configuration of this router.
    pub fn vhost(&mut self, host: &str) -> Result<&mut Ship, RouteError> {
        let config = self.config.clone();
        let vhosts = self.vhosts.as_mut().ok_or(RouteError::NestedVirtualHost)?;
        if vhosts.contains_key(host) {
            return Err(RouteError::DuplicateVirtualHost(host.to_owned()));
        }

        let mut vhost = Ship::with_config(config);
        vhost.vhosts = None;
        Ok(vhosts.entry(host.to_owned()).or_insert(vhost))
    }

    /// Returns the existing virtual host for `host`.
    pub fn get_vhost(&mut self, host: &str) -> Option<&mut Ship> {
        self.vhosts.as_mut()?.get_mut(host)
    }

    pub fn is_vhost(&self) -> bool {
        self.vhosts.is_none()
    }

    /// Links the shutdown of this router and `other` in both directions.
    pub fn link(&self, other: &Ship) -> &Self {
        Lifecycle::link(&self.lifecycle, &other.lifecycle);
        self
    }

    /// Creates a router named `name` with the configuration of this one,
    /// without signal handling, that shuts down when this one does.
    pub fn fork(&self, name: &str) -> Ship {
        let mut config = self.config.clone();
        config.name = name.to_owned();
        config.signals.clear();
        let fork = Ship::with_config(config);

        let child = Arc::downgrade(&fork.lifecycle);
        self.lifecycle.register(move || {
            if let Some(child) = child.upgrade() {
                child.trigger_shutdown();
            }
        });
        fork
    }

    /// Serves one request.
    pub fn handle(&self, request: Request) -> Response {
        self.handle_with(request, None)
    }

    /// Serves one request that arrived on the connection `info`.
    pub fn handle_with(&self, request: Request, info: Option<ConnectionInfo>) -> Response {
        if let Some(vhost) = self.select_vhost(&request) {
            return vhost.dispatch(request, info);
        }
        self.dispatch(request, info)
    }

    fn select_vhost(&self, request: &Request) -> Option<&Ship> {
        let vhosts = self.vhosts.as_ref().filter(|vhosts| !vhosts.is_empty())?;
        let host = request
            .headers()
            .get(header::HOST)
            .and_then(|host| host.to_str().ok())
            .or_else(|| request.uri().authority().map(|authority| authority.as_str()))?;
        vhosts.get(host)
    }

    fn dispatch(&self, request: Request, info: Option<ConnectionInfo>) -> Response {
        let mut ctx = self.acquire(request, info);
        let result = (self.handler)(&mut ctx);
        let error = match result {
            Ok(()) => ctx.error.take(),
            Err(err) => Some(err),
        };
        if let Some(err) = error {
            (self.error_handler)(&mut ctx, err);
        }
        ctx.response.take()
    }

    fn acquire(&self, request: Request, info: Option<ConnectionInfo>) -> PooledContext<'_> {
        let mut ctx = self.pool.acquire(&self.shared, request, info, self.max_params);
        ctx.router = Some(self.router.clone());
        ctx
    }

    /// Takes a pooled context bound to `request`, for running handlers
    /// outside the dispatcher.
    pub fn acquire_context(&self, request: Request) -> PooledContext<'_> {
        self.acquire(request, None)
    }

    /// Creates a context that is not pooled.
    pub fn new_context(&self) -> Context {
        let mut ctx = Context::new(self.shared.clone());
        ctx.router = Some(self.router.clone());
        ctx.params.reserve(self.max_params);
        ctx
    }

    pub fn acquire_buffer(&self) -> PooledBuffer {
        self.shared.buffers.get()
    }

    pub fn lifecycle(&self) -> &Arc<Lifecycle> {
        &self.lifecycle
    }

    /// Registers a callback run once the router has shut down.
    pub fn register_on_shutdown<F>(&self, callback: F) -> &Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.lifecycle.register(callback);
        self
    }

    /// Starts the shutdown without waiting for it.
    pub fn trigger_shutdown(&self) {
        self.lifecycle.trigger_shutdown();
    }

    /// Stops the server, giving the open connections `deadline` to finish,
    /// and waits for the shutdown callbacks.
    pub fn shutdown(&self, deadline: Duration) -> Result<(), ServerError> {
        self.lifecycle.shutdown(deadline)
    }

    /// Blocks until the router has shut down.
    pub fn wait(&self) {
        self.lifecycle.wait();
    }

    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.lifecycle.wait_timeout(timeout)
    }

    /// Binds `addr` and serves on a background thread, returning the bound
    /// address.
    pub fn start(self: &Arc<Self>, addr: impl ToSocketAddrs) -> Result<SocketAddr, ServerError> {
        if self.is_vhost() {
            return Err(ServerError::VirtualHost);
        }
        let listener = TcpListener::bind(addr)?;
        self.start_with_listener(listener)
    }

    /// Serves on `listener` on a background thread.
    pub fn start_with_listener(
        self: &Arc<Self>,
        listener: TcpListener,
    ) -> Result<SocketAddr, ServerError> {
        if self.is_vhost() {
            return Err(ServerError::VirtualHost);
        }

        let mut server = Server::from_listener(listener, &self.config)?;
        if let Some(logger) = self.logger() {
            server = server.with_error_log(logger.writer());
        }
        let addr = server.local_addr()?;
        self.lifecycle.bind_listener(server.handle())?;

        let ship = self.clone();
        let spawned = thread::Builder::new()
            .name("ship-server".to_owned())
            .spawn(move || ship.run(server, addr));
        if let Err(err) = spawned {
            self.lifecycle.unbind_listener();
            return Err(err.into());
        }

        if let Some(logger) = self.logger() {
            logger.info(format_args!(
                "The HTTP Server [{}] is running on {}",
                self.config.name, addr
            ));
        }
        Ok(addr)
    }

    fn run(self: Arc<Self>, server: Server, addr: SocketAddr) {
        let result = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(ServerError::Io)
            .and_then(|runtime| {
                let signals = self.config.signals.clone();
                let weak = Arc::downgrade(&self.lifecycle);
                let ship = self.clone();
                runtime.block_on(async move {
                    if !signals.is_empty() {
                        tokio::spawn(lifecycle::watch_signals(signals, weak));
                    }
                    server
                        .serve(move |request: Request, info: ConnectionInfo| {
                            ship.handle_with(request, Some(info))
                        })
                        .await
                })
            });

        if let Some(logger) = self.logger() {
            match &result {
                Ok(()) => logger.info(format_args!(
                    "The HTTP Server [{}] listening on {} is shutdown",
                    self.config.name, addr
                )),
                Err(err) => logger.error(format_args!(
                    "The HTTP Server [{}] listening on {} failed: {}",
                    self.config.name, addr, err
                )),
            }
        }

        self.lifecycle.unbind_listener();
        self.lifecycle.finish();
    }
}

/// Resolves the route of the request and runs it, or one of the fallback
/// handlers.
fn route_request(ctx: &mut Context) -> Result {
    let router = match ctx.router.clone() {
        Some(router) => router,
        None => return (ctx.shared.not_found.clone())(ctx),
    };

    let method = ctx.request.method().as_str();
    let path = ctx.request.uri().path();
    if let Some(handler) = router.find(method, path, &mut ctx.params) {
        return handler(ctx);
    }

    let allowed = router.allowed_methods(path).join(", ");
    if allowed.is_empty() {
        return (ctx.shared.not_found.clone())(ctx);
    }

    let fallback = if *ctx.request.method() == Method::OPTIONS {
        ctx.shared.options.clone()
    } else {
        ctx.shared.method_not_allowed.clone()
    };
    let allowed = HeaderValue::from_str(&allowed).map_err(Error::other)?;
    ctx.response.headers_mut().insert(header::ALLOW, allowed);
    fallback(ctx)
}

/// The error handler installed by default.
///
/// An [`HttpError`](crate::HttpError) sends its status with its message,
/// except that server errors hide the message unless in debug mode and are
/// logged. [`Error::Skip`] sends nothing. Any other error is logged and sends
/// a "500 Internal Server Error".
pub fn default_error_handler() -> ErrorHandler {
    Arc::new(handle_error)
}

fn handle_error(ctx: &mut Context, err: Error) {
    if err.is_skip() {
        return;
    }
    if ctx.response().is_committed() {
        if let Some(logger) = ctx.logger() {
            logger.error(format_args!(
                "{} {}: error after the response was written: {}",
                ctx.method(),
                ctx.path(),
                err
            ));
        }
        return;
    }

    let result = match err {
        Error::Http(err) => {
            let code = err.code();
            if code.is_server_error() {
                if let Some(logger) = ctx.logger() {
                    logger.error(format_args!("{} {}: {}", ctx.method(), ctx.path(), err));
                }
            }

            let body = if !code.is_server_error() {
                err.message().to_owned()
            } else if ctx.is_debug() {
                err.to_string()
            } else {
                code.canonical_reason().unwrap_or_default().to_owned()
            };
            ctx.blob(code, err.content_type(), body)
        }
        err => {
            if let Some(logger) = ctx.logger() {
                logger.error(format_args!("{} {}: {}", ctx.method(), ctx.path(), err));
            }
            let body = if ctx.is_debug() {
                err.to_string()
            } else {
                "Internal Server Error".to_owned()
            };
            ctx.text(StatusCode::INTERNAL_SERVER_ERROR, body)
        }
    };

    if let Err(err) = result {
        if let Some(logger) = ctx.logger() {
            logger.error(format_args!("failed to send the error response: {}", err));
        }
        ctx.response_mut().write_header(StatusCode::INTERNAL_SERVER_ERROR);
    }
}
