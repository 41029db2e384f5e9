//! The HTTP server driving a [`Service`].
//!
//! Connections are accepted on the tokio runtime of the caller, registered
//! with the crate's own [`Reactor`] and served by hyper on the worker threads
//! of the [`Executor`]. Service calls are synchronous and may block their
//! worker thread.

use std::cmp;
use std::io::{self, Write};
use std::net::{SocketAddr, TcpListener as StdTcpListener, ToSocketAddrs};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::channel::oneshot;
use futures::future::BoxFuture;
use futures::FutureExt;
use hyper::rt::Executor as _;
use hyper::server::conn::Http;
use hyper::StatusCode;
use tokio::sync::{watch, Notify};

use crate::config::Config;
use crate::error::ServerError;
use crate::executor::Executor;
use crate::http::{Body, Request, Response};
use crate::net::Reactor;

/// Information about the connection a request arrived on.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectionInfo {
    peer_addr: Option<SocketAddr>,
}

impl ConnectionInfo {
    pub fn new(peer_addr: Option<SocketAddr>) -> Self {
        ConnectionInfo { peer_addr }
    }

    /// Returns the address of the client.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }
}

/// A synchronous request handler.
///
/// Any `Fn(Request, ConnectionInfo) -> Response` closure is a service.
pub trait Service: Send + Sync + 'static {
    fn call(&self, request: Request, info: ConnectionInfo) -> Response;
}

impl<F> Service for F
where
    F: Fn(Request, ConnectionInfo) -> Response + Send + Sync + 'static,
{
    fn call(&self, request: Request, info: ConnectionInfo) -> Response {
        self(request, info)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    Running,
    Shutdown(Duration),
}

/// Asks a running [`Server`] to stop.
#[derive(Clone)]
pub struct Handle {
    control: Arc<watch::Sender<Control>>,
}

impl Handle {
    /// Stops accepting connections and lets the open ones finish their
    /// in-flight requests within `grace`; the ones left are then closed.
    pub fn shutdown(&self, grace: Duration) {
        self.control.send_replace(Control::Shutdown(grace));
    }
}

/// State of the served connections, ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum ConnState {
    Serving,
    Draining,
    Closed,
}

/// Counts the open connections.
#[derive(Clone, Default)]
struct ConnectionTracker {
    inner: Arc<TrackerInner>,
}

#[derive(Default)]
struct TrackerInner {
    active: AtomicUsize,
    idle: Notify,
}

impl ConnectionTracker {
    fn track(&self) -> ConnectionGuard {
        self.inner.active.fetch_add(1, Ordering::SeqCst);
        ConnectionGuard {
            inner: self.inner.clone(),
        }
    }

    fn active(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Resolves once no connection is open.
    async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.active() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Keeps a connection counted until dropped.
struct ConnectionGuard {
    inner: Arc<TrackerInner>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if self.inner.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.idle.notify_waiters();
        }
    }
}

type ErrorLog = Arc<Mutex<Box<dyn Write + Send>>>;

fn log_error(error_log: &Option<ErrorLog>, args: std::fmt::Arguments<'_>) {
    match error_log {
        Some(writer) => {
            let mut writer = writer.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            let _ = writer.write_fmt(args).and_then(|()| writer.write_all(b"\n"));
        }
        None => log::debug!("{}", args),
    }
}

/// An HTTP server.
///
/// ```no_run
/// use ship::{Body, Config, ConnectionInfo, Request, Response, Server};
///
/// #[tokio::main]
/// async fn main() -> Result<(), ship::ServerError> {
///     Server::bind("127.0.0.1:3000", &Config::default())?
///         .serve(|_req: Request, _info: ConnectionInfo| Response::new(Body::new("Hello World!")))
///         .await
/// }
/// ```
pub struct Server {
    listener: StdTcpListener,
    config: Config,
    control: Arc<watch::Sender<Control>>,
    error_log: Option<ErrorLog>,
}

impl Server {
    /// Binds a listener to `addr`.
    pub fn bind(addr: impl ToSocketAddrs, config: &Config) -> Result<Self, ServerError> {
        let listener = StdTcpListener::bind(addr)?;
        Self::from_listener(listener, config)
    }

    /// Serves on an already bound listener.
    pub fn from_listener(listener: StdTcpListener, config: &Config) -> Result<Self, ServerError> {
        listener.set_nonblocking(true)?;
        let (control, _) = watch::channel(Control::Running);
        Ok(Server {
            listener,
            config: config.clone(),
            control: Arc::new(control),
            error_log: None,
        })
    }

    /// Sends the connection errors to `writer` instead of the `log` facade.
    pub fn with_error_log(mut self, writer: Box<dyn Write + Send>) -> Self {
        self.error_log = Some(Arc::new(Mutex::new(writer)));
        self
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn handle(&self) -> Handle {
        Handle {
            control: self.control.clone(),
        }
    }

    fn http(&self, executor: Executor) -> Http<Executor> {
        let mut http = Http::new().with_executor(executor);
        http.http1_keep_alive(self.config.http1_keep_alive)
            .http1_half_close(self.config.http1_half_close)
            .max_buf_size(cmp::max(8192, self.config.http1_max_buf_size))
            .http1_only(self.config.http1_only);
        #[cfg(feature = "http2")]
        http.http2_only(self.config.http2_only);
        http
    }

    /// Serves `service` until a shutdown is requested through a [`Handle`],
    /// then drains the open connections.
    ///
    /// Must be polled on a tokio runtime with the IO and time drivers
    /// enabled.
    pub async fn serve<S: Service>(self, service: S) -> Result<(), ServerError> {
        let executor = Executor::new(
            Some(self.config.max_workers),
            Some(self.config.worker_keep_alive()),
        );
        // Services block their thread, so they get their own workers and
        // never wait behind the connections they answer.
        let calls = Executor::new(
            Some(self.config.max_workers),
            Some(self.config.worker_keep_alive()),
        );
        let reactor = Reactor::new()?;
        let http = self.http(executor.clone());
        let service = Arc::new(service);
        let tracker = ConnectionTracker::default();
        let (state_tx, state_rx) = watch::channel(ConnState::Serving);
        let mut control = self.control.subscribe();
        let error_log = self.error_log;
        let listener = tokio::net::TcpListener::from_std(self.listener)?;

        let grace = loop {
            if let Control::Shutdown(grace) = *control.borrow_and_update() {
                break grace;
            }

            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(err) => {
                            log::warn!("failed to accept a connection: {}", err);
                            continue;
                        }
                    };
                    let stream = match stream.into_std().and_then(|stream| {
                        reactor.register(stream).map_err(|err| io::Error::new(io::ErrorKind::Other, err))
                    }) {
                        Ok(stream) => stream,
                        Err(err) => {
                            log::warn!("failed to register the connection from {}: {}", peer, err);
                            continue;
                        }
                    };

                    let guard = tracker.track();
                    let conn = http.serve_connection(stream, HyperService {
                        service: service.clone(),
                        info: ConnectionInfo::new(Some(peer)),
                        calls: calls.clone(),
                    });
                    let mut state = state_rx.clone();
                    let error_log = error_log.clone();

                    executor.execute(async move {
                        let _guard = guard;
                        tokio::pin!(conn);
                        let mut draining = false;
                        loop {
                            tokio::select! {
                                biased;
                                result = conn.as_mut() => {
                                    if let Err(err) = result {
                                        log_error(&error_log, format_args!("connection {} failed: {}", peer, err));
                                    }
                                    break;
                                }
                                changed = state.changed() => {
                                    let next = match changed {
                                        Ok(()) => *state.borrow(),
                                        Err(_) => ConnState::Closed,
                                    };
                                    match next {
                                        ConnState::Serving => {}
                                        ConnState::Draining if !draining => {
                                            draining = true;
                                            conn.as_mut().graceful_shutdown();
                                        }
                                        ConnState::Draining => {}
                                        ConnState::Closed => {
                                            log::debug!("force closing the connection from {}", peer);
                                            break;
                                        }
                                    }
                                }
                            }
                        }
                    });
                }
                changed = control.changed() => {
                    if changed.is_err() {
                        break self.config.shutdown_timeout();
                    }
                }
            }
        };

        drop(listener);
        state_tx.send_replace(ConnState::Draining);
        if tokio::time::timeout(grace, tracker.wait_idle()).await.is_err() {
            log::warn!(
                "{} connections still open after {:?}, closing them",
                tracker.active(),
                grace
            );
            state_tx.send_replace(ConnState::Closed);
        }
        log::debug!(
            "server stopped, {} connection and {} service workers left",
            executor.workers(),
            calls.workers()
        );
        Ok(())
    }
}

/// Adapts a [`Service`] to hyper.
///
/// Each call runs on a worker of `calls` while the connection task keeps
/// reading the request body the service may be waiting for.
struct HyperService<S> {
    service: Arc<S>,
    info: ConnectionInfo,
    calls: Executor,
}

impl<S: Service> hyper::service::Service<hyper::Request<hyper::Body>> for HyperService<S> {
    type Response = Response;
    type Error = std::convert::Infallible;
    type Future = BoxFuture<'static, Result<Response, Self::Error>>;

    fn poll_ready(&mut self, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: hyper::Request<hyper::Body>) -> Self::Future {
        let (tx, rx) = oneshot::channel();
        let service = self.service.clone();
        let info = self.info;
        self.calls.execute(async move {
            let _ = tx.send(service.call(request.map(Body), info));
        });

        // The sender is dropped without a response when the service panics.
        rx.map(|response| {
            Ok(response.unwrap_or_else(|_| {
                let mut response = Response::new(Body::empty());
                *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                response
            }))
        })
        .boxed()
    }
}
