//! A mio event loop driving the accepted connections.
//!
//! The worker threads of the executor poll the connections without a tokio
//! runtime, so readiness comes from this reactor instead: one thread blocks
//! in `mio::Poll` and wakes the tasks whose sockets became ready.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{self as sys, Shutdown};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll, Waker};

use mio::{Events, Token};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::error::{ReactorError, ReactorResult};

mod direction {
    pub const READ: usize = 0;
    pub const WRITE: usize = 1;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Token of the waker stopping the reactor thread.
const WAKE: Token = Token(usize::MAX);

/// Handle to the reactor thread.
///
/// The thread exits once the last handle, including the ones held by the
/// registered streams, is dropped.
#[derive(Clone)]
pub struct Reactor {
    shared: Arc<Shared>,
    _owner: Arc<Owner>,
}

struct Shared {
    registry: mio::Registry,
    token: AtomicUsize,
    sources: Mutex<HashMap<Token, Arc<Source>>>,
    waker: mio::Waker,
    stopped: AtomicBool,
}

/// Stops the reactor thread when dropped.
struct Owner {
    shared: Arc<Shared>,
}

impl Drop for Owner {
    fn drop(&mut self) {
        self.shared.stopped.store(true, Ordering::Release);
        if let Err(err) = self.shared.waker.wake() {
            log::warn!("failed to stop the reactor: {}", err);
        }
    }
}

/// Readiness state of one socket.
struct Source {
    /// Wakers waiting for read and write readiness.
    interest: Mutex<[Option<Waker>; 2]>,
    triggered: [AtomicBool; 2],
    token: Token,
}

impl Reactor {
    /// Starts the reactor thread.
    pub fn new() -> ReactorResult<Self> {
        let poll = mio::Poll::new().map_err(ReactorError::Init)?;
        let shared = Arc::new(Shared {
            token: AtomicUsize::new(0),
            registry: poll.registry().try_clone().map_err(ReactorError::Init)?,
            sources: Mutex::new(HashMap::with_capacity(64)),
            waker: mio::Waker::new(poll.registry(), WAKE).map_err(ReactorError::Init)?,
            stopped: AtomicBool::new(false),
        });

        std::thread::Builder::new()
            .name("ship-reactor".to_owned())
            .spawn({
                let shared = shared.clone();
                move || shared.run(poll)
            })
            .map_err(ReactorError::Init)?;

        Ok(Reactor {
            _owner: Arc::new(Owner {
                shared: shared.clone(),
            }),
            shared,
        })
    }

    /// Switches `sys` to non-blocking mode and watches it for readiness.
    pub fn register(&self, sys: sys::TcpStream) -> ReactorResult<TcpStream> {
        sys.set_nonblocking(true)
            .map_err(ReactorError::Registration)?;
        let mut sys = mio::net::TcpStream::from_std(sys);
        let token = Token(self.shared.token.fetch_add(1, Ordering::Relaxed));

        let source = Arc::new(Source {
            token,
            interest: Default::default(),
            triggered: Default::default(),
        });
        self.shared
            .sources
            .lock()
            .map_err(|_| ReactorError::LockPoisoned)?
            .insert(token, source.clone());

        if let Err(err) = self.shared.registry.register(
            &mut sys,
            token,
            mio::Interest::READABLE | mio::Interest::WRITABLE,
        ) {
            lock(&self.shared.sources).remove(&token);
            return Err(ReactorError::Registration(err));
        }

        Ok(TcpStream {
            sys,
            source,
            reactor: self.clone(),
        })
    }

    /// Reports whether `source` is ready in `direction`, registering the task
    /// waker otherwise.
    fn poll_ready(&self, source: &Source, direction: usize, cx: &Context<'_>) -> Poll<()> {
        if source.triggered[direction].load(Ordering::Acquire) {
            return Poll::Ready(());
        }

        {
            let mut interest = lock(&source.interest);
            match &interest[direction] {
                Some(existing) if existing.will_wake(cx.waker()) => {}
                _ => interest[direction] = Some(cx.waker().clone()),
            }
        }

        // the event may have fired while the waker was being stored
        if source.triggered[direction].load(Ordering::Acquire) {
            return Poll::Ready(());
        }
        Poll::Pending
    }

    fn clear_trigger(&self, source: &Source, direction: usize) {
        source.triggered[direction].store(false, Ordering::Release);
    }
}

impl Shared {
    fn run(&self, mut poll: mio::Poll) {
        let mut events = Events::with_capacity(64);
        let mut wakers = Vec::new();

        while !self.stopped.load(Ordering::Acquire) {
            if let Err(err) = self.poll(&mut poll, &mut events, &mut wakers) {
                log::warn!("failed to poll the reactor: {}", err);
            }
            events.clear();
        }
        log::debug!("reactor stopped");
    }

    fn poll(
        &self,
        poll: &mut mio::Poll,
        events: &mut Events,
        wakers: &mut Vec<Waker>,
    ) -> ReactorResult<()> {
        if let Err(err) = poll.poll(events, None) {
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(ReactorError::Polling(err));
        }

        for event in events.iter() {
            if event.token() == WAKE {
                continue;
            }
            let source = {
                let sources = self
                    .sources
                    .lock()
                    .map_err(|_| ReactorError::LockPoisoned)?;
                match sources.get(&event.token()) {
                    Some(source) => source.clone(),
                    None => continue,
                }
            };

            let mut interest = source
                .interest
                .lock()
                .map_err(|_| ReactorError::LockPoisoned)?;
            if event.is_readable() || event.is_read_closed() || event.is_error() {
                wakers.extend(interest[direction::READ].take());
                source.triggered[direction::READ].store(true, Ordering::Release);
            }
            if event.is_writable() || event.is_write_closed() || event.is_error() {
                wakers.extend(interest[direction::WRITE].take());
                source.triggered[direction::WRITE].store(true, Ordering::Release);
            }
        }

        for waker in wakers.drain(..) {
            waker.wake();
        }
        Ok(())
    }
}

/// A connection registered with the [`Reactor`].
pub struct TcpStream {
    sys: mio::net::TcpStream,
    reactor: Reactor,
    source: Arc<Source>,
}

impl TcpStream {
    /// Runs the non-blocking `f` once the socket is ready in `direction`;
    /// `WouldBlock` resets the readiness and parks the task again.
    fn poll_io<T>(
        &self,
        direction: usize,
        mut f: impl FnMut() -> io::Result<T>,
        cx: &mut Context<'_>,
    ) -> Poll<io::Result<T>> {
        loop {
            if self.reactor.poll_ready(&self.source, direction, cx).is_pending() {
                return Poll::Pending;
            }

            match f() {
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    self.reactor.clear_trigger(&self.source, direction);
                }
                result => return Poll::Ready(result),
            }
        }
    }
}

impl AsyncRead for TcpStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let unfilled = buf.initialize_unfilled();
        match self.poll_io(direction::READ, || (&self.sys).read(unfilled), cx) {
            Poll::Ready(Ok(n)) => {
                buf.advance(n);
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(err)) => Poll::Ready(Err(err)),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncWrite for TcpStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.poll_io(direction::WRITE, || (&self.sys).write(buf), cx)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.poll_io(direction::WRITE, || (&self.sys).flush(), cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(self.sys.shutdown(Shutdown::Write))
    }
}

impl Drop for TcpStream {
    fn drop(&mut self) {
        lock(&self.reactor.shared.sources).remove(&self.source.token);
        let _ = self.reactor.shared.registry.deregister(&mut self.sys);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::task::noop_waker;
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_reactor_creation() {
        assert!(Reactor::new().is_ok());
    }

    /// Tests a request and response exchanged through a registered stream.
    #[test]
    fn test_async_io() {
        let reactor = Reactor::new().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let peer = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).unwrap();
            assert_eq!(&buf, b"ping");
            stream.write_all(b"pong").unwrap();
        });

        crate::executor::Parker::new().block_on(async {
            let mut stream = reactor.register(TcpStream::connect(addr).unwrap()).unwrap();
            stream.write_all(b"ping").await.unwrap();

            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"pong");
        });
        peer.join().unwrap();
    }

    /// Tests that an unready source registers the waker and stays pending.
    #[test]
    fn test_poll_ready_pending() {
        let reactor = Reactor::new().unwrap();
        let waker = noop_waker();
        let cx = Context::from_waker(&waker);
        let source = Source {
            token: Token(0),
            interest: Default::default(),
            triggered: Default::default(),
        };

        assert!(reactor.poll_ready(&source, direction::READ, &cx).is_pending());
        assert!(source.interest.lock().unwrap()[direction::READ].is_some());

        source.triggered[direction::READ].store(true, Ordering::Release);
        assert!(reactor.poll_ready(&source, direction::READ, &cx).is_ready());
    }

    /// Tests that dropping a stream removes its source.
    #[test]
    fn test_source_cleanup() {
        let reactor = Reactor::new().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        {
            let _registered = reactor.register(TcpStream::connect(addr).unwrap()).unwrap();
            assert_eq!(reactor.shared.sources.lock().unwrap().len(), 1);
        }
        assert!(reactor.shared.sources.lock().unwrap().is_empty());
    }

    /// Tests that the reactor thread exits with the last handle.
    #[test]
    fn test_reactor_stops() {
        let reactor = Reactor::new().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let stream = reactor
            .register(TcpStream::connect(listener.local_addr().unwrap()).unwrap())
            .unwrap();
        let shared = Arc::downgrade(&reactor.shared);

        drop(reactor);
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(shared.upgrade().is_some());

        drop(stream);
        for _ in 0..100 {
            if shared.upgrade().is_none() {
                return;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        panic!("the reactor thread is still running");
    }

    /// Tests that a registered stream never blocks.
    #[test]
    fn test_nonblocking() {
        let reactor = Reactor::new().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let stream = reactor.register(TcpStream::connect(addr).unwrap()).unwrap();
        let mut buf = [0; 10];
        let err = (&stream.sys).read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::WouldBlock);
    }
}
