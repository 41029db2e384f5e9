//! Shutdown coordination.
//!
//! Every [`Ship`](crate::Ship) owns one [`Lifecycle`]. It holds the shutdown
//! callbacks, the handle of the listener once the server is started, and the
//! lifecycles of the linked routers. Triggering it asks the listener to drain;
//! when the listener stops, the callbacks run once in reverse registration
//! order and the waiters are released.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use crate::config::Signal;
use crate::error::ServerError;
use crate::server::Handle;

/// Extra time granted to the server after the drain deadline to close the
/// connections it forced.
const FORCE_CLOSE_SLACK: Duration = Duration::from_secs(1);

type Callback = Box<dyn FnOnce() + Send>;

struct State {
    callbacks: Vec<Callback>,
    links: Vec<Weak<Lifecycle>>,
    listener: Option<Handle>,
    grace: Duration,
}

/// The shutdown coordinator of a router.
pub struct Lifecycle {
    state: Mutex<State>,
    triggered: AtomicBool,
    finished: AtomicBool,
    done: Mutex<bool>,
    done_signal: Condvar,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Lifecycle {
    /// Creates a coordinator whose listener gets `grace` to drain when the
    /// shutdown is triggered.
    pub fn new(grace: Duration) -> Arc<Self> {
        Arc::new(Lifecycle {
            state: Mutex::new(State {
                callbacks: Vec::new(),
                links: Vec::new(),
                listener: None,
                grace,
            }),
            triggered: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            done: Mutex::new(false),
            done_signal: Condvar::new(),
        })
    }

    pub(crate) fn set_grace(&self, grace: Duration) {
        lock(&self.state).grace = grace;
    }

    /// Registers a callback to run once the shutdown completes.
    ///
    /// Registered after completion, the callback never runs.
    pub fn register<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        lock(&self.state).callbacks.push(Box::new(callback));
    }

    /// Couples the shutdown of `a` and `b`: triggering either triggers the
    /// other. Linking an already linked pair does nothing.
    pub fn link(a: &Arc<Lifecycle>, b: &Arc<Lifecycle>) {
        if Arc::ptr_eq(a, b) {
            return;
        }
        a.add_link(b);
        b.add_link(a);
    }

    fn add_link(&self, peer: &Arc<Lifecycle>) {
        let peer = Arc::downgrade(peer);
        let mut state = lock(&self.state);
        if state.links.iter().any(|link| link.ptr_eq(&peer)) {
            return;
        }
        state.links.push(peer.clone());
        state.callbacks.push(Box::new(move || {
            if let Some(peer) = peer.upgrade() {
                peer.trigger_shutdown();
            }
        }));
    }

    /// Number of linked peers still alive.
    pub fn links(&self) -> usize {
        lock(&self.state)
            .links
            .iter()
            .filter(|link| link.strong_count() > 0)
            .count()
    }

    /// Starts the shutdown. Only the first call has an effect.
    ///
    /// With a bound listener the callbacks run once the listener has
    /// drained; otherwise they run before this returns.
    pub fn trigger_shutdown(&self) {
        if self
            .triggered
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let listener = {
            let state = lock(&self.state);
            state.listener.clone().map(|handle| (handle, state.grace))
        };
        match listener {
            Some((handle, grace)) => {
                log::debug!("draining the listener within {:?}", grace);
                handle.shutdown(grace);
            }
            None => self.finish(),
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::Acquire)
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Runs the callbacks in reverse registration order and releases the
    /// waiters. Only the first call has an effect.
    pub(crate) fn finish(&self) {
        if self
            .finished
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        self.triggered.store(true, Ordering::Release);

        let callbacks = std::mem::take(&mut lock(&self.state).callbacks);
        for callback in callbacks.into_iter().rev() {
            callback();
        }

        *lock(&self.done) = true;
        self.done_signal.notify_all();
    }

    /// Blocks until the shutdown completes.
    pub fn wait(&self) {
        let mut done = lock(&self.done);
        while !*done {
            done = self
                .done_signal
                .wait(done)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    /// Blocks until the shutdown completes or `timeout` elapses, and reports
    /// whether it completed.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = match Instant::now().checked_add(timeout) {
            Some(deadline) => deadline,
            None => {
                self.wait();
                return true;
            }
        };
        let mut done = lock(&self.done);
        while !*done {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            done = self
                .done_signal
                .wait_timeout(done, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
        true
    }

    /// Drains the listener within `deadline` and waits for the shutdown to
    /// complete.
    pub fn shutdown(&self, deadline: Duration) -> Result<(), ServerError> {
        if self.is_finished() {
            return Ok(());
        }
        {
            let mut state = lock(&self.state);
            if state.listener.is_none() {
                return Err(ServerError::NotStarted);
            }
            state.grace = deadline;
        }

        self.trigger_shutdown();
        if self.wait_timeout(deadline.saturating_add(FORCE_CLOSE_SLACK)) {
            Ok(())
        } else {
            Err(ServerError::Timeout(deadline))
        }
    }

    /// Records the handle of the started listener.
    pub(crate) fn bind_listener(&self, handle: Handle) -> Result<(), ServerError> {
        let grace = {
            let mut state = lock(&self.state);
            if state.listener.is_some() || self.is_finished() {
                return Err(ServerError::AlreadyStarted);
            }
            state.listener = Some(handle.clone());
            state.grace
        };

        // The trigger fired before the listener existed.
        if self.is_triggered() {
            handle.shutdown(grace);
        }
        Ok(())
    }

    pub(crate) fn unbind_listener(&self) {
        lock(&self.state).listener = None;
    }
}

/// Triggers the shutdown of `lifecycle` on the first of `signals`.
#[cfg(unix)]
pub(crate) async fn watch_signals(signals: Vec<Signal>, lifecycle: Weak<Lifecycle>) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut streams = Vec::with_capacity(signals.len());
    for sig in signals {
        let kind = match sig {
            Signal::Interrupt => SignalKind::interrupt(),
            Signal::Terminate => SignalKind::terminate(),
            Signal::Quit => SignalKind::quit(),
            Signal::Hangup => SignalKind::hangup(),
        };
        match signal(kind) {
            Ok(stream) => streams.push(stream),
            Err(err) => log::warn!("cannot listen to {:?}: {}", sig, err),
        }
    }
    if streams.is_empty() {
        return;
    }

    let received = streams.iter_mut().map(|stream| Box::pin(stream.recv()));
    futures::future::select_all(received).await;

    log::info!("received a termination signal, shutting down");
    if let Some(lifecycle) = lifecycle.upgrade() {
        lifecycle.trigger_shutdown();
    }
}

/// Triggers the shutdown of `lifecycle` on Ctrl-C.
#[cfg(not(unix))]
pub(crate) async fn watch_signals(signals: Vec<Signal>, lifecycle: Weak<Lifecycle>) {
    if signals.is_empty() {
        return;
    }
    if let Err(err) = tokio::signal::ctrl_c().await {
        log::warn!("cannot listen to Ctrl-C: {}", err);
        return;
    }

    log::info!("received a termination signal, shutting down");
    if let Some(lifecycle) = lifecycle.upgrade() {
        lifecycle.trigger_shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    fn recorder(lifecycle: &Lifecycle, order: &Arc<Mutex<Vec<usize>>>, id: usize) {
        let order = order.clone();
        lifecycle.register(move || order.lock().unwrap().push(id));
    }

    /// Tests that concurrent triggers run the callbacks once, in reverse order.
    #[test]
    fn test_trigger_idempotence() {
        let lifecycle = Lifecycle::new(Duration::from_secs(1));
        let order = Arc::new(Mutex::new(Vec::new()));
        for id in 1..=3 {
            recorder(&lifecycle, &order, id);
        }

        let triggers: Vec<_> = (0..8)
            .map(|_| {
                let lifecycle = lifecycle.clone();
                thread::spawn(move || lifecycle.trigger_shutdown())
            })
            .collect();
        for trigger in triggers {
            trigger.join().unwrap();
        }
        lifecycle.trigger_shutdown();

        assert_eq!(*order.lock().unwrap(), vec![3, 2, 1]);
        assert!(lifecycle.is_finished());
        assert!(lifecycle.wait_timeout(Duration::from_millis(10)));
    }

    /// Tests that every waiter is released.
    #[test]
    fn test_multiple_waiters() {
        let lifecycle = Lifecycle::new(Duration::from_secs(1));
        let released = Arc::new(AtomicUsize::new(0));

        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let lifecycle = lifecycle.clone();
                let released = released.clone();
                thread::spawn(move || {
                    lifecycle.wait();
                    released.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();

        assert!(!lifecycle.wait_timeout(Duration::from_millis(20)));
        lifecycle.trigger_shutdown();
        for waiter in waiters {
            waiter.join().unwrap();
        }
        assert_eq!(released.load(Ordering::SeqCst), 4);
    }

    /// Tests that linked coordinators shut each other down exactly once.
    #[test]
    fn test_linked_shutdown() {
        let x = Lifecycle::new(Duration::from_secs(1));
        let y = Lifecycle::new(Duration::from_secs(1));
        let calls = Arc::new(AtomicUsize::new(0));
        {
            let calls = calls.clone();
            y.register(move || {
                calls.fetch_add(1, Ordering::SeqCst);
            });
        }

        Lifecycle::link(&x, &y);
        Lifecycle::link(&x, &y);
        Lifecycle::link(&y, &x);
        assert_eq!(x.links(), 1);
        assert_eq!(y.links(), 1);

        x.trigger_shutdown();
        assert!(y.is_finished());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        y.trigger_shutdown();
        x.trigger_shutdown();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    /// Tests the propagation from the other side of the link.
    #[test]
    fn test_linked_shutdown_reverse() {
        let x = Lifecycle::new(Duration::from_secs(1));
        let y = Lifecycle::new(Duration::from_secs(1));
        Lifecycle::link(&x, &y);

        y.trigger_shutdown();
        assert!(x.is_finished());
        assert!(y.is_finished());
    }

    /// Tests that a bounded shutdown needs a started listener.
    #[test]
    fn test_shutdown_not_started() {
        let lifecycle = Lifecycle::new(Duration::from_secs(1));
        assert!(matches!(
            lifecycle.shutdown(Duration::from_millis(10)),
            Err(ServerError::NotStarted)
        ));
        lifecycle.trigger_shutdown();
        assert!(lifecycle.shutdown(Duration::from_millis(10)).is_ok());
    }

    /// Tests that unbounded deadlines wait instead of overflowing.
    #[test]
    fn test_unbounded_deadline() {
        let lifecycle = Lifecycle::new(Duration::from_secs(1));
        let server = crate::Server::bind("127.0.0.1:0", &crate::Config::default()).unwrap();
        lifecycle.bind_listener(server.handle()).unwrap();

        let stopping = {
            let lifecycle = lifecycle.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                lifecycle.unbind_listener();
                lifecycle.finish();
            })
        };

        assert!(lifecycle.shutdown(Duration::MAX).is_ok());
        assert!(lifecycle.wait_timeout(Duration::MAX));
        stopping.join().unwrap();
    }
}
