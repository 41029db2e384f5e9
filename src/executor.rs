use std::collections::VecDeque;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::task::{Context, Poll, Wake};
use std::thread::{self, Thread};
use std::time::Duration;

use crate::error::{ExecutorError, ExecutorResult};

/// Blocks the current thread on a future, parking it while the future is
/// pending.
///
/// Used by the worker threads to drive connections and by [`Body`] to read
/// a request body synchronously from a handler.
///
/// [`Body`]: crate::Body
pub struct Parker {
    thread: Thread,
    parked: AtomicBool,
}

impl Parker {
    pub fn new() -> Arc<Self> {
        Arc::new(Parker {
            thread: thread::current(),
            // starts parked so that a wakeup between poll and park is kept
            parked: AtomicBool::new(true),
        })
    }

    /// Polls `fut` to completion on the current thread.
    pub fn block_on<F>(self: &Arc<Self>, fut: F) -> F::Output
    where
        F: Future,
    {
        self.parked.store(true, Ordering::Relaxed);

        let waker = self.clone().into();
        let mut cx = Context::from_waker(&waker);

        futures::pin_mut!(fut);
        loop {
            match fut.as_mut().poll(&mut cx) {
                Poll::Ready(output) => break output,
                Poll::Pending => {
                    while self.parked.swap(true, Ordering::Acquire) {
                        thread::park();
                    }
                }
            }
        }
    }
}

impl Wake for Parker {
    fn wake(self: Arc<Self>) {
        if self.parked.swap(false, Ordering::Release) {
            self.thread.unpark();
        }
    }
}

type Task = Pin<Box<dyn Future<Output = ()> + Send>>;

/// A pool of worker threads, each driving one connection at a time.
///
/// Workers are spawned on demand up to `max_workers` and exit after
/// `keep_alive` without work. Tasks submitted while every worker is busy
/// wait in a queue.
#[derive(Clone)]
pub struct Executor {
    inner: Arc<Inner>,
}

struct Inner {
    keep_alive: Duration,
    max_workers: usize,
    shared: Mutex<Shared>,
    condvar: Condvar,
}

struct Shared {
    queue: VecDeque<Task>,
    workers: usize,
    idle: usize,
    /// Idle workers woken for a queued task but not yet running.
    notified: usize,
}

impl Executor {
    /// Creates an executor. Missing limits default to 15 workers per CPU and
    /// a keep-alive of 6 seconds.
    pub fn new(max_workers: Option<usize>, keep_alive: Option<Duration>) -> Self {
        Self {
            inner: Arc::new(Inner {
                shared: Mutex::new(Shared {
                    queue: VecDeque::new(),
                    workers: 0,
                    idle: 0,
                    notified: 0,
                }),
                condvar: Condvar::new(),
                keep_alive: keep_alive.unwrap_or_else(|| Duration::from_secs(6)),
                max_workers: max_workers.unwrap_or_else(|| num_cpus::get() * 15).max(1),
            }),
        }
    }

    /// Number of live worker threads.
    pub fn workers(&self) -> usize {
        self.inner
            .lock()
            .map(|shared| shared.workers)
            .unwrap_or_default()
    }

    fn spawn_worker(&self) -> ExecutorResult<()> {
        let inner = self.inner.clone();
        thread::Builder::new()
            .name("ship-worker".to_owned())
            .spawn(move || {
                if let Err(e) = inner.run() {
                    log::error!("worker thread failed: {}", e);
                }
            })
            .map_err(ExecutorError::ThreadSpawn)?;
        Ok(())
    }

    fn submit(&self, task: Task) -> ExecutorResult<()> {
        let mut shared = self.inner.lock()?;
        shared.queue.push_back(task);

        if shared.idle > shared.notified {
            shared.notified += 1;
            self.inner.condvar.notify_one();
        } else if shared.workers < self.inner.max_workers {
            shared.workers += 1;
            if let Err(e) = self.spawn_worker() {
                shared.workers -= 1;
                return Err(e);
            }
        }
        Ok(())
    }
}

impl<F> hyper::rt::Executor<F> for Executor
where
    F: Future<Output = ()> + Send + 'static,
{
    fn execute(&self, fut: F) {
        if let Err(e) = self.submit(Box::pin(fut)) {
            log::error!("failed to execute a task: {}", e);
        }
    }
}

impl Inner {
    fn lock(&self) -> ExecutorResult<MutexGuard<'_, Shared>> {
        self.shared.lock().map_err(|_| ExecutorError::LockPoisoned)
    }

    /// Runs queued tasks until none arrives within the keep-alive.
    fn run(&self) -> ExecutorResult<()> {
        let parker = Parker::new();
        let mut shared = self.lock()?;

        'alive: loop {
            while let Some(task) = shared.queue.pop_front() {
                drop(shared);
                if panic::catch_unwind(AssertUnwindSafe(|| parker.block_on(task))).is_err() {
                    log::error!("a task panicked, the worker keeps running");
                }
                shared = self.lock()?;
            }

            shared.idle += 1;
            loop {
                let (guard, timeout) = self
                    .condvar
                    .wait_timeout(shared, self.keep_alive)
                    .map_err(|_| ExecutorError::LockPoisoned)?;
                shared = guard;

                if shared.notified != 0 {
                    shared.notified -= 1;
                    shared.idle -= 1;
                    continue 'alive;
                }

                if timeout.timed_out() {
                    // A task queued after the last notification still gets run.
                    if !shared.queue.is_empty() {
                        shared.idle -= 1;
                        continue 'alive;
                    }
                    break 'alive;
                }
            }
        }

        shared.workers -= 1;
        shared.idle -= 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::rt::Executor as _;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    /// Tests that an executor is created with the given limits.
    #[test]
    fn test_executor_creation() {
        let executor = Executor::new(Some(4), Some(Duration::from_secs(10)));
        assert_eq!(executor.inner.max_workers, 4);
        assert_eq!(executor.inner.keep_alive, Duration::from_secs(10));
        assert_eq!(executor.workers(), 0);
    }

    /// Tests that submitted tasks run.
    #[test]
    fn test_task_execution() {
        let executor = Executor::new(Some(2), None);
        let counter = Arc::new(AtomicUsize::new(0));
        let (done_tx, done_rx) = mpsc::channel();

        for _ in 0..5 {
            let counter = counter.clone();
            let done_tx = done_tx.clone();
            executor.execute(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                done_tx.send(()).unwrap();
            });
        }

        for _ in 0..5 {
            done_rx.recv_timeout(Duration::from_secs(1)).unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 5);
        assert!(executor.workers() <= 2);
    }

    /// Tests that idle workers exit after the keep-alive.
    #[test]
    fn test_worker_keep_alive() {
        let executor = Executor::new(Some(1), Some(Duration::from_millis(50)));
        let (done_tx, done_rx) = mpsc::channel();
        executor.execute(async move {
            done_tx.send(()).unwrap();
        });
        done_rx.recv_timeout(Duration::from_secs(1)).unwrap();

        thread::sleep(Duration::from_millis(300));
        assert_eq!(executor.workers(), 0);
    }

    /// Tests that a panicking task leaves its worker able to run the next
    /// tasks.
    #[test]
    fn test_task_panic() {
        let executor = Executor::new(Some(1), None);
        executor.execute(async {
            panic!("task failure");
        });

        let (done_tx, done_rx) = mpsc::channel();
        executor.execute(async move {
            done_tx.send(()).unwrap();
        });
        done_rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(executor.workers(), 1);
    }

    /// Tests that a parked thread is resumed by a wakeup from another thread.
    #[test]
    fn test_parker() {
        let parker = Parker::new();
        let (tx, rx) = futures::channel::oneshot::channel();

        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            tx.send("completed").unwrap();
        });

        assert_eq!(parker.block_on(rx), Ok("completed"));
    }
}
