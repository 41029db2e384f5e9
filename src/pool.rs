//! Free lists for per-request contexts and scratch buffers.

use std::mem;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::context::{Context, Shared};
use crate::http::Request;
use crate::server::ConnectionInfo;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // The free lists stay consistent even if a holder panicked.
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A pool of reusable [`Context`]s.
///
/// Each acquisition hands out exclusive ownership of one context through a
/// [`PooledContext`] guard; dropping the guard resets the context and puts it
/// back on the free list.
#[derive(Default)]
pub struct ContextPool {
    free: Mutex<Vec<Context>>,
}

impl ContextPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes a free context, or allocates one, and binds it to `request`.
    ///
    /// The parameter slots are grown to `param_capacity` if a configuration
    /// change raised the parameter count since the context was allocated.
    pub fn acquire(
        &self,
        shared: &Arc<Shared>,
        request: Request,
        info: Option<ConnectionInfo>,
        param_capacity: usize,
    ) -> PooledContext<'_> {
        let reused = lock(&self.free).pop();
        let mut ctx = match reused {
            Some(mut ctx) => {
                if !Arc::ptr_eq(&ctx.shared, shared) {
                    ctx.shared = shared.clone();
                }
                ctx
            }
            None => Context::new(shared.clone()),
        };

        ctx.request = request;
        ctx.info = info;
        ctx.params.reserve(param_capacity);

        PooledContext {
            pool: self,
            ctx: Some(ctx),
        }
    }

    /// Number of idle contexts.
    pub fn idle(&self) -> usize {
        lock(&self.free).len()
    }

    fn release(&self, mut ctx: Context) {
        ctx.reset();
        lock(&self.free).push(ctx);
    }
}

/// Exclusive access to a pooled [`Context`] for the span of one request.
pub struct PooledContext<'p> {
    pool: &'p ContextPool,
    /// Only `None` once dropped.
    ctx: Option<Context>,
}

impl Deref for PooledContext<'_> {
    type Target = Context;

    fn deref(&self) -> &Context {
        self.ctx.as_ref().expect("pooled context used after release")
    }
}

impl DerefMut for PooledContext<'_> {
    fn deref_mut(&mut self) -> &mut Context {
        self.ctx.as_mut().expect("pooled context used after release")
    }
}

impl Drop for PooledContext<'_> {
    fn drop(&mut self) {
        if let Some(ctx) = self.ctx.take() {
            self.pool.release(ctx);
        }
    }
}

/// A pool of byte buffers used to assemble response bodies.
pub struct BufferPool {
    size: usize,
    free: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    /// Creates a pool whose fresh buffers have a capacity of `size` bytes.
    pub fn new(size: usize) -> Self {
        BufferPool {
            size,
            free: Mutex::new(Vec::new()),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Takes an empty buffer. It returns to the pool when the guard drops.
    pub fn get(self: &Arc<Self>) -> PooledBuffer {
        let buf = lock(&self.free)
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(self.size));
        PooledBuffer {
            pool: self.clone(),
            buf,
        }
    }

    fn put(&self, mut buf: Vec<u8>) {
        buf.clear();
        lock(&self.free).push(buf);
    }
}

/// A buffer borrowed from a [`BufferPool`].
pub struct PooledBuffer {
    pool: Arc<BufferPool>,
    buf: Vec<u8>,
}

impl Deref for PooledBuffer {
    type Target = Vec<u8>;

    fn deref(&self) -> &Vec<u8> {
        &self.buf
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        &mut self.buf
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        self.pool.put(mem::take(&mut self.buf));
    }
}
