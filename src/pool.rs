//! TLS connection pooling (spec §4.8).
//!
//! Idle connections sit in a bounded queue; checkout either reuses one or
//! dials a fresh one up to `max_size`, blocking callers wait on a `Notify`
//! until a connection is returned or the deadline passes. A background
//! sweeper task retires connections idle longer than `max_idle_time`.

use crate::endpoint::Endpoint;
use crate::error::{Result, TunnelError};
use crate::tls_transport::Stream;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, warn};

/// Dials a fresh transport connection. Boxed so the pool doesn't need to
/// name the concrete dialing function (production code points this at
/// `tls_transport::dial`; tests point it at an in-memory stub).
pub type DialFn =
    Arc<dyn Fn() -> Pin<Box<dyn Future<Output = Result<Stream>> + Send>> + Send + Sync>;

#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    pub max_size: usize,
    pub min_size: usize,
    pub max_idle_time: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 8,
            min_size: 0,
            max_idle_time: Duration::from_secs(300),
        }
    }
}

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

struct IdleEntry {
    id: u64,
    stream: Stream,
    endpoint: Option<Weak<Endpoint>>,
    created_at: Instant,
    last_used_at: Instant,
    bytes_sent: Arc<AtomicU64>,
    bytes_received: Arc<AtomicU64>,
}

/// A checked-out connection. Returning it to the pool is done by dropping
/// it (which hands it back via `Pool::put` on the tokio runtime) or by
/// calling [`Connection::close`] to discard it instead of recycling it.
pub struct Connection {
    id: u64,
    stream: Option<Stream>,
    endpoint: Option<Weak<Endpoint>>,
    created_at: Instant,
    bytes_sent: Arc<AtomicU64>,
    bytes_received: Arc<AtomicU64>,
    pool: Weak<Pool>,
    discard: bool,
}

impl Connection {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn stream_mut(&mut self) -> &mut Stream {
        self.stream.as_mut().expect("stream taken from live connection")
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    pub fn record_sent(&self, n: u64) {
        self.bytes_sent.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_received(&self, n: u64) {
        self.bytes_received.fetch_add(n, Ordering::Relaxed);
    }

    /// Discard this connection instead of returning it to the pool, e.g.
    /// after a protocol error that poisons the stream.
    pub fn close(mut self) {
        self.discard = true;
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        let Some(stream) = self.stream.take() else {
            return;
        };
        let Some(pool) = self.pool.upgrade() else {
            return;
        };
        if self.discard {
            pool.total.fetch_sub(1, Ordering::SeqCst);
            pool.notify.notify_one();
            return;
        }
        let entry = IdleEntry {
            id: self.id,
            stream,
            endpoint: self.endpoint.take(),
            created_at: self.created_at,
            last_used_at: Instant::now(),
            bytes_sent: self.bytes_sent.clone(),
            bytes_received: self.bytes_received.clone(),
        };
        pool.return_entry(entry);
    }
}

struct State {
    idle: VecDeque<IdleEntry>,
}

/// A bounded pool of TLS connections to a single logical destination.
pub struct Pool {
    config: PoolConfig,
    dial: DialFn,
    state: Mutex<State>,
    notify: Notify,
    total: AtomicUsize,
}

impl Pool {
    pub fn new(config: PoolConfig, dial: DialFn) -> Arc<Self> {
        let pool = Arc::new(Self {
            config,
            dial,
            state: Mutex::new(State {
                idle: VecDeque::new(),
            }),
            notify: Notify::new(),
            total: AtomicUsize::new(0),
        });
        let sweeper = pool.clone();
        tokio::spawn(async move {
            sweeper.run_sweeper().await;
        });
        pool
    }

    /// Attempt to pre-populate `min_size` idle connections. Failures are
    /// logged but non-fatal — the pool still functions, just starts cold.
    pub async fn warm_up(self: &Arc<Self>) {
        for _ in 0..self.config.min_size {
            match self.dial_one().await {
                Ok(entry) => {
                    let mut state = self.state.lock().await;
                    state.idle.push_back(entry);
                }
                Err(e) => {
                    warn!(error = %e, "pool warm-up dial failed");
                    break;
                }
            }
        }
    }

    async fn dial_one(&self) -> Result<IdleEntry> {
        let stream = (self.dial)().await?;
        self.total.fetch_add(1, Ordering::SeqCst);
        Ok(IdleEntry {
            id: NEXT_CONN_ID.fetch_add(1, Ordering::SeqCst),
            stream,
            endpoint: None,
            created_at: Instant::now(),
            last_used_at: Instant::now(),
            bytes_sent: Arc::new(AtomicU64::new(0)),
            bytes_received: Arc::new(AtomicU64::new(0)),
        })
    }

    fn entry_into_connection(self: &Arc<Self>, entry: IdleEntry) -> Connection {
        Connection {
            id: entry.id,
            stream: Some(entry.stream),
            endpoint: entry.endpoint,
            created_at: entry.created_at,
            bytes_sent: entry.bytes_sent,
            bytes_received: entry.bytes_received,
            pool: Arc::downgrade(self),
            discard: false,
        }
    }

    /// Check out a connection, reusing an idle one or dialing a fresh one,
    /// failing with `DeadlineExceeded` if `deadline` passes first.
    pub async fn get(self: &Arc<Self>, deadline: Instant) -> Result<Connection> {
        loop {
            {
                let mut state = self.state.lock().await;
                if let Some(entry) = state.idle.pop_front() {
                    return Ok(self.entry_into_connection(entry));
                }
            }

            if self.total.load(Ordering::SeqCst) < self.config.max_size {
                // Reserve the slot before the (possibly slow) dial so
                // concurrent callers don't all race past max_size.
                self.total.fetch_add(1, Ordering::SeqCst);
                let remaining = deadline.saturating_duration_since(Instant::now());
                let dial_result = tokio::time::timeout(remaining, (self.dial)()).await;
                match dial_result {
                    Ok(Ok(stream)) => {
                        let entry = IdleEntry {
                            id: NEXT_CONN_ID.fetch_add(1, Ordering::SeqCst),
                            stream,
                            endpoint: None,
                            created_at: Instant::now(),
                            last_used_at: Instant::now(),
                            bytes_sent: Arc::new(AtomicU64::new(0)),
                            bytes_received: Arc::new(AtomicU64::new(0)),
                        };
                        return Ok(self.entry_into_connection(entry));
                    }
                    Ok(Err(e)) => {
                        self.total.fetch_sub(1, Ordering::SeqCst);
                        return Err(e);
                    }
                    Err(_) => {
                        self.total.fetch_sub(1, Ordering::SeqCst);
                        return Err(TunnelError::DeadlineExceeded);
                    }
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(TunnelError::DeadlineExceeded);
            }
            let wait = deadline - now;
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(wait) => return Err(TunnelError::DeadlineExceeded),
            }
        }
    }

    fn return_entry(self: &Arc<Self>, entry: IdleEntry) {
        let id = entry.id;
        // Bound the idle queue at max_size implicitly: total only ever
        // counts live connections, and idle entries are a subset of total.
        let state = self.state.try_lock();
        match state {
            Ok(mut guard) => {
                guard.idle.push_back(entry);
                self.notify.notify_one();
            }
            Err(_) => {
                // Lock contention on return is rare; spawn a task rather
                // than block the dropping caller.
                let pool = self.clone();
                tokio::spawn(async move {
                    pool.state.lock().await.idle.push_back(entry);
                    pool.notify.notify_one();
                });
                debug!(id, "connection returned via deferred task");
            }
        }
    }

    async fn run_sweeper(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.max_idle_time.max(Duration::from_secs(1)));
        loop {
            ticker.tick().await;
            let mut state = self.state.lock().await;
            let max_idle = self.config.max_idle_time;
            let before = state.idle.len();
            state.idle.retain(|e| e.last_used_at.elapsed() < max_idle);
            let retired = before - state.idle.len();
            if retired > 0 {
                self.total.fetch_sub(retired, Ordering::SeqCst);
                debug!(retired, "pool sweeper retired idle connections");
            }
        }
    }

    /// Close every idle connection and reset the pool to empty. In-flight
    /// checked-out connections are unaffected and will be dropped normally.
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        let drained = state.idle.drain(..).count();
        self.total.fetch_sub(drained, Ordering::SeqCst);
    }

    pub fn idle_count(&self) -> usize {
        // best-effort snapshot; exact value requires the async lock.
        self.total.load(Ordering::SeqCst)
    }
}
