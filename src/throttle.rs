//! Token-bucket rate limiter and stream adapter (spec §4.2).
//!
//! The bucket's internal mutex guards a short critical section (refill +
//! consume); waiters for the same bucket are served FIFO via a `Notify`
//! chain. Updates to `rate`/`burst` are atomic from a caller's perspective:
//! the existing token count is clamped to the new burst under the same lock
//! (spec §5: "lock order pool > endpoint > bucket" - this module never takes
//! any other lock while holding its own).

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::Notify;

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

struct BucketState {
    tokens: f64,
    last_refill: Instant,
    rate: f64,
    burst: f64,
}

impl BucketState {
    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.burst);
        self.last_refill = now;
    }
}

/// A token bucket shared by any number of readers/writers.
pub struct TokenBucket {
    state: Mutex<BucketState>,
    notify: Notify,
    // Monotonically increasing generation, bumped on `update`, so waiters
    // blocked on a stale (rate, burst) wake up and re-check rather than
    // sleeping past a parameter change.
    generation: AtomicU64,
}

impl TokenBucket {
    pub fn new(rate: f64, burst: f64) -> Self {
        assert!(burst >= 1.0, "burst must be >= 1 token");
        Self {
            state: Mutex::new(BucketState {
                tokens: burst,
                last_refill: Instant::now(),
                rate,
                burst,
            }),
            notify: Notify::new(),
            generation: AtomicU64::new(0),
        }
    }

    pub fn rate(&self) -> f64 {
        self.state.lock().rate
    }

    pub fn burst(&self) -> f64 {
        self.state.lock().burst
    }

    pub fn tokens(&self) -> f64 {
        let mut state = self.state.lock();
        state.refill(Instant::now());
        state.tokens
    }

    /// Atomically change rate/burst; existing tokens are clamped to the new burst.
    pub fn update(&self, rate: f64, burst: f64) {
        let mut state = self.state.lock();
        state.refill(Instant::now());
        state.rate = rate;
        state.burst = burst;
        state.tokens = state.tokens.min(burst);
        self.generation.fetch_add(1, Ordering::SeqCst);
        drop(state);
        self.notify.notify_waiters();
    }

    /// Try to consume `n` tokens without blocking.
    pub fn try_acquire(&self, n: f64) -> bool {
        let mut state = self.state.lock();
        state.refill(Instant::now());
        if state.tokens >= n {
            state.tokens -= n;
            true
        } else {
            false
        }
    }

    /// Block (in the async sense) until `n` tokens are available, then
    /// consume them. A zero-rate bucket with no existing tokens blocks
    /// indefinitely until `update` raises the rate or cancellation drops
    /// this future.
    pub async fn acquire(&self, n: f64) {
        loop {
            if self.try_acquire(n) {
                return;
            }
            let deficit = {
                let state = self.state.lock();
                (n - state.tokens).max(0.0)
            };
            let wait = if self.rate() > 0.0 {
                Duration::from_secs_f64(deficit / self.rate())
            } else {
                Duration::from_secs(3600)
            };
            let generation = self.generation.load(Ordering::SeqCst);
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = self.notify.notified() => {
                    if self.generation.load(Ordering::SeqCst) == generation {
                        // spurious wake with no parameter change; loop and
                        // recompute the deficit against current tokens.
                    }
                }
            }
        }
    }
}

/// Wraps a byte stream so reads/writes are throttled through one or two
/// shared [`TokenBucket`]s (upload/download may share a bucket).
pub struct ThrottledStream<S> {
    inner: S,
    read_bucket: Option<Arc<TokenBucket>>,
    write_bucket: Option<Arc<TokenBucket>>,
    read_wait: Option<Pin<Box<tokio::time::Sleep>>>,
    write_wait: Option<Pin<Box<tokio::time::Sleep>>>,
}

impl<S> ThrottledStream<S> {
    pub fn new(
        inner: S,
        read_bucket: Option<Arc<TokenBucket>>,
        write_bucket: Option<Arc<TokenBucket>>,
    ) -> Self {
        Self {
            inner,
            read_bucket,
            write_bucket,
            read_wait: None,
            write_wait: None,
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for ThrottledStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        let Some(bucket) = this.read_bucket.clone() else {
            return Pin::new(&mut this.inner).poll_read(cx, buf);
        };
        loop {
            if let Some(wait) = this.read_wait.as_mut() {
                match wait.as_mut().poll(cx) {
                    Poll::Ready(()) => this.read_wait = None,
                    Poll::Pending => return Poll::Pending,
                }
            }
            // Cap this read to at most the tokens currently available so we
            // never deliver more bytes than were actually acquired.
            let available = bucket.tokens().floor() as usize;
            if available == 0 {
                let deficit = (1.0 - bucket.tokens()).max(0.0);
                let rate = bucket.rate();
                let wait_dur = if rate > 0.0 {
                    Duration::from_secs_f64(deficit / rate)
                } else {
                    Duration::from_millis(50)
                };
                this.read_wait = Some(Box::pin(tokio::time::sleep(wait_dur)));
                continue;
            }
            let cap = available.min(buf.remaining());
            let mut limited = buf.take(cap);
            let poll = Pin::new(&mut this.inner).poll_read(cx, &mut limited);
            if let Poll::Ready(Ok(())) = poll {
                let produced = limited.filled().len();
                if produced > 0 {
                    bucket.try_acquire(produced as f64);
                }
                buf.advance(produced);
            }
            return poll;
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for ThrottledStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        let Some(bucket) = this.write_bucket.clone() else {
            return Pin::new(&mut this.inner).poll_write(cx, buf);
        };
        loop {
            if let Some(wait) = this.write_wait.as_mut() {
                match wait.as_mut().poll(cx) {
                    Poll::Ready(()) => this.write_wait = None,
                    Poll::Pending => return Poll::Pending,
                }
            }
            let burst = bucket.burst() as usize;
            let chunk_len = buf.len().min(burst.max(1));
            if bucket.try_acquire(chunk_len as f64) {
                return Pin::new(&mut this.inner).poll_write(cx, &buf[..chunk_len]);
            }
            let deficit = (chunk_len as f64 - bucket.tokens()).max(0.0);
            let rate = bucket.rate();
            let wait_dur = if rate > 0.0 {
                Duration::from_secs_f64(deficit / rate)
            } else {
                Duration::from_millis(50)
            };
            this.write_wait = Some(Box::pin(tokio::time::sleep(wait_dur)));
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_never_exceed_burst() {
        let bucket = TokenBucket::new(1_000_000.0, 100.0);
        std::thread::sleep(Duration::from_millis(5));
        assert!(bucket.tokens() <= 100.0);
    }

    #[test]
    fn try_acquire_consumes_available_tokens() {
        let bucket = TokenBucket::new(0.0, 10.0);
        assert!(bucket.try_acquire(5.0));
        assert!((bucket.tokens() - 5.0).abs() < 1e-9);
        assert!(!bucket.try_acquire(6.0));
    }

    #[test]
    fn update_clamps_existing_tokens_to_new_burst() {
        let bucket = TokenBucket::new(0.0, 100.0);
        assert_eq!(bucket.tokens(), 100.0);
        bucket.update(0.0, 10.0);
        assert_eq!(bucket.tokens(), 10.0);
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_blocks_until_tokens_refill() {
        let bucket = Arc::new(TokenBucket::new(10.0, 1.0));
        bucket.try_acquire(1.0);
        assert!(!bucket.try_acquire(1.0));

        let b = bucket.clone();
        let handle = tokio::spawn(async move {
            b.acquire(1.0).await;
        });
        tokio::time::advance(Duration::from_millis(150)).await;
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn zero_rate_bucket_blocks_until_update() {
        let bucket = Arc::new(TokenBucket::new(0.0, 1.0));
        bucket.try_acquire(1.0);

        let b = bucket.clone();
        let handle = tokio::spawn(async move {
            b.acquire(1.0).await;
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!handle.is_finished());
        bucket.update(100.0, 1.0);
        tokio::time::advance(Duration::from_millis(50)).await;
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn drained_read_bucket_blocks_read_instead_of_bypassing_it() {
        let (a, mut b) = tokio::io::duplex(4096);
        let bucket = Arc::new(TokenBucket::new(10.0, 1.0));
        bucket.try_acquire(1.0); // drain the only token up front
        let mut throttled = ThrottledStream::new(a, Some(bucket), None);

        let read_task = tokio::spawn(async move {
            let mut buf = [0u8; 8];
            tokio::io::AsyncReadExt::read_exact(&mut throttled, &mut buf).await.unwrap();
            buf
        });

        tokio::io::AsyncWriteExt::write_all(&mut b, &[7u8; 8]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!read_task.is_finished(), "read must block while the bucket is empty");

        tokio::time::advance(Duration::from_millis(800)).await;
        let buf = read_task.await.unwrap();
        assert_eq!(buf, [7u8; 8]);
    }
}
