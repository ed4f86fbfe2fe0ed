//! Tunnel data plane (spec §4.5): framing, uplink/downlink pumps, statistics.
//!
//! Frames are a 2-byte big-endian length prefix followed by that many bytes
//! of payload. A length of 0 is a keepalive carrying no payload. Both
//! directions run as independent tasks so a stalled peer on one side never
//! blocks drain of the other; each direction holds at most one frame
//! in-flight (the next read doesn't start until the previous write
//! completes), which is the back-pressure the protocol relies on instead of
//! an explicit flow-control window.

use crate::buffer_pool::BufferPool;
use crate::error::{Result, TunnelError};
use crate::tls_transport::Stream;
use crate::tun::Handle as TunHandle;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, error, warn};

/// Default idle time before the uplink writer sends a keepalive frame
/// (spec §4.5/§6: zero-length frame "sent by the writer when no data has
/// flowed for `keepalive_interval`").
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

// tokio_util is not in the dependency graph; a tiny cooperative cancellation
// token is all this needs and keeps the dependency surface aligned with the
// rest of the crate.
mod cancel {
    use std::sync::Arc;
    use tokio::sync::Notify;

    #[derive(Clone, Default)]
    pub struct CancellationToken {
        notify: Arc<Notify>,
        cancelled: Arc<std::sync::atomic::AtomicBool>,
    }

    impl CancellationToken {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn cancel(&self) {
            self.cancelled.store(true, std::sync::atomic::Ordering::SeqCst);
            self.notify.notify_waiters();
        }

        pub fn is_cancelled(&self) -> bool {
            self.cancelled.load(std::sync::atomic::Ordering::SeqCst)
        }

        pub async fn cancelled(&self) {
            if self.is_cancelled() {
                return;
            }
            self.notify.notified().await;
        }
    }
}
pub use cancel::CancellationToken as CancelToken;

const LENGTH_PREFIX_BYTES: usize = 2;
const MAX_FRAME_LEN: usize = u16::MAX as usize;

/// Running byte/frame counters for one tunnel session, safe to read
/// concurrently from a control-surface status query.
#[derive(Default)]
pub struct Statistics {
    pub bytes_up: AtomicU64,
    pub bytes_down: AtomicU64,
    pub frames_up: AtomicU64,
    pub frames_down: AtomicU64,
    pub errors: AtomicU64,
    pub reconnects: AtomicU64,
}

impl Statistics {
    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            bytes_up: self.bytes_up.load(Ordering::Relaxed),
            bytes_down: self.bytes_down.load(Ordering::Relaxed),
            frames_up: self.frames_up.load(Ordering::Relaxed),
            frames_down: self.frames_down.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct StatisticsSnapshot {
    pub bytes_up: u64,
    pub bytes_down: u64,
    pub frames_up: u64,
    pub frames_down: u64,
    pub errors: u64,
    pub reconnects: u64,
}

/// Read exactly one frame (length prefix + payload) from `stream`. Returns
/// `Ok(None)` on a clean EOF between frames (not mid-frame, which is a
/// `ShortRead`).
async fn read_frame(stream: &mut Stream, mtu: usize) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; LENGTH_PREFIX_BYTES];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(TunnelError::Io(e)),
    }
    let len = u16::from_be_bytes(len_buf) as usize;
    if len > mtu && len != 0 {
        return Err(TunnelError::FrameTooLarge { len, mtu });
    }
    if len == 0 {
        return Ok(Some(Vec::new()));
    }
    let mut payload = vec![0u8; len];
    stream
        .read_exact(&mut payload)
        .await
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => TunnelError::ShortRead {
                expected: len,
                got: 0,
            },
            _ => TunnelError::Io(e),
        })?;
    Ok(Some(payload))
}

async fn write_frame(stream: &mut Stream, payload: &[u8]) -> Result<()> {
    if payload.len() > MAX_FRAME_LEN {
        return Err(TunnelError::FrameTooLarge {
            len: payload.len(),
            mtu: MAX_FRAME_LEN,
        });
    }
    let len_buf = (payload.len() as u16).to_be_bytes();
    stream.write_all(&len_buf).await.map_err(TunnelError::Io)?;
    if !payload.is_empty() {
        stream.write_all(payload).await.map_err(TunnelError::Io)?;
    }
    stream.flush().await.map_err(TunnelError::Io)?;
    Ok(())
}

/// Write a zero-length keepalive frame.
pub async fn write_keepalive(stream: &mut Stream) -> Result<()> {
    write_frame(stream, &[]).await
}

/// Drives one direction of the tunnel: read IP frames off `tun` and forward
/// them as length-prefixed frames on `tls`, until cancelled or an error. When
/// `keepalive_interval` elapses with no frame written, sends a zero-length
/// keepalive frame instead of letting the link sit silent.
pub async fn pump_uplink(
    mut tun: TunHandle,
    mut tls: Stream,
    buffers: Arc<BufferPool>,
    stats: Arc<Statistics>,
    cancel: CancelToken,
    keepalive_interval: Duration,
) -> Result<()> {
    let mtu = tun.mtu() as usize;
    let mut idle = tokio::time::interval_at(
        tokio::time::Instant::now() + keepalive_interval,
        keepalive_interval,
    );
    idle.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        let mut buf = buffers.get(mtu);
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = idle.tick() => {
                if let Err(e) = write_keepalive(&mut tls).await {
                    stats.errors.fetch_add(1, Ordering::Relaxed);
                    return Err(e);
                }
                debug!("uplink idle, sent keepalive frame");
            }
            result = tun.read(buf.as_mut_slice()) => {
                let n = result?;
                if n == 0 {
                    continue;
                }
                buf.resize(n, 0);
                if let Err(e) = write_frame(&mut tls, buf.as_slice()).await {
                    stats.errors.fetch_add(1, Ordering::Relaxed);
                    buffers.put(buf);
                    return Err(e);
                }
                stats.bytes_up.fetch_add(n as u64, Ordering::Relaxed);
                stats.frames_up.fetch_add(1, Ordering::Relaxed);
                buffers.put(buf);
                idle.reset();
            }
        }
    }
}

/// Drives the other direction: read length-prefixed frames off `tls` and
/// write their payload to `tun`. Zero-length frames are keepalives and are
/// consumed without touching the TUN device.
pub async fn pump_downlink(
    mut tun: TunHandle,
    mut tls: Stream,
    stats: Arc<Statistics>,
    cancel: CancelToken,
) -> Result<()> {
    let mtu = tun.mtu() as usize;
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            result = read_frame(&mut tls, mtu) => result?,
        };
        let Some(payload) = frame else {
            debug!("downlink stream closed cleanly");
            return Ok(());
        };
        if payload.is_empty() {
            continue; // keepalive
        }
        if let Err(e) = tun.write(&payload).await {
            stats.errors.fetch_add(1, Ordering::Relaxed);
            return Err(e);
        }
        stats.bytes_down.fetch_add(payload.len() as u64, Ordering::Relaxed);
        stats.frames_down.fetch_add(1, Ordering::Relaxed);
    }
}

/// Runs both directions concurrently and tears down the whole session (TUN
/// + TLS stream) as soon as either direction exits, cancelling the other.
pub async fn run_session(
    tun_a: TunHandle,
    tun_b: TunHandle,
    tls_up: Stream,
    tls_down: Stream,
    buffers: Arc<BufferPool>,
    stats: Arc<Statistics>,
    keepalive_interval: Duration,
) -> Result<()> {
    let cancel = CancelToken::new();
    let uplink = tokio::spawn(pump_uplink(
        tun_a,
        tls_up,
        buffers,
        stats.clone(),
        cancel.clone(),
        keepalive_interval,
    ));
    let downlink = tokio::spawn(pump_downlink(tun_b, tls_down, stats, cancel.clone()));

    let result = tokio::select! {
        res = uplink => { cancel.cancel(); res }
        res = downlink => { cancel.cancel(); res }
    };

    match result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            warn!(error = %e, "tunnel session ended with error");
            Err(e)
        }
        Err(join_err) => {
            error!(error = %join_err, "tunnel session task panicked");
            Err(TunnelError::HandlerFailed(join_err.to_string()))
        }
    }
}
