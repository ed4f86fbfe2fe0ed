//! Mutually-authenticated TLS tunnel core: bridges a local TUN interface to
//! a remote peer over TLS 1.3 with client-certificate authentication,
//! throttling, connection pooling with retry, and endpoint load balancing.

pub mod buffer_pool;
pub mod cert_store;
pub mod config;
pub mod control;
pub mod endpoint;
pub mod error;
pub mod load_balancer;
pub mod logging;
pub mod pool;
pub mod retry;
pub mod service;
pub mod state_machine;
pub mod throttle;
pub mod tls_transport;
pub mod tun;
pub mod tunnel;

pub use error::{Result, TunnelError};
