//! IPC bridge between the master, the proxy and the workers.
//!
//! # Architecture
//!
//! - **protocol**: Message types (ProxyMessage, WorkerMessage, ControlRequest)
//! - **codec**: JSON framing codec for AsyncRead/AsyncWrite
//! - **transport**: Unix socket the proxy listens on and workers dial
//! - **control**: stdin watcher that turns master requests into cancellation

pub mod codec;
pub mod control;
pub mod protocol;
pub mod transport;
