//! Async client for a boxlet proxy.

use std::io;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio_util::codec::Framed;

use crate::envelope::{DecodeError, Envelope, EnvelopeCodec};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("connection failed: {0}")]
    Io(#[from] io::Error),
    #[error("bad reply: {0}")]
    Decode(#[from] DecodeError),
    #[error("proxy closed the connection")]
    Closed,
}

/// One TCP connection to a proxy. Replies may arrive in any order when
/// several requests are outstanding; match them by `sn`.
pub struct Client {
    framed: Framed<TcpStream, EnvelopeCodec>,
}

impl Client {
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self {
            framed: Framed::new(stream, EnvelopeCodec::new()),
        })
    }

    pub async fn send(&mut self, env: &Envelope) -> Result<(), ClientError> {
        self.framed.send(env).await?;
        Ok(())
    }

    /// Next reply, `None` once the proxy closed the connection.
    pub async fn recv(&mut self) -> Result<Option<Envelope>, ClientError> {
        self.framed.next().await.transpose().map_err(Into::into)
    }

    /// Send one envelope and wait for the next reply.
    pub async fn call(&mut self, env: Envelope) -> Result<Envelope, ClientError> {
        self.send(&env).await?;
        self.recv().await?.ok_or(ClientError::Closed)
    }
}
