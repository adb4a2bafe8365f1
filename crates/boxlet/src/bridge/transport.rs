//! Worker socket transport.
//!
//! The proxy binds one listener; every worker connects to it and introduces
//! itself with `Ready`. Platform-specific addresses:
//! - **Named**: filesystem socket (macOS, Linux, BSD)
//! - **Abstract**: Linux abstract namespace (no filesystem, auto-cleanup)

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::{UnixListener, UnixStream};

const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Where workers find the proxy. Passed to every child in its role marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IpcAddress {
    Named {
        path: PathBuf,
    },
    #[cfg(target_os = "linux")]
    Abstract {
        name: String,
    },
}

impl IpcAddress {
    /// Platform default for a master process (abstract on Linux, named elsewhere).
    pub fn for_master(pid: u32) -> Self {
        #[cfg(target_os = "linux")]
        {
            Self::Abstract {
                name: format!("boxlet-{}", pid),
            }
        }

        #[cfg(not(target_os = "linux"))]
        {
            Self::Named {
                path: std::env::temp_dir()
                    .join(format!("boxlet-{}", pid))
                    .join("workers.sock"),
            }
        }
    }

    pub fn named(path: impl Into<PathBuf>) -> Self {
        Self::Named { path: path.into() }
    }
}

impl std::fmt::Display for IpcAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Named { path } => write!(f, "{}", path.display()),
            #[cfg(target_os = "linux")]
            Self::Abstract { name } => write!(f, "@{}", name),
        }
    }
}

/// Proxy side: accepts worker connections.
pub struct WorkerListener {
    listener: UnixListener,
    socket_path: Option<PathBuf>,
    owned_dir: Option<PathBuf>,
}

impl WorkerListener {
    pub fn bind(addr: &IpcAddress) -> io::Result<Self> {
        match addr {
            IpcAddress::Named { path } => {
                let mut owned_dir = None;
                if let Some(dir) = path.parent()
                    && !dir.exists()
                {
                    std::fs::create_dir_all(dir)?;
                    owned_dir = Some(dir.to_path_buf());
                }
                if path.exists() {
                    std::fs::remove_file(path)?;
                }
                let listener = UnixListener::bind(path)?;
                tracing::debug!(transport_type = "named", path = %path.display(), "Bound worker socket");
                Ok(Self {
                    listener,
                    socket_path: Some(path.clone()),
                    owned_dir,
                })
            }
            #[cfg(target_os = "linux")]
            IpcAddress::Abstract { name } => {
                use std::os::linux::net::SocketAddrExt;
                use std::os::unix::net::{SocketAddr, UnixListener as StdUnixListener};

                let addr = SocketAddr::from_abstract_name(name.as_bytes())?;
                let std_listener = StdUnixListener::bind_addr(&addr)?;
                std_listener.set_nonblocking(true)?;
                let listener = UnixListener::from_std(std_listener)?;
                tracing::debug!(transport_type = "abstract", name = %name, "Bound worker socket");
                Ok(Self {
                    listener,
                    socket_path: None,
                    owned_dir: None,
                })
            }
        }
    }

    pub async fn accept(&self) -> io::Result<UnixStream> {
        let (stream, _) = self.listener.accept().await?;
        tracing::trace!("Worker connected");
        Ok(stream)
    }
}

impl Drop for WorkerListener {
    fn drop(&mut self) {
        let result = match (&self.owned_dir, &self.socket_path) {
            (Some(dir), _) => std::fs::remove_dir_all(dir),
            (None, Some(path)) => std::fs::remove_file(path),
            (None, None) => Ok(()),
        };
        if let Err(e) = result
            && e.kind() != io::ErrorKind::NotFound
        {
            tracing::warn!(error = %e, "Failed to clean up worker socket");
        }
    }
}

/// Worker side: connect once.
pub async fn connect(addr: &IpcAddress) -> io::Result<UnixStream> {
    match addr {
        IpcAddress::Named { path } => UnixStream::connect(path).await,
        #[cfg(target_os = "linux")]
        IpcAddress::Abstract { name } => {
            use std::os::linux::net::SocketAddrExt;
            use std::os::unix::net::SocketAddr;

            let addr = SocketAddr::from_abstract_name(name.as_bytes())?;
            // tokio doesn't support abstract sockets directly
            let std_stream = std::os::unix::net::UnixStream::connect_addr(&addr)?;
            std_stream.set_nonblocking(true)?;
            UnixStream::from_std(std_stream)
        }
    }
}

/// Worker side: the proxy may still be starting, so keep trying until
/// `timeout` elapses.
pub async fn connect_with_retry(addr: &IpcAddress, timeout: Duration) -> io::Result<UnixStream> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        match connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) if tokio::time::Instant::now() >= deadline => {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("could not reach proxy at {} within {:?}: {}", addr, timeout, e),
                ));
            }
            Err(e) => {
                tracing::trace!(error = %e, address = %addr, "Proxy not reachable yet");
                tokio::time::sleep(CONNECT_RETRY_INTERVAL).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipc_address_roundtrips() {
        let addr = IpcAddress::named("/tmp/boxlet-123/workers.sock");
        let json = serde_json::to_string(&addr).unwrap();
        assert_eq!(json, r#"{"kind":"named","path":"/tmp/boxlet-123/workers.sock"}"#);
        assert_eq!(serde_json::from_str::<IpcAddress>(&json).unwrap(), addr);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn master_default_is_abstract_on_linux() {
        assert_eq!(
            IpcAddress::for_master(77),
            IpcAddress::Abstract {
                name: "boxlet-77".to_string()
            }
        );
        assert_eq!(IpcAddress::for_master(77).to_string(), "@boxlet-77");
    }

    #[tokio::test]
    async fn named_listener_accepts_and_cleans_up() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("nested");
        let addr = IpcAddress::named(dir.join("w.sock"));

        let listener = WorkerListener::bind(&addr).unwrap();
        let (accepted, connected) = tokio::join!(
            listener.accept(),
            connect_with_retry(&addr, Duration::from_secs(1))
        );
        accepted.unwrap();
        connected.unwrap();

        drop(listener);
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn connect_with_retry_waits_for_late_listener() {
        let tmp = tempfile::tempdir().unwrap();
        let addr = IpcAddress::named(tmp.path().join("late.sock"));

        let bind_addr = addr.clone();
        let server = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            let listener = WorkerListener::bind(&bind_addr).unwrap();
            listener.accept().await.unwrap();
        });

        connect_with_retry(&addr, Duration::from_secs(2)).await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn connect_with_retry_gives_up() {
        let tmp = tempfile::tempdir().unwrap();
        let addr = IpcAddress::named(tmp.path().join("nobody.sock"));
        let err = connect_with_retry(&addr, Duration::from_millis(120))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }
}
