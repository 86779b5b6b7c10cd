//! Listening socket and acceptor loop
//!
//! Binds one listening socket per the configured transport flavor and
//! accepts peers forever, one at a time; when a connection dies the
//! acceptor waits for cleanup to finish and goes back to accepting, so a
//! disconnected peer can reconnect.

use crate::config::{DEFAULT_SOCKET_PATH, Transport};
use crate::connection::{Link, RemoteBackend};
use common::{Error, Result};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::TcpListener;
#[cfg(unix)]
use tokio::net::UnixListener;
use tracing::{debug, info, warn};

/// Listening socket for one backend instance
pub enum RemoteListener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener),
}

impl RemoteListener {
    /// Bind a listening socket for the given transport
    pub async fn bind(transport: &Transport) -> Result<Self> {
        match transport {
            Transport::Unix { path } => Self::bind_unix(path.as_deref()).await,
            Transport::Tcp { addr, port } => {
                let addr = SocketAddr::from((addr.unwrap_or(Ipv4Addr::UNSPECIFIED), *port));
                Self::bind_tcp(addr).await
            }
            Transport::Tcp6 { addr, port } => {
                let addr = SocketAddr::from((addr.unwrap_or(Ipv6Addr::UNSPECIFIED), *port));
                Self::bind_tcp(addr).await
            }
        }
    }

    async fn bind_tcp(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Transport(format!("Cannot bind {}: {}", addr, e)))?;
        info!("Listening on {}", addr);
        Ok(Self::Tcp(listener))
    }

    #[cfg(unix)]
    async fn bind_unix(path: Option<&std::path::Path>) -> Result<Self> {
        use std::os::unix::fs::PermissionsExt;

        let path = match path {
            Some(path) => path.to_path_buf(),
            None => {
                warn!(
                    "No socket path specified, using default (`{}`)",
                    DEFAULT_SOCKET_PATH
                );
                std::path::PathBuf::from(DEFAULT_SOCKET_PATH)
            }
        };

        check_socket_path(&path)?;

        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(Error::Transport(format!(
                    "unlink('{}') failed: {}",
                    path.display(),
                    e
                )));
            }
        }

        let listener = UnixListener::bind(&path)
            .map_err(|e| Error::Transport(format!("Cannot bind {}: {}", path.display(), e)))?;

        // World-accessible socket so the peer process need not share our uid.
        if let Err(e) =
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o666))
        {
            warn!("chmod('{}') failed: {}", path.display(), e);
        }

        info!("Listening on {}", path.display());
        Ok(Self::Unix(listener))
    }

    #[cfg(not(unix))]
    async fn bind_unix(_path: Option<&std::path::Path>) -> Result<Self> {
        Err(Error::Config(
            "UNIX sockets are not supported on this platform".to_string(),
        ))
    }

    /// Accept one peer connection
    pub async fn accept(&self) -> std::io::Result<Box<dyn Link>> {
        match self {
            Self::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                if let Err(e) = stream.set_nodelay(true) {
                    warn!("Failed to set nodelay for socket: {}", e);
                }
                debug!("Accepted connection from {}", peer);
                Ok(Box::new(stream))
            }
            #[cfg(unix)]
            Self::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                debug!("Accepted connection on unix socket");
                Ok(Box::new(stream))
            }
        }
    }

    /// Accept peers until the engine shuts down
    ///
    /// One peer at a time: after a connection dies, waits for its deferred
    /// cleanup to finish before accepting the next, so no state from the
    /// previous connection leaks into the new one.
    pub async fn serve(self, engine: Arc<RemoteBackend>) {
        loop {
            if engine.is_stopped() {
                break;
            }

            let stream = tokio::select! {
                result = self.accept() => match result {
                    Ok(stream) => stream,
                    Err(e) => {
                        warn!("Accept error: {}", e);
                        continue;
                    }
                },
                _ = engine.stop_requested() => break,
            };

            if let Err(e) = engine.attach_stream(stream).await {
                warn!("Rejecting connection: {}", e);
                continue;
            }

            engine.wait_closed().await;
        }

        info!("Acceptor stopped");
    }
}

/// Refuse to unlink an existing path that is not a socket
#[cfg(unix)]
fn check_socket_path(path: &std::path::Path) -> Result<()> {
    use nix::sys::stat::{SFlag, lstat};

    match lstat(path) {
        Ok(st) => {
            let kind = SFlag::from_bits_truncate(st.st_mode) & SFlag::S_IFMT;
            if kind != SFlag::S_IFSOCK {
                return Err(Error::Config(format!(
                    "Existing file at `{}` is not a socket",
                    path.display()
                )));
            }
            Ok(())
        }
        Err(nix::errno::Errno::ENOENT) => Ok(()),
        Err(e) => Err(Error::Io(e.into())),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_check_socket_path_rejects_regular_file() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("remote-usb-test-{}", std::process::id()));
        std::fs::write(&path, b"not a socket").unwrap();

        let result = check_socket_path(&path);
        assert!(matches!(result, Err(Error::Config(_))));

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_check_socket_path_accepts_missing() {
        let path = std::path::Path::new("/nonexistent/remote-usb-no-such-socket");
        assert!(check_socket_path(path).is_ok());
    }

    #[tokio::test]
    async fn test_bind_and_accept_unix() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("remote-usb-bind-{}.sock", std::process::id()));
        let _ = std::fs::remove_file(&path);

        let listener = RemoteListener::bind(&Transport::Unix {
            path: Some(path.clone()),
        })
        .await
        .unwrap();

        let client = tokio::net::UnixStream::connect(&path);
        let (accepted, connected) = tokio::join!(listener.accept(), client);
        assert!(accepted.is_ok());
        assert!(connected.is_ok());

        std::fs::remove_file(&path).unwrap();
    }
}
