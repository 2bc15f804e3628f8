//! Single-instance control socket
//!
//! The control channel is a Unix domain socket. A crashed daemon leaves the
//! socket file behind with nobody listening, so startup runs a small state
//! machine over the path:
//!
//! ```text
//! Unbound -> ConnectExisting -> Conflict          (someone answered)
//!                            -> Reclaim -> Unbound (stale file, once)
//! Unbound -> Bound
//! ```

use crate::error::{Error, Result};
use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, warn};

/// States of the socket acquisition protocol
#[derive(Debug)]
pub enum SocketState {
    /// Nothing bound yet. `reclaimed` is set once a stale file was removed.
    Unbound { reclaimed: bool },
    /// A file exists at the path, find out whether anyone serves it
    ConnectExisting { reclaimed: bool },
    /// The existing file is orphaned and must be removed
    Reclaim,
    /// Listening on the path
    Bound(UnixListener),
}

impl SocketState {
    /// Advance one transition. `Bound` is terminal and returned unchanged.
    pub async fn step(self, path: &Path) -> Result<SocketState> {
        match self {
            SocketState::Unbound { reclaimed } => match std::fs::symlink_metadata(path) {
                Ok(_) => Ok(SocketState::ConnectExisting { reclaimed }),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    let listener = UnixListener::bind(path).map_err(|e| {
                        Error::Startup(format!("failed to listen on {}: {}", path.display(), e))
                    })?;
                    Ok(SocketState::Bound(listener))
                }
                Err(e) => Err(Error::Startup(format!(
                    "failed to inspect {}: {}",
                    path.display(),
                    e
                ))),
            },

            SocketState::ConnectExisting { reclaimed } => {
                let metadata = std::fs::symlink_metadata(path)?;
                if !metadata.file_type().is_socket() {
                    return Err(Error::Startup(format!(
                        "{} exists and is not a socket",
                        path.display()
                    )));
                }

                match UnixStream::connect(path).await {
                    Ok(_) => Err(Error::AlreadyRunning(path.to_path_buf())),
                    Err(e) if reclaimed => Err(Error::Startup(format!(
                        "stale socket {} reappeared after removal: {}",
                        path.display(),
                        e
                    ))),
                    Err(e) => {
                        debug!("Connect to {} failed: {}", path.display(), e);
                        Ok(SocketState::Reclaim)
                    }
                }
            }

            SocketState::Reclaim => {
                warn!("Removing stale socket: {}", path.display());
                std::fs::remove_file(path).map_err(|e| {
                    Error::Startup(format!(
                        "failed to remove stale socket {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                Ok(SocketState::Unbound { reclaimed: true })
            }

            bound @ SocketState::Bound(_) => Ok(bound),
        }
    }
}

/// The daemon's bound control socket
///
/// Dropping it removes the socket file, provided the file on disk is still
/// the one this instance created.
#[derive(Debug)]
pub struct ControlSocket {
    listener: UnixListener,
    path: PathBuf,
    /// Device and inode of the socket file this instance bound
    dev_ino: (u64, u64),
}

impl ControlSocket {
    /// Acquire the control socket at `path`, reclaiming a stale one
    pub async fn prepare<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    Error::Startup(format!("failed to create {}: {}", parent.display(), e))
                })?;
            }
        }

        let mut state = SocketState::Unbound { reclaimed: false };
        let listener = loop {
            match state.step(path).await? {
                SocketState::Bound(listener) => break listener,
                next => state = next,
            }
        };

        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).map_err(|e| {
            Error::Startup(format!("failed to restrict {}: {}", path.display(), e))
        })?;

        let metadata = std::fs::symlink_metadata(path)?;
        info!("Control socket listening on {}", path.display());

        Ok(Self {
            listener,
            path: path.to_path_buf(),
            dev_ino: (metadata.dev(), metadata.ino()),
        })
    }

    /// Accept the next control connection
    pub async fn accept(&self) -> std::io::Result<UnixStream> {
        let (stream, _) = self.listener.accept().await?;
        Ok(stream)
    }

    /// Socket path
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ControlSocket {
    fn drop(&mut self) {
        if let Ok(metadata) = std::fs::symlink_metadata(&self.path) {
            if (metadata.dev(), metadata.ino()) == self.dev_ino {
                let _ = std::fs::remove_file(&self.path);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_bind_fresh_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("proxyd.sock");

        let socket = ControlSocket::prepare(&path).await.unwrap();
        assert_eq!(socket.path(), path.as_path());

        let metadata = std::fs::symlink_metadata(&path).unwrap();
        assert!(metadata.file_type().is_socket());
        assert_eq!(metadata.permissions().mode() & 0o777, 0o600);
    }

    #[tokio::test]
    async fn test_live_socket_is_a_conflict() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("proxyd.sock");

        let _first = ControlSocket::prepare(&path).await.unwrap();
        let second = ControlSocket::prepare(&path).await;

        assert!(matches!(second, Err(Error::AlreadyRunning(_))));
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_stale_socket_is_reclaimed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("proxyd.sock");

        // A std listener dropped without unlinking leaves an orphaned file
        drop(std::os::unix::net::UnixListener::bind(&path).unwrap());
        assert!(path.exists());

        let socket = ControlSocket::prepare(&path).await.unwrap();
        let client = UnixStream::connect(&path).await;
        assert!(client.is_ok());
        drop(socket);
    }

    #[tokio::test]
    async fn test_state_machine_transitions() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("proxyd.sock");
        drop(std::os::unix::net::UnixListener::bind(&path).unwrap());

        let state = SocketState::Unbound { reclaimed: false }.step(&path).await.unwrap();
        assert!(matches!(state, SocketState::ConnectExisting { reclaimed: false }));

        let state = state.step(&path).await.unwrap();
        assert!(matches!(state, SocketState::Reclaim));

        let state = state.step(&path).await.unwrap();
        assert!(matches!(state, SocketState::Unbound { reclaimed: true }));
        assert!(!path.exists());

        let state = state.step(&path).await.unwrap();
        assert!(matches!(state, SocketState::Bound(_)));
    }

    #[tokio::test]
    async fn test_stale_socket_after_reclaim_is_fatal() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("proxyd.sock");
        drop(std::os::unix::net::UnixListener::bind(&path).unwrap());

        let state = SocketState::ConnectExisting { reclaimed: true }.step(&path).await;
        assert!(matches!(state, Err(Error::Startup(_))));
    }

    #[tokio::test]
    async fn test_regular_file_is_not_removed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("proxyd.sock");
        std::fs::write(&path, b"not a socket").unwrap();

        let result = ControlSocket::prepare(&path).await;
        assert!(matches!(result, Err(Error::Startup(_))));
        assert_eq!(std::fs::read(&path).unwrap(), b"not a socket");
    }

    #[tokio::test]
    async fn test_drop_removes_socket_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("proxyd.sock");

        let socket = ControlSocket::prepare(&path).await.unwrap();
        drop(socket);
        assert!(!path.exists());

        // Next start takes the clean path
        let _socket = ControlSocket::prepare(&path).await.unwrap();
    }

    #[tokio::test]
    async fn test_drop_leaves_newer_socket_alone() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("proxyd.sock");

        let old = ControlSocket::prepare(&path).await.unwrap();
        // Keep the old file alive elsewhere so the new one gets its own inode
        std::fs::rename(&path, dir.path().join("moved.sock")).unwrap();
        let _new = ControlSocket::prepare(&path).await.unwrap();

        drop(old);
        assert!(path.exists());
    }
}
