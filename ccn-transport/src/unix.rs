//! The local-domain listener socket.
//!
//! Clients reach the forwarder over a file-system stream socket. The
//! socket path is derived from `CCN_LOCAL_PORT`: the default port uses
//! the bare name, any other port gets it as a suffix, so daemons bound
//! to different ports coexist under the same directory.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{info, warn};
use tokio::net::UnixListener;

/// Default datagram port, also the default socket-name suffix selector.
pub const DEFAULT_PORT: &str = "4485";

const SOCKET_DIR: &str = "/tmp";
const SOCKET_NAME: &str = "ccnd.sock";

/// How long to let a previous owner notice its socket is gone.
const PRIOR_OWNER_GRACE: Duration = Duration::from_secs(9);

/// Resolve the port string from the environment.
pub fn local_port() -> String {
    local_port_or(DEFAULT_PORT)
}

/// Like [`local_port`], falling back to a configured default instead
/// of the built-in one.
pub fn local_port_or(default: &str) -> String {
    std::env::var("CCN_LOCAL_PORT")
        .ok()
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| default.to_string())
}

/// Path of the listener socket for `port`.
pub fn socket_path(port: &str) -> PathBuf {
    let name = if port == DEFAULT_PORT {
        SOCKET_NAME.to_string()
    } else {
        format!("{SOCKET_NAME}.{port}")
    };
    Path::new(SOCKET_DIR).join(name)
}

/// Bind the listener, clearing a stale socket first. When a socket
/// file was present, the prior owner may still be running: removing
/// the file tells it to exit, and we wait out a grace period before
/// re-binding.
pub async fn bind_listener(path: &Path) -> io::Result<UnixListener> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            warn!(
                "removed existing socket {}; waiting for prior owner to exit",
                path.display()
            );
            tokio::time::sleep(PRIOR_OWNER_GRACE).await;
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    let listener = UnixListener::bind(path)?;
    info!("listening on {}", path.display());
    Ok(listener)
}

/// Unlink the socket path, ignoring a missing file.
pub fn remove_socket(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!("could not remove {}: {}", path.display(), e);
        }
    }
}
