pub mod codec;
pub mod message;
pub mod transport;

use std::path::PathBuf;

use crate::error::Result;

pub fn socket_dir() -> PathBuf {
    let uid = nix::unistd::getuid();
    PathBuf::from(format!("/tmp/rmx-{uid}"))
}

/// Socket path for a named server under the per-user directory.
pub fn socket_path(name: &str) -> PathBuf {
    socket_dir().join(name)
}

pub fn ensure_socket_dir() -> Result<()> {
    let dir = socket_dir();
    std::fs::create_dir_all(&dir)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}
