//! The identify burst: who we are, what our terminal looks like, and the
//! terminal itself.
//!
//! The server may start consuming fields as they arrive but does not promote
//! the client until `IdentifyDone`, so the order here is part of the
//! protocol.

use std::os::fd::{AsFd, FromRawFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;

use tracing::debug;

use crate::error::Result;
use crate::ipc::codec::{HEADER_SIZE, MAX_FRAME_SIZE};
use crate::ipc::message::{ClientFlags, MsgType};
use crate::ipc::transport::Peer;

pub async fn send(peer: &mut Peer, flags: ClientFlags, tty_name: &str, cwd: &str) -> Result<()> {
    debug!("sending identify messages");

    peer.send(MsgType::IdentifyFlags, &flags.bits().to_ne_bytes())
        .await?;

    let term = std::env::var("TERM").unwrap_or_default();
    peer.send(MsgType::IdentifyTerm, &nul_terminated(term.as_bytes()))
        .await?;
    peer.send(MsgType::IdentifyTtyName, &nul_terminated(tty_name.as_bytes()))
        .await?;
    peer.send(MsgType::IdentifyCwd, &nul_terminated(cwd.as_bytes()))
        .await?;

    // The server takes over the terminal through this duplicate; our copy
    // closes as soon as the frame is on the wire.
    let stdin = dup_stdin()?;
    peer.send_fd(MsgType::IdentifyStdin, &[], stdin.as_fd())
        .await?;
    drop(stdin);

    let pid = std::process::id() as i32;
    peer.send(MsgType::IdentifyClientPid, &pid.to_ne_bytes())
        .await?;

    for (key, value) in std::env::vars_os() {
        let mut entry = Vec::with_capacity(key.len() + value.len() + 2);
        entry.extend_from_slice(key.as_bytes());
        entry.push(b'=');
        entry.extend_from_slice(value.as_bytes());
        entry.push(0);
        if entry.len() > MAX_FRAME_SIZE - HEADER_SIZE {
            continue;
        }
        peer.send(MsgType::IdentifyEnviron, &entry).await?;
    }

    peer.send(MsgType::IdentifyDone, &[]).await?;
    Ok(())
}

fn dup_stdin() -> Result<OwnedFd> {
    let fd = unsafe { libc::dup(libc::STDIN_FILENO) };
    if fd < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn nul_terminated(bytes: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(bytes.len() + 1);
    buf.extend_from_slice(bytes);
    buf.push(0);
    buf
}

/// Working directory reported to the server: the real cwd when it can be
/// read, the home directory as a fallback, `/` as a last resort.
pub fn current_dir() -> String {
    if let Ok(cwd) = std::env::current_dir() {
        return cwd.to_string_lossy().into_owned();
    }
    if let Ok(home) = std::env::var("HOME") {
        if !home.is_empty() {
            return home;
        }
    }
    "/".into()
}
