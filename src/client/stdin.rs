//! Non-blocking reader on standard input.
//!
//! Forwarding is driven by server-side flow control: the pump starts paused
//! and the event loop enables it when the server asks for input. A read of
//! zero or a hard error produces a final frame with `size <= 0`, after which
//! the loop pauses the pump again.

use std::io;

use tokio::io::Interest;
use tokio::io::unix::AsyncFd;

use crate::error::Result;

const READ_SIZE: usize = 8192;

pub struct StdinPump {
    afd: AsyncFd<io::Stdin>,
}

/// One `Stdin` frame worth of input: the `read` result and the bytes.
pub struct StdinChunk {
    pub size: i64,
    pub data: Vec<u8>,
}

impl StdinChunk {
    /// Wire payload: native `i64` size followed by the bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(8 + self.data.len());
        payload.extend_from_slice(&self.size.to_ne_bytes());
        payload.extend_from_slice(&self.data);
        payload
    }
}

impl StdinPump {
    /// Put stdin into non-blocking mode and register it with the reactor.
    /// The caller restores blocking mode on the way out.
    pub fn new() -> Result<StdinPump> {
        set_blocking(libc::STDIN_FILENO, false)?;
        let afd = AsyncFd::with_interest(io::stdin(), Interest::READABLE)?;
        Ok(StdinPump { afd })
    }

    /// Wait until stdin is readable and read one chunk. Returns `None` for
    /// an interrupted or spurious wakeup. Cancel-safe: the read happens
    /// synchronously once readiness resolves.
    pub async fn read_chunk(&mut self) -> Result<Option<StdinChunk>> {
        let mut guard = self.afd.readable_mut().await?;
        let mut data = vec![0u8; READ_SIZE];
        let n = unsafe {
            libc::read(
                libc::STDIN_FILENO,
                data.as_mut_ptr() as *mut libc::c_void,
                data.len(),
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            return match err.raw_os_error() {
                Some(libc::EINTR) => Ok(None),
                Some(libc::EAGAIN) => {
                    guard.clear_ready();
                    Ok(None)
                }
                // Tell the server the terminal is gone.
                _ => Ok(Some(StdinChunk {
                    size: -1,
                    data: Vec::new(),
                })),
            };
        }
        data.truncate(n as usize);
        Ok(Some(StdinChunk {
            size: n as i64,
            data,
        }))
    }
}

pub fn set_blocking(fd: i32, blocking: bool) -> Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error().into());
    }
    let flags = if blocking {
        flags & !libc::O_NONBLOCK
    } else {
        flags | libc::O_NONBLOCK
    };
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags) } < 0 {
        return Err(io::Error::last_os_error().into());
    }
    Ok(())
}
