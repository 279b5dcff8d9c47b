//! Socket bring-up: connect to the server, starting one if permitted.
//!
//! Concurrent clients racing a missing server serialize on an advisory lock
//! next to the socket, so at most one of them spawns a server; the rest wait
//! for the lock holder and then connect normally.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use tracing::debug;

use crate::error::{Error, Result};

/// Collaborator that brings up a fresh server and hands back a connected
/// socket. Called with the start lock held; the lock is released once the
/// returned stream is live.
pub trait ServerStart {
    fn start(&self, socket_path: &Path) -> io::Result<UnixStream>;
}

const START_RETRY_DELAYS_MS: [u64; 8] = [100, 200, 300, 400, 500, 500, 500, 500];

/// Default collaborator: spawn the configured server command detached and
/// poll the socket until it is accepting. The socket path is appended as the
/// command's final argument.
pub struct CommandStart {
    pub command: Vec<String>,
}

impl ServerStart for CommandStart {
    fn start(&self, socket_path: &Path) -> io::Result<UnixStream> {
        let Some((program, args)) = self.command.split_first() else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "server command is empty",
            ));
        };
        debug!("starting server: {}", self.command.join(" "));
        Command::new(program)
            .args(args)
            .arg(socket_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;
        // The command daemonizes itself; SIGCHLD is ignored before this
        // point so the intermediate process cannot linger as a zombie.
        for delay in START_RETRY_DELAYS_MS {
            std::thread::sleep(Duration::from_millis(delay));
            match UnixStream::connect(socket_path) {
                Ok(stream) => return Ok(stream),
                Err(e) => debug!("server not accepting yet: {e}"),
            }
        }
        Err(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            "server failed to start",
        ))
    }
}

enum StartLock {
    Acquired(Flock<File>),
    /// Another client holds the lock; we waited for it to finish.
    Contended,
    /// Lockfile unusable; start the server without one.
    Unavailable,
}

fn start_lock(lockfile: &Path) -> StartLock {
    debug!("lock file is {}", lockfile.display());

    let file = match OpenOptions::new()
        .write(true)
        .create(true)
        .mode(0o600)
        .open(lockfile)
    {
        Ok(file) => file,
        Err(e) => {
            debug!("open failed: {e}");
            return StartLock::Unavailable;
        }
    };

    match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
        Ok(lock) => {
            debug!("flock succeeded");
            StartLock::Acquired(lock)
        }
        Err((file, Errno::EWOULDBLOCK)) => {
            debug!("lock held, waiting");
            let mut file = file;
            loop {
                match Flock::lock(file, FlockArg::LockExclusive) {
                    Ok(lock) => {
                        drop(lock);
                        break;
                    }
                    Err((f, Errno::EINTR)) => file = f,
                    Err(_) => break,
                }
            }
            StartLock::Contended
        }
        Err((_, e)) => {
            debug!("flock failed: {e}");
            StartLock::Unavailable
        }
    }
}

fn check_path_len(path: &Path) -> Result<()> {
    // sun_path capacity varies by platform; leave room for the terminator.
    let max = std::mem::size_of::<libc::sockaddr_un>()
        - std::mem::size_of::<libc::sa_family_t>()
        - 1;
    if path.as_os_str().len() >= max {
        return Err(Error::Connect {
            path: path.to_path_buf(),
            source: io::Error::from_raw_os_error(libc::ENAMETOOLONG),
        });
    }
    Ok(())
}

/// Connect to the server socket at `path`, in non-blocking mode. When no
/// server is listening and `start_server` is set, take the start lock and
/// bring one up via `starter`.
pub fn connect(path: &Path, start_server: bool, starter: &dyn ServerStart) -> Result<UnixStream> {
    check_path_len(path)?;
    debug!("socket is {}", path.display());

    let lockfile = lockfile_path(path);
    let mut lock: Option<Flock<File>> = None;
    let mut locked = false;

    loop {
        debug!("trying connect");
        match UnixStream::connect(path) {
            Ok(stream) => {
                stream.set_nonblocking(true)?;
                return Ok(stream);
            }
            Err(e) => {
                debug!("connect failed: {e}");
                let refused = e.kind() == io::ErrorKind::ConnectionRefused;
                if !refused && e.kind() != io::ErrorKind::NotFound {
                    return Err(Error::Connect {
                        path: path.to_path_buf(),
                        source: e,
                    });
                }
                if !start_server {
                    if refused {
                        return Err(Error::NoServer(path.to_path_buf()));
                    }
                    return Err(Error::Connect {
                        path: path.to_path_buf(),
                        source: e,
                    });
                }
            }
        }

        if !locked {
            locked = true;
            match start_lock(&lockfile) {
                StartLock::Acquired(l) => lock = Some(l),
                StartLock::Contended => {
                    // The other client is starting the server; let it finish.
                    locked = false;
                }
                StartLock::Unavailable => {}
            }
            // Retry at least once even with the lock held: another client
            // may have started the server and released the lock between our
            // connect and our flock.
            continue;
        }

        if lock.is_some() {
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(Error::Connect {
                        path: path.to_path_buf(),
                        source: e,
                    });
                }
            }
        }

        let stream = starter.start(path).map_err(|e| Error::Connect {
            path: path.to_path_buf(),
            source: e,
        })?;
        stream.set_nonblocking(true)?;
        // Dropping the lock here releases waiting clients against a live
        // server.
        return Ok(stream);
    }
}

fn lockfile_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".lock");
    PathBuf::from(name)
}
