//! The client proper: bring-up, identify handshake, event loop, dispatch,
//! and teardown.
//!
//! One `Client` owns everything for the lifetime of the process: the framed
//! channel to the server, the signal bridge, the stdin pump, and the exit
//! bookkeeping that decides what happens after the loop stops.

pub mod bringup;
pub mod exec;
pub mod identify;
pub mod signals;
pub mod stdin;
pub mod tty;

use std::io;
use std::path::PathBuf;

use nix::sys::termios::Termios;
use tracing::debug;

use crate::client::bringup::ServerStart;
use crate::client::exec::ExitReason;
use crate::client::signals::{SignalBridge, SignalEvent};
use crate::client::stdin::{StdinChunk, StdinPump};
use crate::cmd;
use crate::error::{Error, Result};
use crate::ipc::codec::Frame;
use crate::ipc::message::{ClientFlags, MsgType, PROTOCOL_VERSION};
use crate::ipc::transport::Peer;

pub struct ClientOptions {
    pub socket_path: PathBuf,
    pub flags: ClientFlags,
    /// `-c` argument; asks the server for a shell instead of running
    /// multiplexer commands.
    pub shell_command: Option<String>,
    /// Raw multiplexer command words, empty for the default command.
    pub command: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Wait,
    Attached,
    Exiting,
}

/// Last terminal message kind from the server; selects the post-loop action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExitType {
    None,
    Detach,
    DetachKill,
    Exec,
}

struct Client {
    peer: Peer,
    signals: SignalBridge,
    stdin: Option<StdinPump>,
    stdin_enabled: bool,
    flags: ClientFlags,
    shell_command: Option<String>,
    state: State,
    was_attached: bool,
    exit_reason: ExitReason,
    exit_code: i32,
    exit_type: ExitType,
    exit_session: Option<String>,
    exec_shell: Option<String>,
    exec_command: Option<String>,
    saved_tty: Option<Termios>,
}

/// Run the client against the server socket at `opts.socket_path` and return
/// the process exit code. Replaces the process image instead of returning
/// when the server hands off to a shell.
pub async fn run(opts: ClientOptions, starter: &dyn ServerStart) -> Result<i32> {
    // Before anything can fork: a daemonizing server start must not leave a
    // zombie behind.
    signals::ignore_sigchld()?;

    let (send_shell, start_server) = if opts.shell_command.is_some() {
        (true, true)
    } else if opts.command.is_empty() {
        (false, true)
    } else {
        let list = cmd::parse(&opts.command).map_err(Error::Command)?;
        (false, list.wants_server_start())
    };

    let signals = SignalBridge::new()?;

    let stream = bringup::connect(&opts.socket_path, start_server, starter)?;
    let mut peer = Peer::from_std(stream)?;

    let cwd = identify::current_dir();
    let tty_name = tty::tty_name();

    let stdin = match StdinPump::new() {
        Ok(pump) => Some(pump),
        Err(e) => {
            debug!("stdin unavailable: {e}");
            None
        }
    };

    let saved_tty = if opts.flags.contains(ClientFlags::CONTROL_CONTROL) {
        Some(tty::enter_control_mode()?)
    } else {
        None
    };

    identify::send(&mut peer, opts.flags, &tty_name, &cwd).await?;

    if send_shell {
        peer.send(MsgType::Shell, &[]).await?;
    } else {
        peer.send(MsgType::Command, &cmd::pack(&opts.command)?)
            .await?;
    }

    let mut client = Client {
        peer,
        signals,
        stdin,
        stdin_enabled: false,
        flags: opts.flags,
        shell_command: opts.shell_command,
        state: State::Wait,
        was_attached: false,
        exit_reason: ExitReason::None,
        exit_code: 0,
        exit_type: ExitType::None,
        exit_session: None,
        exec_shell: None,
        exec_command: None,
        saved_tty,
    };
    client.run_loop().await?;
    client.finish()
}

enum Event {
    Frame(Option<Frame>),
    Signal(SignalEvent),
    Stdin(Option<StdinChunk>),
}

async fn stdin_wait(pump: &mut Option<StdinPump>, enabled: bool) -> Result<Option<StdinChunk>> {
    match pump {
        Some(pump) if enabled => pump.read_chunk().await,
        _ => std::future::pending().await,
    }
}

impl Client {
    async fn run_loop(&mut self) -> Result<()> {
        while self.state != State::Exiting {
            let event = tokio::select! {
                frame = self.peer.recv() => Event::Frame(frame?),
                sig = self.signals.recv() => Event::Signal(sig),
                chunk = stdin_wait(&mut self.stdin, self.stdin_enabled) => Event::Stdin(chunk?),
            };
            match event {
                Event::Frame(Some(frame)) => self.dispatch(frame).await?,
                Event::Frame(None) => {
                    debug!("server closed the channel");
                    self.exit_reason = ExitReason::LostServer;
                    self.exit_code = 1;
                    self.state = State::Exiting;
                }
                Event::Signal(sig) => self.on_signal(sig).await?,
                Event::Stdin(Some(chunk)) => {
                    let eof = chunk.size <= 0;
                    self.peer.send(MsgType::Stdin, &chunk.encode()).await?;
                    if eof {
                        self.stdin_enabled = false;
                    }
                }
                Event::Stdin(None) => {}
            }
        }
        Ok(())
    }

    async fn dispatch(&mut self, frame: Frame) -> Result<()> {
        match self.state {
            State::Wait => self.dispatch_wait(frame).await,
            State::Attached => self.dispatch_attached(frame).await,
            State::Exiting => Ok(()),
        }
    }

    /// Messages accepted before the server promotes us with `Ready`.
    async fn dispatch_wait(&mut self, frame: Frame) -> Result<()> {
        match MsgType::from_raw(frame.kind) {
            Some(MsgType::Exit) | Some(MsgType::Shutdown) => {
                if let Some(code) = exit_code_payload(&frame.payload, "Exit")? {
                    self.exit_code = code;
                }
                self.state = State::Exiting;
            }
            Some(MsgType::Ready) => {
                expect_empty(&frame, "Ready")?;
                self.stdin_enabled = false;
                self.state = State::Attached;
                self.was_attached = true;
                self.peer.send(MsgType::Resize, &[]).await?;
            }
            Some(MsgType::Stdin) => {
                expect_empty(&frame, "Stdin")?;
                self.stdin_enabled = true;
            }
            Some(MsgType::Stdout) => {
                let data = stdio_payload(&frame.payload, "Stdout")?;
                write_retry(libc::STDOUT_FILENO, data);
            }
            Some(MsgType::Stderr) => {
                let data = stdio_payload(&frame.payload, "Stderr")?;
                write_retry(libc::STDERR_FILENO, data);
            }
            Some(MsgType::Version) => {
                expect_empty(&frame, "Version")?;
                eprintln!(
                    "protocol version mismatch (client {}, server {})",
                    PROTOCOL_VERSION,
                    frame.peer_id & 0xff
                );
                self.exit_code = 1;
                self.state = State::Exiting;
            }
            Some(MsgType::Shell) => {
                let shell = string_payload(&frame.payload, "Shell")?;
                let Some(command) = self.shell_command.clone() else {
                    return Err(Error::Protocol("Shell without a shell command".into()));
                };
                let login = self.flags.contains(ClientFlags::LOGIN);
                return Err(exec::exec_shell(&shell, &command, login));
            }
            Some(MsgType::Detach) | Some(MsgType::DetachKill) => {
                self.peer.send(MsgType::Exiting, &[]).await?;
            }
            Some(MsgType::Exited) => {
                self.state = State::Exiting;
            }
            _ => {}
        }
        Ok(())
    }

    /// Messages accepted while relaying terminal I/O for a live session.
    async fn dispatch_attached(&mut self, frame: Frame) -> Result<()> {
        match MsgType::from_raw(frame.kind) {
            Some(kind @ (MsgType::Detach | MsgType::DetachKill)) => {
                self.exit_session = Some(string_payload(&frame.payload, "Detach")?);
                if kind == MsgType::DetachKill {
                    self.exit_type = ExitType::DetachKill;
                    self.exit_reason = ExitReason::DetachedHup;
                } else {
                    self.exit_type = ExitType::Detach;
                    self.exit_reason = ExitReason::Detached;
                }
                self.peer.send(MsgType::Exiting, &[]).await?;
            }
            Some(MsgType::Exec) => {
                let (command, shell) = exec_payload(&frame.payload)?;
                self.exec_command = Some(command);
                self.exec_shell = Some(shell);
                self.exit_type = ExitType::Exec;
                self.peer.send(MsgType::Exiting, &[]).await?;
            }
            Some(MsgType::Exit) => {
                // Size check only; the attached path never applies the code.
                exit_code_payload(&frame.payload, "Exit")?;
                self.peer.send(MsgType::Exiting, &[]).await?;
                self.exit_reason = ExitReason::Exited;
            }
            Some(MsgType::Exited) => {
                expect_empty(&frame, "Exited")?;
                self.state = State::Exiting;
            }
            Some(MsgType::Shutdown) => {
                expect_empty(&frame, "Shutdown")?;
                self.peer.send(MsgType::Exiting, &[]).await?;
                self.exit_reason = ExitReason::ServerExited;
                self.exit_code = 1;
            }
            Some(MsgType::Suspend) => {
                expect_empty(&frame, "Suspend")?;
                signals::suspend_self()?;
            }
            Some(MsgType::Lock) => {
                let command = string_payload(&frame.payload, "Lock")?;
                // Deliberately synchronous; the terminal is locked anyway.
                let _ = std::process::Command::new("sh")
                    .arg("-c")
                    .arg(&command)
                    .status();
                self.peer.send(MsgType::Unlock, &[]).await?;
            }
            _ => {}
        }
        Ok(())
    }

    async fn on_signal(&mut self, sig: SignalEvent) -> Result<()> {
        if sig == SignalEvent::Child {
            signals::reap_children();
            return Ok(());
        }
        if self.state != State::Attached {
            if sig == SignalEvent::Terminate {
                self.state = State::Exiting;
            }
            return Ok(());
        }
        match sig {
            SignalEvent::Hangup => {
                self.exit_reason = ExitReason::LostTty;
                self.exit_code = 1;
                self.peer.send(MsgType::Exiting, &[]).await?;
            }
            SignalEvent::Terminate => {
                self.exit_reason = ExitReason::Terminated;
                self.exit_code = 1;
                self.peer.send(MsgType::Exiting, &[]).await?;
            }
            SignalEvent::WindowChange => {
                self.peer.send(MsgType::Resize, &[]).await?;
            }
            SignalEvent::Continue => {
                signals::ignore_tstp()?;
                self.peer.send(MsgType::Wakeup, &[]).await?;
            }
            SignalEvent::Child => {}
        }
        Ok(())
    }

    /// Post-loop teardown: exec handoff, banner, parent SIGHUP, terminal
    /// restore. Consumes the client; the channel closes here.
    fn finish(self) -> Result<i32> {
        if self.exit_type == ExitType::Exec {
            if let (Some(shell), Some(command)) = (&self.exec_shell, &self.exec_command) {
                let login = self.flags.contains(ClientFlags::LOGIN);
                return Err(exec::exec_shell(shell, command, login));
            }
        }

        let banner = exec::exit_message(self.exit_reason, self.exit_session.as_deref());
        if self.was_attached {
            if let Some(msg) = &banner {
                println!("[{msg}]");
            }
            if self.exit_type == ExitType::DetachKill {
                signals::hangup_parent();
            }
        } else if self.flags.contains(ClientFlags::CONTROL_CONTROL) {
            match &banner {
                Some(msg) => println!("%exit {msg}"),
                None => println!("%exit"),
            }
            print!("\x1b\\");
            let _ = io::Write::flush(&mut io::stdout());
            if let Some(saved) = &self.saved_tty {
                tty::restore(saved)?;
            }
        } else if let Some(msg) = &banner {
            eprintln!("{msg}");
        }

        let _ = stdin::set_blocking(libc::STDIN_FILENO, true);
        Ok(self.exit_code)
    }
}

fn expect_empty(frame: &Frame, what: &str) -> Result<()> {
    if frame.payload.is_empty() {
        Ok(())
    } else {
        Err(Error::Protocol(format!("bad {what} size")))
    }
}

/// NUL-terminated string payload; bytes past the first NUL are ignored.
fn string_payload(payload: &[u8], what: &str) -> Result<String> {
    if payload.is_empty() || *payload.last().unwrap() != 0 {
        return Err(Error::Protocol(format!("bad {what} string")));
    }
    let end = payload.iter().position(|&b| b == 0).unwrap();
    Ok(String::from_utf8_lossy(&payload[..end]).into_owned())
}

/// Optional native `i32` exit code.
fn exit_code_payload(payload: &[u8], what: &str) -> Result<Option<i32>> {
    match payload.len() {
        0 => Ok(None),
        4 => Ok(Some(i32::from_ne_bytes(payload.try_into().unwrap()))),
        _ => Err(Error::Protocol(format!("bad {what} size"))),
    }
}

/// `i64` length followed by exactly that many bytes.
fn stdio_payload<'a>(payload: &'a [u8], what: &str) -> Result<&'a [u8]> {
    if payload.len() >= 8 {
        let size = i64::from_ne_bytes(payload[..8].try_into().unwrap());
        if size >= 0 && payload.len() - 8 == size as usize {
            return Ok(&payload[8..]);
        }
    }
    Err(Error::Protocol(format!("bad {what} size")))
}

/// Two NUL-terminated strings back to back: the command, then the shell. A
/// payload holding a single string is rejected.
fn exec_payload(payload: &[u8]) -> Result<(String, String)> {
    let bad = || Error::Protocol("bad Exec string".into());
    if payload.is_empty() || *payload.last().unwrap() != 0 {
        return Err(bad());
    }
    let first_end = payload.iter().position(|&b| b == 0).unwrap();
    if first_end == payload.len() - 1 {
        return Err(bad());
    }
    let command = String::from_utf8_lossy(&payload[..first_end]).into_owned();
    let rest = &payload[first_end + 1..];
    let shell_end = rest.iter().position(|&b| b == 0).unwrap();
    let shell = String::from_utf8_lossy(&rest[..shell_end]).into_owned();
    Ok((command, shell))
}

/// Push bytes at the terminal, riding out interrupts and short writes. Other
/// errors mean the terminal is gone; there is nobody left to tell.
fn write_retry(fd: i32, data: &[u8]) {
    let mut off = 0;
    while off < data.len() {
        let n = unsafe {
            libc::write(
                fd,
                data[off..].as_ptr() as *const libc::c_void,
                data.len() - off,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) | Some(libc::EAGAIN) => continue,
                _ => break,
            }
        }
        off += n as usize;
    }
}
