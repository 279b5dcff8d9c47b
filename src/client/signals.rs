//! Signal handling for the client.
//!
//! The OS-level handlers only feed the tokio signal streams; every visible
//! effect (exit bookkeeping, outgoing frames) happens on the event loop when
//! [`SignalBridge::recv`] surfaces a [`SignalEvent`].

use nix::sys::signal::{
    SaFlags, SigAction, SigHandler, SigSet, Signal, kill, raise, sigaction, signal,
};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use tokio::signal::unix::{Signal as SignalStream, SignalKind};

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalEvent {
    Child,
    Terminate,
    Hangup,
    WindowChange,
    Continue,
}

pub struct SignalBridge {
    child: SignalStream,
    term: SignalStream,
    hup: SignalStream,
    winch: SignalStream,
    cont: SignalStream,
}

impl SignalBridge {
    pub fn new() -> Result<SignalBridge> {
        Ok(SignalBridge {
            child: tokio::signal::unix::signal(SignalKind::child())?,
            term: tokio::signal::unix::signal(SignalKind::terminate())?,
            hup: tokio::signal::unix::signal(SignalKind::hangup())?,
            winch: tokio::signal::unix::signal(SignalKind::window_change())?,
            cont: tokio::signal::unix::signal(SignalKind::from_raw(libc::SIGCONT))?,
        })
    }

    /// Wait for the next signal of interest. Cancel-safe.
    pub async fn recv(&mut self) -> SignalEvent {
        tokio::select! {
            Some(_) = self.child.recv() => SignalEvent::Child,
            Some(_) = self.term.recv() => SignalEvent::Terminate,
            Some(_) = self.hup.recv() => SignalEvent::Hangup,
            Some(_) = self.winch.recv() => SignalEvent::WindowChange,
            Some(_) = self.cont.recv() => SignalEvent::Continue,
        }
    }
}

/// Ignore SIGCHLD before anything forks, so a daemonizing server start
/// cannot leave a zombie behind.
pub fn ignore_sigchld() -> Result<()> {
    unsafe { signal(Signal::SIGCHLD, SigHandler::SigIgn) }?;
    Ok(())
}

/// Reap any exited children without blocking.
pub fn reap_children() {
    loop {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) | Err(_) => break,
            Ok(_) => {}
        }
    }
}

fn set_tstp_handler(handler: SigHandler) -> Result<()> {
    let action = SigAction::new(handler, SaFlags::SA_RESTART, SigSet::empty());
    unsafe { sigaction(Signal::SIGTSTP, &action) }?;
    Ok(())
}

/// On SIGCONT: go back to ignoring the stop signal and let the loop tell the
/// server we are awake.
pub fn ignore_tstp() -> Result<()> {
    set_tstp_handler(SigHandler::SigIgn)
}

/// Server-requested suspend: restore the default stop disposition and stop
/// ourselves. Execution resumes here after SIGCONT.
pub fn suspend_self() -> Result<()> {
    set_tstp_handler(SigHandler::SigDfl)?;
    raise(Signal::SIGTSTP)?;
    Ok(())
}

/// Put dispositions back to default before replacing the process image; an
/// ignored disposition would survive the exec.
pub fn reset_for_exec() -> Result<()> {
    unsafe { signal(Signal::SIGCHLD, SigHandler::SigDfl) }?;
    set_tstp_handler(SigHandler::SigDfl)?;
    Ok(())
}

pub fn hangup_parent() {
    let ppid = nix::unistd::getppid();
    if ppid.as_raw() > 1 {
        let _ = kill(ppid, Signal::SIGHUP);
    }
}
