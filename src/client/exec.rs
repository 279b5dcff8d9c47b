//! Post-loop handoff: exit banners and replacing the client with a shell.

use std::os::unix::process::CommandExt;
use std::process::Command;

use tracing::debug;

use crate::client::signals;
use crate::client::stdin::set_blocking;
use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    None,
    Detached,
    DetachedHup,
    LostTty,
    Terminated,
    LostServer,
    Exited,
    ServerExited,
}

/// Banner for an exit reason, or `None` when there is nothing to report.
pub fn exit_message(reason: ExitReason, session: Option<&str>) -> Option<String> {
    match reason {
        ExitReason::None => None,
        ExitReason::Detached => Some(match session {
            Some(name) => format!("detached (from session {name})"),
            None => "detached".into(),
        }),
        ExitReason::DetachedHup => Some(match session {
            Some(name) => format!("detached and SIGHUP (from session {name})"),
            None => "detached and SIGHUP".into(),
        }),
        ExitReason::LostTty => Some("lost tty".into()),
        ExitReason::Terminated => Some("terminated".into()),
        ExitReason::LostServer => Some("lost server".into()),
        ExitReason::Exited => Some("exited".into()),
        ExitReason::ServerExited => Some("server exited".into()),
    }
}

/// argv[0] for the execed shell: its basename, `-`-prefixed for login
/// shells. A trailing slash falls back to the whole path.
pub fn shell_argv0(shell: &str, login: bool) -> String {
    let name = match shell.rfind('/') {
        Some(idx) if idx + 1 < shell.len() => &shell[idx + 1..],
        _ => shell,
    };
    if login {
        format!("-{name}")
    } else {
        name.to_string()
    }
}

/// Replace the process image with `shell -c command`. Returns only on
/// failure, mirroring `Command::exec`.
pub fn exec_shell(shell: &str, command: &str, login: bool) -> Error {
    debug!("shell {shell}, command {command}");

    if let Err(e) = signals::reset_for_exec() {
        return e;
    }
    for fd in [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO] {
        let _ = set_blocking(fd, true);
    }

    // All descriptors above stderr are close-on-exec, so the shell inherits
    // only the standard streams.
    let err = Command::new(shell)
        .arg0(shell_argv0(shell, login))
        .arg("-c")
        .arg(command)
        .env("SHELL", shell)
        .exec();
    Error::Io(err)
}
