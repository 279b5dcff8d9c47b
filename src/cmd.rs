//! Command-line multiplexer commands.
//!
//! The client only needs enough of the command table to answer one question
//! before the server exists: does this invocation require starting a server?
//! Full parsing and execution happen server-side; the client ships the raw
//! argv in a `Command` frame.

use crate::error::{Error, Result};
use crate::ipc::codec::{HEADER_SIZE, MAX_FRAME_SIZE};

const START_SERVER: u32 = 0x1;

struct CmdEntry {
    name: &'static str,
    alias: Option<&'static str>,
    flags: u32,
}

static CMD_TABLE: &[CmdEntry] = &[
    CmdEntry { name: "attach-session", alias: Some("attach"), flags: 0 },
    CmdEntry { name: "detach-client", alias: Some("detach"), flags: 0 },
    CmdEntry { name: "has-session", alias: Some("has"), flags: 0 },
    CmdEntry { name: "kill-server", alias: None, flags: 0 },
    CmdEntry { name: "kill-session", alias: None, flags: 0 },
    CmdEntry { name: "list-clients", alias: Some("lsc"), flags: 0 },
    CmdEntry { name: "list-sessions", alias: Some("ls"), flags: 0 },
    CmdEntry { name: "lock-client", alias: Some("lockc"), flags: 0 },
    CmdEntry { name: "new-session", alias: Some("new"), flags: START_SERVER },
    CmdEntry { name: "refresh-client", alias: Some("refresh"), flags: 0 },
    CmdEntry { name: "rename-session", alias: Some("rename"), flags: 0 },
    CmdEntry { name: "send-keys", alias: Some("send"), flags: 0 },
    CmdEntry { name: "source-file", alias: Some("source"), flags: 0 },
    CmdEntry { name: "start-server", alias: Some("start"), flags: START_SERVER },
    CmdEntry { name: "switch-client", alias: Some("switchc"), flags: 0 },
];

#[derive(Debug)]
pub struct Command {
    pub name: &'static str,
    pub args: Vec<String>,
    flags: u32,
}

#[derive(Debug)]
pub struct CommandList {
    pub commands: Vec<Command>,
}

impl CommandList {
    pub fn wants_server_start(&self) -> bool {
        self.commands.iter().any(|c| c.flags & START_SERVER != 0)
    }
}

fn lookup(word: &str) -> std::result::Result<&'static CmdEntry, String> {
    if let Some(entry) = CMD_TABLE
        .iter()
        .find(|e| e.name == word || e.alias == Some(word))
    {
        return Ok(entry);
    }
    let matches: Vec<&CmdEntry> = CMD_TABLE
        .iter()
        .filter(|e| e.name.starts_with(word))
        .collect();
    match matches.len() {
        0 => Err(format!("unknown command: {word}")),
        1 => Ok(matches[0]),
        _ => Err(format!("ambiguous command: {word}")),
    }
}

/// Resolve argv into a command list, splitting on `;`. The error is a
/// user-readable cause string, printed verbatim by the caller.
pub fn parse(argv: &[String]) -> std::result::Result<CommandList, String> {
    let mut commands = Vec::new();
    for group in argv.split(|word| word == ";") {
        let Some((first, rest)) = group.split_first() else {
            return Err("empty command".into());
        };
        let entry = lookup(first)?;
        commands.push(Command {
            name: entry.name,
            args: rest.to_vec(),
            flags: entry.flags,
        });
    }
    Ok(CommandList { commands })
}

/// Pack argv for the wire: `argc` followed by NUL-terminated strings.
pub fn pack(argv: &[String]) -> Result<Vec<u8>> {
    let size: usize = 4 + argv.iter().map(|a| a.len() + 1).sum::<usize>();
    if size > MAX_FRAME_SIZE - HEADER_SIZE {
        return Err(Error::Command("command too long".into()));
    }
    let mut buf = Vec::with_capacity(size);
    buf.extend_from_slice(&(argv.len() as u32).to_ne_bytes());
    for arg in argv {
        buf.extend_from_slice(arg.as_bytes());
        buf.push(0);
    }
    Ok(buf)
}
