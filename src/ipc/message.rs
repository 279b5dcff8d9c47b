//! Message types shared between client and server.
//!
//! The numeric values are the wire representation; they never change meaning
//! once assigned. A peer speaking a different protocol version answers the
//! identify burst with `Version`.

pub const PROTOCOL_VERSION: u32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MsgType {
    Version = 12,

    IdentifyFlags = 100,
    IdentifyTerm = 101,
    IdentifyTtyName = 102,
    IdentifyCwd = 103,
    IdentifyStdin = 104,
    IdentifyEnviron = 105,
    IdentifyClientPid = 106,
    IdentifyDone = 107,

    Command = 200,
    Detach = 201,
    DetachKill = 202,
    Exit = 203,
    Exited = 204,
    Exiting = 205,
    Lock = 206,
    Ready = 207,
    Resize = 208,
    Shell = 209,
    Shutdown = 210,
    Stderr = 211,
    Stdin = 212,
    Stdout = 213,
    Suspend = 214,
    Unlock = 215,
    Wakeup = 216,
    Exec = 217,
}

impl MsgType {
    /// Decode a wire value. Unknown values are not an error at the framing
    /// layer; dispatch ignores messages it does not understand.
    pub fn from_raw(raw: u32) -> Option<MsgType> {
        use MsgType::*;
        Some(match raw {
            12 => Version,
            100 => IdentifyFlags,
            101 => IdentifyTerm,
            102 => IdentifyTtyName,
            103 => IdentifyCwd,
            104 => IdentifyStdin,
            105 => IdentifyEnviron,
            106 => IdentifyClientPid,
            107 => IdentifyDone,
            200 => Command,
            201 => Detach,
            202 => DetachKill,
            203 => Exit,
            204 => Exited,
            205 => Exiting,
            206 => Lock,
            207 => Ready,
            208 => Resize,
            209 => Shell,
            210 => Shutdown,
            211 => Stderr,
            212 => Stdin,
            213 => Stdout,
            214 => Suspend,
            215 => Unlock,
            216 => Wakeup,
            217 => Exec,
            _ => return None,
        })
    }
}

/// Client mode bits carried in `IdentifyFlags`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientFlags(u32);

impl ClientFlags {
    /// Shell exec handoff prefixes argv0 with `-`.
    pub const LOGIN: ClientFlags = ClientFlags(0x1);
    /// Machine-readable control mode.
    pub const CONTROL: ClientFlags = ClientFlags(0x2);
    /// Control mode that also owns the terminal (raw mode, `%exit` banners).
    pub const CONTROL_CONTROL: ClientFlags = ClientFlags(0x4);

    pub fn empty() -> ClientFlags {
        ClientFlags(0)
    }

    pub fn contains(self, other: ClientFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: ClientFlags) {
        self.0 |= other.0;
    }

    pub fn bits(self) -> u32 {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn msg_type_wire_roundtrip() {
        for kind in [
            MsgType::Version,
            MsgType::IdentifyFlags,
            MsgType::IdentifyTerm,
            MsgType::IdentifyTtyName,
            MsgType::IdentifyCwd,
            MsgType::IdentifyStdin,
            MsgType::IdentifyEnviron,
            MsgType::IdentifyClientPid,
            MsgType::IdentifyDone,
            MsgType::Command,
            MsgType::Detach,
            MsgType::DetachKill,
            MsgType::Exit,
            MsgType::Exited,
            MsgType::Exiting,
            MsgType::Lock,
            MsgType::Ready,
            MsgType::Resize,
            MsgType::Shell,
            MsgType::Shutdown,
            MsgType::Stderr,
            MsgType::Stdin,
            MsgType::Stdout,
            MsgType::Suspend,
            MsgType::Unlock,
            MsgType::Wakeup,
            MsgType::Exec,
        ] {
            assert_eq!(MsgType::from_raw(kind as u32), Some(kind));
        }
    }

    #[test]
    fn unknown_wire_value() {
        assert_eq!(MsgType::from_raw(9999), None);
    }

    #[test]
    fn flags_bits() {
        let mut flags = ClientFlags::empty();
        assert!(!flags.contains(ClientFlags::LOGIN));
        flags.insert(ClientFlags::LOGIN);
        flags.insert(ClientFlags::CONTROL_CONTROL);
        assert!(flags.contains(ClientFlags::LOGIN));
        assert!(flags.contains(ClientFlags::CONTROL_CONTROL));
        assert!(!flags.contains(ClientFlags::CONTROL));
        assert_eq!(flags.bits(), 0x5);
    }
}
