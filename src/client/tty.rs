//! Terminal attribute handling for control mode.

use std::io;

use nix::sys::termios::{
    ControlFlags, InputFlags, LocalFlags, OutputFlags, SetArg, SpecialCharacterIndices, Termios,
    cfgetispeed, cfgetospeed, cfmakeraw, cfsetispeed, cfsetospeed, tcgetattr, tcsetattr,
};

use crate::error::Result;

/// Switch the terminal to the raw mode control clients expect and return the
/// previous attributes for the terminator to restore.
pub fn enter_control_mode() -> Result<Termios> {
    let stdin = io::stdin();
    let saved = tcgetattr(&stdin)?;

    let mut tio = saved.clone();
    cfmakeraw(&mut tio);
    tio.input_flags = InputFlags::ICRNL | InputFlags::IXANY;
    tio.output_flags = OutputFlags::OPOST | OutputFlags::ONLCR;
    tio.local_flags = LocalFlags::empty();
    tio.control_flags = ControlFlags::CREAD | ControlFlags::CS8 | ControlFlags::HUPCL;
    tio.control_chars[SpecialCharacterIndices::VMIN as usize] = 1;
    tio.control_chars[SpecialCharacterIndices::VTIME as usize] = 0;
    cfsetispeed(&mut tio, cfgetispeed(&saved))?;
    cfsetospeed(&mut tio, cfgetospeed(&saved))?;
    tcsetattr(&stdin, SetArg::TCSANOW, &tio)?;

    Ok(saved)
}

/// Restore saved attributes on standard output once the control stream has
/// been terminated.
pub fn restore(saved: &Termios) -> Result<()> {
    tcsetattr(&io::stdout(), SetArg::TCSAFLUSH, saved)?;
    Ok(())
}

/// Name of the controlling terminal, or the empty string when stdin is not a
/// tty.
pub fn tty_name() -> String {
    let mut buf = [0u8; 256];
    let rc = unsafe {
        libc::ttyname_r(
            libc::STDIN_FILENO,
            buf.as_mut_ptr() as *mut libc::c_char,
            buf.len(),
        )
    };
    if rc != 0 {
        return String::new();
    }
    let len = buf.iter().position(|&c| c == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..len]).into_owned()
}
