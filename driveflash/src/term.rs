#[cfg(unix)]
use libc::ECHOCTL;
#[cfg(unix)]
use std::io::{IsTerminal, stdout};
#[cfg(unix)]
use std::os::unix::io::AsRawFd;
#[cfg(unix)]
use std::sync::OnceLock;
#[cfg(unix)]
use termios::{TCSANOW, Termios, tcsetattr};

/// Terminal settings in effect before [`EchoGuard::new`] changed them.
#[cfg(unix)]
static SAVED: OnceLock<Termios> = OnceLock::new();

/// Hides the `^C` echo while a job runs, so a cancelled write ends with our own message
/// rather than a stray control character. The previous terminal state returns on drop.
pub struct EchoGuard(());

impl EchoGuard {
    #[cfg(unix)]
    pub fn new() -> Self {
        let fd = stdout().as_raw_fd();
        if !stdout().is_terminal() {
            return Self(());
        }

        if let Ok(original) = Termios::from_fd(fd) {
            let mut quiet = original;
            quiet.c_lflag &= !ECHOCTL;
            if tcsetattr(fd, TCSANOW, &quiet).is_ok() {
                let _ = SAVED.set(original);
            }
        }
        Self(())
    }

    #[cfg(not(unix))]
    pub fn new() -> Self {
        Self(())
    }
}

impl Drop for EchoGuard {
    fn drop(&mut self) {
        restore();
    }
}

/// Puts the terminal back the way [`EchoGuard::new`] found it. Safe to call more than
/// once, and from the Ctrl+C handler before the process exits.
pub fn restore() {
    #[cfg(unix)]
    if let Some(saved) = SAVED.get() {
        tcsetattr(stdout().as_raw_fd(), TCSANOW, saved).ok();
    }
}
