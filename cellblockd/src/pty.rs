//! Pseudo-terminal allocation and spawning children as session leaders on
//! the slave side.

use std::fs::File;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};

use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use nix::pty::{openpty, Winsize};
use nix::sys::termios::{self, ControlFlags, InputFlags, LocalFlags, OutputFlags, SetArg, Termios};
use nix::unistd::{setsid, ttyname};

use cellblock_common::protocol::{TerminalModes, WindowSize};

pub struct PtyPair {
    pub master: File,
    pub slave: File,
    pub name: String,
}

pub fn open_pty() -> io::Result<PtyPair> {
    let pty = openpty(None::<&Winsize>, None::<&Termios>)?;
    set_cloexec(pty.master.as_fd())?;
    set_cloexec(pty.slave.as_fd())?;
    let name = ttyname(&pty.slave)?.to_string_lossy().into_owned();
    Ok(PtyPair {
        master: File::from(pty.master),
        slave: File::from(pty.slave),
        name,
    })
}

fn set_cloexec(fd: BorrowedFd<'_>) -> io::Result<()> {
    let flags = FdFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFD)?);
    fcntl(fd, FcntlArg::F_SETFD(flags | FdFlag::FD_CLOEXEC))?;
    Ok(())
}

fn set_nonblocking(fd: BorrowedFd<'_>) -> io::Result<()> {
    let flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL)?);
    fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    Ok(())
}

/// A child running on a fresh pty. The master is non-blocking.
pub struct PtyChild {
    pub pid: u32,
    pub master: File,
    pub tty_name: String,
}

/// Spawn `command` with the pty slave as its stdio and controlling terminal.
/// The child is reaped by pid through `waitpid`, not through `Child`.
pub fn spawn_on_pty(mut command: Command) -> io::Result<PtyChild> {
    let PtyPair {
        master,
        slave,
        name,
    } = open_pty()?;

    command
        .stdin(Stdio::from(slave.try_clone()?))
        .stdout(Stdio::from(slave.try_clone()?))
        .stderr(Stdio::from(slave));

    // SAFETY: setsid and ioctl are async-signal-safe; stdin is already the
    // slave when pre_exec runs.
    unsafe {
        command.pre_exec(|| {
            setsid()?;
            if libc::ioctl(0, libc::TIOCSCTTY as _, 0) == -1 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let child = command.spawn()?;
    let pid = child.id();
    // Releases the parent's copies of the slave.
    drop(command);

    set_nonblocking(master.as_fd())?;
    Ok(PtyChild {
        pid,
        master,
        tty_name: name,
    })
}

pub fn set_window_size(pty: &File, size: &WindowSize) -> io::Result<()> {
    let ws = Winsize {
        ws_row: size.rows,
        ws_col: size.cols,
        ws_xpixel: size.xpixel,
        ws_ypixel: size.ypixel,
    };
    // SAFETY: the fd is a live pty and `ws` outlives the call.
    if unsafe { libc::ioctl(pty.as_raw_fd(), libc::TIOCSWINSZ as _, &ws) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Copy the client's terminal modes onto the pty.
pub fn apply_modes(pty: &File, modes: &TerminalModes) -> io::Result<()> {
    let mut tio = termios::tcgetattr(pty)?;
    tio.input_flags = InputFlags::from_bits_truncate(modes.input_flags as libc::tcflag_t);
    tio.output_flags = OutputFlags::from_bits_truncate(modes.output_flags as libc::tcflag_t);
    tio.control_flags = ControlFlags::from_bits_truncate(modes.control_flags as libc::tcflag_t);
    tio.local_flags = LocalFlags::from_bits_truncate(modes.local_flags as libc::tcflag_t);
    for (slot, value) in tio.control_chars.iter_mut().zip(&modes.control_chars) {
        *slot = *value as libc::cc_t;
    }
    termios::tcsetattr(pty, SetArg::TCSANOW, &tio)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::wait::{waitpid, WaitStatus};
    use nix::unistd::Pid;
    use std::io::Read;
    use std::time::{Duration, Instant};

    #[test]
    fn child_output_arrives_on_master() {
        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c").arg("printf ready; exit 4");
        let child = spawn_on_pty(cmd).expect("spawn on pty");
        assert!(child.pid > 0);
        assert!(child.tty_name.starts_with("/dev/"));

        let mut seen = Vec::new();
        let mut buf = [0u8; 256];
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline && !seen.ends_with(b"ready") {
            match (&child.master).read(&mut buf) {
                Ok(0) => break,
                Ok(n) => seen.extend_from_slice(&buf[..n]),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(20))
                }
                Err(_) => break,
            }
        }
        assert!(String::from_utf8_lossy(&seen).contains("ready"));

        let status = waitpid(Pid::from_raw(child.pid as i32), None).unwrap();
        assert_eq!(status, WaitStatus::Exited(Pid::from_raw(child.pid as i32), 4));
    }

    #[test]
    fn window_size_round_trips_through_the_kernel() {
        let pair = open_pty().unwrap();
        let size = WindowSize {
            rows: 40,
            cols: 132,
            xpixel: 0,
            ypixel: 0,
        };
        set_window_size(&pair.master, &size).unwrap();

        let mut ws = unsafe { std::mem::zeroed::<libc::winsize>() };
        let rc = unsafe { libc::ioctl(pair.slave.as_raw_fd(), libc::TIOCGWINSZ as _, &mut ws) };
        assert_eq!(rc, 0);
        assert_eq!((ws.ws_row, ws.ws_col), (40, 132));
    }

    #[test]
    fn modes_are_applied_to_the_pty() {
        let pair = open_pty().unwrap();
        let before = termios::tcgetattr(&pair.master).unwrap();
        let modes = TerminalModes {
            input_flags: before.input_flags.bits() as u64,
            output_flags: before.output_flags.bits() as u64,
            control_flags: before.control_flags.bits() as u64,
            local_flags: (before.local_flags - LocalFlags::ECHO).bits() as u64,
            control_chars: Vec::new(),
        };
        apply_modes(&pair.master, &modes).unwrap();

        let after = termios::tcgetattr(&pair.slave).unwrap();
        assert!(!after.local_flags.contains(LocalFlags::ECHO));
        let fd_flags = fcntl(pair.master.as_fd(), FcntlArg::F_GETFD).unwrap();
        assert!(FdFlag::from_bits_truncate(fd_flags).contains(FdFlag::FD_CLOEXEC));
    }
}
