use std::{
    fs::File as StdFile,
    io::{self, Read},
    os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd},
    process::Stdio,
};

use nix::{
    fcntl::{fcntl, FcntlArg, OFlag},
    pty::{openpty, Winsize},
};
use tokio::{
    fs::File,
    io::unix::AsyncFd,
    process::{Child, Command},
};

use crate::NexusutilsResult;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The default number of rows for a new terminal.
pub const DEFAULT_PTY_ROWS: u16 = 24;

/// The default number of columns for a new terminal.
pub const DEFAULT_PTY_COLS: u16 = 80;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The master side of a pseudo terminal attached to a spawned child.
pub struct PtyMaster {
    /// Read half
    pub reader: PtyReader,

    /// Write half
    pub writer: File,
}

/// The non-blocking read half of a pseudo terminal master.
pub struct PtyReader {
    fd: AsyncFd<StdFile>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl PtyReader {
    /// Reads the next chunk of terminal output.
    ///
    /// Returns `Ok(0)` once the slave side has been closed by every process holding it.
    pub async fn read_chunk(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.fd.readable().await?;
            match guard.try_io(|inner| inner.get_ref().read(buf)) {
                Ok(Ok(n)) => return Ok(n),
                // Linux reports EIO on the master after the last slave fd closes.
                Ok(Err(e)) if e.raw_os_error() == Some(libc::EIO) => return Ok(0),
                Ok(Err(e)) => return Err(e),
                Err(_would_block) => continue,
            }
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Spawns `command` as the leader of a new session with a fresh pseudo terminal as its
/// controlling terminal and standard streams.
pub fn spawn_with_pty(mut command: Command) -> NexusutilsResult<(Child, PtyMaster)> {
    let winsize = Winsize {
        ws_row: DEFAULT_PTY_ROWS,
        ws_col: DEFAULT_PTY_COLS,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };

    let pty = openpty(&winsize, None)?;
    let master_fd = pty.master.as_raw_fd();
    {
        let flags = OFlag::from_bits_truncate(fcntl(master_fd, FcntlArg::F_GETFL)?);
        fcntl(master_fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    }

    let slave_in = pty.slave.try_clone()?;
    let slave_out = pty.slave.try_clone()?;
    let slave_err: OwnedFd = pty.slave;

    command
        .stdin(Stdio::from(slave_in))
        .stdout(Stdio::from(slave_out))
        .stderr(Stdio::from(slave_err))
        .kill_on_drop(true);

    // New session with the pty as the controlling terminal.
    unsafe {
        command.pre_exec(|| {
            nix::unistd::setsid().map_err(io::Error::from)?;
            if libc::ioctl(libc::STDIN_FILENO, libc::TIOCSCTTY as _, 0 as libc::c_long) < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let child = command.spawn()?;

    // The command still owns the slave copies; drop it so EOF is observable on the master.
    drop(command);

    let master_write_fd = nix::unistd::dup(master_fd)?;
    let master_read_file = unsafe { StdFile::from_raw_fd(pty.master.into_raw_fd()) };
    let master_write_file = unsafe { StdFile::from_raw_fd(master_write_fd) };

    Ok((
        child,
        PtyMaster {
            reader: PtyReader {
                fd: AsyncFd::new(master_read_file)?,
            },
            writer: File::from_std(master_write_file),
        },
    ))
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
