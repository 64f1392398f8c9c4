//! Child-process plumbing for the cipher tool.
//!
//! gpg is driven over plain pipes: encryption feeds plaintext on stdin while
//! ciphertext streams out, decryption is the mirror image. Both directions
//! can be live at once and gpg buffers freely, so the channel puts its pipe
//! ends into non-blocking mode and multiplexes them with poll(2). A blocking
//! write followed by a blocking read would deadlock as soon as the child
//! fills its output pipe before draining its input.

use std::ffi::OsStr;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

/// Progress made by a single [`Subprocess::communicate`] call.
#[derive(Clone, Copy, Debug, Default)]
pub struct Progress {
    /// Bytes placed into the caller's output buffer.
    pub bytes_read: usize,
    /// Bytes consumed from the caller's input slice.
    pub bytes_written: usize,
    /// The child closed its stdout.
    pub stdout_eof: bool,
}

pub struct Subprocess {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    stdout_eof: bool,
}

impl Subprocess {
    /// Spawn `program` with the given arguments.
    ///
    /// When `stdin`/`stdout` are supplied the descriptors are handed to the
    /// child directly; otherwise a pipe is created and serviced by
    /// [`communicate`](Self::communicate). stderr is inherited from the
    /// parent.
    pub fn spawn<S: AsRef<OsStr>>(
        program: &str,
        args: &[S],
        stdin: Option<File>,
        stdout: Option<File>,
    ) -> io::Result<Self> {
        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(stdin.map_or_else(Stdio::piped, Stdio::from))
            .stdout(stdout.map_or_else(Stdio::piped, Stdio::from));

        let mut child = command.spawn()?;
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        if let Some(pipe) = &stdin {
            set_nonblocking(pipe.as_raw_fd())?;
        }
        if let Some(pipe) = &stdout {
            set_nonblocking(pipe.as_raw_fd())?;
        }

        Ok(Subprocess {
            child,
            stdin,
            stdout,
            stdout_eof: false,
        })
    }

    /// Drive both pipes at once.
    ///
    /// Writes from `input` whenever the child's stdin is writable and reads
    /// into `out` whenever its stdout is readable. `input` must be the
    /// entire remaining input: once it has been fully written the stdin pipe
    /// is closed so the child sees end of input. Passing `None` (or an empty
    /// slice) closes stdin immediately.
    ///
    /// Returns once `out` is full, or once all input has been written and
    /// stdout has reached end of file (or was never piped). Either pipe may
    /// make progress while the other is stalled.
    pub fn communicate(
        &mut self,
        mut out: Option<&mut [u8]>,
        input: Option<&[u8]>,
    ) -> io::Result<Progress> {
        let input = input.unwrap_or(&[]);
        let mut progress = Progress::default();

        // gpg produces no final output until it sees end of input.
        if input.is_empty() {
            self.stdin = None;
        }

        loop {
            let want_write = self.stdin.is_some() && progress.bytes_written < input.len();
            let (want_read, out_full) = match &out {
                Some(buf) => (
                    self.stdout.is_some() && !self.stdout_eof && progress.bytes_read < buf.len(),
                    progress.bytes_read == buf.len(),
                ),
                None => (false, false),
            };

            if out_full {
                break;
            }
            if !want_write && !want_read {
                break;
            }

            let mut fds = [libc::pollfd {
                fd: -1,
                events: 0,
                revents: 0,
            }; 2];
            let mut nfds = 0;
            let mut stdin_slot = usize::MAX;
            let mut stdout_slot = usize::MAX;
            if want_write {
                fds[nfds] = pollfd(self.stdin.as_ref().unwrap().as_raw_fd(), libc::POLLOUT);
                stdin_slot = nfds;
                nfds += 1;
            }
            if want_read {
                fds[nfds] = pollfd(self.stdout.as_ref().unwrap().as_raw_fd(), libc::POLLIN);
                stdout_slot = nfds;
                nfds += 1;
            }

            poll(&mut fds[..nfds])?;

            if stdin_slot != usize::MAX && fds[stdin_slot].revents != 0 {
                match self
                    .stdin
                    .as_mut()
                    .unwrap()
                    .write(&input[progress.bytes_written..])
                {
                    Ok(n) => {
                        progress.bytes_written += n;
                        if progress.bytes_written == input.len() {
                            self.stdin = None;
                        }
                    }
                    Err(e) if retriable(&e) => {}
                    Err(e) => return Err(e),
                }
            }

            if stdout_slot != usize::MAX && fds[stdout_slot].revents != 0 {
                let buf = out.as_deref_mut().unwrap();
                match self
                    .stdout
                    .as_mut()
                    .unwrap()
                    .read(&mut buf[progress.bytes_read..])
                {
                    Ok(0) => self.stdout_eof = true,
                    Ok(n) => progress.bytes_read += n,
                    Err(e) if retriable(&e) => {}
                    Err(e) => return Err(e),
                }
            }
        }

        progress.stdout_eof = self.stdout_eof;
        Ok(progress)
    }

    /// Wait for the child to exit and return its exit code.
    ///
    /// Any stdin pipe still open is closed first, so a child waiting for end
    /// of input cannot hang the caller. A child killed by a signal reports
    /// as -1.
    pub fn wait(&mut self) -> io::Result<i32> {
        self.stdin = None;
        let status = self.child.wait()?;
        Ok(status.code().unwrap_or(-1))
    }
}

fn pollfd(fd: RawFd, events: libc::c_short) -> libc::pollfd {
    libc::pollfd {
        fd,
        events,
        revents: 0,
    }
}

fn retriable(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    // SAFETY: fd refers to a pipe end owned by this process.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

fn poll(fds: &mut [libc::pollfd]) -> io::Result<()> {
    loop {
        // SAFETY: fds points at a valid, mutable pollfd array of this length.
        let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, -1) };
        if rc >= 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Seek, SeekFrom};

    #[test]
    fn cat_round_trips_small_input() {
        let input = b"hello, world";
        let mut out = [0u8; 64];

        let mut child = Subprocess::spawn::<&str>("cat", &[], None, None).unwrap();
        let progress = child
            .communicate(Some(&mut out), Some(input))
            .unwrap();

        assert_eq!(progress.bytes_written, input.len());
        assert_eq!(progress.bytes_read, input.len());
        assert_eq!(&out[..progress.bytes_read], input);
        assert_eq!(child.wait().unwrap(), 0);
    }

    #[test]
    fn cat_round_trips_more_than_a_pipe_buffer() {
        // Large enough that cat must interleave reads and writes; a blocking
        // write-then-read strategy deadlocks here.
        let input: Vec<u8> = (0..1 << 20).map(|i| (i % 251) as u8).collect();
        let mut out = vec![0u8; input.len()];
        let mut read = 0;
        let mut remaining: &[u8] = &input;

        let mut child = Subprocess::spawn::<&str>("cat", &[], None, None).unwrap();
        loop {
            let progress = child
                .communicate(Some(&mut out[read..]), Some(remaining))
                .unwrap();
            read += progress.bytes_read;
            remaining = &remaining[progress.bytes_written..];
            if progress.stdout_eof || progress.bytes_read == 0 {
                break;
            }
        }

        assert_eq!(read, input.len());
        assert_eq!(out, input);
        assert_eq!(child.wait().unwrap(), 0);
    }

    #[test]
    fn output_only_child_reaches_eof() {
        let mut out = [0u8; 64];
        let mut child = Subprocess::spawn("echo", &["-n", "ping"], None, None).unwrap();
        let progress = child.communicate(Some(&mut out), None).unwrap();

        assert!(progress.stdout_eof);
        assert_eq!(&out[..progress.bytes_read], b"ping");
        assert_eq!(child.wait().unwrap(), 0);
    }

    #[test]
    fn exit_codes_are_reported() {
        let mut ok = Subprocess::spawn::<&str>("true", &[], None, None).unwrap();
        assert_eq!(ok.wait().unwrap(), 0);

        let mut fail = Subprocess::spawn::<&str>("false", &[], None, None).unwrap();
        assert_ne!(fail.wait().unwrap(), 0);
    }

    #[test]
    fn stdout_can_be_redirected_to_a_descriptor() {
        let mut sink = tempfile::tempfile().unwrap();
        let redirect = sink.try_clone().unwrap();

        let mut child =
            Subprocess::spawn::<&str>("cat", &[], None, Some(redirect)).unwrap();
        child.communicate(None, Some(b"straight to disk")).unwrap();
        assert_eq!(child.wait().unwrap(), 0);

        let mut contents = String::new();
        sink.seek(SeekFrom::Start(0)).unwrap();
        sink.read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "straight to disk");
    }

    #[test]
    fn stdin_can_be_supplied_from_a_descriptor() {
        let mut source = tempfile::tempfile().unwrap();
        use std::io::Write as _;
        source.write_all(b"from a file").unwrap();
        source.seek(SeekFrom::Start(0)).unwrap();

        let mut out = [0u8; 64];
        let mut child = Subprocess::spawn::<&str>("cat", &[], Some(source), None).unwrap();
        let progress = child.communicate(Some(&mut out), None).unwrap();

        assert_eq!(&out[..progress.bytes_read], b"from a file");
        assert_eq!(child.wait().unwrap(), 0);
    }
}
