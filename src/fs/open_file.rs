//! Per-file open state and the two ciphertext transitions.
//!
//! While a file is open its plaintext lives in an in-memory buffer; the
//! backing file only ever holds ciphertext. Decryption happens lazily on the
//! first read (or size query) that needs it, encryption happens once, when
//! the last handle is released.

use std::fs::File;
use std::io::{Seek, SeekFrom};
use std::os::unix::io::IntoRawFd;
use std::path::PathBuf;
use std::sync::Arc;

use memmap2::Mmap;

use crate::fs::convert::io_error_to_libc;
use crate::recipient::Recipient;
use crate::subprocess::Subprocess;

/// Armor trailer that ends every encrypted message in a backing file.
pub(crate) const BLOCK_TERMINATOR: &[u8] = b"-----END PGP MESSAGE-----\n";

/// Ciphertext is fed to gpg per block, but plaintext comes back in slices of
/// this size with the buffer growing incrementally.
const CHUNK_SIZE: usize = 1 << 20;

const GPG: &str = "gpg";
const DECRYPT_ARGS: &[&str] = &["-d", "--no-tty", "--batch"];

pub(crate) struct OpenFile {
    /// Backing descriptor; None once closed.
    file: Option<File>,
    pub flags: i32,
    pub path: PathBuf,
    pub refs: u32,
    pub buffer: Vec<u8>,
    /// True iff `buffer` is known to equal the plaintext of the whole file.
    pub buffer_set: bool,
    /// True iff `buffer` has changes not yet encrypted to the backing file.
    pub dirty: bool,
    recipients: Arc<Vec<Recipient>>,
}

impl OpenFile {
    pub fn new(
        file: File,
        flags: i32,
        path: PathBuf,
        buffer_set: bool,
        recipients: Arc<Vec<Recipient>>,
    ) -> Self {
        OpenFile {
            file: Some(file),
            flags,
            path,
            refs: 1,
            buffer: Vec::new(),
            buffer_set,
            dirty: false,
            recipients,
        }
    }

    pub fn file(&self) -> Result<&File, libc::c_int> {
        self.file.as_ref().ok_or(libc::EBADF)
    }

    /// Decrypt the backing file into `buffer`.
    ///
    /// Idempotent: a no-op once `buffer_set` holds. The backing file is one
    /// or more concatenated armored messages; gpg refuses to decrypt more
    /// than one message per run, so each block gets its own child and the
    /// plaintexts concatenate in file order.
    pub fn load_buffer(&mut self) -> Result<(), libc::c_int> {
        if self.buffer_set {
            return Ok(());
        }

        self.dirty = false;
        self.buffer.clear();

        let len = self
            .file()?
            .metadata()
            .map_err(|e| io_error_to_libc(&e))?
            .len();
        if len == 0 {
            self.buffer_set = true;
            return Ok(());
        }

        // SAFETY: the backing file is only written at flush time, after this
        // mapping has been dropped.
        let map = unsafe { Mmap::map(self.file()?) }.map_err(|e| io_error_to_libc(&e))?;

        self.buffer_set = true;
        let mut offset = 0;
        while offset < map.len() {
            let end = next_block_end(&map, offset);
            let whole_file = offset == 0 && end == map.len();

            // Single-block files can hand gpg the descriptor itself; anything
            // else streams the block's bytes through a pipe.
            let stdin = if whole_file {
                let fd = self.file()?.try_clone().map_err(|e| io_error_to_libc(&e))?;
                Some(fd)
            } else {
                None
            };
            let mut gpg = Subprocess::spawn(GPG, DECRYPT_ARGS, stdin, None)
                .map_err(|e| io_error_to_libc(&e))?;

            let mut input: &[u8] = if whole_file { &[] } else { &map[offset..end] };
            let mut comm_err = None;
            loop {
                let start = self.buffer.len();
                self.buffer.resize(start + CHUNK_SIZE, 0);
                match gpg.communicate(Some(&mut self.buffer[start..]), Some(input)) {
                    Ok(progress) => {
                        self.buffer.truncate(start + progress.bytes_read);
                        input = &input[progress.bytes_written..];
                        if progress.stdout_eof || progress.bytes_read == 0 {
                            break;
                        }
                    }
                    Err(e) => {
                        self.buffer.truncate(start);
                        comm_err = Some(io_error_to_libc(&e));
                        break;
                    }
                }
            }

            match gpg.wait() {
                Ok(0) => {}
                Ok(_) => {
                    self.buffer_set = false;
                    return Err(libc::EIO);
                }
                Err(e) => {
                    self.buffer_set = false;
                    return Err(io_error_to_libc(&e));
                }
            }
            if let Some(errno) = comm_err {
                self.buffer_set = false;
                return Err(errno);
            }

            offset = end;
        }

        Ok(())
    }

    /// Flush-and-close. Single shot: a second call is a no-op.
    ///
    /// A dirty buffer is encrypted to the backing file first; the descriptor
    /// is closed regardless, and the first error wins.
    pub fn close(&mut self) -> Result<(), libc::c_int> {
        let Some(file) = self.file.take() else {
            return Ok(());
        };

        let mut result = Ok(());
        if self.dirty {
            result = encrypt_to(&file, &self.buffer, self.buffer_set, &self.recipients);
            self.dirty = false;
        }

        let fd = file.into_raw_fd();
        // SAFETY: ownership of fd was released by into_raw_fd just above.
        let close_ret = unsafe { libc::close(fd) };
        if result.is_ok() && close_ret != 0 {
            result = Err(io_error_to_libc(&std::io::Error::last_os_error()));
        }
        result
    }
}

impl Drop for OpenFile {
    fn drop(&mut self) {
        if self.file.is_some() {
            if let Err(errno) = self.close() {
                tracing::warn!("flush of {:?} on drop failed: errno {}", self.path, errno);
            }
        }
    }
}

/// Encrypt `buffer` into the backing file.
///
/// When the buffer mirrors the whole plaintext (`rewrite`), the file is
/// truncated and rewritten as a single fresh message. Otherwise the buffer
/// holds only bytes appended through a write-only handle, and the new
/// message lands after the existing ones; that is how backing files come to
/// hold several concatenated messages.
fn encrypt_to(
    file: &File,
    buffer: &[u8],
    rewrite: bool,
    recipients: &[Recipient],
) -> Result<(), libc::c_int> {
    let mut stdout = file.try_clone().map_err(|e| io_error_to_libc(&e))?;
    if rewrite {
        file.set_len(0).map_err(|e| io_error_to_libc(&e))?;
        // The shared offset may sit past the new end if decryption consumed
        // the descriptor directly.
        stdout
            .seek(SeekFrom::Start(0))
            .map_err(|e| io_error_to_libc(&e))?;
    }

    let mut args: Vec<&str> = vec!["-ae", "--no-tty", "--batch"];
    for recipient in recipients {
        args.push("-r");
        args.push(recipient.as_str());
    }

    let mut gpg = Subprocess::spawn(GPG, &args, None, Some(stdout))
        .map_err(|e| io_error_to_libc(&e))?;
    let comm = gpg.communicate(None, Some(buffer));
    match gpg.wait() {
        Ok(0) => {}
        Ok(_) => return Err(libc::EIO),
        Err(e) => return Err(io_error_to_libc(&e)),
    }
    comm.map(|_| ()).map_err(|e| io_error_to_libc(&e))
}

/// Index one past the next block terminator at or after `from`, or the end
/// of the data if no further terminator exists.
fn next_block_end(data: &[u8], from: usize) -> usize {
    data[from..]
        .windows(BLOCK_TERMINATOR.len())
        .position(|w| w == BLOCK_TERMINATOR)
        .map(|p| from + p + BLOCK_TERMINATOR.len())
        .unwrap_or(data.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn armored(body: &str) -> Vec<u8> {
        let mut block = format!("-----BEGIN PGP MESSAGE-----\n\n{body}\n").into_bytes();
        block.extend_from_slice(BLOCK_TERMINATOR);
        block
    }

    #[test]
    fn single_block_spans_the_file() {
        let data = armored("abc");
        assert_eq!(next_block_end(&data, 0), data.len());
    }

    #[test]
    fn concatenated_blocks_split_at_each_terminator() {
        let first = armored("abc");
        let second = armored("def");
        let mut data = first.clone();
        data.extend_from_slice(&second);

        let end = next_block_end(&data, 0);
        assert_eq!(end, first.len());
        assert_eq!(next_block_end(&data, end), data.len());
    }

    #[test]
    fn missing_terminator_falls_back_to_the_tail() {
        let data = b"-----BEGIN PGP MESSAGE-----\ntruncated".to_vec();
        assert_eq!(next_block_end(&data, 0), data.len());
    }
}
