//! One-shot pipe barriers between parent and child.
//!
//! Each barrier is a unidirectional pipe used purely as a rendezvous
//! point during container creation: the waiting side blocks until the
//! signalling side has either written its token or closed its end.
//! Close-triggered EOF is a valid wake-up — a child that dies before
//! signalling still releases the parent, which then observes the
//! failure through the exit status.

use std::fs::File;
use std::io::{Read, Write};
use std::os::unix::io::FromRawFd;

use palisade_common::error::{Result, RuntimeError};

const TOKEN: &[u8] = b"done";

/// Creates a close-on-exec pipe, returning `(read end, write end)`.
pub(crate) fn pipe_pair() -> Result<(File, File)> {
    let mut fds = [0i32; 2];

    // SAFETY: pipe2 writes two descriptors into the provided array.
    let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
    if ret != 0 {
        return Err(RuntimeError::kernel(
            "pipe2",
            std::io::Error::last_os_error(),
        ));
    }

    // SAFETY: both descriptors were just created and are owned here.
    let reader = unsafe { File::from_raw_fd(fds[0]) };
    let writer = unsafe { File::from_raw_fd(fds[1]) };
    Ok((reader, writer))
}

/// A one-shot rendezvous barrier backed by a pipe.
///
/// After fork, both processes hold a full endpoint pair; the waiting
/// side calls [`wait`](Self::wait) (dropping its own write end first so
/// EOF can arrive) and the signalling side calls
/// [`signal`](Self::signal) (dropping its read end and closing the
/// write end after the token). Either operation consumes the endpoint,
/// making the barrier strictly single-use.
#[derive(Debug)]
pub struct Barrier {
    reader: Option<File>,
    writer: Option<File>,
}

impl Barrier {
    /// Allocates a fresh barrier.
    ///
    /// # Errors
    ///
    /// Returns an error if the pipe cannot be created.
    pub fn new() -> Result<Self> {
        let (reader, writer) = pipe_pair()?;
        Ok(Self {
            reader: Some(reader),
            writer: Some(writer),
        })
    }

    /// Duplicates both endpoint handles, as fork does.
    ///
    /// # Errors
    ///
    /// Returns an error if a descriptor cannot be duplicated or the
    /// barrier was already used.
    pub fn try_clone(&self) -> Result<Self> {
        let dup = |file: &Option<File>| -> Result<Option<File>> {
            file.as_ref()
                .map(|f| {
                    f.try_clone()
                        .map_err(|e| RuntimeError::kernel("dup", e))
                })
                .transpose()
        };
        Ok(Self {
            reader: dup(&self.reader)?,
            writer: dup(&self.writer)?,
        })
    }

    /// Releases the barrier, writing the token and closing the write
    /// end so the waiting side unblocks.
    ///
    /// # Errors
    ///
    /// Returns an error if the barrier was already consumed or the
    /// token cannot be written.
    pub fn signal(&mut self) -> Result<()> {
        drop(self.reader.take());
        let mut writer = self.writer.take().ok_or_else(|| RuntimeError::Sync {
            message: "barrier already signalled".into(),
        })?;
        writer.write_all(TOKEN).map_err(|e| RuntimeError::Sync {
            message: format!("barrier signal failed: {e}"),
        })?;
        drop(writer);
        Ok(())
    }

    /// Blocks until the other side signals or closes its write end.
    ///
    /// # Errors
    ///
    /// Returns an error if the barrier was already consumed or the
    /// read fails.
    pub fn wait(&mut self) -> Result<()> {
        drop(self.writer.take());
        let mut reader = self.reader.take().ok_or_else(|| RuntimeError::Sync {
            message: "barrier already waited on".into(),
        })?;
        let mut buf = Vec::new();
        let _ = reader
            .read_to_end(&mut buf)
            .map_err(|e| RuntimeError::Sync {
                message: format!("barrier wait failed: {e}"),
            })?;
        Ok(())
    }

    /// Drops both endpoint copies without signalling.
    ///
    /// Used by a process that holds an inherited endpoint it does not
    /// participate in; the other process's copies are unaffected.
    pub fn close(&mut self) {
        self.reader = None;
        self.writer = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn wait_blocks_until_signal() {
        let mut ours = Barrier::new().expect("barrier");
        let mut theirs = ours.try_clone().expect("clone");

        let (tx, rx) = mpsc::channel();
        let signaller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            tx.send("signalled").expect("send");
            theirs.signal().expect("signal");
        });

        ours.wait().expect("wait");
        // The signal always lands before the wait returns.
        assert_eq!(rx.try_recv().ok(), Some("signalled"));
        signaller.join().expect("join");
    }

    #[test]
    fn close_without_signal_also_releases_the_waiter() {
        let mut ours = Barrier::new().expect("barrier");
        let mut theirs = ours.try_clone().expect("clone");

        let closer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            theirs.close();
        });

        // EOF from a dead peer is the designated wake-up, not an error.
        ours.wait().expect("wait on EOF");
        closer.join().expect("join");
    }

    #[test]
    fn barrier_is_single_use() {
        let mut barrier = Barrier::new().expect("barrier");
        barrier.signal().expect("first signal");
        assert!(barrier.signal().is_err());
        assert!(barrier.wait().is_err());
    }
}
