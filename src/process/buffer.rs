use std::{
    fmt,
    fs::File,
    io::{self, Read, Write},
    os::fd::{FromRawFd, OwnedFd},
    sync::{Arc, Mutex, MutexGuard},
    thread::{self, JoinHandle},
};

use nix::{fcntl::OFlag, unistd::pipe2};
use tokio::sync::watch;

const READ_CHUNK: usize = 4096;

/// Output captured by the engine instead of the console.
///
/// Cloning shares the same buffer; it is released once the last clone and
/// the last drain thread are gone. More than one producer may append to it
/// when later stages chain their output onto an earlier one.
#[derive(Clone)]
pub struct OutputBuffer {
    inner: Arc<BufferInner>,
}

struct BufferInner {
    data: Mutex<Vec<u8>>,
    active_pumps: watch::Sender<usize>,
}

impl Default for OutputBuffer {
    fn default() -> Self {
        let (active_pumps, _) = watch::channel(0);
        Self {
            inner: Arc::new(BufferInner {
                data: Mutex::new(Vec::new()),
                active_pumps,
            }),
        }
    }
}

impl fmt::Debug for OutputBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputBuffer")
            .field("len", &self.len())
            .field("active_pumps", &*self.inner.active_pumps.borrow())
            .finish()
    }
}

impl OutputBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts draining `reader` into this buffer. The descriptor now belongs
    /// to the pump.
    pub fn commence(&self, reader: OwnedFd) -> io::Result<JoinHandle<()>> {
        self.inner.active_pumps.send_modify(|n| *n += 1);

        let buffer = self.clone();
        let spawned = thread::Builder::new()
            .name("shex-drain".into())
            .spawn(move || {
                let mut pipe = File::from(reader);
                let mut chunk = [0u8; READ_CHUNK];

                loop {
                    match pipe.read(&mut chunk) {
                        Ok(0) => break,
                        Ok(len) => buffer.data().extend_from_slice(&chunk[..len]),
                        Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                        Err(err) => {
                            warn!(%err, "output pump read failed");
                            break;
                        }
                    }
                }

                trace!(len = buffer.len(), "output pump finished");
                buffer.inner.active_pumps.send_modify(|n| *n -= 1);
            });

        if spawned.is_err() {
            self.inner.active_pumps.send_modify(|n| *n -= 1);
        }

        spawned
    }

    /// Resolves once every producer has closed its end of the pipe and all of
    /// its bytes have been appended.
    pub async fn wait_for_finalize(&self) {
        let mut pumps = self.inner.active_pumps.subscribe();
        while *pumps.borrow_and_update() != 0 {
            if pumps.changed().await.is_err() {
                break;
            }
        }
    }

    /// Serves what was captured so far through a new pipe and returns its
    /// read end. A writer thread feeds the pipe at the reader's pace.
    pub fn replay(&self) -> io::Result<OwnedFd> {
        let (reader, writer) = pipe2(OFlag::O_CLOEXEC)?;
        let (reader, writer) =
            unsafe { (OwnedFd::from_raw_fd(reader), OwnedFd::from_raw_fd(writer)) };
        let contents = self.contents();

        thread::Builder::new()
            .name("shex-replay".into())
            .spawn(move || {
                let mut pipe = File::from(writer);
                if let Err(err) = pipe.write_all(&contents) {
                    trace!(%err, "replay reader went away");
                }
            })?;

        Ok(reader)
    }

    pub fn is_finalized(&self) -> bool {
        *self.inner.active_pumps.borrow() == 0
    }

    pub fn contents(&self) -> Vec<u8> {
        self.data().clone()
    }

    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.data()).into_owned()
    }

    pub fn len(&self) -> usize {
        self.data().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn reference_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    fn data(&self) -> MutexGuard<'_, Vec<u8>> {
        self.inner
            .data
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn pipe() -> (OwnedFd, File) {
        let (read, write) = pipe2(OFlag::O_CLOEXEC).unwrap();
        unsafe { (OwnedFd::from_raw_fd(read), File::from_raw_fd(write)) }
    }

    #[tokio::test]
    async fn drains_until_writer_closes() {
        let buffer = OutputBuffer::new();
        let (read, mut write) = pipe();
        let pump = buffer.commence(read).unwrap();

        write.write_all(b"hello\n").unwrap();
        assert!(!buffer.is_finalized());
        write.write_all(b"world\n").unwrap();
        drop(write);

        tokio::time::timeout(Duration::from_secs(5), buffer.wait_for_finalize())
            .await
            .unwrap();
        pump.join().unwrap();

        assert_eq!(buffer.contents(), b"hello\nworld\n");
        assert_eq!(buffer.reference_count(), 1);
    }

    #[tokio::test]
    async fn chained_producers_append_to_one_buffer() {
        let buffer = OutputBuffer::new();
        let (first_read, mut first) = pipe();
        let (second_read, mut second) = pipe();
        let shared = buffer.clone();

        let a = buffer.commence(first_read).unwrap();
        first.write_all(b"one ").unwrap();
        drop(first);
        a.join().unwrap();

        let b = shared.commence(second_read).unwrap();
        second.write_all(b"two").unwrap();
        drop(second);

        buffer.wait_for_finalize().await;
        b.join().unwrap();
        assert_eq!(shared.to_string_lossy(), "one two");
    }

    #[test]
    fn replay_outlasts_the_pipe_capacity() {
        let buffer = OutputBuffer::new();
        let (read, mut write) = pipe();
        let pump = buffer.commence(read).unwrap();
        write.write_all(&vec![b'x'; 300_000]).unwrap();
        drop(write);
        pump.join().unwrap();

        let mut replayed = Vec::new();
        File::from(buffer.replay().unwrap())
            .read_to_end(&mut replayed)
            .unwrap();
        assert_eq!(replayed.len(), 300_000);
    }
}
