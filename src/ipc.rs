//! Cross-process coordination primitives.
//!
//! Sibling worker processes share nothing but inherited file descriptors
//! and the work directory, so the two primitives here are a named
//! semaphore backed by flock(2) on a file in the work dir, and a bounded
//! message queue backed by a SOCK_SEQPACKET socketpair created before
//! forking. Queue messages are tiny (an oid or a WAL position); the kernel
//! socket buffer provides the bound.

use std::fs::{File, OpenOptions};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};

use anyhow::{bail, format_err, Error};
use nix::errno::Errno;
use nix::fcntl::{flock, FlockArg};
use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
use nix::unistd;
use serde::{Deserialize, Serialize};

use crate::process;

/// A named semaphore with initial value 1, shared between processes via
/// its backing file in the work directory. Guards tiny critical sections
/// only (post-copy fan-out, constraint ordering).
#[derive(Debug, Clone)]
pub struct Semaphore {
    path: PathBuf,
}

/// Holding the guard holds the lock; dropping it releases.
pub struct SemaphoreGuard {
    _file: File,
}

impl Semaphore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Semaphore {
            path: path.as_ref().to_owned(),
        }
    }

    /// Block until the critical section is ours.
    pub fn acquire(&self) -> Result<SemaphoreGuard, Error> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|err| format_err!("unable to open semaphore {:?} - {}", self.path, err))?;

        loop {
            match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
                Ok(()) => return Ok(SemaphoreGuard { _file: file }),
                Err(_) => {
                    if process::asked_to_quit() {
                        bail!("interrupted while waiting on semaphore {:?}", self.path);
                    }
                    std::thread::sleep(std::time::Duration::from_millis(10));
                }
            }
        }
    }
}

/// What travels on the queues. Workers resolve oids against their own
/// copy of the catalog, so an oid is all a job needs to carry.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum QueueMessage {
    /// Build this index (and its constraint, if any).
    Index(u32),
    /// Vacuum analyze this table.
    Vacuum(u32),
    /// Transform the JSON file whose name is this WAL position.
    File(u64),
    /// Drain sentinel: the consumer receiving it exits its loop.
    Stop,
}

const QUEUE_MSG_MAX: usize = 128;

/// A multi-producer multi-consumer FIFO between forked processes.
///
/// Both descriptors are inherited across fork, so any process holding the
/// queue value can send or receive. Closing is by sentinel, one Stop per
/// consumer, never by shutting the socket down.
#[derive(Debug, Clone, Copy)]
pub struct Queue {
    tx: RawFd,
    rx: RawFd,
}

impl Queue {
    pub fn new() -> Result<Self, Error> {
        let (tx, rx) = socketpair(
            AddressFamily::Unix,
            SockType::SeqPacket,
            None,
            SockFlag::empty(),
        )
        .map_err(|err| format_err!("unable to create queue socketpair - {}", err))?;

        Ok(Queue { tx, rx })
    }

    pub fn send(&self, message: &QueueMessage) -> Result<(), Error> {
        let bytes = serde_json::to_vec(message)?;

        if bytes.len() > QUEUE_MSG_MAX {
            bail!("queue message too large ({} bytes)", bytes.len());
        }

        loop {
            match unistd::write(self.tx, &bytes) {
                Ok(n) if n == bytes.len() => return Ok(()),
                Ok(n) => bail!("short queue write ({} of {} bytes)", n, bytes.len()),
                Err(nix::Error::Sys(Errno::EINTR)) => {
                    if process::asked_to_quit() {
                        bail!("interrupted while sending to queue");
                    }
                }
                Err(err) => bail!("queue send failed - {}", err),
            }
        }
    }

    /// Receive the next message, blocking. Exactly one consumer gets any
    /// given message thanks to the packet semantics of the socket.
    pub fn recv(&self) -> Result<QueueMessage, Error> {
        let mut buffer = [0u8; QUEUE_MSG_MAX];

        loop {
            match unistd::read(self.rx, &mut buffer) {
                Ok(0) => bail!("queue closed unexpectedly"),
                Ok(n) => {
                    return serde_json::from_slice(&buffer[..n])
                        .map_err(|err| format_err!("invalid queue message - {}", err));
                }
                Err(nix::Error::Sys(Errno::EINTR)) => {
                    if process::asked_to_quit() {
                        bail!("interrupted while receiving from queue");
                    }
                }
                Err(err) => bail!("queue recv failed - {}", err),
            }
        }
    }

    /// Ask `consumers` workers to stop once the queue drains.
    pub fn send_stop(&self, consumers: usize) -> Result<(), Error> {
        for _ in 0..consumers {
            self.send(&QueueMessage::Stop)?;
        }
        Ok(())
    }

    /// Close both descriptors in this process. Other processes holding
    /// the queue are unaffected.
    pub fn close(self) {
        let _ = unistd::close(self.tx);
        let _ = unistd::close(self.rx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn queue_is_fifo_and_drains_by_sentinel() {
        let queue = Queue::new().unwrap();

        queue.send(&QueueMessage::Index(1)).unwrap();
        queue.send(&QueueMessage::Vacuum(2)).unwrap();
        queue.send_stop(1).unwrap();

        assert_eq!(queue.recv().unwrap(), QueueMessage::Index(1));
        assert_eq!(queue.recv().unwrap(), QueueMessage::Vacuum(2));
        assert_eq!(queue.recv().unwrap(), QueueMessage::Stop);

        queue.close();
    }

    #[test]
    fn queue_messages_are_delivered_once() {
        let queue = Queue::new().unwrap();

        for oid in 0..100u32 {
            queue.send(&QueueMessage::Index(oid)).unwrap();
        }
        queue.send_stop(4).unwrap();

        let seen = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();

        for _ in 0..4 {
            let seen = Arc::clone(&seen);
            handles.push(std::thread::spawn(move || loop {
                match queue.recv().unwrap() {
                    QueueMessage::Stop => break,
                    QueueMessage::Index(_) => {
                        seen.fetch_add(1, Ordering::SeqCst);
                    }
                    other => panic!("unexpected message {:?}", other),
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(seen.load(Ordering::SeqCst), 100);
        queue.close();
    }

    #[test]
    fn semaphore_serializes_critical_sections() {
        let dir = tempfile::tempdir().unwrap();
        let semaphore = Semaphore::new(dir.path().join("table-semaphore"));

        let in_section = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();

        for _ in 0..8 {
            let semaphore = semaphore.clone();
            let in_section = Arc::clone(&in_section);

            handles.push(std::thread::spawn(move || {
                for _ in 0..20 {
                    let _guard = semaphore.acquire().unwrap();

                    let nested = in_section.fetch_add(1, Ordering::SeqCst);
                    assert_eq!(nested, 0, "two holders inside the critical section");
                    std::thread::yield_now();
                    in_section.fetch_sub(1, Ordering::SeqCst);
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }
    }
}
