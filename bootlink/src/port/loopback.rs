//! In-memory connected port pair.
//!
//! Bytes written to one end become readable on the other. Dropping or
//! closing one end makes reads on the other return 0 once its buffer drains.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::error::Result;
use crate::port::Port;

#[derive(Debug, Default)]
struct PipeState {
    data: VecDeque<u8>,
    closed: bool,
}

#[derive(Debug, Default)]
struct Pipe {
    state: Mutex<PipeState>,
    ready: Condvar,
}

impl Pipe {
    fn lock(&self) -> io::Result<MutexGuard<'_, PipeState>> {
        self.state
            .lock()
            .map_err(|_| io::Error::other("loopback pipe poisoned"))
    }

    fn close(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.closed = true;
        }
        self.ready.notify_all();
    }
}

/// One end of an in-memory connected pair.
#[derive(Debug)]
pub struct LoopbackPort {
    name: String,
    rx: Arc<Pipe>,
    tx: Arc<Pipe>,
    timeout: Duration,
}

impl LoopbackPort {
    /// Create two connected ends.
    pub fn pair() -> (Self, Self) {
        let a = Arc::new(Pipe::default());
        let b = Arc::new(Pipe::default());
        let timeout = Duration::from_millis(50);
        (
            Self {
                name: "loopback:a".to_string(),
                rx: Arc::clone(&a),
                tx: Arc::clone(&b),
                timeout,
            },
            Self {
                name: "loopback:b".to_string(),
                rx: b,
                tx: a,
                timeout,
            },
        )
    }

    /// Bytes waiting to be read on this end.
    pub fn pending(&self) -> usize {
        self.rx
            .lock()
            .map(|s| s.data.len())
            .unwrap_or(0)
    }
}

impl Read for LoopbackPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let deadline = Instant::now() + self.timeout;
        let mut state = self.rx.lock()?;
        loop {
            if !state.data.is_empty() {
                let n = buf.len().min(state.data.len());
                for (slot, byte) in buf.iter_mut().zip(state.data.drain(..n)) {
                    *slot = byte;
                }
                return Ok(n);
            }
            if state.closed {
                return Ok(0);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "loopback read timed out"));
            }
            state = self
                .rx
                .ready
                .wait_timeout(state, deadline - now)
                .map_err(|_| io::Error::other("loopback pipe poisoned"))?
                .0;
        }
    }
}

impl Write for LoopbackPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.tx.lock()?;
        if state.closed {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "loopback peer closed"));
        }
        state.data.extend(buf);
        drop(state);
        self.tx.ready.notify_all();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Port for LoopbackPort {
    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn clear_buffers(&mut self) -> Result<()> {
        self.rx.lock()?.data.clear();
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn close(&mut self) -> Result<()> {
        self.rx.close();
        self.tx.close();
        Ok(())
    }
}

impl Drop for LoopbackPort {
    fn drop(&mut self) {
        self.rx.close();
        self.tx.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pair_transfers_bytes() {
        let (mut a, mut b) = LoopbackPort::pair();
        a.write_all_bytes(b"hello").unwrap();
        assert_eq!(b.pending(), 5);

        let mut buf = [0u8; 8];
        let n = b.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");
    }

    #[test]
    fn test_read_times_out() {
        let (_a, mut b) = LoopbackPort::pair();
        b.set_timeout(Duration::from_millis(5)).unwrap();
        let err = b.read(&mut [0u8; 4]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[test]
    fn test_drop_signals_eof() {
        let (a, mut b) = LoopbackPort::pair();
        drop(a);
        assert_eq!(b.read(&mut [0u8; 4]).unwrap(), 0);
        assert!(b.write(b"x").is_err());
    }

    #[test]
    fn test_buffered_data_survives_close() {
        let (mut a, mut b) = LoopbackPort::pair();
        a.write_all(b"ab").unwrap();
        drop(a);
        let mut buf = [0u8; 4];
        assert_eq!(b.read(&mut buf).unwrap(), 2);
        assert_eq!(b.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_cross_thread_wakeup() {
        let (mut a, mut b) = LoopbackPort::pair();
        b.set_timeout(Duration::from_secs(2)).unwrap();
        let writer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            a.write_all(b"z").unwrap();
            a
        });
        let mut buf = [0u8; 1];
        assert_eq!(b.read(&mut buf).unwrap(), 1);
        assert_eq!(buf[0], b'z');
        drop(writer.join().unwrap());
    }
}
