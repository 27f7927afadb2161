//! In-memory backend for engine tests.
//!
//! Unlike a canned-response stub, this mock genuinely blocks on a condvar and
//! honors wake-ups and bounded timeouts, so the engine's state machine is
//! exercised with real suspension points and no hardware.

use std::collections::VecDeque;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

use crate::config::{SerialConfig, Timeout};
use crate::error::{Error, Result};
use crate::sys::RawPort;

#[derive(Default)]
struct MockState {
    read_queue: VecDeque<u8>,
    write_log: Vec<Vec<u8>>,
    config: Option<SerialConfig>,
    woken: bool,
}

pub(crate) struct MockPort {
    state: Mutex<MockState>,
    data_ready: Condvar,
}

impl MockPort {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                config: Some(SerialConfig::default()),
                ..MockState::default()
            }),
            data_ready: Condvar::new(),
        }
    }

    /// Make bytes available to subsequent (or currently blocked) reads.
    pub(crate) fn push_bytes(&self, data: &[u8]) {
        let mut state = self.state.lock();
        state.read_queue.extend(data);
        self.data_ready.notify_all();
    }

    /// Everything written so far, one entry per write call.
    pub(crate) fn written(&self) -> Vec<Vec<u8>> {
        self.state.lock().write_log.clone()
    }
}

impl RawPort for MockPort {
    fn read_with_timeout(&self, buf: &mut [u8], timeout: Timeout) -> Result<usize> {
        let deadline = timeout
            .as_duration()
            .map(|bound| Instant::now() + bound);
        let mut state = self.state.lock();
        loop {
            if state.woken {
                return Err(Error::ClosedPort);
            }
            if !state.read_queue.is_empty() {
                let mut n = 0;
                for slot in buf.iter_mut() {
                    match state.read_queue.pop_front() {
                        Some(byte) => {
                            *slot = byte;
                            n += 1;
                        }
                        None => break,
                    }
                }
                return Ok(n);
            }
            match deadline {
                None => self.data_ready.wait(&mut state),
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        return Ok(0);
                    }
                    if self
                        .data_ready
                        .wait_until(&mut state, deadline)
                        .timed_out()
                    {
                        // Re-check the queue once; a racing push may have
                        // landed right at the deadline.
                        continue;
                    }
                }
            }
        }
    }

    fn write(&self, buf: &[u8]) -> Result<usize> {
        let mut state = self.state.lock();
        if state.woken {
            return Err(Error::ClosedPort);
        }
        state.write_log.push(buf.to_vec());
        Ok(buf.len())
    }

    fn native_config(&self) -> Result<SerialConfig> {
        self.state
            .lock()
            .config
            .ok_or_else(|| Error::unsupported("no configuration applied"))
    }

    fn set_native_config(&self, config: &SerialConfig) -> Result<()> {
        self.state.lock().config = Some(*config);
        Ok(())
    }

    fn bytes_to_read(&self) -> Result<usize> {
        Ok(self.state.lock().read_queue.len())
    }

    fn discard_buffers(&self) -> Result<()> {
        self.state.lock().read_queue.clear();
        Ok(())
    }

    fn wake(&self) {
        let mut state = self.state.lock();
        state.woken = true;
        self.data_ready.notify_all();
    }

    fn close_native(&self) {}
}
