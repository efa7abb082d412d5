//! Scripted in-memory bus used by the unit tests.

use crate::link::{LinkSettings, Opener, Port};
use crate::{Error, Result};
use std::cell::{RefCell, RefMut};
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::time::Duration;

#[derive(Debug, Default)]
pub struct BusState {
    /// Bytes waiting to be read.
    pub incoming: VecDeque<u8>,
    /// Every byte written so far.
    pub written: Vec<u8>,
    /// Response queued whenever the keyed request line is written.
    pub responses: HashMap<String, String>,
    pub bauds: Vec<u32>,
    pub opens: u32,
    pub clears: u32,
    /// Number of upcoming opens that fail.
    pub fail_open: u32,
    /// Number of upcoming writes that fail.
    pub fail_write: u32,
    pub fail_read: bool,
    line: Vec<u8>,
}

impl BusState {
    pub fn feed(&mut self, text: &str) {
        self.incoming.extend(text.bytes());
    }

    pub fn respond(&mut self, request: &str, response: &str) {
        self.responses.insert(request.to_string(), response.to_string());
    }
}

#[derive(Debug, Clone, Default)]
pub struct MockBus(Rc<RefCell<BusState>>);

impl MockBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> RefMut<'_, BusState> {
        self.0.borrow_mut()
    }

    pub fn opener(&self) -> Opener<MockBus> {
        let bus = self.clone();
        Box::new(move |baud: u32| -> Result<MockBus> {
            let mut state = bus.state();
            state.opens += 1;
            if state.fail_open > 0 {
                state.fail_open -= 1;
                return Err(Error::Io(std::io::ErrorKind::NotFound.into()));
            }
            state.bauds.push(baud);
            drop(state);
            Ok(bus.clone())
        })
    }
}

/// Settings without any sleeps.
pub fn test_settings() -> LinkSettings {
    LinkSettings {
        settle: Duration::ZERO,
        write_settle: Duration::ZERO,
        write_backoff: Duration::ZERO,
        init_backoff: Duration::ZERO,
        poll_interval: Duration::ZERO,
        ..Default::default()
    }
}

impl Port for MockBus {
    fn set_baud_rate(&mut self, baud_rate: u32) -> Result<()> {
        self.state().bauds.push(baud_rate);
        Ok(())
    }

    fn set_timeout(&mut self, _timeout: Duration) -> Result<()> {
        Ok(())
    }

    fn clear_buffers(&mut self) -> Result<()> {
        let mut state = self.state();
        state.clears += 1;
        state.incoming.clear();
        Ok(())
    }

    fn bytes_to_read(&mut self) -> Result<u32> {
        Ok(self.state().incoming.len() as u32)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut state = self.state();
        if state.fail_read {
            return Err(Error::Io(std::io::ErrorKind::BrokenPipe.into()));
        }
        let len = buf.len().min(state.incoming.len());
        for (slot, byte) in buf.iter_mut().zip(state.incoming.drain(..len)) {
            *slot = byte;
        }
        Ok(len)
    }

    fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        let mut state = self.state();
        if state.fail_write > 0 {
            state.fail_write -= 1;
            return Err(Error::Io(std::io::ErrorKind::BrokenPipe.into()));
        }
        state.written.extend_from_slice(buf);
        for byte in buf {
            if *byte == b'\n' {
                let line = String::from_utf8_lossy(&std::mem::take(&mut state.line)).into_owned();
                if let Some(response) = state.responses.get(&line).cloned() {
                    state.feed(&response);
                }
            } else {
                state.line.push(*byte);
            }
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}
