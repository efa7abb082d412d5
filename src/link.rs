//! Serial session with the battery bus.
//!
//! The bus is half duplex and shared by all units, so a single
//! [`LinkSession`] serialises every exchange. Link level faults feed the
//! session's [`FailureTracker`]; a completed but empty response does not.

use crate::breaker::FailureTracker;
use crate::protocol::{StartMarker, LINE_TERMINATOR, LOGIN, WAKE_FRAME};
use crate::{Error, Result};
use std::time::{Duration, Instant};

/// Byte channel the session talks through.
pub trait Port {
    fn set_baud_rate(&mut self, baud_rate: u32) -> Result<()>;
    fn set_timeout(&mut self, timeout: Duration) -> Result<()>;
    /// Discards pending input and output.
    fn clear_buffers(&mut self) -> Result<()>;
    fn bytes_to_read(&mut self) -> Result<u32>;
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;
    fn write_all(&mut self, buf: &[u8]) -> Result<()>;
    fn flush(&mut self) -> Result<()>;
}

#[cfg_attr(docsrs, doc(cfg(feature = "serialport")))]
#[cfg(feature = "serialport")]
impl Port for Box<dyn serialport::SerialPort> {
    fn set_baud_rate(&mut self, baud_rate: u32) -> Result<()> {
        Ok(serialport::SerialPort::set_baud_rate(&mut **self, baud_rate)?)
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        Ok(serialport::SerialPort::set_timeout(&mut **self, timeout)?)
    }

    fn clear_buffers(&mut self) -> Result<()> {
        Ok(serialport::SerialPort::clear(
            &**self,
            serialport::ClearBuffer::All,
        )?)
    }

    fn bytes_to_read(&mut self) -> Result<u32> {
        Ok(serialport::SerialPort::bytes_to_read(&**self)?)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        Ok(std::io::Read::read(&mut **self, buf)?)
    }

    fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        Ok(std::io::Write::write_all(&mut **self, buf)?)
    }

    fn flush(&mut self) -> Result<()> {
        Ok(std::io::Write::flush(&mut **self)?)
    }
}

/// Opens `device` as 8N1 without flow control.
#[cfg_attr(docsrs, doc(cfg(feature = "serialport")))]
#[cfg(feature = "serialport")]
pub fn serial_opener(device: String, timeout: Duration) -> Opener<Box<dyn serialport::SerialPort>> {
    Box::new(move |baud_rate: u32| -> Result<Box<dyn serialport::SerialPort>> {
        log::debug!("Opening {device} at {baud_rate} baud");
        let port = serialport::new(&device, baud_rate)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .timeout(timeout)
            .open()?;
        Ok(port)
    })
}

/// Timing and retry parameters of the session.
#[derive(Debug, Clone)]
pub struct LinkSettings {
    /// Baud rate the wake frame is sent at.
    pub wake_baud: u32,
    /// Operating baud rate, 8N1.
    pub baud: u32,
    /// Read timeout of the underlying port.
    pub timeout: Duration,
    /// Pause after the wake frame and after the login.
    pub settle: Duration,
    /// Pause after each written command.
    pub write_settle: Duration,
    pub write_retries: u32,
    pub write_backoff: Duration,
    pub init_attempts: u32,
    pub init_backoff: Duration,
    /// Sleep between polls of the input buffer while waiting for a response.
    pub poll_interval: Duration,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            wake_baud: 1200,
            baud: 19200,
            timeout: Duration::from_secs(5),
            settle: Duration::from_millis(500),
            write_settle: Duration::from_millis(50),
            write_retries: 2,
            write_backoff: Duration::from_secs(1),
            init_attempts: 3,
            init_backoff: Duration::from_secs(2),
            poll_interval: Duration::from_millis(5),
        }
    }
}

/// Lines collected from one response.
pub type LineBatch = Vec<String>;

/// Opens the port at the requested baud rate.
pub type Opener<P> = Box<dyn FnMut(u32) -> Result<P>>;

pub struct LinkSession<P: Port> {
    port: Option<P>,
    opener: Opener<P>,
    settings: LinkSettings,
    tracker: FailureTracker,
}

impl<P: Port> std::fmt::Debug for LinkSession<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkSession")
            .field("open", &self.port.is_some())
            .field("settings", &self.settings)
            .field("tracker", &self.tracker)
            .finish()
    }
}

fn handshake<P: Port>(opener: &mut Opener<P>, settings: &LinkSettings) -> Result<P> {
    let mut port = opener(settings.wake_baud)?;
    port.write_all(WAKE_FRAME)?;
    port.flush()?;
    std::thread::sleep(settings.settle);

    port.set_baud_rate(settings.baud)?;
    port.write_all(&[LINE_TERMINATOR])?;
    port.write_all(LOGIN.as_bytes())?;
    port.write_all(&[LINE_TERMINATOR])?;
    port.flush()?;
    std::thread::sleep(settings.settle);

    port.set_timeout(settings.timeout)?;
    Ok(port)
}

impl<P: Port> LinkSession<P> {
    /// Wakes the bus and logs into its console. The whole sequence is retried
    /// `init_attempts` times; `Error::LinkInit` when every attempt failed.
    pub fn initialize(
        mut opener: Opener<P>,
        settings: LinkSettings,
        mut tracker: FailureTracker,
    ) -> Result<Self> {
        let attempts = settings.init_attempts.max(1);
        for attempt in 1..=attempts {
            match handshake(&mut opener, &settings) {
                Ok(port) => {
                    log::info!("Serial connection initialized");
                    tracker.record_success();
                    return Ok(Self {
                        port: Some(port),
                        opener,
                        settings,
                        tracker,
                    });
                }
                Err(err) => {
                    log::error!("Serial initialization attempt {attempt} of {attempts} failed: {err}");
                    tracker.record_failure();
                    if attempt < attempts {
                        std::thread::sleep(settings.init_backoff);
                    }
                }
            }
        }
        log::error!("Max serial initialization attempts reached");
        Err(Error::LinkInit { attempts })
    }

    pub fn settings(&self) -> &LinkSettings {
        &self.settings
    }

    pub fn tracker(&self) -> &FailureTracker {
        &self.tracker
    }

    pub fn is_open(&self) -> bool {
        self.port.is_some()
    }

    pub fn close(&mut self) {
        if self.port.take().is_some() {
            log::info!("Serial port closed");
        }
    }

    fn ensure_open(&mut self) -> Result<&mut P> {
        if self.port.is_none() {
            let mut port = (self.opener)(self.settings.baud)?;
            port.set_timeout(self.settings.timeout)?;
            log::debug!("Serial port opened");
            self.port = Some(port);
        }
        // Populated above.
        self.port
            .as_mut()
            .ok_or_else(|| Error::Io(std::io::ErrorKind::NotConnected.into()))
    }

    fn try_write(&mut self, request: &str) -> Result<()> {
        let write_settle = self.settings.write_settle;
        let port = self.ensure_open()?;
        port.clear_buffers()?;
        let mut frame = Vec::with_capacity(request.len() + 1);
        frame.extend(request.chars().map(latin1));
        frame.push(LINE_TERMINATOR);
        port.write_all(&frame)?;
        port.flush()?;
        std::thread::sleep(write_settle);
        Ok(())
    }

    /// Sends `request` followed by the line terminator, retrying up to
    /// `write_retries` times. Exhaustion counts as one link failure; a
    /// successful write does not reset the tracker.
    pub fn write(&mut self, request: &str) -> Result<()> {
        let retries = self.settings.write_retries.max(1);
        for attempt in 1..=retries {
            match self.try_write(request) {
                Ok(()) => {
                    log::debug!("Serial write successful for request '{request}'");
                    return Ok(());
                }
                Err(err) => {
                    log::warn!(
                        "Serial write error for request '{request}' on attempt {attempt}: {err}"
                    );
                    self.port = None;
                    if attempt < retries {
                        std::thread::sleep(self.settings.write_backoff);
                    }
                }
            }
        }
        self.tracker.record_failure();
        Err(Error::WriteFailed(request.to_string()))
    }

    /// Collects response lines. Collection opens at the first line matching
    /// `start` and ends with the first collected line containing `stop`.
    ///
    /// On timeout the lines collected so far are returned; on an I/O error
    /// nothing is. Both count as a link failure.
    pub fn read_until(&mut self, start: StartMarker, stop: &str, timeout: Duration) -> LineBatch {
        let poll_interval = self.settings.poll_interval;
        let port = match self.ensure_open() {
            Ok(port) => port,
            Err(err) => {
                log::warn!("Serial read error: {err}");
                self.tracker.record_failure();
                return LineBatch::new();
            }
        };
        match collect_lines(port, start, stop, timeout, poll_interval) {
            Ok(Collected::Complete(lines)) => {
                log::debug!("Serial read completed, lines collected: {}", lines.len());
                self.tracker.record_success();
                lines
            }
            Ok(Collected::TimedOut(lines)) => {
                log::warn!(
                    "Serial read timeout after {timeout:?}, lines collected: {}",
                    lines.len()
                );
                self.tracker.record_failure();
                lines
            }
            Err(err) => {
                log::warn!("Serial read error: {err}");
                self.port = None;
                self.tracker.record_failure();
                LineBatch::new()
            }
        }
    }
}

/// Characters outside latin-1 are sent as `?`.
fn latin1(c: char) -> u8 {
    u8::try_from(u32::from(c)).unwrap_or(b'?')
}

enum Collected {
    Complete(LineBatch),
    TimedOut(LineBatch),
}

fn collect_lines<P: Port>(
    port: &mut P,
    start: StartMarker,
    stop: &str,
    timeout: Duration,
    poll_interval: Duration,
) -> Result<Collected> {
    let started_at = Instant::now();
    let mut line = String::new();
    let mut lines = LineBatch::new();
    let mut collecting = false;
    let mut buf = [0u8; 256];

    loop {
        let pending = port.bytes_to_read()?;
        if pending > 0 {
            let len = (pending as usize).min(buf.len());
            let received = port.read(&mut buf[..len])?;
            for byte in &buf[..received] {
                // latin-1 decoding
                line.push(char::from(*byte));
                if *byte != LINE_TERMINATOR {
                    continue;
                }
                log::trace!("Read line: {}", line.trim());
                if !collecting && start.matches(&line) {
                    collecting = true;
                }
                if collecting {
                    let done = line.contains(stop);
                    lines.push(std::mem::take(&mut line));
                    if done {
                        return Ok(Collected::Complete(lines));
                    }
                } else {
                    line.clear();
                }
            }
        } else {
            std::thread::sleep(poll_interval);
        }
        if started_at.elapsed() > timeout {
            return Ok(Collected::TimedOut(lines));
        }
    }
}
