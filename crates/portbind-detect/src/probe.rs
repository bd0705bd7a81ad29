//! Identity probing over serial
//!
//! Each device node is walked down a ladder of baud rates. At every rate the
//! port is opened, given a moment to settle, flushed, sent the probe byte and
//! read for one reply line. The ladder itself ([`ProbeLadder`]) is a pure state
//! machine so its termination rules can be tested without any I/O; the async
//! driver ([`DeviceProber`]) only performs the attempts it is told to.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::time::{sleep, timeout};
use tokio_serial::{ClearBuffer, SerialPort, SerialPortBuilderExt, SerialStream};
use tracing::{debug, info, trace, warn};

use crate::device::{DeviceName, DeviceNode, ProbeOutcome};
use crate::error::{DetectError, ProbeError};

/// Byte sent to ask a peripheral for its name
pub const PROBE_BYTE: u8 = b'i';

/// Fastest rate first, most conservative last
pub const DEFAULT_BAUD_RATES: [u32; 3] = [230_400, 115_200, 9_600];

/// Attempts per baud rate before moving on
pub const DEFAULT_MAX_ATTEMPTS: u32 = 30;

/// Configuration for probing
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// Baud rates to try, in order
    pub baud_rates: Vec<u32>,
    /// Failed attempts allowed at each rate
    pub max_attempts: u32,
    /// How long to wait for a reply line
    pub read_timeout: Duration,
    /// Delay between opening the port and flushing it
    pub settle_delay: Duration,
    /// Delay between failed attempts at the same rate
    pub retry_delay: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            baud_rates: DEFAULT_BAUD_RATES.to_vec(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            read_timeout: Duration::from_secs(2),
            settle_delay: Duration::from_millis(500),
            retry_delay: Duration::from_millis(500),
        }
    }
}

/// Shared flag that aborts probing between attempts
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// What a single attempt produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptResult {
    /// Reply matched a known identity
    Valid(DeviceName),
    /// Reply was text, but not a known identity
    Invalid(String),
    /// Reply bytes were not UTF-8
    Undecodable(Vec<u8>),
    /// Nothing (or only whitespace) arrived before the timeout
    Silent,
    /// The port could not be opened at this rate
    OpenError(DetectError),
    /// The port failed mid-conversation
    IoError(DetectError),
}

impl AttemptResult {
    /// Classify the raw bytes of one reply line
    pub fn classify(raw: &[u8]) -> Self {
        if raw.is_empty() {
            return Self::Silent;
        }
        match std::str::from_utf8(raw) {
            Ok(text) => {
                let text = text.trim();
                if text.is_empty() {
                    Self::Silent
                } else {
                    match text.parse::<DeviceName>() {
                        Ok(name) => Self::Valid(name),
                        Err(_) => Self::Invalid(text.to_string()),
                    }
                }
            }
            Err(_) => Self::Undecodable(raw.to_vec()),
        }
    }
}

/// Next action dictated by the ladder
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Perform attempt number `attempt` (1-based) at `baud`
    Attempt { baud: u32, attempt: u32 },
    /// Probing is over
    Done(ProbeOutcome),
}

/// Baud-rate ladder with a per-rate attempt budget
#[derive(Debug, Clone)]
pub struct ProbeLadder {
    baud_rates: Vec<u32>,
    max_attempts: u32,
    rate_index: usize,
    failed_at_rate: u32,
    total_attempts: u32,
    heard_reply: bool,
    fallback_name: String,
    identified: Option<DeviceName>,
}

impl ProbeLadder {
    pub fn new(baud_rates: Vec<u32>, max_attempts: u32, fallback_name: impl Into<String>) -> Self {
        Self {
            baud_rates,
            max_attempts,
            rate_index: 0,
            failed_at_rate: 0,
            total_attempts: 0,
            heard_reply: false,
            fallback_name: fallback_name.into(),
            identified: None,
        }
    }

    /// Attempts performed so far, across all rates
    pub fn total_attempts(&self) -> u32 {
        self.total_attempts
    }

    /// Whether any non-empty reply has been heard
    pub fn heard_reply(&self) -> bool {
        self.heard_reply
    }

    pub fn next_step(&self) -> Step {
        if let Some(name) = self.identified {
            return Step::Done(ProbeOutcome::Identified(name));
        }
        // A zero budget exhausts every rate without an attempt
        if self.max_attempts == 0 || self.rate_index >= self.baud_rates.len() {
            return Step::Done(self.exhausted_outcome());
        }
        Step::Attempt {
            baud: self.baud_rates[self.rate_index],
            attempt: self.failed_at_rate + 1,
        }
    }

    /// Feed the result of the attempt returned by the last [`next_step`](Self::next_step)
    pub fn record(&mut self, result: AttemptResult) -> Step {
        if matches!(self.next_step(), Step::Done(_)) {
            return self.next_step();
        }
        self.total_attempts += 1;

        match result {
            AttemptResult::Valid(name) => self.identified = Some(name),
            AttemptResult::Invalid(_) | AttemptResult::Undecodable(_) => {
                self.heard_reply = true;
                self.count_failure();
            }
            AttemptResult::Silent => self.count_failure(),
            // Transport errors abandon the rate without using its budget
            AttemptResult::OpenError(_) | AttemptResult::IoError(_) => self.advance_rate(),
        }

        self.next_step()
    }

    fn count_failure(&mut self) {
        self.failed_at_rate += 1;
        if self.failed_at_rate >= self.max_attempts {
            self.advance_rate();
        }
    }

    fn advance_rate(&mut self) {
        self.rate_index += 1;
        self.failed_at_rate = 0;
    }

    fn exhausted_outcome(&self) -> ProbeOutcome {
        if self.heard_reply {
            ProbeOutcome::GenericFallback(self.fallback_name.clone())
        } else {
            ProbeOutcome::NoResponse
        }
    }
}

/// A bidirectional channel to a peripheral
pub trait ProbeLink: AsyncRead + AsyncWrite + Unpin + Send {
    /// Discard anything already sitting in the receive buffer
    fn clear_input(&mut self) -> io::Result<()>;
}

impl ProbeLink for SerialStream {
    fn clear_input(&mut self) -> io::Result<()> {
        SerialPort::clear(self, ClearBuffer::Input).map_err(io::Error::from)
    }
}

/// Opens a [`ProbeLink`] to a device node at a given rate
pub trait PortOpener: Send + Sync {
    type Link: ProbeLink;

    fn open(
        &self,
        node: &DeviceNode,
        baud_rate: u32,
        timeout: Duration,
    ) -> Result<Self::Link, DetectError>;
}

/// Opens real serial ports through tokio-serial
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialOpener;

impl PortOpener for SerialOpener {
    type Link = SerialStream;

    fn open(
        &self,
        node: &DeviceNode,
        baud_rate: u32,
        timeout: Duration,
    ) -> Result<SerialStream, DetectError> {
        tokio_serial::new(node.path().to_string_lossy(), baud_rate)
            .timeout(timeout)
            .open_native_async()
            .map_err(|e| DetectError::OpenFailed {
                port: node.to_string(),
                reason: e.to_string(),
            })
    }
}

/// Result of probing one node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeReport {
    pub outcome: ProbeOutcome,
    /// Attempts performed across all rates
    pub attempts: u32,
    /// Rate the identity was received at
    pub baud_rate: Option<u32>,
}

/// Drives a [`ProbeLadder`] against real (or simulated) ports
pub struct DeviceProber<O> {
    opener: O,
    config: ProbeConfig,
    cancel: CancelFlag,
}

impl<O: PortOpener> DeviceProber<O> {
    pub fn new(opener: O, config: ProbeConfig) -> Self {
        Self {
            opener,
            config,
            cancel: CancelFlag::new(),
        }
    }

    /// Abort probing when `cancel` is raised
    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &ProbeConfig {
        &self.config
    }

    pub fn opener(&self) -> &O {
        &self.opener
    }

    /// Probe one node until it identifies itself or the ladder runs out
    pub async fn probe(&self, node: &DeviceNode) -> Result<ProbeReport, ProbeError> {
        info!("Communicating with {}...", node);

        let mut ladder = ProbeLadder::new(
            self.config.baud_rates.clone(),
            self.config.max_attempts,
            node.fallback_name(),
        );
        let mut step = ladder.next_step();
        let mut last_baud = None;

        loop {
            match step {
                Step::Done(outcome) => {
                    let baud_rate = match outcome {
                        ProbeOutcome::Identified(_) => last_baud,
                        _ => None,
                    };
                    match &outcome {
                        ProbeOutcome::Identified(name) => {
                            info!("{} identified as {}", node, name)
                        }
                        ProbeOutcome::GenericFallback(name) => {
                            warn!("{} never sent a valid name, using {}", node, name)
                        }
                        ProbeOutcome::NoResponse => {
                            warn!("No response from {} after trying all baud rates", node)
                        }
                    }
                    return Ok(ProbeReport {
                        outcome,
                        attempts: ladder.total_attempts(),
                        baud_rate,
                    });
                }
                Step::Attempt { baud, attempt } => {
                    self.check_cancelled()?;
                    if attempt == 1 {
                        info!("  Trying baud rate: {}...", baud);
                    } else {
                        sleep(self.config.retry_delay).await;
                        self.check_cancelled()?;
                    }
                    last_baud = Some(baud);

                    let result = self.attempt(node, baud).await;
                    self.log_attempt(attempt, &result);
                    step = ladder.record(result);
                }
            }
        }
    }

    fn check_cancelled(&self) -> Result<(), ProbeError> {
        if self.cancel.is_cancelled() {
            debug!("Probe cancelled");
            return Err(ProbeError::Cancelled);
        }
        Ok(())
    }

    /// One open/flush/probe/read cycle; the link is dropped (closed) on return
    async fn attempt(&self, node: &DeviceNode, baud: u32) -> AttemptResult {
        let mut link = match self.opener.open(node, baud, self.config.read_timeout) {
            Ok(link) => link,
            Err(e) => return AttemptResult::OpenError(e),
        };

        match self.converse(&mut link).await {
            Ok(raw) => AttemptResult::classify(&raw),
            Err(e) => AttemptResult::IoError(DetectError::Io {
                port: node.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    async fn converse(&self, link: &mut O::Link) -> io::Result<Vec<u8>> {
        // Some peripherals need time to initialise after the port opens
        sleep(self.config.settle_delay).await;
        link.clear_input()?;

        link.write_all(&[PROBE_BYTE]).await?;
        link.flush().await?;

        let mut reader = BufReader::new(link);
        let mut raw = Vec::new();
        match timeout(self.config.read_timeout, reader.read_until(b'\n', &mut raw)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => trace!("Read timed out with {} byte(s) buffered", raw.len()),
        }
        Ok(raw)
    }

    fn log_attempt(&self, attempt: u32, result: &AttemptResult) {
        let max = self.config.max_attempts;
        match result {
            AttemptResult::Valid(name) => {
                info!("  Attempt {}: valid device name received: {}", attempt, name)
            }
            AttemptResult::Invalid(text) => info!(
                "  Attempt {}/{}: invalid device name {:?}, expected one of {:?}",
                attempt,
                max,
                text,
                DeviceName::ALL.map(|n| n.as_str())
            ),
            AttemptResult::Undecodable(raw) => {
                info!("  Attempt {}/{}: binary reply {:02x?}", attempt, max, raw)
            }
            AttemptResult::Silent => debug!("  Attempt {}/{}: no response", attempt, max),
            AttemptResult::OpenError(e) | AttemptResult::IoError(e) => {
                warn!("  Attempt {}: {}; abandoning this baud rate", attempt, e)
            }
        }
    }
}
