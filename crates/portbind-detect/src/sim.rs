//! Simulated peripheral
//!
//! Provides a scripted device that answers the probe byte, so the probe state
//! machine can be exercised without hardware.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::device::DeviceNode;
use crate::error::DetectError;
use crate::probe::{PortOpener, ProbeLink, PROBE_BYTE};

/// How the simulated peripheral behaves for one attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimReply {
    /// Send these bytes back after the probe byte
    Bytes(Vec<u8>),
    /// Close the read side without sending anything
    Silent,
    /// Never answer; the reader only returns on its own timeout
    Hang,
    /// Refuse to open
    OpenFails,
    /// Open, then fail on write
    IoFails,
}

impl SimReply {
    /// A CRLF-terminated text line, as firmware usually prints it
    pub fn line(text: &str) -> Self {
        Self::Bytes(format!("{text}\r\n").into_bytes())
    }
}

/// Counters shared between a peripheral and the links it opens
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimStats {
    /// Successful opens
    pub opens: u32,
    /// Probe bytes received
    pub probes_received: u32,
    /// Open calls per baud rate, including failed ones
    pub attempts_by_baud: HashMap<u32, u32>,
}

type Script = Box<dyn Fn(u32, u32) -> SimReply + Send + Sync>;

/// A scripted peripheral
///
/// The script receives the baud rate and the 1-based attempt number at that
/// rate and decides the reply.
pub struct VirtualPeripheral {
    script: Script,
    stats: Arc<Mutex<SimStats>>,
}

impl VirtualPeripheral {
    pub fn new(script: impl Fn(u32, u32) -> SimReply + Send + Sync + 'static) -> Self {
        Self {
            script: Box::new(script),
            stats: Arc::new(Mutex::new(SimStats::default())),
        }
    }

    /// Same reply to every attempt at every rate
    pub fn always(reply: SimReply) -> Self {
        Self::new(move |_, _| reply.clone())
    }

    /// Answers `name` only at `baud`, silent elsewhere
    pub fn identifying_at(name: &str, baud: u32) -> Self {
        let reply = SimReply::line(name);
        Self::new(move |rate, _| {
            if rate == baud {
                reply.clone()
            } else {
                SimReply::Silent
            }
        })
    }

    pub fn stats(&self) -> SimStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl PortOpener for VirtualPeripheral {
    type Link = SimLink;

    fn open(
        &self,
        node: &DeviceNode,
        baud_rate: u32,
        _timeout: Duration,
    ) -> Result<SimLink, DetectError> {
        let attempt = {
            let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
            let count = stats.attempts_by_baud.entry(baud_rate).or_insert(0);
            *count += 1;
            *count
        };

        let reply = (self.script)(baud_rate, attempt);
        if reply == SimReply::OpenFails {
            return Err(DetectError::OpenFailed {
                port: node.to_string(),
                reason: "device or resource busy".to_string(),
            });
        }

        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .opens += 1;

        Ok(SimLink {
            reply,
            rx: VecDeque::new(),
            answered: false,
            stats: Arc::clone(&self.stats),
        })
    }
}

/// One open connection to a [`VirtualPeripheral`]
pub struct SimLink {
    reply: SimReply,
    rx: VecDeque<u8>,
    answered: bool,
    stats: Arc<Mutex<SimStats>>,
}

impl ProbeLink for SimLink {
    fn clear_input(&mut self) -> io::Result<()> {
        self.rx.clear();
        Ok(())
    }
}

impl AsyncWrite for SimLink {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.reply == SimReply::IoFails {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "device disconnected",
            )));
        }
        for _ in buf.iter().filter(|b| **b == PROBE_BYTE) {
            this.stats
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .probes_received += 1;
            if !this.answered {
                this.answered = true;
                if let SimReply::Bytes(bytes) = &this.reply {
                    this.rx.extend(bytes.iter().copied());
                }
            }
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl AsyncRead for SimLink {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.rx.is_empty() {
            if this.reply == SimReply::Hang {
                return Poll::Pending;
            }
            // End of stream: the reader sees zero bytes
            return Poll::Ready(Ok(()));
        }
        let n = buf.remaining().min(this.rx.len());
        let chunk: Vec<u8> = this.rx.drain(..n).collect();
        buf.put_slice(&chunk);
        Poll::Ready(Ok(()))
    }
}
