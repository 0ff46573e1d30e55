//! Link bring-up: boot banner check followed by a hello/ack exchange.

use std::fmt;
use std::io::Write;
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};
use serde::Deserialize;

use crate::errors::HandshakeError;
use crate::link::SerialLink;

// ============================================================================
// Constants
// ============================================================================

/// Line the firmware prints once it has booted.
pub const READY_BANNER: &[u8] = b"Ready!\r\n";

const CMD_HELLO: u8 = b'H';
const RESP_ACK: u8 = b'I';

/// Time the board needs to reboot after the port is opened.
pub const SETTLE_DELAY: Duration = Duration::from_secs(5);

/// Gap between polls for the ack byte.
pub const ACK_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Polls for the ack byte before giving up.
pub const ACK_ATTEMPTS: u32 = 5;

// ============================================================================
// State
// ============================================================================

/// Lifecycle of the link as seen by the rest of the crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Handshaking,
    Connected,
    Failed,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Handshaking => "handshaking",
            ConnectionState::Connected => "connected",
            ConnectionState::Failed => "failed",
            ConnectionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Fine-grained handshake progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStage {
    NotConnected,
    AwaitingBanner,
    BannerOk,
    BannerBad,
    AwaitingEcho,
    Connected,
    Failed,
}

impl HandshakeStage {
    pub fn connection_state(self) -> ConnectionState {
        match self {
            HandshakeStage::NotConnected => ConnectionState::Disconnected,
            HandshakeStage::Connected => ConnectionState::Connected,
            HandshakeStage::Failed | HandshakeStage::BannerBad => ConnectionState::Failed,
            _ => ConnectionState::Handshaking,
        }
    }
}

/// Handshake timing. Defaults match the reference firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct HandshakeConfig {
    #[serde(with = "humantime_serde")]
    pub settle_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    pub max_attempts: u32,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            settle_delay: SETTLE_DELAY,
            poll_interval: ACK_POLL_INTERVAL,
            max_attempts: ACK_ATTEMPTS,
        }
    }
}

impl HandshakeConfig {
    /// No waiting at all; for scripted links.
    pub fn immediate() -> Self {
        Self {
            settle_delay: Duration::ZERO,
            poll_interval: Duration::ZERO,
            max_attempts: ACK_ATTEMPTS,
        }
    }
}

// ============================================================================
// Handshake
// ============================================================================

/// Runs the bring-up sequence once on a freshly opened link.
///
/// ```text
/// NotConnected -> AwaitingBanner -> BannerOk | BannerBad
///              -> AwaitingEcho   -> Connected | Failed
/// ```
#[derive(Debug)]
pub struct Handshake {
    config: HandshakeConfig,
    stage: HandshakeStage,
}

impl Handshake {
    pub fn new(config: HandshakeConfig) -> Self {
        Self {
            config,
            stage: HandshakeStage::NotConnected,
        }
    }

    pub fn stage(&self) -> HandshakeStage {
        self.stage
    }

    /// Run the handshake. On error the stage is `Failed` (or `BannerBad`) and
    /// the caller must close the link.
    pub fn run<L: SerialLink + ?Sized>(&mut self, link: &mut L) -> Result<(), HandshakeError> {
        debug!("waiting {:?} for the peripheral to boot", self.config.settle_delay);
        thread::sleep(self.config.settle_delay);

        if let Err(e) = self.read_banner(link) {
            warn!("handshake failed: {}", e);
            return Err(e);
        }
        match self.exchange_hello(link) {
            Ok(()) => {
                self.stage = HandshakeStage::Connected;
                info!("peripheral connected");
                Ok(())
            }
            Err(e) => {
                self.stage = HandshakeStage::Failed;
                warn!("handshake failed: {}", e);
                Err(e)
            }
        }
    }

    /// Read banner lines until a read comes back empty. One of them must be
    /// exactly the ready banner.
    fn read_banner<L: SerialLink + ?Sized>(&mut self, link: &mut L) -> Result<(), HandshakeError> {
        self.stage = HandshakeStage::AwaitingBanner;
        let mut collected = Vec::new();
        let mut ready = false;
        loop {
            let line = link.read_line().map_err(|e| {
                self.stage = HandshakeStage::Failed;
                HandshakeError::Io(e)
            })?;
            if line.is_empty() {
                break;
            }
            debug!("banner line: {:?}", String::from_utf8_lossy(&line));
            ready |= line == READY_BANNER;
            collected.extend_from_slice(&line);
        }

        if ready {
            self.stage = HandshakeStage::BannerOk;
            Ok(())
        } else {
            self.stage = HandshakeStage::BannerBad;
            Err(HandshakeError::UnexpectedBanner(
                String::from_utf8_lossy(&collected).into_owned(),
            ))
        }
    }

    fn exchange_hello<L: SerialLink + ?Sized>(&mut self, link: &mut L) -> Result<(), HandshakeError> {
        link.clear_input()?;
        link.write_all(&[CMD_HELLO])?;
        link.flush()?;
        self.stage = HandshakeStage::AwaitingEcho;

        for attempt in 1..=self.config.max_attempts {
            thread::sleep(self.config.poll_interval);
            if link.bytes_available()? > 0 {
                let byte = link.read_byte()?;
                if byte == RESP_ACK {
                    debug!("ack received on attempt {}/{}", attempt, self.config.max_attempts);
                    return Ok(());
                }
                return Err(HandshakeError::UnexpectedResponse(byte));
            }
            debug!("no ack on attempt {}/{}", attempt, self.config.max_attempts);
        }
        Err(HandshakeError::NoResponse)
    }
}
