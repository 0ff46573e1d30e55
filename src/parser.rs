//! Tag-dispatched decoding of the peripheral's event stream.
//!
//! Every message starts with a single ASCII tag byte. All tags except the
//! trial-end tag carry a 4-byte little-endian timestamp taken from the
//! firmware's microsecond clock.

use std::fmt;

use log::{debug, trace};

use crate::codec::{next_byte, read_timestamp};
use crate::errors::ProtocolError;
use crate::link::ByteSource;

// Device -> host tags
const TAG_TASK_START: u8 = b'B';
const TAG_SYNC_TONE: u8 = b'S';
const TAG_CONTINUATION_TONE: u8 = b'C';
const TAG_TAP: u8 = b'T';
const TAG_RELEASE: u8 = b'R';
const TAG_TRIAL_END: u8 = b'I';

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    TaskStart,
    SyncTone,
    ContinuationTone,
    Tap,
    Release,
    TrialEnd,
}

impl Tag {
    pub fn as_byte(self) -> u8 {
        match self {
            Tag::TaskStart => TAG_TASK_START,
            Tag::SyncTone => TAG_SYNC_TONE,
            Tag::ContinuationTone => TAG_CONTINUATION_TONE,
            Tag::Tap => TAG_TAP,
            Tag::Release => TAG_RELEASE,
            Tag::TrialEnd => TAG_TRIAL_END,
        }
    }

    /// Whether a timestamp follows this tag on the wire.
    pub fn has_timestamp(self) -> bool {
        !matches!(self, Tag::TrialEnd)
    }
}

impl TryFrom<u8> for Tag {
    type Error = ProtocolError;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        match byte {
            TAG_TASK_START => Ok(Tag::TaskStart),
            TAG_SYNC_TONE => Ok(Tag::SyncTone),
            TAG_CONTINUATION_TONE => Ok(Tag::ContinuationTone),
            TAG_TAP => Ok(Tag::Tap),
            TAG_RELEASE => Ok(Tag::Release),
            TAG_TRIAL_END => Ok(Tag::TrialEnd),
            other => Err(ProtocolError::UnknownTag(other)),
        }
    }
}

/// One decoded message from the peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceEvent {
    TaskStarted { timestamp: u32 },
    SyncTone { timestamp: u32 },
    ContinuationTone { timestamp: u32 },
    Tap { timestamp: u32 },
    Release { timestamp: u32 },
    TrialEnd,
}

impl DeviceEvent {
    pub fn timestamp(&self) -> Option<u32> {
        match *self {
            DeviceEvent::TaskStarted { timestamp }
            | DeviceEvent::SyncTone { timestamp }
            | DeviceEvent::ContinuationTone { timestamp }
            | DeviceEvent::Tap { timestamp }
            | DeviceEvent::Release { timestamp } => Some(timestamp),
            DeviceEvent::TrialEnd => None,
        }
    }

    pub fn tag(&self) -> Tag {
        match self {
            DeviceEvent::TaskStarted { .. } => Tag::TaskStart,
            DeviceEvent::SyncTone { .. } => Tag::SyncTone,
            DeviceEvent::ContinuationTone { .. } => Tag::ContinuationTone,
            DeviceEvent::Tap { .. } => Tag::Tap,
            DeviceEvent::Release { .. } => Tag::Release,
            DeviceEvent::TrialEnd => Tag::TrialEnd,
        }
    }

    fn with_timestamp(tag: Tag, timestamp: u32) -> Self {
        match tag {
            Tag::TaskStart => DeviceEvent::TaskStarted { timestamp },
            Tag::SyncTone => DeviceEvent::SyncTone { timestamp },
            Tag::ContinuationTone => DeviceEvent::ContinuationTone { timestamp },
            Tag::Tap => DeviceEvent::Tap { timestamp },
            Tag::Release => DeviceEvent::Release { timestamp },
            Tag::TrialEnd => DeviceEvent::TrialEnd,
        }
    }
}

impl fmt::Display for DeviceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = char::from(self.tag().as_byte());
        match self.timestamp() {
            Some(ts) => write!(f, "{tag}@{ts}"),
            None => write!(f, "{tag}"),
        }
    }
}

/// Pulls one event per call from a byte source.
///
/// Tracks the last timestamp seen so that a clock going backwards inside a
/// session is reported instead of silently producing out-of-order events.
/// Use a fresh parser (or [`reset`](Self::reset)) per trial, since the
/// peripheral clock may restart between trials.
#[derive(Debug, Default)]
pub struct EventStreamParser {
    last_timestamp: Option<u32>,
    parsed: usize,
}

impl EventStreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.last_timestamp = None;
        self.parsed = 0;
    }

    pub fn events_parsed(&self) -> usize {
        self.parsed
    }

    pub fn last_timestamp(&self) -> Option<u32> {
        self.last_timestamp
    }

    /// Block until one complete event has been read.
    pub fn next_event<S: ByteSource + ?Sized>(
        &mut self,
        source: &mut S,
    ) -> Result<DeviceEvent, ProtocolError> {
        let byte = next_byte(source)?;
        let tag = Tag::try_from(byte).inspect_err(|_| {
            debug!("unknown tag byte {:#04X} after {} events", byte, self.parsed);
        })?;

        let event = if tag.has_timestamp() {
            let timestamp = read_timestamp(source)?;
            self.check_order(timestamp)?;
            DeviceEvent::with_timestamp(tag, timestamp)
        } else {
            DeviceEvent::TrialEnd
        };

        self.parsed += 1;
        trace!("event #{}: {}", self.parsed, event);
        Ok(event)
    }

    /// Discard raw bytes up to and including the next trial-end tag.
    ///
    /// Used once framing is lost (after an unknown tag), when message
    /// boundaries can no longer be trusted. Returns the number of bytes
    /// skipped, not counting the tag.
    pub fn skip_to_trial_end<S: ByteSource + ?Sized>(
        &mut self,
        source: &mut S,
    ) -> Result<usize, ProtocolError> {
        let mut skipped = 0;
        while next_byte(source)? != TAG_TRIAL_END {
            skipped += 1;
        }
        trace!("resynchronized on trial end after {} bytes", skipped);
        Ok(skipped)
    }

    fn check_order(&mut self, timestamp: u32) -> Result<(), ProtocolError> {
        if let Some(previous) = self.last_timestamp {
            if timestamp < previous {
                return Err(ProtocolError::TimestampDesync {
                    previous,
                    current: timestamp,
                });
            }
        }
        self.last_timestamp = Some(timestamp);
        Ok(())
    }
}
