//! Tagged ASCII messages carried in radio frames.
//!
//! Every frame is either the literal `GET_TIME` or a tag prefix followed by a
//! comma separated payload, e.g. `TRC:12,2024-06-01 10:15:00,C45BBEE4FE08,...`.

use core::fmt::{self, Write};

use thiserror_no_std::Error;

use super::{MAX_FRAME_LEN, Payload};

/// Time request sent to the time authority. Matched exactly.
pub const GET_TIME: &[u8] = b"GET_TIME";

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageError {
    #[error("message of at least {0} bytes exceeds the frame ceiling")]
    TooLong(usize),
}

/// Payload categories the aggregator persists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    Calibrate,
    Climate,
    Trc,
    Syslog,
}

impl Tag {
    /// Order in which prefixes are tried when classifying.
    pub const ROUTING_ORDER: [Tag; 4] = [Tag::Calibrate, Tag::Climate, Tag::Trc, Tag::Syslog];

    pub const fn prefix(self) -> &'static str {
        match self {
            Self::Calibrate => "CALIBRATE:",
            Self::Climate => "CLIMATE:",
            Self::Trc => "TRC:",
            Self::Syslog => "SYSLOG:",
        }
    }

    /// Category name used in log file names.
    pub const fn category(self) -> &'static str {
        match self {
            Self::Calibrate => "CALIBRATE",
            Self::Climate => "CLIMATE",
            Self::Trc => "TRC",
            Self::Syslog => "SYSLOG",
        }
    }
}

/// A classified inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Message<'a> {
    TimeRequest,
    /// A persisted category; `body` has the tag stripped.
    Tagged { tag: Tag, body: &'a str },
    Unclassified,
}

impl<'a> Message<'a> {
    pub fn classify(payload: &'a [u8]) -> Self {
        if payload == GET_TIME {
            return Self::TimeRequest;
        }
        let Ok(text) = core::str::from_utf8(payload) else {
            return Self::Unclassified;
        };
        Tag::ROUTING_ORDER
            .iter()
            .find_map(|tag| {
                text.strip_prefix(tag.prefix())
                    .map(|body| Self::Tagged { tag: *tag, body })
            })
            .unwrap_or(Self::Unclassified)
    }
}

/// Builds a tagged frame in place, refusing to exceed the frame ceiling.
pub struct MessageBuilder {
    buf: heapless::String<MAX_FRAME_LEN>,
    fields: usize,
    overflowed: bool,
}

impl MessageBuilder {
    pub fn new(tag: Tag) -> Self {
        let mut buf = heapless::String::new();
        // Every prefix is far below the ceiling.
        let _ = buf.push_str(tag.prefix());
        Self {
            buf,
            fields: 0,
            overflowed: false,
        }
    }

    /// Append one comma separated field. The first field follows the tag
    /// directly.
    pub fn field(&mut self, value: impl fmt::Display) -> &mut Self {
        let result = if self.fields > 0 {
            write!(self.buf, ",{value}")
        } else {
            write!(self.buf, "{value}")
        };
        if result.is_err() {
            self.overflowed = true;
        }
        self.fields += 1;
        self
    }

    /// Append a reading; NaN is written as `nan`.
    pub fn reading(&mut self, value: f64) -> &mut Self {
        self.field(Reading(value))
    }

    pub fn finish(&self) -> Result<Payload, MessageError> {
        if self.overflowed {
            return Err(MessageError::TooLong(MAX_FRAME_LEN + 1));
        }
        Payload::from_slice(self.buf.as_bytes()).map_err(|_| MessageError::TooLong(self.buf.len()))
    }
}

/// Display adapter that renders NaN as `nan` the way the log files expect.
#[derive(Debug, Clone, Copy)]
pub struct Reading(pub f64);

impl fmt::Display for Reading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_nan() {
            f.write_str("nan")
        } else {
            write!(f, "{}", self.0)
        }
    }
}
