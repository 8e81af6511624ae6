//! Generic framing filters
//!
//! - [`LengthFieldFilter`]: frames prefixed with a big-endian length field
//! - [`LineFilter`]: delimiter-terminated text lines
//!
//! Both strip their framing on arrival and add it back on departure, so a
//! service above them sees bare payloads. Object messages pass through
//! untouched.

use bytes::{BufMut, BytesMut};

use super::{Boundary, Filter, Message, Session};
use crate::error::{Error, Result};

/// Frames carrying a big-endian length prefix of 1, 2, 4 or 8 bytes
///
/// The length counts payload bytes only. Frames whose announced length
/// exceeds the maximum are reported as corrupt input.
///
/// # Examples
///
/// ```rust
/// use horizon_reactor::filter::codec::LengthFieldFilter;
///
/// let filter = LengthFieldFilter::new(4).with_max_frame(64 * 1024);
/// assert_eq!(filter.width(), 4);
/// ```
#[derive(Clone, Debug)]
pub struct LengthFieldFilter {
    width: usize,
    max_frame: usize,
}

impl LengthFieldFilter {
    /// # Panics
    ///
    /// Panics if `width` is not 1, 2, 4 or 8.
    pub fn new(width: usize) -> Self {
        assert!(
            matches!(width, 1 | 2 | 4 | 8),
            "length field width must be 1, 2, 4 or 8 bytes, got {width}"
        );
        let max_frame = match width {
            8 => usize::MAX - 8,
            w => (1usize << (w * 8)) - 1,
        };
        Self { width, max_frame }
    }

    /// Caps the payload length; longer frames are framing errors.
    pub fn with_max_frame(mut self, max_frame: usize) -> Self {
        self.max_frame = self.max_frame.min(max_frame);
        self
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn max_frame(&self) -> usize {
        self.max_frame
    }

    fn read_len(&self, data: &[u8]) -> u64 {
        data[..self.width]
            .iter()
            .fold(0u64, |acc, &b| (acc << 8) | u64::from(b))
    }
}

impl Filter for LengthFieldFilter {
    fn msg_min_size(&self) -> usize {
        self.width
    }

    fn tell_boundary(&self, _session: &Session<'_>, data: &[u8]) -> Boundary {
        if data.len() < self.width {
            return Boundary::Underflow;
        }
        match usize::try_from(self.read_len(data)) {
            Ok(len) if len <= self.max_frame => Boundary::Length(self.width + len),
            _ => Boundary::Error,
        }
    }

    fn on_msg_arrive(&self, _session: &Session<'_>, msg: Message, output: &mut Vec<Message>) -> Result<bool> {
        match msg {
            Message::Bytes(frame) => output.push(Message::Bytes(frame.slice(self.width..))),
            other => output.push(other),
        }
        Ok(true)
    }

    fn on_msg_depart(&self, session: &Session<'_>, msg: Message, output: &mut Vec<Message>) -> Result<bool> {
        let payload = match msg {
            Message::Bytes(payload) => payload,
            other => {
                output.push(other);
                return Ok(true);
            }
        };
        if payload.len() > self.max_frame {
            return Err(Error::filter(
                session.filter_name(),
                format!("frame of {} bytes exceeds {}", payload.len(), self.max_frame),
            ));
        }

        let mut frame = BytesMut::with_capacity(self.width + payload.len());
        let len = payload.len() as u64;
        frame.put_slice(&len.to_be_bytes()[8 - self.width..]);
        frame.put_slice(&payload);
        output.push(Message::Bytes(frame.freeze()));
        Ok(true)
    }
}

/// Line terminator appended on departure
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum LineEnding {
    #[default]
    Lf,
    CrLf,
}

impl LineEnding {
    fn as_bytes(self) -> &'static [u8] {
        match self {
            LineEnding::Lf => b"\n",
            LineEnding::CrLf => b"\r\n",
        }
    }
}

/// Per-channel scan position, so a long line is not rescanned on every read.
#[derive(Default)]
struct LineScan {
    scanned: usize,
}

/// Lines terminated by `\n` or `\r\n`
///
/// Arriving lines are delivered without their terminator. A line longer than
/// the maximum (terminator excluded) is a framing error.
#[derive(Clone, Debug)]
pub struct LineFilter {
    max_line: usize,
    ending: LineEnding,
}

impl Default for LineFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl LineFilter {
    /// Lines of up to 8 KiB, `\n` on departure.
    pub fn new() -> Self {
        Self {
            max_line: 8 * 1024,
            ending: LineEnding::Lf,
        }
    }

    pub fn with_max_line(mut self, max_line: usize) -> Self {
        self.max_line = max_line;
        self
    }

    pub fn with_ending(mut self, ending: LineEnding) -> Self {
        self.ending = ending;
        self
    }
}

impl Filter for LineFilter {
    fn msg_min_size(&self) -> usize {
        1
    }

    fn tell_boundary(&self, session: &Session<'_>, data: &[u8]) -> Boundary {
        session.with_state(|scan: &mut LineScan| {
            let from = scan.scanned.min(data.len());
            match data[from..].iter().position(|&b| b == b'\n') {
                Some(pos) => {
                    scan.scanned = 0;
                    let end = from + pos + 1;
                    let content = end - 1 - usize::from(end >= 2 && data[end - 2] == b'\r');
                    if content > self.max_line {
                        Boundary::Error
                    } else {
                        Boundary::Length(end)
                    }
                }
                // +1 leaves room for a `\r` whose `\n` has not arrived yet
                None if data.len() > self.max_line + 1 => Boundary::Error,
                None => {
                    scan.scanned = data.len();
                    Boundary::Underflow
                }
            }
        })
    }

    fn on_msg_arrive(&self, _session: &Session<'_>, msg: Message, output: &mut Vec<Message>) -> Result<bool> {
        match msg {
            Message::Bytes(line) => {
                let mut end = line.len();
                if line.ends_with(b"\n") {
                    end -= 1;
                    if line[..end].ends_with(b"\r") {
                        end -= 1;
                    }
                }
                output.push(Message::Bytes(line.slice(..end)));
            }
            other => output.push(other),
        }
        Ok(true)
    }

    fn on_msg_depart(&self, _session: &Session<'_>, msg: Message, output: &mut Vec<Message>) -> Result<bool> {
        match msg {
            Message::Bytes(line) => {
                let ending = self.ending.as_bytes();
                let mut framed = BytesMut::with_capacity(line.len() + ending.len());
                framed.put_slice(&line);
                framed.put_slice(ending);
                output.push(Message::Bytes(framed.freeze()));
            }
            other => output.push(other),
        }
        Ok(true)
    }
}

/// Payload of a `Bytes` message, for tests and simple services.
pub fn payload(msg: &Message) -> &[u8] {
    match msg {
        Message::Bytes(b) => &b[..],
        Message::Object(_) => &[],
    }
}
