//! The console contract every flow talks through, and the pattern buffer that
//! implements expect semantics for the concrete consoles.

use std::{io::Write, thread, time::Duration, time::Instant};

use hexplay::HexViewBuilder;
use log::{log_enabled, trace, Level::Trace};
use regex::Regex;

use crate::error::{Error, Result};

// =============================================================================
// Public Interface
// =============================================================================

/// Terminator appended by [`Console::send_line`].
pub const LINE_END: &str = "\n";

/// The outcome of a successful pattern wait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Match {
    /// Index of the alternative that matched.
    pub index: usize,
    /// Console output received before the match.
    pub before: String,
    /// The matched text.
    pub text: String,
    /// Capture groups, group 0 being the whole match.
    pub groups: Vec<Option<String>>,
}
impl Match {
    pub fn group(&self, index: usize) -> Option<&str> {
        self.groups.get(index).and_then(|g| g.as_deref())
    }
}

/// A live interactive connection to the device console.
///
/// Patterns are regular expressions. When several alternatives are present in
/// the output, the one matching earliest wins and ties go to the lowest index.
/// Output up to the end of the match is consumed.
pub trait Console: Send {
    fn name(&self) -> String;

    /// Send raw text. A non-zero `char_delay` sends it one character at a
    /// time, emulating a slow terminal.
    fn send(&mut self, text: &str, char_delay: Duration) -> Result<()>;

    fn send_line(&mut self, text: &str, char_delay: Duration) -> Result<()> {
        self.send(text, char_delay)?;
        self.send(LINE_END, char_delay)
    }

    /// Send the control character for `c` (`'c'` sends `0x03`).
    fn send_control(&mut self, c: char) -> Result<()>;

    /// Wait until one of `patterns` shows up or fail with
    /// [`Error::Timeout`].
    fn expect(&mut self, patterns: &[&str], timeout: Duration) -> Result<Match>;

    /// Like [`Console::expect`] but a timeout is an ordinary outcome.
    fn try_expect(&mut self, patterns: &[&str], timeout: Duration) -> Result<Option<Match>> {
        match self.expect(patterns, timeout) {
            Ok(found) => Ok(Some(found)),
            Err(Error::Timeout { .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Drop whatever output has been received so far.
    fn reset_buffer(&mut self);

    /// Let the device work for a while.
    fn pause(&mut self, duration: Duration) {
        thread::sleep(duration);
    }
}

/// Map a character to its control code the way terminals do.
pub fn control_code(c: char) -> Result<u8> {
    let upper = c.to_ascii_uppercase();
    match upper {
        '@'..='_' => Ok(upper as u8 - b'@'),
        '?' => Ok(0x7f),
        _ => Err(Error::BootCommand {
            command: format!("sendcontrol {}", c),
            message: "not a control character".into(),
        }),
    }
}

// =============================================================================
// Crate-Public Interface
// =============================================================================

/// Bound on buffered console output; older output is dropped first.
const MAX_BUFFER: usize = 1 << 20;

#[derive(Debug, Default)]
pub(crate) struct ExpectBuffer {
    data: String,
    /// Start of a character split across reads.
    pending: Vec<u8>,
}
impl ExpectBuffer {
    /// Decode console output, holding back an incomplete trailing character
    /// until the next read completes it.
    pub fn push_bytes(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
        let raw = std::mem::take(&mut self.pending);
        let mut text = String::with_capacity(raw.len());
        let mut input = &raw[..];
        loop {
            match std::str::from_utf8(input) {
                Ok(valid) => {
                    text.push_str(valid);
                    break;
                }
                Err(err) => {
                    let (valid, rest) = input.split_at(err.valid_up_to());
                    text.push_str(&String::from_utf8_lossy(valid));
                    match err.error_len() {
                        Some(len) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            input = &rest[len..];
                        }
                        None => {
                            self.pending = rest.to_vec();
                            break;
                        }
                    }
                }
            }
        }
        self.push_str(&text);
    }

    pub fn push_str(&mut self, text: &str) {
        self.data.push_str(text);
        if self.data.len() > MAX_BUFFER {
            let mut cut = self.data.len() - MAX_BUFFER / 2;
            while !self.data.is_char_boundary(cut) {
                cut += 1;
            }
            self.data.drain(..cut);
        }
    }

    pub fn clear(&mut self) {
        self.data.clear();
        self.pending.clear();
    }

    /// Find the earliest matching alternative and consume the buffer up to
    /// the end of its match.
    pub fn take_match(&mut self, patterns: &[Regex]) -> Option<Match> {
        let mut best: Option<(usize, usize)> = None;
        for (index, re) in patterns.iter().enumerate() {
            if let Some(m) = re.find(&self.data) {
                if best.map_or(true, |(start, _)| m.start() < start) {
                    best = Some((m.start(), index));
                }
            }
        }
        let (_, index) = best?;

        let (found, end) = {
            let caps = patterns[index].captures(&self.data)?;
            let whole = caps.get(0)?;
            let found = Match {
                index,
                before: self.data[..whole.start()].to_owned(),
                text: whole.as_str().to_owned(),
                groups: caps
                    .iter()
                    .map(|g| g.map(|m| m.as_str().to_owned()))
                    .collect(),
            };
            (found, whole.end())
        };
        self.data.drain(..end);
        Some(found)
    }
}

pub(crate) fn compile(patterns: &[&str]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|p| Regex::new(p).map_err(Error::from))
        .collect()
}

/// Drive a blocking pattern wait over a byte source. `read` must return
/// within a short poll interval, with `Ok(0)` when nothing arrived.
pub(crate) fn expect_with<F>(
    buffer: &mut ExpectBuffer,
    patterns: &[&str],
    timeout: Duration,
    mut read: F,
) -> Result<Match>
where
    F: FnMut(&mut [u8]) -> Result<usize>,
{
    let regexes = compile(patterns)?;
    let deadline = Instant::now() + timeout;
    let mut chunk = [0u8; 4096];
    loop {
        if let Some(found) = buffer.take_match(&regexes) {
            return Ok(found);
        }
        if Instant::now() >= deadline {
            return Err(Error::timeout(patterns, timeout));
        }
        let n = read(&mut chunk)?;
        if n > 0 {
            // Dump the received data in a hex table for debugging
            if log_enabled!(Trace) {
                let view = HexViewBuilder::new(&chunk[..n])
                    .address_offset(0)
                    .row_width(16)
                    .finish();
                trace!("\n{}", view);
            }
            buffer.push_bytes(&chunk[..n]);
        }
    }
}

/// Write `text`, one character at a time when a delay is requested.
pub(crate) fn write_paced<W: Write + ?Sized>(
    out: &mut W,
    text: &str,
    char_delay: Duration,
) -> std::io::Result<()> {
    if char_delay.is_zero() {
        out.write_all(text.as_bytes())?;
    } else {
        let mut encoded = [0u8; 4];
        for c in text.chars() {
            thread::sleep(char_delay);
            out.write_all(c.encode_utf8(&mut encoded).as_bytes())?;
        }
    }
    out.flush()
}

// =============================================================================
// Unit Tests
// =============================================================================
