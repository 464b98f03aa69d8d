use std::{
    io::{self, Read, Write},
    net::TcpStream,
    time::Duration,
};

use log::{debug, info, warn};
use retry::{delay, retry_with_index};

use super::console::{control_code, expect_with, write_paced, Console, ExpectBuffer, Match};
use crate::error::{Error, Result};

const READ_TIMEOUT: Duration = Duration::from_millis(100);

const IAC: u8 = 255;
const DONT: u8 = 254;
const DO: u8 = 253;
const WONT: u8 = 252;
const WILL: u8 = 251;
const SB: u8 = 250;
const SE: u8 = 240;

/// A console reached through a telnet console server.
#[derive(Debug)]
pub struct TelnetConsole {
    peer: String,
    stream: TcpStream,
    filter: TelnetFilter,
    buffer: ExpectBuffer,
}
impl TelnetConsole {
    pub fn connect(host: &str, port: u16) -> Result<Self> {
        let address = format!("{}:{}", host, port);
        let result = retry_with_index(delay::Fixed::from_millis(1000).take(4), |index| {
            debug!("Trying to connect {} ({})", address, index);
            TcpStream::connect(&address)
        });
        let stream = match result {
            Ok(stream) => stream,
            Err(retry::Error::Operation {
                error,
                total_delay,
                tries,
            }) => {
                warn!(
                    "Failed to connect {} after {:?} and {} tries: {}",
                    address, total_delay, tries, error
                );
                return Err(error.into());
            }
            Err(retry::Error::Internal(message)) => {
                return Err(Error::Critical(format!(
                    "internal error while connecting {}: {}",
                    address, message
                )))
            }
        };
        stream.set_read_timeout(Some(READ_TIMEOUT))?;
        stream.set_nodelay(true)?;
        info!("Connected to console server {}", address);
        Ok(TelnetConsole {
            peer: address,
            stream,
            filter: TelnetFilter::default(),
            buffer: ExpectBuffer::default(),
        })
    }
}
impl Console for TelnetConsole {
    fn name(&self) -> String {
        self.peer.clone()
    }

    fn send(&mut self, text: &str, char_delay: Duration) -> Result<()> {
        write_paced(&mut self.stream, text, char_delay)?;
        Ok(())
    }

    fn send_control(&mut self, c: char) -> Result<()> {
        let code = control_code(c)?;
        self.stream.write_all(&[code])?;
        Ok(())
    }

    fn expect(&mut self, patterns: &[&str], timeout: Duration) -> Result<Match> {
        let stream = &mut self.stream;
        let filter = &mut self.filter;
        expect_with(&mut self.buffer, patterns, timeout, |chunk| {
            let mut raw = vec![0u8; chunk.len()];
            match stream.read(&mut raw) {
                Ok(0) => Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "console server closed the connection",
                )
                .into()),
                Ok(n) => {
                    let data = filter.filter(&raw[..n]);
                    chunk[..data.len()].copy_from_slice(&data);
                    Ok(data.len())
                }
                Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                    Ok(0)
                }
                Err(e) => Err(e.into()),
            }
        })
    }

    fn reset_buffer(&mut self) {
        self.buffer.clear();
        // Drain what already arrived without blocking.
        if self.stream.set_nonblocking(true).is_ok() {
            let mut scratch = [0u8; 4096];
            while let Ok(n) = self.stream.read(&mut scratch) {
                if n == 0 {
                    break;
                }
                self.filter.filter(&scratch[..n]);
            }
            if let Err(e) = self.stream.set_nonblocking(false) {
                warn!("could not restore blocking mode on {}: {}", self.peer, e);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FilterState {
    Data,
    Command,
    Negotiation,
    Subnegotiation,
    SubnegotiationCommand,
}

/// Strips telnet protocol sequences out of the byte stream. The state carries
/// over between reads so sequences split across packets are handled.
#[derive(Debug)]
struct TelnetFilter {
    state: FilterState,
}
impl Default for TelnetFilter {
    fn default() -> Self {
        TelnetFilter {
            state: FilterState::Data,
        }
    }
}
impl TelnetFilter {
    fn filter(&mut self, input: &[u8]) -> Vec<u8> {
        use FilterState::*;

        let mut out = Vec::with_capacity(input.len());
        for &b in input {
            self.state = match (self.state, b) {
                (Data, IAC) => Command,
                (Data, _) => {
                    out.push(b);
                    Data
                }
                (Command, IAC) => {
                    out.push(IAC);
                    Data
                }
                (Command, WILL) | (Command, WONT) | (Command, DO) | (Command, DONT) => Negotiation,
                (Command, SB) => Subnegotiation,
                (Command, _) | (Negotiation, _) => Data,
                (Subnegotiation, IAC) => SubnegotiationCommand,
                (Subnegotiation, _) => Subnegotiation,
                (SubnegotiationCommand, SE) => Data,
                (SubnegotiationCommand, _) => Subnegotiation,
            };
        }
        out
    }
}
