use std::{
    fmt,
    io::{self, Read, Write},
    thread,
    time::Duration,
};

use log::debug;
use serialport::{ClearBuffer, SerialPort};

use super::console::{control_code, expect_with, write_paced, Console, ExpectBuffer, Match};
use crate::{
    error::{Error, Result},
    settings::SerialLine,
    utils::{open_and_setup_port, wait_for_port},
};

/// How long to wait for the serial device node to show up.
const PORT_WAIT: Duration = Duration::from_secs(30);
const POLL: Duration = Duration::from_millis(50);

/// A console on a local serial line.
pub struct SerialConsole {
    port: Box<dyn SerialPort>,
    buffer: ExpectBuffer,
}
impl SerialConsole {
    pub fn open(line: &SerialLine) -> Result<Self> {
        if !wait_for_port(&line.path, PORT_WAIT) {
            return Err(Error::Critical(format!(
                "serial port {} did not show up",
                line.path
            )));
        }
        let mut port = open_and_setup_port(line)?;
        port.set_timeout(Duration::from_millis(100))?;
        Ok(SerialConsole {
            port,
            buffer: ExpectBuffer::default(),
        })
    }
}
impl Console for SerialConsole {
    fn name(&self) -> String {
        self.port.name().unwrap_or_else(|| "serial".into())
    }

    fn send(&mut self, text: &str, char_delay: Duration) -> Result<()> {
        write_paced(&mut *self.port, text, char_delay)?;
        Ok(())
    }

    fn send_control(&mut self, c: char) -> Result<()> {
        let code = control_code(c)?;
        self.port.write_all(&[code])?;
        self.port.flush()?;
        Ok(())
    }

    fn expect(&mut self, patterns: &[&str], timeout: Duration) -> Result<Match> {
        let port = &mut self.port;
        expect_with(&mut self.buffer, patterns, timeout, |chunk| {
            read_available(port, chunk)
        })
    }

    fn reset_buffer(&mut self) {
        self.buffer.clear();
        if let Err(e) = self.port.clear(ClearBuffer::Input) {
            debug!("could not flush serial input: {}", e);
        }
    }
}
impl fmt::Debug for SerialConsole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let port = &self.port;
        f.debug_struct("SerialConsole")
            .field("name", &port.name())
            .field("baud_rate", &port.baud_rate())
            .field("data_bits", &port.data_bits())
            .field("stop_bits", &port.stop_bits())
            .field("parity", &port.parity())
            .field("flow_control", &port.flow_control())
            .finish()
    }
}

fn read_available(port: &mut Box<dyn SerialPort>, chunk: &mut [u8]) -> Result<usize> {
    let available = port.bytes_to_read()? as usize;
    if available == 0 {
        thread::sleep(POLL);
        return Ok(0);
    }
    let len = available.min(chunk.len());
    match port.read(&mut chunk[..len]) {
        Ok(n) => Ok(n),
        Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
        Err(e) => Err(e.into()),
    }
}
