//! Interactive console sessions to the device.
//!
//! Every flow in the dispatcher talks to the device through a [`Console`]:
//! send text or a control character, then wait for one of several patterns
//! with a bound on the wait. Three consoles are provided:
//!
//! - [`SerialConsole`] on a local serial line,
//! - [`TelnetConsole`] through a console server,
//! - [`ReplayConsole`], a scripted stand-in used for tests and dry runs.
//!
//! A [`Connector`] knows how to (re)open the console for a device, so the
//! target can drop and re-acquire its session.

mod console;
mod replay;
mod serial;
mod telnet;

use crate::{
    error::Result,
    settings::{Connection, DeviceConfig},
};

pub use console::{control_code, Console, Match, LINE_END};
pub use replay::{ReplayConnector, ReplayConsole, ReplayLog, ReplayRule, ReplayScript, Sent};
pub use serial::SerialConsole;
pub use telnet::TelnetConsole;

/// Opens console sessions for one device.
pub trait Connector: Send {
    fn connect(&mut self) -> Result<Box<dyn Console>>;
}

/// Opens the console described by the device configuration.
#[derive(Debug, Clone)]
pub struct ConfigConnector {
    connection: Connection,
}
impl ConfigConnector {
    pub fn new(config: &DeviceConfig) -> Self {
        ConfigConnector {
            connection: config.connection.clone(),
        }
    }
}
impl Connector for ConfigConnector {
    fn connect(&mut self) -> Result<Box<dyn Console>> {
        match &self.connection {
            Connection::Serial(line) => Ok(Box::new(SerialConsole::open(line)?)),
            Connection::Telnet { host, port } => Ok(Box::new(TelnetConsole::connect(host, *port)?)),
        }
    }
}
