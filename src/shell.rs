//! Running commands on the device's Android shell.

use std::time::Duration;

use log::debug;
use regex::Regex;

use crate::{
    error::{Error, Result},
    session::Console,
};

/// Runs commands and collects what they print before the next prompt.
pub struct ShellRunner<'a> {
    console: &'a mut dyn Console,
    prompt: &'a str,
    timeout: Duration,
}
impl<'a> ShellRunner<'a> {
    pub fn new(console: &'a mut dyn Console, prompt: &'a str, timeout: Duration) -> Self {
        ShellRunner {
            console,
            prompt,
            timeout,
        }
    }

    /// Run `command` and return its output, prompt excluded.
    pub fn run(&mut self, command: &str) -> Result<String> {
        self.run_with_timeout(command, self.timeout)
    }

    pub fn run_with_timeout(&mut self, command: &str, timeout: Duration) -> Result<String> {
        debug!("shell: {}", command);
        self.console.reset_buffer();
        self.console.send_line(command, Duration::ZERO)?;
        let found = self.console.expect(&[self.prompt], timeout)?;
        Ok(found.before)
    }

    /// The device's first non-loopback IPv4 address.
    pub fn target_ip(&mut self) -> Result<String> {
        let output = self
            .run("busybox ifconfig")
            .map_err(|e| Error::Network(format!("cannot query interfaces: {}", e)))?;
        parse_ip(&output)?
            .ok_or_else(|| Error::Network("Unable to determine target IP address".into()))
    }
}

fn parse_ip(output: &str) -> Result<Option<String>> {
    let inet = Regex::new(r"inet (?:addr:)?(\d{1,3}(?:\.\d{1,3}){3})")?;
    let ip = inet
        .captures_iter(output)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str())
        .find(|ip| !ip.starts_with("127."))
        .map(str::to_owned);
    Ok(ip)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{ReplayConsole, ReplayScript};

    const IFCONFIG: &str = "eth0      Link encap:Ethernet  HWaddr 00:30:1B:BA:02:DB\r\n\
        \x20         inet addr:172.16.117.42  Bcast:172.16.117.255  Mask:255.255.255.0\r\n\
        lo        Link encap:Local Loopback\r\n\
        \x20         inet addr:127.0.0.1  Mask:255.0.0.0\r\n";

    #[test]
    fn loopback_is_skipped() {
        let output = "lo: inet 127.0.0.1\r\nwlan0: inet 10.1.2.3 netmask";
        assert_eq!(parse_ip(output).unwrap().as_deref(), Some("10.1.2.3"));
        assert_eq!(parse_ip("inet addr:127.0.0.1").unwrap(), None);
    }

    #[test]
    fn target_ip_from_device() {
        let script = ReplayScript::new().on(
            "^busybox ifconfig$",
            &format!("{}root@helios:/ # ", IFCONFIG),
        );
        let mut console = ReplayConsole::new(script).unwrap();
        let mut shell = ShellRunner::new(&mut console, "root@", Duration::from_secs(5));
        assert_eq!(shell.target_ip().unwrap(), "172.16.117.42");
    }

    #[test]
    fn silent_device_is_a_network_error() {
        let mut console = ReplayConsole::new(ReplayScript::new()).unwrap();
        let mut shell = ShellRunner::new(&mut console, "root@", Duration::from_secs(5));
        assert!(matches!(shell.target_ip(), Err(Error::Network(_))));
    }
}
