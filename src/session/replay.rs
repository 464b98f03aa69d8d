//! A scripted console standing in for a device.
//!
//! A [`ReplayScript`] is a list of rules: whenever a line (or a control
//! character, written `^C`) sent to the console matches a rule's `send`
//! pattern, the rule's `reply` becomes console output. The first matching rule
//! answers; `once` rules answer a single time. Waits never block: a pattern
//! that is not already in the output times out immediately, and pauses are
//! only recorded.
//!
//! Scripts load from TOML for dry runs of a device configuration:
//!
//! ```toml
//! banner = "shell@helios:/ $ "
//!
//! [[rule]]
//! send = "^reboot$"
//! reply = "U-Boot 2011.06\r\n"
//! once = true
//! ```

use std::{
    fs,
    path::Path,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use log::debug;
use regex::Regex;
use serde::Deserialize;

use super::{
    console::{compile, control_code, Console, ExpectBuffer, Match},
    Connector,
};
use crate::error::{Error, Result};

// =============================================================================
// Public Interface
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ReplayRule {
    pub send: String,
    pub reply: String,
    #[serde(default)]
    pub once: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ReplayScript {
    /// Output available as soon as the console is attached.
    #[serde(default)]
    pub banner: String,
    #[serde(default, rename = "rule")]
    pub rules: Vec<ReplayRule>,
}
impl ReplayScript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn banner(mut self, text: &str) -> Self {
        self.banner = text.into();
        self
    }

    pub fn on(mut self, send: &str, reply: &str) -> Self {
        self.rules.push(ReplayRule {
            send: send.into(),
            reply: reply.into(),
            once: false,
        });
        self
    }

    pub fn once(mut self, send: &str, reply: &str) -> Self {
        self.rules.push(ReplayRule {
            send: send.into(),
            reply: reply.into(),
            once: true,
        });
        self
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_toml_str(&fs::read_to_string(path)?)
    }
}

/// What the dispatcher did to a replayed console.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sent {
    Connect,
    Line(String),
    Control(char),
    Pause(Duration),
}

/// Shared record of everything sent, readable after the console has been
/// handed over to a target.
#[derive(Debug, Clone, Default)]
pub struct ReplayLog {
    entries: Arc<Mutex<Vec<Sent>>>,
}
impl ReplayLog {
    pub fn entries(&self) -> Vec<Sent> {
        lock(&self.entries).clone()
    }

    /// Lines sent, in order.
    pub fn lines(&self) -> Vec<String> {
        lock(&self.entries)
            .iter()
            .filter_map(|e| match e {
                Sent::Line(line) => Some(line.clone()),
                _ => None,
            })
            .collect()
    }

    /// Number of lines and control characters sent; connects and pauses do
    /// not count.
    pub fn interactions(&self) -> usize {
        lock(&self.entries)
            .iter()
            .filter(|e| matches!(e, Sent::Line(_) | Sent::Control(_)))
            .count()
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.entries).is_empty()
    }

    fn push(&self, entry: Sent) {
        lock(&self.entries).push(entry);
    }
}

pub struct ReplayConsole {
    rules: Arc<Mutex<Vec<CompiledRule>>>,
    log: ReplayLog,
    buffer: ExpectBuffer,
    partial: String,
}
impl ReplayConsole {
    pub fn new(script: ReplayScript) -> Result<Self> {
        let banner = script.banner.clone();
        let console = ReplayConsole {
            rules: Arc::new(Mutex::new(compile_rules(script.rules)?)),
            log: ReplayLog::default(),
            buffer: ExpectBuffer::default(),
            partial: String::new(),
        };
        Ok(console.with_output(&banner))
    }

    pub fn log(&self) -> ReplayLog {
        self.log.clone()
    }

    fn with_output(mut self, text: &str) -> Self {
        self.buffer.push_str(text);
        self
    }

    fn line(&mut self, line: String) {
        debug!("replay <- {:?}", line);
        self.respond(&line);
        self.log.push(Sent::Line(line));
    }

    fn respond(&mut self, sent: &str) {
        let mut rules = lock(&self.rules);
        if let Some(rule) = rules
            .iter_mut()
            .find(|r| !(r.once && r.used) && r.pattern.is_match(sent))
        {
            rule.used = true;
            self.buffer.push_str(&rule.reply);
        }
    }
}
impl Console for ReplayConsole {
    fn name(&self) -> String {
        "replay".into()
    }

    fn send(&mut self, text: &str, _char_delay: Duration) -> Result<()> {
        for c in text.chars() {
            if c == '\n' {
                let line = std::mem::take(&mut self.partial);
                self.line(line);
            } else {
                self.partial.push(c);
            }
        }
        Ok(())
    }

    fn send_control(&mut self, c: char) -> Result<()> {
        control_code(c)?;
        self.log.push(Sent::Control(c));
        self.respond(&format!("^{}", c.to_ascii_uppercase()));
        Ok(())
    }

    fn expect(&mut self, patterns: &[&str], timeout: Duration) -> Result<Match> {
        let regexes = compile(patterns)?;
        self.buffer
            .take_match(&regexes)
            .ok_or_else(|| Error::timeout(patterns, timeout))
    }

    fn reset_buffer(&mut self) {
        self.buffer.clear();
    }

    fn pause(&mut self, duration: Duration) {
        self.log.push(Sent::Pause(duration));
    }
}

/// Hands out replay consoles sharing one script and one log, so `once` rules
/// stay consumed across reconnects.
pub struct ReplayConnector {
    rules: Arc<Mutex<Vec<CompiledRule>>>,
    banner: String,
    log: ReplayLog,
}
impl ReplayConnector {
    pub fn new(script: ReplayScript) -> Result<Self> {
        Ok(ReplayConnector {
            rules: Arc::new(Mutex::new(compile_rules(script.rules)?)),
            banner: script.banner,
            log: ReplayLog::default(),
        })
    }

    pub fn log(&self) -> ReplayLog {
        self.log.clone()
    }
}
impl Connector for ReplayConnector {
    fn connect(&mut self) -> Result<Box<dyn Console>> {
        self.log.push(Sent::Connect);
        let console = ReplayConsole {
            rules: Arc::clone(&self.rules),
            log: self.log.clone(),
            buffer: ExpectBuffer::default(),
            partial: String::new(),
        };
        Ok(Box::new(console.with_output(&self.banner)))
    }
}

// =============================================================================
// Private stuff
// =============================================================================

struct CompiledRule {
    pattern: Regex,
    reply: String,
    once: bool,
    used: bool,
}

fn compile_rules(rules: Vec<ReplayRule>) -> Result<Vec<CompiledRule>> {
    rules
        .into_iter()
        .map(|rule| {
            Ok(CompiledRule {
                pattern: Regex::new(&rule.send)?,
                reply: rule.reply,
                once: rule.once,
                used: false,
            })
        })
        .collect()
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rules_answer_sent_lines() {
        let script = ReplayScript::new()
            .banner("shell@helios:/ $ ")
            .on("^reboot$", "U-Boot 2011.06\r\n");
        let mut console = ReplayConsole::new(script).unwrap();
        let log = console.log();

        console.expect(&["shell@"], Duration::from_secs(1)).unwrap();
        console.send_line("reboot", Duration::ZERO).unwrap();
        let found = console.expect(&["U-Boot"], Duration::from_secs(20)).unwrap();
        assert_eq!(found.index, 0);
        assert_eq!(log.lines(), vec!["reboot"]);
    }

    #[test]
    fn missing_output_times_out_immediately() {
        let mut console = ReplayConsole::new(ReplayScript::new()).unwrap();
        let err = console
            .expect(&["U-Boot"], Duration::from_secs(3600))
            .unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(console.try_expect(&["x"], Duration::from_secs(1)).unwrap(), None);
    }

    #[test]
    fn once_rules_answer_a_single_time() {
        let script = ReplayScript::new()
            .once("dumpsys", "com.helios.guide\r\n")
            .on("dumpsys", "com.helios.launcher\r\n");
        let mut console = ReplayConsole::new(script).unwrap();
        console.send_line("dumpsys window", Duration::ZERO).unwrap();
        console.send_line("dumpsys window", Duration::ZERO).unwrap();
        let first = console
            .expect(&["com.helios.guide", "com.helios.launcher"], Duration::ZERO)
            .unwrap();
        let second = console
            .expect(&["com.helios.guide", "com.helios.launcher"], Duration::ZERO)
            .unwrap();
        assert_eq!((first.index, second.index), (0, 1));
    }

    #[test]
    fn partial_sends_form_one_line() {
        let mut console = ReplayConsole::new(ReplayScript::new()).unwrap();
        let log = console.log();
        console.send("setenv bootargs", Duration::ZERO).unwrap();
        console.send_line("", Duration::ZERO).unwrap();
        console.send_control('c').unwrap();
        console.pause(Duration::from_secs(50));
        assert_eq!(
            log.entries(),
            vec![
                Sent::Line("setenv bootargs".into()),
                Sent::Control('c'),
                Sent::Pause(Duration::from_secs(50)),
            ]
        );
        assert_eq!(log.interactions(), 2);
    }

    #[test]
    fn control_characters_match_caret_rules() {
        let script = ReplayScript::new().on(r"^\^C$", "root@helios:/ # ");
        let mut console = ReplayConsole::new(script).unwrap();
        console.send_control('c').unwrap();
        assert!(console.expect(&["root@"], Duration::ZERO).is_ok());
    }

    #[test]
    fn connector_shares_rules_and_log() {
        let script = ReplayScript::new().banner("> ").once("^hello$", "world");
        let mut connector = ReplayConnector::new(script).unwrap();
        let log = connector.log();

        let mut first = connector.connect().unwrap();
        first.send_line("hello", Duration::ZERO).unwrap();
        assert!(first.expect(&["world"], Duration::ZERO).is_ok());

        let mut second = connector.connect().unwrap();
        assert!(second.expect(&["> "], Duration::ZERO).is_ok());
        second.send_line("hello", Duration::ZERO).unwrap();
        assert!(second.expect(&["world"], Duration::ZERO).is_err());
        assert_eq!(
            log.entries().iter().filter(|e| **e == Sent::Connect).count(),
            2
        );
    }

    #[test]
    fn script_from_toml() {
        let text = r#"
            banner = "shell@helios:/ $ "

            [[rule]]
            send = "^reboot$"
            reply = "U-Boot 2011.06"
            once = true

            [[rule]]
            send = "^$"
            reply = "<< MStar >>#"
        "#;
        let script = ReplayScript::from_toml_str(text).unwrap();
        assert_eq!(script.rules.len(), 2);
        assert!(script.rules[0].once);
        assert!(!script.rules[1].once);
    }

    #[test]
    fn invalid_rule_pattern_is_reported() {
        let script = ReplayScript::new().on("(unclosed", "x");
        assert!(matches!(
            ReplayConsole::new(script),
            Err(Error::Pattern(_))
        ));
    }
}
