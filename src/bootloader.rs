//! Driving the device from power-on into the bootloader and through a boot
//! command sequence.

use std::time::{Duration, Instant};

use log::{debug, error, info};

use crate::{
    boot_cmds::{BootCommandSequence, Directive},
    customize::Customizer,
    error::{Error, Result},
    family::DeploymentTarget,
    power::PowerControl,
    results::ResultLog,
    session::Console,
    settings::DeviceConfig,
};

/// Blank lines sent after the reset banner to stop autoboot.
const RESET_PRESSES: usize = 100;
const RESET_PRESS_DELAY: Duration = Duration::from_millis(60);
/// How long a blank line gets to bring up a shell prompt before a hard reset.
const SHELL_PROBE: Duration = Duration::from_secs(5);

const ENTER_FAILED: &str = "Infrastructure Error: failed to enter the bootloader.";
const BOOT_CMDS_FAILED: &str = "Bootloader Error: boot command execution failed.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetMode {
    /// Reboot from the running shell.
    Soft,
    /// Power cycle, falling back to a soft reset without a power switch.
    Hard,
}

pub(crate) struct Bootloader<'a> {
    config: &'a DeviceConfig,
    target: &'a dyn DeploymentTarget,
    console: &'a mut dyn Console,
    power: &'a mut dyn PowerControl,
    results: &'a mut ResultLog,
}
impl<'a> Bootloader<'a> {
    pub fn new(
        config: &'a DeviceConfig,
        target: &'a dyn DeploymentTarget,
        console: &'a mut dyn Console,
        power: &'a mut dyn PowerControl,
        results: &'a mut ResultLog,
    ) -> Self {
        Bootloader {
            config,
            target,
            console,
            power,
            results,
        }
    }

    pub fn reset(&mut self, mode: ResetMode) -> Result<()> {
        match mode {
            ResetMode::Soft => self.soft_reset(),
            ResetMode::Hard => self.hard_reset(),
        }
    }

    /// Wait for the bootloader prompt and record how long it took.
    pub fn enter_bootloader(&mut self) -> Result<()> {
        let started = Instant::now();
        let prompt = self.config.bootloader_prompt.as_str();
        match self.console.expect(&[prompt], self.config.bootloader_timeout) {
            Ok(_) => {
                self.console.reset_buffer();
                self.results.pass_timed("enter_bootloader", started.elapsed());
                Ok(())
            }
            Err(err) => {
                error!("{}", ENTER_FAILED);
                self.results.fail("enter_bootloader", Some(ENTER_FAILED));
                Err(err)
            }
        }
    }

    /// Run a boot command sequence line by line.
    pub fn execute(&mut self, sequence: &BootCommandSequence) -> Result<()> {
        let started = Instant::now();
        let sequence = sequence.clone().strip_trailing_empty();
        let delay = self.config.char_delay();

        for (line, directive) in sequence.lines().iter().zip(sequence.directives()) {
            if let Err(err) = self.execute_line(directive, delay) {
                error!("{}", BOOT_CMDS_FAILED);
                self.results.fail("execute_boot_cmds", Some(BOOT_CMDS_FAILED));
                return Err(match err {
                    Error::Timeout { .. } => Error::BootCommand {
                        command: line.clone(),
                        message: BOOT_CMDS_FAILED.into(),
                    },
                    other => other,
                });
            }
        }
        self.results.pass("execute_boot_cmds");
        self.results
            .pass_timed("boot_cmds_execution_time", started.elapsed());
        Ok(())
    }

    /// Wait for the autoboot countdown, stop it and settle at the prompt.
    pub fn interrupt_autoboot(
        &mut self,
        banner_timeout: Duration,
        presses: usize,
        delay: Duration,
    ) -> Result<()> {
        let interrupt = self.config.interrupt_boot_prompt.as_str();
        self.console.expect(&[interrupt], banner_timeout)?;
        self.press_enter(presses, delay)?;
        self.wait_prompt(self.config.boot_cmd_timeout)?;
        self.console.reset_buffer();
        Ok(())
    }

    /// Wait for the bootloader prompt, nudging the console with a blank line
    /// halfway through.
    pub fn wait_prompt(&mut self, timeout: Duration) -> Result<()> {
        let prompt = self.config.bootloader_prompt.as_str();
        if self.console.try_expect(&[prompt], timeout / 2)?.is_none() {
            self.console.send_line("", Duration::ZERO)?;
            self.console.expect(&[prompt], timeout / 2)?;
        }
        Ok(())
    }

    pub fn power_cycle(&mut self) -> Result<()> {
        self.power.power_off()?;
        self.console.pause(self.config.power_cycle_delay);
        self.power.power_on()
    }

    pub fn press_enter(&mut self, count: usize, delay: Duration) -> Result<()> {
        for _ in 0..count {
            self.console.send_line("", Duration::ZERO)?;
            self.console.pause(delay);
        }
        Ok(())
    }

    fn soft_reset(&mut self) -> Result<()> {
        info!("soft reboot of {}", self.config.hostname);
        let shell = self.config.shell_prompt.as_str();
        self.console.reset_buffer();
        self.console.send_control('c')?;
        self.console.expect(&[shell], self.config.shell_timeout)?;
        self.console
            .send_line(&self.config.soft_boot_cmd, Duration::ZERO)?;
        self.await_reset_banner()
    }

    fn hard_reset(&mut self) -> Result<()> {
        info!("hard reset of {}", self.config.hostname);
        let shell = self.config.shell_prompt.as_str();
        self.console.reset_buffer();
        self.console.send_line("", Duration::ZERO)?;
        if self.console.try_expect(&[shell], SHELL_PROBE)?.is_some() {
            debug!("in the device shell, showing the USB media first");
            Customizer::new(
                &mut *self.console,
                self.config,
                self.target.family(),
                &mut *self.results,
            )
            .display_usb()?;
        }

        if self.config.hard_reset_available() {
            self.power_cycle()?;
            self.await_reset_banner()
        } else {
            self.soft_reset()
        }
    }

    fn await_reset_banner(&mut self) -> Result<()> {
        let banner = self.target.reset_banner(self.config);
        self.console
            .expect(&[banner], self.config.reset_banner_timeout)?;
        self.press_enter(RESET_PRESSES, RESET_PRESS_DELAY)
    }

    fn execute_line(&mut self, directive: Directive<'_>, delay: Duration) -> Result<()> {
        match directive {
            Directive::SendLine(text) => {
                self.console.send(text, delay)?;
                self.console.send_line("", delay)
            }
            Directive::SendControl(name) => {
                let mut chars = name.chars();
                match (chars.next(), chars.next()) {
                    (Some(c), None) => self.console.send_control(c),
                    _ => Err(Error::BootCommand {
                        command: format!("sendcontrol {}", name),
                        message: "expected a single control character".into(),
                    }),
                }
            }
            Directive::Expect(text) => {
                let pattern = regex::escape(text);
                self.console
                    .expect(&[pattern.as_str()], self.config.boot_cmd_timeout)
                    .map(|_| ())
            }
            Directive::Plain(line) => {
                self.wait_prompt(self.config.boot_cmd_timeout)?;
                info!("boot command: {}", line);
                self.console.send_line(line, delay)
            }
        }
    }
}
