//! Everything a provisioning state works with.
//!
//! The [`Context`] borrows the device session and collaborators from the
//! [`Target`](crate::Target) for the duration of one provisioning run, and
//! wraps the console calls the family routines repeat over and over.

use std::time::Duration;

use log::{debug, info};

use crate::{
    boot_cmds::{self, BootTagMap, MASTER_BOOT_CMDS},
    bootloader::Bootloader,
    customize::Customizer,
    error::Result,
    factory::FactoryImage,
    family::DeploymentTarget,
    power::PowerControl,
    results::ResultLog,
    session::{Console, Match},
    settings::{DeviceConfig, Family},
    target::{BootRequest, DeployRequest},
};

pub(crate) struct Context<'a> {
    pub config: &'a DeviceConfig,
    pub target: &'a dyn DeploymentTarget,
    pub console: &'a mut dyn Console,
    pub power: &'a mut dyn PowerControl,
    pub factory: &'a dyn FactoryImage,
    pub results: &'a mut ResultLog,
    pub deploy: &'a DeployRequest,
    pub boot: &'a BootRequest,
    pub tags: &'a BootTagMap,
}
impl<'a> Context<'a> {
    pub fn family(&self) -> Family {
        self.target.family()
    }

    pub fn bootloader(&mut self) -> Bootloader<'_> {
        Bootloader::new(
            self.config,
            self.target,
            &mut *self.console,
            &mut *self.power,
            &mut *self.results,
        )
    }

    pub fn customizer(&mut self) -> Customizer<'_> {
        let family = self.target.family();
        Customizer::new(&mut *self.console, self.config, family, &mut *self.results)
    }

    // Console ----------------------------------------------------------------

    /// Send a line, paced like a slow terminal when the device needs it.
    pub fn send(&mut self, line: &str) -> Result<()> {
        debug!("=> {}", line);
        self.console.send_line(line, self.config.char_delay())
    }

    pub fn control(&mut self, c: char) -> Result<()> {
        self.console.send_control(c)
    }

    pub fn expect(&mut self, patterns: &[&str], timeout: Duration) -> Result<Match> {
        self.console.expect(patterns, timeout)
    }

    pub fn try_expect(&mut self, patterns: &[&str], timeout: Duration) -> Result<Option<Match>> {
        self.console.try_expect(patterns, timeout)
    }

    pub fn pause(&mut self, duration: Duration) {
        self.console.pause(duration);
    }

    pub fn reset_buffer(&mut self) {
        self.console.reset_buffer();
    }

    // Bootloader prompt ------------------------------------------------------

    pub fn prompt(&mut self) -> Result<()> {
        self.prompt_within(self.config.boot_cmd_timeout)
    }

    pub fn prompt_within(&mut self, timeout: Duration) -> Result<()> {
        let config = self.config;
        self.console
            .expect(&[config.bootloader_prompt.as_str()], timeout)
            .map(|_| ())
    }

    /// Send a bootloader command and wait for the prompt to come back.
    pub fn command(&mut self, line: &str) -> Result<()> {
        self.command_within(line, self.config.boot_cmd_timeout)
    }

    pub fn command_within(&mut self, line: &str, timeout: Duration) -> Result<()> {
        self.send(line)?;
        self.prompt_within(timeout)
    }

    /// Wait for the prompt, nudging the console if it stays quiet.
    pub fn settle(&mut self) -> Result<()> {
        let timeout = self.config.boot_cmd_timeout;
        self.bootloader().wait_prompt(timeout)
    }

    /// Stop the autoboot countdown announced within `banner_timeout`.
    pub fn interrupt(
        &mut self,
        banner_timeout: Duration,
        presses: usize,
        delay: Duration,
    ) -> Result<()> {
        self.bootloader()
            .interrupt_autoboot(banner_timeout, presses, delay)
    }

    /// Resolve the boot commands of this boot and run them.
    pub fn execute_boot_cmds(&mut self) -> Result<()> {
        let config = self.config;
        let boot = self.boot;
        let (sequence, source) = boot_cmds::resolve(
            &config.default_boot_cmds,
            config,
            &boot.overrides(),
            boot.dynamic_boot_cmds.as_ref(),
            self.tags,
        )?;
        info!("running {} boot commands from {}", sequence.len(), source);
        self.bootloader().execute(&sequence)
    }

    // Deployment -------------------------------------------------------------

    /// `name` next to the deployed image on the image server.
    pub fn image_path(&self, name: &str) -> String {
        match self.deploy.image.rfind('/') {
            Some(end) => format!("{}/{}", &self.deploy.image[..end], name),
            None => name.to_owned(),
        }
    }

    pub fn is_release(&self) -> bool {
        self.deploy.is_release()
    }

    /// Booting the master image rather than a test image.
    pub fn is_master(&self) -> bool {
        self.config.default_boot_cmds == MASTER_BOOT_CMDS
    }

    pub fn image_server_ip(&self) -> &'a str {
        let deploy = self.deploy;
        deploy.image_server_ip.as_str()
    }

    pub fn macaddr(&self) -> Option<&'a str> {
        let config = self.config;
        config.macaddr.as_deref()
    }

    /// Generate the factory image, returning its TFTP path.
    pub fn generate_factory(&self) -> Result<String> {
        self.factory.generate(&self.deploy.factory)
    }
}

// =============================================================================
// Test fixture
// =============================================================================

/// Owns everything a [`Context`] borrows, for tests of single states and
/// family routines.
#[cfg(test)]
pub(crate) struct Fixture {
    pub config: DeviceConfig,
    pub target: Box<dyn DeploymentTarget>,
    pub console: crate::session::ReplayConsole,
    pub power: crate::power::NoPower,
    pub factory: Box<dyn FactoryImage>,
    pub results: ResultLog,
    pub deploy: DeployRequest,
    pub boot: BootRequest,
    pub tags: BootTagMap,
}
#[cfg(test)]
impl Fixture {
    pub fn new(config: DeviceConfig, script: crate::session::ReplayScript) -> Self {
        let target = crate::family::for_family(config.family().unwrap());
        Fixture {
            config,
            target,
            console: crate::session::ReplayConsole::new(script).unwrap(),
            power: crate::power::NoPower,
            factory: Box::new(crate::factory::NoFactoryImage),
            results: ResultLog::new(),
            deploy: DeployRequest::new("helios/20170301/images/mstar.img", "172.16.117.9"),
            boot: BootRequest::default(),
            tags: BootTagMap::new(),
        }
    }

    pub fn run<T, F>(&mut self, f: F) -> T
    where
        F: FnOnce(&mut Context<'_>) -> T,
    {
        let mut ctx = Context {
            config: &self.config,
            target: &*self.target,
            console: &mut self.console,
            power: &mut self.power,
            factory: &*self.factory,
            results: &mut self.results,
            deploy: &self.deploy,
            boot: &self.boot,
            tags: &self.tags,
        };
        f(&mut ctx)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        session::{ReplayScript, Sent},
        settings::SettingsBuilder,
    };

    #[test]
    fn image_paths_are_relative_to_the_image() {
        let mut fixture = Fixture::new(SettingsBuilder::new().finalize(), ReplayScript::new());
        let path = fixture.run(|ctx| ctx.image_path("auto_update_mboot.txt"));
        assert_eq!(path, "helios/20170301/images/auto_update_mboot.txt");

        fixture.deploy.image = "auto.txt".into();
        assert_eq!(fixture.run(|ctx| ctx.image_path("fastboot.txt")), "fastboot.txt");
    }

    #[test]
    fn release_builds_carry_an_r() {
        let mut fixture = Fixture::new(SettingsBuilder::new().finalize(), ReplayScript::new());
        assert!(!fixture.run(|ctx| ctx.is_release()));
        fixture.deploy.image = "helios/V1.0.3R/images/mstar.img".into();
        assert!(fixture.run(|ctx| ctx.is_release()));
    }

    #[test]
    fn command_waits_for_the_prompt() {
        let script = ReplayScript::new().on("^dhcp$", "DHCP client bound\r\n<< MStar >># ");
        let mut fixture = Fixture::new(SettingsBuilder::new().finalize(), script);
        fixture.run(|ctx| ctx.command("dhcp")).unwrap();
        let err = fixture.run(|ctx| ctx.command("estart")).unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(
            fixture.console.log().entries(),
            vec![Sent::Line("dhcp".into()), Sent::Line("estart".into())]
        );
    }

    #[test]
    fn settle_nudges_a_quiet_console() {
        let script = ReplayScript::new().on("^$", "<< MStar >># ");
        let mut fixture = Fixture::new(SettingsBuilder::new().finalize(), script);
        fixture.run(|ctx| ctx.settle()).unwrap();
        assert_eq!(fixture.console.log().lines(), vec![String::new()]);
    }
}
