//! Power control of the device under test.

use log::{info, warn};

use crate::{
    error::{Error, Result},
    settings::DeviceConfig,
    utils::run_command,
};

/// Switches the device power, usually through a PDU.
pub trait PowerControl: Send {
    fn power_off(&mut self) -> Result<()>;
    fn power_on(&mut self) -> Result<()>;
}

/// Runs the configured host commands through `sh -c`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandPower {
    off: String,
    on: String,
}
impl CommandPower {
    pub fn new(off: &str, on: &str) -> Self {
        CommandPower {
            off: off.to_owned(),
            on: on.to_owned(),
        }
    }

    /// Uses `power_off_cmd`/`power_on_cmd`, falling back to
    /// `hard_reset_command` for power off.
    pub fn from_config(config: &DeviceConfig) -> Result<Self> {
        let off = configured(&config.power_off_cmd).or(configured(&config.hard_reset_command));
        match (off, configured(&config.power_on_cmd)) {
            (Some(off), Some(on)) => Ok(CommandPower::new(off, on)),
            _ => Err(Error::UnsupportedConfiguration(format!(
                "{} has no power commands",
                config.hostname
            ))),
        }
    }
}
impl PowerControl for CommandPower {
    fn power_off(&mut self) -> Result<()> {
        info!("power off");
        run_command(&self.off).map(|_| ())
    }

    fn power_on(&mut self) -> Result<()> {
        info!("power on");
        run_command(&self.on).map(|_| ())
    }
}

fn configured(command: &Option<String>) -> Option<&str> {
    command.as_deref().filter(|cmd| !cmd.trim().is_empty())
}

/// For devices without a power switch. Power requests are logged and ignored.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPower;
impl PowerControl for NoPower {
    fn power_off(&mut self) -> Result<()> {
        warn!("no power control, ignoring power off");
        Ok(())
    }

    fn power_on(&mut self) -> Result<()> {
        warn!("no power control, ignoring power on");
        Ok(())
    }
}

/// Pick the power control for a device: nothing when it has no hard reset,
/// its commands otherwise. A hard reset without both power commands is
/// rejected.
pub fn for_config(config: &DeviceConfig) -> Result<Box<dyn PowerControl>> {
    if !config.hard_reset_available() {
        return Ok(Box::new(NoPower));
    }
    Ok(Box::new(CommandPower::from_config(config)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::SettingsBuilder;

    #[test]
    fn commands_come_from_config() {
        let config = SettingsBuilder::new()
            .hard_reset("pdu reboot 3", "pdu off 3", "pdu on 3")
            .finalize();
        assert_eq!(
            CommandPower::from_config(&config).unwrap(),
            CommandPower::new("pdu off 3", "pdu on 3")
        );
        assert!(CommandPower::from_config(&SettingsBuilder::new().finalize()).is_err());
    }

    #[test]
    fn hard_reset_needs_both_power_commands() {
        assert!(for_config(&SettingsBuilder::new().finalize()).is_ok());
        assert!(for_config(
            &SettingsBuilder::new()
                .hard_reset("pdu reboot 3", "pdu off 3", "pdu on 3")
                .finalize()
        )
        .is_ok());

        let incomplete = SettingsBuilder::new()
            .hard_reset("pdu reset", "", "")
            .finalize();
        assert!(matches!(
            for_config(&incomplete),
            Err(Error::UnsupportedConfiguration(_))
        ));
        let mut no_power_on = SettingsBuilder::new()
            .hard_reset("pdu reset", "pdu off 3", "pdu on 3")
            .finalize();
        no_power_on.power_on_cmd = None;
        assert!(for_config(&no_power_on).is_err());
    }

    #[test]
    fn command_power_runs_shell() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("on");
        let mut power = CommandPower::new("true", &format!("touch {}", marker.display()));
        power.power_off().unwrap();
        power.power_on().unwrap();
        assert!(marker.exists());

        let mut broken = CommandPower::new("exit 1", "true");
        assert!(broken.power_off().is_err());
    }
}
