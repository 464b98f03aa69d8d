//! MStar boards. The 938 variant also keeps settings in `ufts` storage and
//! ships its mboot as `scripts/[[mboot`.

use std::time::Duration;

use log::{info, warn};

use super::{secs, skip_missing_factory, DeploymentTarget};
use crate::{
    bootloader::ResetMode,
    error::Result,
    provision::Context,
    settings::{DeviceConfig, Family},
};

const PRESSES: usize = 10;
const PRESS_DELAY: Duration = Duration::from_millis(100);
/// Environment written before the storage dump, so the dumped image boots
/// straight away on any board.
const DUMP_MACADDR: &str = "00:30:1B:BA:02:DB";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MstarTarget {
    variant_938: bool,
}
impl MstarTarget {
    pub fn new(variant_938: bool) -> Self {
        MstarTarget { variant_938 }
    }

    /// Wipe the bootloader environment back to defaults.
    fn clean_env(&self, ctx: &mut Context) -> Result<()> {
        ctx.command("cleanallenv")?;
        if self.variant_938 {
            ctx.command("ufts reset")?;
        }
        ctx.command("setenv bootdelay 10")?;
        ctx.command("saveenv")
    }

    /// Fetch the network configuration over DHCP from `server`.
    fn network(&self, ctx: &mut Context, server: &str) -> Result<()> {
        ctx.command(&format!("setenv serverip {}", server))?;
        ctx.command("estart")?;
        ctx.command_within("dhcp", secs(100))
    }

    fn burn_factory_emmc(&self, ctx: &mut Context) -> Result<()> {
        let factory = ctx.generate_factory()?;
        info!("[EMMC MSTAR] burning factory image {}", factory);
        let config = ctx.config;
        self.network(ctx, &config.server_ip)?;
        ctx.command_within(&format!("mstar {}", factory), secs(600))?;
        ctx.reset_buffer();
        Ok(())
    }

    fn wipe_data(&self, ctx: &mut Context) -> Result<()> {
        info!("[EMMC MSTAR] wiping the data partition");
        let config = ctx.config;
        ctx.command("setenv db_table 0")?;
        ctx.command("saveenv")?;
        ctx.command_within("recovery_wipe_partition data", secs(30))?;
        ctx.send("reset")?;
        ctx.expect(&[config.recovery_prompt.as_str()], secs(300))?;
        Ok(())
    }

    /// Once Android is up, burn the production mboot script.
    fn burn_mboot_script(&self, ctx: &mut Context) -> Result<()> {
        info!("[EMMC MSTAR] waiting for android to boot");
        let config = ctx.config;
        let booted = ctx.expect(&["start test", "TVOS"], config.image_boot_msg_timeout)?;
        if booted.index == 1 {
            ctx.pause(secs(200));
        }
        ctx.bootloader().reset(ResetMode::Hard)?;
        ctx.prompt_within(secs(30))?;
        ctx.reset_buffer();

        let script = ctx.image_path("scripts/[[mboot");
        info!("[EMMC MSTAR] burning {}", script);
        let ip = ctx.image_server_ip();
        self.network(ctx, ip)?;
        ctx.command_within(&format!("mstar {}", script), secs(600))
    }
}
impl DeploymentTarget for MstarTarget {
    fn family(&self) -> Family {
        if self.variant_938 {
            Family::Mstar938
        } else {
            Family::Mstar
        }
    }

    fn reset_banner<'c>(&self, _config: &'c DeviceConfig) -> &'c str {
        "U-Boot"
    }

    fn tvinfo_partition(&self) -> &'static str {
        "/dev/block/platform/mstar_mci.0/by-name/tvinfo"
    }

    fn set_mac_address(&self, ctx: &mut Context) -> Result<()> {
        let config = ctx.config;
        let mac = match ctx.macaddr() {
            Some(mac) => mac,
            None => {
                warn!("{} has no macaddr, keeping the board address", config.hostname);
                return Ok(());
            }
        };
        info!("setting mac address {} and bootdelay", mac);
        ctx.send(&format!("setenv ethaddr {}", mac))?;
        ctx.send(&format!("setenv macaddr {}", mac))?;
        ctx.send("setenv bootdelay 10")?;
        ctx.send("saveenv")?;
        ctx.expect(&["done"], config.boot_cmd_timeout)?;
        ctx.reset_buffer();
        Ok(())
    }

    fn prepare_image(&self, ctx: &mut Context) -> Result<()> {
        info!("burning mboot with auto_update_mboot.txt");
        ctx.reset_buffer();
        self.clean_env(ctx)?;
        ctx.send("reset")?;
        ctx.interrupt(secs(100), PRESSES, PRESS_DELAY)?;
        let ip = ctx.image_server_ip();
        ctx.command(&format!("setenv serverip {}", ip))?;
        self.set_mac_address(ctx)?;
        let script = ctx.image_path("auto_update_mboot.txt");
        ctx.send(&format!("mstar {}", script))?;
        ctx.interrupt(secs(600), PRESSES, PRESS_DELAY)
    }

    fn burn_factory(&self, ctx: &mut Context) -> Result<()> {
        info!("burning the mstar factory image");
        let config = ctx.config;
        ctx.interrupt(config.image_boot_msg_timeout, PRESSES, PRESS_DELAY)?;
        self.network(ctx, &config.server_ip)?;
        let burned = ctx.generate_factory().and_then(|factory| {
            ctx.send(&format!("mstar {}", factory))?;
            // The factory script may reset the board itself.
            ctx.try_expect(&[config.bootloader_prompt.as_str()], secs(600))
                .map(|_| ())
        });
        let reset = ctx.send("reset");
        skip_missing_factory(burned).and(reset)
    }

    fn burn_su_image(&self, ctx: &mut Context) -> Result<()> {
        info!("release build, burning su to tvinfo");
        let config = ctx.config;
        ctx.interrupt(config.image_boot_msg_timeout, PRESSES, PRESS_DELAY)?;
        self.network(ctx, &config.su_server_ip)?;
        let su = if self.variant_938 {
            "su/mstar_938"
        } else {
            "su/mstar"
        };
        ctx.command_within(&format!("mstar {}", su), secs(600))
    }

    fn enter_recovery(&self, ctx: &mut Context) -> Result<()> {
        info!("entering recovery mode");
        let config = ctx.config;
        ctx.reset_buffer();
        ctx.command("ac androidboot.debuggable 1")?;
        ctx.command("recovery")?;
        ctx.send("reset")?;
        ctx.expect(&[config.recovery_prompt.as_str()], secs(150))?;
        ctx.pause(secs(15));
        ctx.reset_buffer();
        Ok(())
    }

    fn prepare_emmc(&self, ctx: &mut Context) -> Result<()> {
        let script = if self.variant_938 {
            ctx.image_path("scripts/[[mboot")
        } else {
            ctx.image_path("auto_update_mboot.txt")
        };
        info!("[EMMC MSTAR] burning mboot with {}", script);
        let config = ctx.config;
        let ip = ctx.image_server_ip();
        ctx.send("setenv bootdelay 10")?;
        ctx.send("setenv macaddr")?;
        ctx.send("setenv ethaddr")?;
        ctx.send(&format!("setenv serverip {}", ip))?;
        ctx.send("saveenv")?;
        ctx.expect(&["done"], config.boot_cmd_timeout)?;
        ctx.reset_buffer();

        ctx.command_within("estart", secs(20))?;
        ctx.command_within("dhcp", secs(20))?;
        ctx.send(&format!("mstar {}", script))?;
        if self.variant_938 {
            ctx.prompt_within(secs(300))?;
            ctx.send("reset")?;
        }
        ctx.interrupt(secs(300), PRESSES, PRESS_DELAY)?;

        info!("[EMMC MSTAR] cleaning the environment");
        self.clean_env(ctx)?;
        ctx.send("reset")?;
        ctx.interrupt(secs(60), PRESSES, PRESS_DELAY)
    }

    fn provision_emmc(&self, ctx: &mut Context) -> Result<()> {
        info!("[EMMC MSTAR] waiting for the end of the update script");
        let config = ctx.config;
        ctx.interrupt(config.image_boot_msg_timeout, PRESSES, PRESS_DELAY)?;
        if self.variant_938 {
            ctx.command("ufts set fts.fac.factory_mode 1")?;
        }
        self.burn_factory_emmc(ctx)?;
        self.calibrate(ctx)?;
        self.wipe_data(ctx)?;
        self.burn_mboot_script(ctx)?;
        self.dump_storage(ctx)
    }

    /// The panel data comes with the factory image; show it from recovery.
    fn calibrate(&self, ctx: &mut Context) -> Result<()> {
        info!("[EMMC MSTAR] showing the factory partition");
        let config = ctx.config;
        let recovery = config.recovery_prompt.as_str();
        ctx.command("recovery")?;
        ctx.send("reset")?;
        ctx.expect(&[recovery], secs(100))?;
        ctx.pause(secs(10));
        ctx.control('c')?;
        ctx.try_expect(&[recovery], config.shell_timeout)?;
        ctx.customizer().show_factory_files()?;
        ctx.send("busybox reboot -f")?;
        ctx.interrupt(secs(100), PRESSES, PRESS_DELAY)?;
        ctx.control('c')?;
        ctx.settle()
    }

    fn dump_storage(&self, ctx: &mut Context) -> Result<()> {
        info!("[EMMC MSTAR] dumping the emmc to the usb disk");
        let config = ctx.config;
        ctx.reset_buffer();
        ctx.send("setenv bootdelay")?;
        ctx.send("setenv deployargs")?;
        ctx.send("setenv bootcmd")?;
        ctx.send(&format!("setenv macaddr {}", DUMP_MACADDR))?;
        ctx.send("saveenv")?;
        ctx.expect(&["done"], config.boot_cmd_timeout)?;
        ctx.reset_buffer();

        ctx.command_within("mmc erase.boot 2 0 512", secs(60))?;
        ctx.command_within("printenv", secs(60))?;
        if self.variant_938 {
            ctx.command("ufts list")?;
        }
        ctx.reset_buffer();
        ctx.command_within("usb start 3", secs(60))?;
        ctx.send("mmc dd mmc2usb 3")?;
        ctx.expect(&["Dump Block"], config.image_boot_msg_timeout)?;
        ctx.pause(secs(10));
        Ok(())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        provision::Fixture,
        session::{ReplayScript, Sent},
        settings::SettingsBuilder,
    };

    const PROMPT: &str = "<< MStar >># ";

    /// Standard bootloader replies, after any rules already in `script`.
    fn bootloader(script: ReplayScript) -> ReplayScript {
        script
            .on("^saveenv$", "Saving Environment to MMC...\r\nWriting to MMC(0)... done\r\n<< MStar >># ")
            .on("^reset$", "Hit any key to stop autoboot:  1 \r\n")
            .on("^mstar ", "Hit any key to stop autoboot:  1 \r\n")
            .on(
                "^(setenv|cleanallenv|estart|dhcp|ufts|ac |recovery|$)",
                PROMPT,
            )
    }

    fn at_countdown() -> ReplayScript {
        ReplayScript::new().banner("Hit any key to stop autoboot:  3 \r\n")
    }

    fn config(device_type: &str) -> DeviceConfig {
        SettingsBuilder::new()
            .device_type(device_type)
            .macaddr("00:30:1B:BA:02:DB")
            .finalize()
    }

    #[test]
    fn mac_address_is_saved() {
        let mut fixture = Fixture::new(config("mstar"), bootloader(ReplayScript::new()));
        fixture
            .run(|ctx| {
                let target = ctx.target;
                target.set_mac_address(ctx)
            })
            .unwrap();
        assert_eq!(
            fixture.console.log().lines(),
            vec![
                "setenv ethaddr 00:30:1B:BA:02:DB",
                "setenv macaddr 00:30:1B:BA:02:DB",
                "setenv bootdelay 10",
                "saveenv",
            ]
        );
    }

    #[test]
    fn missing_mac_address_is_skipped() {
        let config = SettingsBuilder::new().finalize();
        let mut fixture = Fixture::new(config, ReplayScript::new());
        fixture
            .run(|ctx| MstarTarget::new(false).set_mac_address(ctx))
            .unwrap();
        assert!(fixture.console.log().is_empty());
    }

    #[test]
    fn mboot_burn_uses_the_image_directory() {
        let mut fixture = Fixture::new(config("mstar-938"), bootloader(ReplayScript::new()));
        fixture
            .run(|ctx| MstarTarget::new(true).prepare_image(ctx))
            .unwrap();
        let lines = fixture.console.log().lines();
        assert_eq!(&lines[..4], ["cleanallenv", "ufts reset", "setenv bootdelay 10", "saveenv"]);
        assert!(lines.contains(&"setenv serverip 172.16.117.9".to_owned()));
        assert_eq!(
            lines.iter().filter(|l| l.starts_with("mstar ")).collect::<Vec<_>>(),
            ["mstar helios/20170301/images/auto_update_mboot.txt"]
        );
    }

    #[test]
    fn factory_burn_is_skipped_but_still_resets() {
        let mut fixture = Fixture::new(config("mstar"), bootloader(at_countdown()));
        fixture
            .run(|ctx| MstarTarget::new(false).burn_factory(ctx))
            .unwrap();
        let lines = fixture.console.log().lines();
        assert!(!lines.iter().any(|l| l.starts_with("mstar ")));
        assert_eq!(lines.last().map(String::as_str), Some("reset"));
    }

    #[test]
    fn su_payload_depends_on_variant() {
        for (variant_938, su) in [(false, "mstar su/mstar"), (true, "mstar su/mstar_938")] {
            let script = bootloader(at_countdown().on("^mstar su/", PROMPT));
            let mut fixture = Fixture::new(config("mstar"), script);
            fixture
                .run(|ctx| MstarTarget::new(variant_938).burn_su_image(ctx))
                .unwrap();
            let lines = fixture.console.log().lines();
            assert!(lines.contains(&"setenv serverip 172.16.10.41".to_owned()));
            assert_eq!(lines.last().map(String::as_str), Some(su));
        }
    }

    #[test]
    fn recovery_waits_for_the_recovery_shell() {
        let script = bootloader(ReplayScript::new().on("^reset$", "Booting recovery...\r\n/ # "));
        let mut fixture = Fixture::new(config("mstar"), script);
        fixture
            .run(|ctx| MstarTarget::new(false).enter_recovery(ctx))
            .unwrap();
        assert!(fixture
            .console
            .log()
            .entries()
            .contains(&Sent::Pause(secs(15))));
    }
}
