//! HiSilicon boards. Their bootloader runs `exec` scripts fetched over TFTP
//! and keeps boot flags in `ufts` storage.

use std::time::Duration;

use log::{error, info, warn};

use super::{secs, skip_missing_factory, DeploymentTarget};
use crate::{
    error::Result,
    provision::Context,
    settings::{DeviceConfig, Family},
};

const PRESS_DELAY: Duration = Duration::from_millis(60);
/// What the launcher prints once Android is up.
const GUI_STARTED: &str = "StartGUI";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct HisiTarget;
impl HisiTarget {
    /// Burn `fastboot.txt` from the image directory and come back to the
    /// prompt after the reset it needs.
    fn burn_fastboot(&self, ctx: &mut Context) -> Result<()> {
        let script = ctx.image_path("fastboot.txt");
        info!("burning fastboot with {}", script);
        ctx.command_within(&format!("exec {}", script), secs(600))?;
        ctx.send("reset")?;
        ctx.interrupt(secs(600), 50, PRESS_DELAY)
    }

    /// Get to the prompt ahead of the su burn, power cycling first when a
    /// power switch is available.
    fn stop_autoboot(&self, ctx: &mut Context) -> Result<()> {
        let delay = Duration::from_millis(100);
        if ctx.config.hard_reset_available() {
            ctx.bootloader().power_cycle()?;
            ctx.interrupt(secs(20), 50, delay)
        } else {
            ctx.bootloader().press_enter(50, delay)?;
            ctx.prompt()
        }
    }

    fn burn_factory_emmc(&self, ctx: &mut Context) -> Result<()> {
        let factory = ctx.generate_factory()?;
        info!("[EMMC HISI] burning factory image {}", factory);
        let config = ctx.config;
        ctx.reset_buffer();
        ctx.command(&format!("setenv serverip {}", config.server_ip))?;
        ctx.command_within("dhcp", secs(100))?;
        ctx.command_within(&format!("exec {}", factory), secs(600))?;
        ctx.reset_buffer();
        ctx.command_within("printenv", secs(60))?;
        ctx.command("ufts list")
    }
}
impl DeploymentTarget for HisiTarget {
    fn family(&self) -> Family {
        Family::Hisi
    }

    fn reset_banner<'c>(&self, config: &'c DeviceConfig) -> &'c str {
        &config.interrupt_boot_prompt
    }

    fn tvinfo_partition(&self) -> &'static str {
        "/dev/block/platform/hi_mci.1/by-name/tvinfo"
    }

    fn set_mac_address(&self, ctx: &mut Context) -> Result<()> {
        match ctx.macaddr() {
            Some(mac) => {
                info!("setting mac address {}", mac);
                ctx.command(&format!("setenv ethaddr {}", mac))?;
                ctx.reset_buffer();
            }
            None => warn!("{} has no macaddr, keeping the board address", ctx.config.hostname),
        }
        Ok(())
    }

    fn prepare_image(&self, ctx: &mut Context) -> Result<()> {
        ctx.reset_buffer();
        self.set_mac_address(ctx)?;
        let ip = ctx.image_server_ip();
        ctx.command(&format!("setenv serverip {}", ip))?;
        ctx.command("ufts reset")?;
        self.burn_fastboot(ctx)?;
        // The fastboot burn resets the environment.
        self.set_mac_address(ctx)
    }

    fn burn_factory(&self, ctx: &mut Context) -> Result<()> {
        info!("burning the hisi factory image");
        let config = ctx.config;
        ctx.interrupt(config.image_boot_msg_timeout, 30, PRESS_DELAY)?;
        ctx.command(&format!("setenv serverip {}", config.server_ip))?;
        ctx.command_within("dhcp", secs(100))?;
        let burned = ctx
            .generate_factory()
            .and_then(|factory| ctx.command_within(&format!("exec {}", factory), secs(600)));
        let reset = ctx.send("reset");
        skip_missing_factory(burned).and(reset)
    }

    fn burn_su_image(&self, ctx: &mut Context) -> Result<()> {
        info!("release build, burning su to tvinfo");
        let config = ctx.config;
        if let Err(err) = self.stop_autoboot(ctx) {
            error!("Infrastructure Error: failed to enter the bootloader.");
            return Err(err);
        }
        ctx.reset_buffer();
        ctx.command(&format!("setenv serverip {}", config.su_server_ip))?;
        ctx.command_within("exec su/hisi", secs(600))
    }

    fn enter_recovery(&self, ctx: &mut Context) -> Result<()> {
        info!("entering recovery mode");
        ctx.reset_buffer();
        ctx.send("ufts set fts.fac.factory_mode 0")?;
        ctx.command("ufts set fts.boot.command boot-recovery")?;
        ctx.command("ufts set fts.boot.status")?;
        ctx.command("ufts set fts.boot.recovery")?;
        ctx.send("reset")?;
        ctx.expect(&[GUI_STARTED], secs(150))?;
        ctx.pause(secs(15));
        ctx.reset_buffer();
        Ok(())
    }

    fn prepare_emmc(&self, ctx: &mut Context) -> Result<()> {
        info!("[EMMC HISI] burning fastboot");
        ctx.reset_buffer();
        self.set_mac_address(ctx)?;
        let ip = ctx.image_server_ip();
        ctx.command(&format!("setenv serverip {}", ip))?;
        self.burn_fastboot(ctx)?;
        ctx.send("ufts reset")?;
        if let Some(mac) = ctx.macaddr() {
            ctx.send(&format!("setenv ethaddr {}", mac))?;
        }
        ctx.reset_buffer();
        Ok(())
    }

    fn provision_emmc(&self, ctx: &mut Context) -> Result<()> {
        let config = ctx.config;
        ctx.reset_buffer();
        if ctx.deploy.image.contains("auto.txt") {
            info!("[EMMC HISI] waiting for the end of auto.txt");
            ctx.interrupt(config.image_boot_msg_timeout, 30, Duration::from_millis(80))?;
            ctx.command("ufts set fts.fac.factory_mode 1")?;
        }
        self.burn_factory_emmc(ctx)?;
        ctx.reset_buffer();
        self.calibrate(ctx)?;

        ctx.pause(secs(120));
        ctx.customizer().show_pq()?;
        ctx.send("reboot r")?;
        ctx.expect(&[GUI_STARTED], secs(150))?;
        ctx.pause(secs(15));
        self.dump_storage(ctx)
    }

    /// Write the panel index with `panel_index`, or through the hidebug menu
    /// on fastboot builds that lack the command.
    fn calibrate(&self, ctx: &mut Context) -> Result<()> {
        let config = ctx.config;
        let deploy = ctx.deploy;
        let index = deploy.factory.model_index.as_str();
        ctx.send("panel_index")?;
        let probe = ctx.expect(&[config.bootloader_prompt.as_str()], config.boot_cmd_timeout)?;
        if probe.before.contains("Unknown command") {
            info!("[EMMC HISI] no panel_index command, using the spi menu");
            ctx.send("reset")?;
            ctx.pause(secs(60));
            let mut customizer = ctx.customizer();
            customizer.skip_guide()?;
            customizer.clear_tv_database()?;
            customizer.set_panel_spi(index)?;
            ctx.send("reboot")
        } else {
            info!("[EMMC HISI] writing panel index {}", index);
            ctx.command(&format!("panel_index write {}", index))?;
            ctx.command("panel_index read")?;
            ctx.send("reset")
        }
    }

    fn dump_storage(&self, ctx: &mut Context) -> Result<()> {
        info!("[EMMC HISI] dumping the emmc to the usb disk from recovery");
        let config = ctx.config;
        let recovery = config.recovery_prompt.as_str();
        ctx.control('c')?;
        ctx.expect(&[recovery], secs(60))?;
        ctx.reset_buffer();
        ctx.send("busybox --install /sbin")?;
        ctx.send("busybox mkdir /tmp/disk")?;
        ctx.send("sda=`busybox ls /dev/block/sda* | busybox grep \"/dev/block/sda.\"`")?;
        ctx.pause(secs(2));
        ctx.send("busybox mount $sda /tmp/disk")?;
        ctx.pause(secs(2));
        ctx.reset_buffer();

        ctx.send("busybox dd if=/dev/block/mmcblk0 of=/tmp/disk/android.bin bs=512")?;
        ctx.expect(&[recovery], secs(3600))?;
        ctx.send("busybox md5sum /tmp/disk/android.bin")?;
        ctx.expect(&[recovery], secs(600))?;
        ctx.send("busybox umount /tmp/disk")?;
        ctx.expect(&[recovery], secs(60))?;
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

    const PROMPT: &str = "fastboot# ";

    fn config() -> DeviceConfig {
        SettingsBuilder::new()
            .device_type("hisi")
            .bootloader_prompt("fastboot#")
            .macaddr("00:30:1B:BA:02:DB")
            .finalize()
    }

    fn fixture(script: ReplayScript) -> Fixture {
        let mut fixture = Fixture::new(config(), script);
        fixture.deploy.factory.model_index = "12".into();
        fixture
    }

    #[test]
    fn panel_index_is_written_when_supported() {
        let script = ReplayScript::new()
            .on("^panel_index$", "usage: panel_index read|write <index>\r\nfastboot# ")
            .on("^panel_index ", PROMPT);
        let mut fixture = fixture(script);
        fixture.run(|ctx| HisiTarget.calibrate(ctx)).unwrap();
        assert_eq!(
            fixture.console.log().lines(),
            vec!["panel_index", "panel_index write 12", "panel_index read", "reset"]
        );
    }

    #[test]
    fn unknown_panel_index_falls_back_to_spi_menu() {
        let script = ReplayScript::new()
            .on("^panel_index$", "Unknown command 'panel_index' - try 'help'\r\nfastboot# ")
            .on("^dumpsys", "mFocusedApp com.helios.launcher/.Launcher\r\n")
            .on("^hidebug$", "TV> ")
            .on("^(factory|spi )", "factory@TV> ")
            .on(r"^\^C$", "shell@Hi3751:/ $ ");
        let mut fixture = fixture(script);
        fixture.run(|ctx| HisiTarget.calibrate(ctx)).unwrap();
        let lines = fixture.console.log().lines();
        assert!(!lines.iter().any(|l| l.starts_with("panel_index write")));
        assert!(lines.contains(&"spi 12".to_owned()));
        assert!(lines.contains(&"rm -rf /tvdatabase/db/*".to_owned()));
        assert_eq!(lines.last().map(String::as_str), Some("reboot"));
        assert!(fixture
            .console
            .log()
            .entries()
            .contains(&Sent::Pause(secs(60))));
    }

    #[test]
    fn factory_burn_uses_exec() {
        let script = ReplayScript::new()
            .banner("Press Ctrl+C to stop autoboot\r\nHit any key to stop autoboot\r\n")
            .on("^(setenv|dhcp|$)", PROMPT);
        let mut fixture = fixture(script);
        fixture.run(|ctx| HisiTarget.burn_factory(ctx)).unwrap();
        let lines = fixture.console.log().lines();
        let blanks = lines.iter().filter(|l| l.is_empty()).count();
        assert_eq!(blanks, 30);
        assert_eq!(&lines[30..], ["setenv serverip 127.0.0.1", "dhcp", "reset"]);
    }

    #[test]
    fn recovery_waits_for_the_gui() {
        let script = ReplayScript::new()
            .on("^ufts", PROMPT)
            .on("^reset$", "...\r\nStartGUI\r\n");
        let mut fixture = fixture(script);
        fixture.run(|ctx| HisiTarget.enter_recovery(ctx)).unwrap();
        assert_eq!(fixture.console.log().lines().len(), 5);
    }

    #[test]
    fn su_image_power_cycles_when_possible() {
        let config = SettingsBuilder::new()
            .device_type("hisi")
            .bootloader_prompt("fastboot#")
            .hard_reset("pdu reboot", "pdu off", "pdu on")
            .finalize();
        let script = ReplayScript::new()
            .banner("Hit any key to stop autoboot\r\n")
            .on("^(setenv|exec|$)", PROMPT);
        let mut fixture = Fixture::new(config, script);
        fixture.run(|ctx| HisiTarget.burn_su_image(ctx)).unwrap();
        let log = fixture.console.log();
        assert!(log.entries().contains(&Sent::Pause(secs(20))));
        assert_eq!(
            &log.lines()[50..],
            ["setenv serverip 172.16.10.41", "exec su/hisi"]
        );
    }
}
