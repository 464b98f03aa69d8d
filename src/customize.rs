//! Android-side customizations of a freshly flashed device: getting past the
//! setup wizard, installing the busybox toolkit and writing the board
//! identity.

use std::time::Duration;

use log::{debug, info, warn};
use retry::{delay, retry_with_index, OperationResult};

use crate::{
    error::{Error, Result},
    results::ResultLog,
    session::Console,
    settings::{DeviceConfig, Family},
};

/// Activities `dumpsys` may report as focused while the device boots.
const FOCUS_PATTERNS: &[&str] = &[
    "Can't find service",
    "com.helios.guide",
    "com.helios.launcher",
    "com.whaley.tv.tvplayer.ui",
];
const FOCUS_NO_SERVICE: usize = 0;
const FOCUS_GUIDE: usize = 1;
const FOCUS_LAUNCHER: usize = 2;

/// Result id recorded when the setup guide would not go away.
const SKIP_GUIDE: &str = "skip_guide_whaley";

pub struct Customizer<'a> {
    console: &'a mut dyn Console,
    config: &'a DeviceConfig,
    family: Family,
    results: &'a mut ResultLog,
}
impl<'a> Customizer<'a> {
    pub fn new(
        console: &'a mut dyn Console,
        config: &'a DeviceConfig,
        family: Family,
        results: &'a mut ResultLog,
    ) -> Self {
        Customizer {
            console,
            config,
            family,
            results,
        }
    }

    /// Get the launcher focused, dismissing the setup guide if needed. Gives
    /// up after 10 attempts, recording `skip_guide_whaley` as failed.
    pub fn skip_guide(&mut self) -> Result<()> {
        info!("skipping the setup guide");
        let result = retry_with_index(delay::NoDelay.take(9), |attempt| {
            debug!("skip guide attempt {}", attempt);
            match self.guide_attempt() {
                Ok(None) => OperationResult::Ok(()),
                Ok(Some(reason)) => OperationResult::Retry(GuideError::StillFocused(reason)),
                Err(err) => OperationResult::Err(GuideError::Console(err)),
            }
        });
        match result {
            Ok(()) => Ok(()),
            Err(retry::Error::Operation {
                error: GuideError::StillFocused(reason),
                tries,
                ..
            }) => {
                warn!("could not skip the guide after {} tries: {}", tries, reason);
                self.results.fail(SKIP_GUIDE, Some(reason));
                Ok(())
            }
            Err(retry::Error::Operation {
                error: GuideError::Console(err),
                ..
            }) => Err(err),
            Err(retry::Error::Internal(message)) => Err(Error::Critical(message)),
        }
    }

    /// List the media folders of the attached USB disks.
    pub fn display_usb(&mut self) -> Result<()> {
        self.run("su")?;
        self.run(
            "for usb in `ls /mnt/usb`; do busybox du -sh /mnt/usb/$usb/多媒体; \
             busybox ls -lh /mnt/usb/$usb/多媒体; done",
        )?;
        self.console.reset_buffer();
        Ok(())
    }

    /// Install busybox applets into `/system/xbin`. Release builds lack
    /// sqlite3, which is fetched from the resource server.
    pub fn install_toolkit(&mut self, release: bool) -> Result<()> {
        info!("installing the busybox toolkit");
        self.run("su")?;
        self.run("mount -o remount,rw /system")?;
        self.run("cd /system/xbin")?;
        self.run("busybox --install .")?;
        if release {
            let resource = if self.family.is_mstar() {
                "sqlite3"
            } else {
                "sqlite3_hisi"
            };
            self.line(&format!(
                "busybox wget -O sqlite3 {}/{}",
                self.config.resource_url, resource
            ))?;
            self.console.pause(secs(5));
            self.run("busybox chmod 755 sqlite3")?;
        }
        self.run("cd /")?;
        self.console.reset_buffer();
        Ok(())
    }

    pub fn disable_auto_shutdown(&mut self) -> Result<()> {
        self.run(
            "sqlite3 /data/system/hardwareprotect.db \
             \"update hwprotect set timeout=-1 where name='shutdown'\"",
        )
    }

    pub fn remove_setup_wizard(&mut self) -> Result<()> {
        info!("removing the setup guide");
        self.run("su")?;
        self.run("rm -rf /data/dalvik-cache/arm/system@priv-app@HeliosGuide@HeliosGuide.apk@classes.dex")?;
        self.run("mount -o remount,rw /system")?;
        self.run("rm -rf /system/priv-app/HeliosGuide")?;
        if self.family == Family::Mstar938 {
            self.run(
                "busybox sed -i 's/name=\"user_setup_complete\" value=\"0\"/\
                 name=\"user_setup_complete\" value=\"1\"/g' \
                 /data/system/users/0/settings_secure.xml",
            )?;
        }
        Ok(())
    }

    /// Append the board MAC address and serial number to the factory
    /// properties.
    pub fn write_factory_properties(&mut self) -> Result<()> {
        let (mac, sn) = match (&self.config.macaddr, &self.config.sn) {
            (Some(mac), Some(sn)) => (mac.clone(), sn.clone()),
            _ => {
                warn!("{} has no macaddr or sn, not writing factory properties", self.config.hostname);
                return Ok(());
            }
        };
        self.run("su")?;
        self.run("mount -o remount,rw /factory")?;
        self.run(&format!("echo ro.hardware.lan_mac={} >> /factory/factory.prop", mac))?;
        self.run(&format!("echo ro.device.serialno={} >> /factory/factory.prop", sn))?;
        self.run("chmod 644 /factory/factory.prop")
    }

    pub fn reboot(&mut self) -> Result<()> {
        self.line("reboot")?;
        self.console.pause(secs(50));
        Ok(())
    }

    /// Log into the vendor account with the UI automation helper.
    pub fn auto_login(&mut self) -> Result<()> {
        info!("logging into the vendor account");
        self.run("cd /data/local/tmp")?;
        self.run("su")?;
        self.line(&format!(
            "busybox wget -O TvUiTools.jar {}/media/TvUiTools.jar",
            self.config.resource_url
        ))?;
        self.console.pause(secs(5));
        self.line("input keyevent 21")?;
        self.console.pause(secs(5));
        self.console.reset_buffer();
        self.run(
            "uiautomator runtest TvUiTools.jar \
             -c com.whaley.viplogin.testcases.AutoLoginTestCase#testAutoLogin",
        )?;
        self.run("input keyevent 3")?;
        self.run("cd /")?;
        self.console.reset_buffer();
        Ok(())
    }

    /// From the recovery shell, install su from the tvinfo partition and
    /// reboot.
    pub fn su_device(&mut self, tvinfo: &str) -> Result<()> {
        info!("installing su from {}", tvinfo);
        let config = self.config;
        let recovery = config.recovery_prompt.as_str();
        self.console.send_control('c')?;
        self.console.try_expect(&[recovery], config.shell_timeout)?;
        let mount = format!("busybox mount {} /tmp/disk", tvinfo);
        for command in [
            "busybox --install /sbin",
            "busybox mkdir /tmp/disk",
            mount.as_str(),
            "busybox ls /tmp/disk",
            "cd /tmp/disk/su",
            "busybox ls /tmp/disk/su",
            "busybox chmod 755 su_install.sh",
            "busybox sh su_install.sh",
        ] {
            self.line(command)?;
            self.console.try_expect(&[recovery], config.shell_timeout)?;
        }
        self.console.pause(secs(5));
        self.line("busybox reboot -f")?;
        self.console.reset_buffer();
        Ok(())
    }

    /// Print the panel and picture quality settings.
    pub fn show_pq(&mut self) -> Result<()> {
        self.run("cat /proc/msp/pdm")?;
        self.run("cat /proc/msp/pq")?;
        self.show_factory_files()?;
        self.console.reset_buffer();
        Ok(())
    }

    pub fn show_factory_files(&mut self) -> Result<()> {
        for command in [
            "busybox ls -lh /factory",
            "busybox cat /factory/model_index.ini",
            "busybox cat /factory/factory.prop",
        ] {
            self.line(command)?;
            self.console.pause(secs(2));
        }
        Ok(())
    }

    pub fn clear_tv_database(&mut self) -> Result<()> {
        for command in [
            "rm -rf /tvdatabase/db/*",
            "rm -rf /tvdatabase/dtv/*",
            "rm -rf /atv/db/*",
            "sync",
        ] {
            self.run(command)?;
        }
        self.console.reset_buffer();
        Ok(())
    }

    /// Select the panel through the legacy hidebug menu.
    pub fn set_panel_spi(&mut self, index: &str) -> Result<()> {
        let timeout = self.config.shell_timeout;
        let spi = format!("spi {}", index);
        for (command, answer) in [
            ("hidebug", "TV"),
            ("factory", "factory@TV"),
            (spi.as_str(), "factory@TV"),
            ("q", "TV"),
            ("q", "shell@"),
        ] {
            self.line(command)?;
            self.console.try_expect(&[answer], timeout)?;
        }
        self.show_pq()
    }

    fn guide_attempt(&mut self) -> Result<Option<&'static str>> {
        let config = self.config;
        let shell = config.shell_prompt.as_str();
        self.console.reset_buffer();
        self.console.send_control('c')?;
        self.console.try_expect(&[shell], secs(20))?;
        self.line("dumpsys window | grep mFocusedApp")?;
        let focused = self.console.try_expect(FOCUS_PATTERNS, secs(10))?;
        match focused.map(|m| m.index) {
            Some(FOCUS_NO_SERVICE) => {
                self.console.pause(secs(100));
                Ok(Some("window service is not running"))
            }
            Some(FOCUS_GUIDE) => {
                self.console.pause(secs(80));
                self.console.send_control('c')?;
                self.console.try_expect(&[shell], secs(5))?;
                self.line("su")?;
                self.line("am start -n com.helios.launcher/.LauncherActivity")?;
                self.console.pause(secs(20));
                self.line("dumpsys window | grep mFocusedApp")?;
                match self.console.try_expect(FOCUS_PATTERNS, secs(10))? {
                    Some(m) if m.index == FOCUS_LAUNCHER => Ok(None),
                    _ => Ok(Some("setup guide is still focused")),
                }
            }
            Some(_) => Ok(None),
            None => {
                self.console.pause(secs(100));
                Ok(Some("no focused application reported"))
            }
        }
    }

    fn line(&mut self, command: &str) -> Result<()> {
        self.console.send_line(command, Duration::ZERO)
    }

    /// Send a command and give the shell a chance to come back.
    fn run(&mut self, command: &str) -> Result<()> {
        self.line(command)?;
        let config = self.config;
        if self
            .console
            .try_expect(&[config.shell_prompt.as_str()], config.shell_timeout)?
            .is_none()
        {
            debug!("no prompt after `{}`", command);
        }
        Ok(())
    }
}

enum GuideError {
    StillFocused(&'static str),
    Console(Error),
}

fn secs(n: u64) -> Duration {
    Duration::from_secs(n)
}
