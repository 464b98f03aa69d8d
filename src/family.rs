//! Per-family bootloader routines.
//!
//! MStar and HiSilicon boards share the overall provisioning flow but differ
//! in every bootloader command used to get there. Each family implements
//! [`DeploymentTarget`] and the provisioning states call through it, so the
//! flow itself never checks the family tag.

mod hisi;
mod mstar;

use std::{fmt, time::Duration};

use log::warn;

use crate::{
    error::{Error, Result},
    provision::Context,
    settings::{DeviceConfig, Family},
};

pub(crate) use hisi::HisiTarget;
pub(crate) use mstar::MstarTarget;

// =============================================================================
// Crate-Public Interface
// =============================================================================

/// The bootloader capabilities of one family of boards.
pub(crate) trait DeploymentTarget: Send + fmt::Debug {
    fn family(&self) -> Family;

    /// What the console prints right after a reset, before the autoboot
    /// countdown.
    fn reset_banner<'c>(&self, config: &'c DeviceConfig) -> &'c str;

    /// Partition holding the su payload written by [`burn_su_image`].
    ///
    /// [`burn_su_image`]: DeploymentTarget::burn_su_image
    fn tvinfo_partition(&self) -> &'static str;

    /// Store the board MAC address in the bootloader environment.
    fn set_mac_address(&self, ctx: &mut Context) -> Result<()>;

    /// Burn the bootloader stage of the image, ending at the prompt.
    fn prepare_image(&self, ctx: &mut Context) -> Result<()>;

    /// Burn the per-board factory image once the boot commands have run,
    /// then reset. A factory image that cannot be generated is skipped.
    fn burn_factory(&self, ctx: &mut Context) -> Result<()>;

    /// Write the su payload of release builds to the tvinfo partition.
    fn burn_su_image(&self, ctx: &mut Context) -> Result<()>;

    /// Reboot into the recovery shell.
    fn enter_recovery(&self, ctx: &mut Context) -> Result<()>;

    /// Bootloader stage of an EMMC build.
    fn prepare_emmc(&self, ctx: &mut Context) -> Result<()>;

    /// Everything after the EMMC boot commands: factory image, panel
    /// calibration, data wipe and the final dump of the storage to USB.
    fn provision_emmc(&self, ctx: &mut Context) -> Result<()>;

    /// Apply or show the panel configuration of the factory image.
    fn calibrate(&self, ctx: &mut Context) -> Result<()>;

    /// Copy the whole EMMC to the attached USB disk.
    fn dump_storage(&self, ctx: &mut Context) -> Result<()>;
}

/// The capabilities for a family tag.
pub(crate) fn for_family(family: Family) -> Box<dyn DeploymentTarget> {
    match family {
        Family::Mstar => Box::new(MstarTarget::new(false)),
        Family::Mstar938 => Box::new(MstarTarget::new(true)),
        Family::Hisi => Box::new(HisiTarget),
    }
}

// =============================================================================
// Private stuff
// =============================================================================

/// Normal-mode flashing carries on without a factory image.
fn skip_missing_factory(burned: Result<()>) -> Result<()> {
    match burned {
        Err(Error::FlashGeneration(reason)) => {
            warn!("skip burn factory image: {}", reason);
            Ok(())
        }
        other => other,
    }
}

fn secs(n: u64) -> Duration {
    Duration::from_secs(n)
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::SettingsBuilder;

    #[test]
    fn family_round_trip() {
        for family in [Family::Mstar, Family::Mstar938, Family::Hisi] {
            assert_eq!(for_family(family).family(), family);
        }
    }

    #[test]
    fn reset_banners() {
        let config = SettingsBuilder::new()
            .interrupt_boot_prompt("Press Ctrl\\+C to stop autoboot")
            .finalize();
        assert_eq!(for_family(Family::Mstar938).reset_banner(&config), "U-Boot");
        assert_eq!(
            for_family(Family::Hisi).reset_banner(&config),
            "Press Ctrl\\+C to stop autoboot"
        );
    }

    #[test]
    fn only_generation_failures_are_skipped() {
        assert!(skip_missing_factory(Err(Error::FlashGeneration("no tool".into()))).is_ok());
        assert!(skip_missing_factory(Err(Error::timeout(&["<< MStar >>#"], secs(1)))).is_err());
    }
}
