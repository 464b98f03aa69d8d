//! States for the provisioning state machine.
//!
//! This modules is private and restricted to the
//! [`provision`](crate::provision) scope. The public interface of the
//! provisioning state machine is provided by
//! [`provision`](crate::provision).
//!
//! ```ignore
//! use super::states::*;
//! ```
//!
//! Refer to the [`state_machine`](super::state_machine) module for an overview
//! of states, events and transitions.

use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use super::{context::Context, events::*, state_machine::FailureReason};
use crate::{
    bootloader::ResetMode,
    error::{Error, Result},
};

const IMAGE_BOOT_FAILED: &str = "Kernel Error: did not start booting.";
/// A kernel warning or oops, with its trace in group 1.
const KERNEL_TRACE: &str = r"-+\[ cut here \]-+\s+(.*\s+-+\[ end trace (\w*) \]-+)";
const KERNEL_FAULT: &str = r"(Unhandled fault.*)\r\n";
/// Attempts at getting a stuck bootloader to reset after the image never
/// started.
const RESET_ATTEMPTS: usize = 5;

// =============================================================================
// Crate-Public Interface
// =============================================================================

/// Trait adding the ability for a state to be `run` after a transition into it.
pub(crate) trait Runnable {
    /// A state implements this method so it can be `run` after the state
    /// machine transitions into it.
    ///
    /// During this call, the state drives the device through the `ctx` and
    /// when finished, requests a transition to a `new state` by returning the
    /// appropriate `event`. The `state` and the `event` are consumed to create
    /// the `new state` using the corresponding [`From`] trait implementation
    /// (provided such implementation exists).
    fn run(&mut self, ctx: &mut Context) -> Event;
}

// Idle State ==================================================================

/// The initial state of the provisioning state machine.
///
///  * **[`EnterBootloaderEvent`] => [`EnteringBootloaderState`]** normally,
///  * **[`BootedEvent`] => [`BootedState`]** when the boot is skipped, without
///    touching the console.
#[derive(Debug)]
pub(crate) struct IdleState {}
impl Runnable for IdleState {
    fn run(&mut self, ctx: &mut Context) -> Event {
        info!("=> Idle");
        if ctx.boot.skip {
            info!("boot skipped, {} is taken as booted", ctx.config.hostname);
            Event::Booted(BootedEvent)
        } else {
            Event::EnterBootloader(EnterBootloaderEvent)
        }
    }
}

// EnteringBootloader State ====================================================

/// Resets the device into its bootloader and stores the board MAC address.
///
///  * **[`FlashEvent`] => [`FlashingState`]** at the prompt,
///  * **[`FailedEvent`] => [`FailedState`]** with a bootloader timeout when
///    the reset banner or the prompt never shows.
#[derive(Debug)]
pub(crate) struct EnteringBootloaderState {}
impl EnteringBootloaderState {
    fn enter(&self, ctx: &mut Context) -> Result<()> {
        ctx.bootloader().reset(ResetMode::Hard)?;
        ctx.bootloader().enter_bootloader()?;
        let target = ctx.target;
        target.set_mac_address(ctx)
    }
}
impl Runnable for EnteringBootloaderState {
    fn run(&mut self, ctx: &mut Context) -> Event {
        info!("=> Entering Bootloader ({})", ctx.family());
        match self.enter(ctx) {
            Ok(()) => Event::Flash(FlashEvent),
            Err(err) if err.is_timeout() => Event::Failed(FailedEvent {
                reason: FailureReason::BootloaderTimeout,
                error: err,
            }),
            Err(err) => failure(err, FailureReason::Console),
        }
    }
}

// Flashing State ==============================================================

/// Burns the image from the bootloader.
///
///  * **[`AwaitKernelBootEvent`] => [`AwaitingKernelBootState`]** after a
///    normal-mode flash,
///  * **[`BootedEvent`] => [`BootedState`]** after an EMMC flash,
///  * **[`FailedEvent`] => [`FailedState`]** on any error.
#[derive(Debug)]
pub(crate) struct FlashingState {}
impl FlashingState {
    fn flash_image(&self, ctx: &mut Context) -> Result<()> {
        let target = ctx.target;
        target.prepare_image(ctx)?;
        ctx.execute_boot_cmds()?;
        target.burn_factory(ctx)?;
        if ctx.is_release() {
            info!("release build, enabling console and su");
            target.burn_su_image(ctx)?;
            target.enter_recovery(ctx)?;
            ctx.customizer().su_device(target.tvinfo_partition())?;
        }
        Ok(())
    }

    fn flash_emmc(&self, ctx: &mut Context) -> Result<()> {
        let target = ctx.target;
        target.prepare_emmc(ctx)?;
        ctx.execute_boot_cmds()?;
        target.provision_emmc(ctx)
    }
}
impl Runnable for FlashingState {
    fn run(&mut self, ctx: &mut Context) -> Event {
        let emmc = ctx.boot.emmc;
        info!("=> Flashing{}", if emmc { " (EMMC)" } else { "" });

        let config = ctx.config;
        if let Some(command) = config.pre_boot_cmd.as_deref() {
            if let Err(err) = ctx.send(command) {
                return failure(err, FailureReason::Console);
            }
        }
        let flashed = if emmc {
            self.flash_emmc(ctx)
        } else {
            self.flash_image(ctx)
        };
        match flashed {
            Ok(()) if emmc => Event::Booted(BootedEvent),
            Ok(()) => Event::AwaitKernelBoot(AwaitKernelBootEvent),
            Err(err) => failure(err, FailureReason::Flashing),
        }
    }
}

// AwaitingKernelBoot State ====================================================

/// Follows the kernel boot on the console, recording every kernel exception
/// it prints on the way.
///
///  * **[`AwaitUserspaceBootEvent`] => [`AwaitingUserspaceBootState`]** once
///    a boot marker shows,
///  * **[`FailedEvent`] => [`FailedState`]** when the image never starts or
///    the kernel never finishes.
#[derive(Debug)]
pub(crate) struct AwaitingKernelBootState {}
impl AwaitingKernelBootState {
    fn image_boot(&self, ctx: &mut Context, names: &ResultNames) -> Result<()> {
        let config = ctx.config;
        let started = Instant::now();
        match ctx.expect(&[config.image_boot_msg.as_str()], config.image_boot_msg_timeout) {
            Ok(_) => {
                debug!("image started booting after {:?}", started.elapsed());
                ctx.results.pass(names.image_boot);
                Ok(())
            }
            Err(err) if err.is_timeout() => {
                error!("{}", IMAGE_BOOT_FAILED);
                if let Err(reset) = self.reset_stuck_bootloader(ctx) {
                    warn!("could not reset the bootloader: {}", reset);
                }
                ctx.results.fail(names.image_boot, Some(IMAGE_BOOT_FAILED));
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    /// The bootloader is usually stuck in a TFTP transfer; interrupt it and
    /// reset the board so the next job starts clean.
    fn reset_stuck_bootloader(&self, ctx: &mut Context) -> Result<()> {
        info!("trying to reset the bootloader and reboot the device");
        let config = ctx.config;
        for attempt in 1..=RESET_ATTEMPTS {
            ctx.control('c')?;
            ctx.pause(Duration::from_secs(2));
            let prompt = ctx.try_expect(&[config.bootloader_prompt.as_str()], Duration::from_secs(3))?;
            if prompt.is_some() {
                return ctx.send("reset");
            }
            warn!("bootloader still busy, attempt {} of {}", attempt, RESET_ATTEMPTS);
        }
        Ok(())
    }

    fn kernel_boot(&self, ctx: &mut Context, names: &ResultNames) -> Result<()> {
        let config = ctx.config;
        let markers = [
            config.kernel_boot_msg.as_str(),
            "Freeing init memory",
            KERNEL_TRACE,
            KERNEL_FAULT,
        ];
        let mut exceptions = 0;
        loop {
            match ctx.expect(&markers, config.kernel_boot_msg_timeout) {
                Ok(found) if found.index < 2 => {
                    ctx.results.pass(names.kernel_boot);
                    return Ok(());
                }
                Ok(found) => {
                    exceptions += 1;
                    let id = format!("{}{}", names.kernel_exception, exceptions);
                    warn!("kernel exception detected, logged as {}", id);
                    let trace = found.group(1).unwrap_or(&found.text);
                    ctx.results.fail(&id, Some(trace));
                }
                Err(err) => {
                    if err.is_timeout() {
                        ctx.results.fail(names.kernel_boot, None);
                    }
                    return Err(err);
                }
            }
        }
    }
}
impl Runnable for AwaitingKernelBootState {
    fn run(&mut self, ctx: &mut Context) -> Event {
        info!("=> Awaiting Kernel Boot");
        if !ctx.config.has_kernel_messages {
            debug!("no kernel messages on this console");
            return Event::AwaitUserspaceBoot(AwaitUserspaceBootEvent);
        }
        let names = ResultNames::new(ctx.is_master());
        if let Err(err) = self.image_boot(ctx, &names) {
            return match err {
                Error::Timeout { .. } => Event::Failed(FailedEvent {
                    reason: FailureReason::ImageBootTimeout,
                    error: err,
                }),
                other => failure(other, FailureReason::Console),
            };
        }
        match self.kernel_boot(ctx, &names) {
            Ok(()) => Event::AwaitUserspaceBoot(AwaitUserspaceBootEvent),
            Err(err) if err.is_timeout() => Event::Failed(FailedEvent {
                reason: FailureReason::KernelBootTimeout,
                error: err,
            }),
            Err(err) => failure(err, FailureReason::Console),
        }
    }
}

// AwaitingUserspaceBoot State =================================================

/// Waits for Android and gets the launcher in front of the setup guide.
#[derive(Debug)]
pub(crate) struct AwaitingUserspaceBootState {}
impl Runnable for AwaitingUserspaceBootState {
    fn run(&mut self, ctx: &mut Context) -> Event {
        info!("=> Awaiting Userspace Boot");
        match ctx.customizer().skip_guide() {
            Ok(()) => Event::Customize(CustomizeEvent),
            Err(err) => failure(err, FailureReason::Customization),
        }
    }
}

// PostBootCustomizing State ===================================================

/// Prepares the booted device for tests: toolkit, identity, no setup guide.
#[derive(Debug)]
pub(crate) struct PostBootCustomizingState {}
impl PostBootCustomizingState {
    fn customize(&self, ctx: &mut Context) -> Result<()> {
        let release = ctx.is_release();
        let mut customizer = ctx.customizer();
        customizer.display_usb()?;
        customizer.install_toolkit(release)?;
        customizer.disable_auto_shutdown()?;
        customizer.remove_setup_wizard()?;
        customizer.write_factory_properties()?;
        customizer.display_usb()?;
        customizer.reboot()?;
        customizer.skip_guide()?;
        customizer.auto_login()
    }
}
impl Runnable for PostBootCustomizingState {
    fn run(&mut self, ctx: &mut Context) -> Event {
        info!("=> Post-Boot Customizing");
        match self.customize(ctx) {
            Ok(()) => Event::Booted(BootedEvent),
            Err(err) => failure(err, FailureReason::Customization),
        }
    }
}

// Booted State ================================================================

/// Terminal state: the device is ready for tests.
#[derive(Debug)]
pub(crate) struct BootedState {}

// Failed State ================================================================

/// Terminal state. The error is handed back to the caller of the machine.
#[derive(Debug)]
pub(crate) struct FailedState {
    pub reason: FailureReason,
    pub error: Option<Error>,
}

// =============================================================================
// Private stuff
// =============================================================================

/// Result ids of the boot monitor; booting the master image has its own set.
struct ResultNames {
    image_boot: &'static str,
    kernel_boot: &'static str,
    kernel_exception: &'static str,
}
impl ResultNames {
    fn new(master: bool) -> Self {
        if master {
            ResultNames {
                image_boot: "wait_for_master_image_boot_msg",
                kernel_boot: "wait_for_master_kernel_boot_msg",
                kernel_exception: "master_kernel_exception_",
            }
        } else {
            ResultNames {
                image_boot: "wait_for_image_boot_msg",
                kernel_boot: "wait_for_kernel_boot_msg",
                kernel_exception: "test_kernel_exception_",
            }
        }
    }
}

/// Map an error to the failure event, using `otherwise` for errors that do
/// not name their own reason.
fn failure(err: Error, otherwise: fn(String) -> FailureReason) -> Event {
    let reason = match &err {
        Error::BootCommand { command, .. } => FailureReason::BootCommand(command.clone()),
        Error::FlashGeneration(message) => FailureReason::Flashing(message.clone()),
        Error::Network(message) => FailureReason::Network(message.clone()),
        Error::UnsupportedConfiguration(message) => FailureReason::Unsupported(message.clone()),
        other => otherwise(other.to_string()),
    };
    error!("provisioning failed: {}", reason);
    Event::Failed(FailedEvent { reason, error: err })
}

// =============================================================================
// Unit Tests
// =============================================================================
