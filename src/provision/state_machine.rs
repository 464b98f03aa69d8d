//! Device provisioning state machine.
//!
//! A provisioning run takes a device from whatever it is doing to a freshly
//! flashed and customized Android, ready for tests. Every state drives the
//! console through the [`Context`] and returns the event deciding the next
//! transition.
//!
//! The following state diagram summarizes the different states and
//! transitions a provisioning run goes through:
//!
//! ```text
//!   Idle ──skip──────────────────────────────────────────────┐
//!    │                                                       │
//!    ▼                                                       ▼
//!   EnteringBootloader ─▶ Flashing ──emmc──────────────▶ Booted
//!                            │                               ▲
//!                            ▼                               │
//!                  AwaitingKernelBoot ─▶ AwaitingUserspaceBoot
//!                                                 │          │
//!                                                 ▼          │
//!                                        PostBootCustomizing ┘
//!
//!   any non-terminal state ──error──▶ Failed(reason)
//! ```

use std::{fmt, time::Instant};

use log::debug;

use super::{context::Context, events::*, states::*};
use crate::error::{Error, Result};

// =============================================================================
// Public Interface
// =============================================================================

/// Where a provisioning run stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisioningState {
    Idle,
    EnteringBootloader,
    Flashing,
    AwaitingKernelBoot,
    AwaitingUserspaceBoot,
    PostBootCustomizing,
    Booted,
    Failed(FailureReason),
}
impl ProvisioningState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProvisioningState::Booted | ProvisioningState::Failed(_))
    }
}
impl fmt::Display for ProvisioningState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProvisioningState::Idle => write!(f, "Idle"),
            ProvisioningState::EnteringBootloader => write!(f, "EnteringBootloader"),
            ProvisioningState::Flashing => write!(f, "Flashing"),
            ProvisioningState::AwaitingKernelBoot => write!(f, "AwaitingKernelBoot"),
            ProvisioningState::AwaitingUserspaceBoot => write!(f, "AwaitingUserspaceBoot"),
            ProvisioningState::PostBootCustomizing => write!(f, "PostBootCustomizing"),
            ProvisioningState::Booted => write!(f, "Booted"),
            ProvisioningState::Failed(reason) => write!(f, "Failed ({})", reason),
        }
    }
}

/// Why a provisioning run ended in [`ProvisioningState::Failed`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    BootloaderTimeout,
    /// The boot command line that failed.
    BootCommand(String),
    Flashing(String),
    ImageBootTimeout,
    KernelBootTimeout,
    Customization(String),
    Network(String),
    Unsupported(String),
    Console(String),
}
impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::BootloaderTimeout => write!(f, "failed to enter the bootloader"),
            FailureReason::BootCommand(line) => write!(f, "boot command `{}` failed", line),
            FailureReason::Flashing(message) => write!(f, "flashing failed: {}", message),
            FailureReason::ImageBootTimeout => write!(f, "the image did not start booting"),
            FailureReason::KernelBootTimeout => write!(f, "the kernel did not finish booting"),
            FailureReason::Customization(message) => {
                write!(f, "post-boot customization failed: {}", message)
            }
            FailureReason::Network(message) => write!(f, "network error: {}", message),
            FailureReason::Unsupported(message) => {
                write!(f, "unsupported configuration: {}", message)
            }
            FailureReason::Console(message) => write!(f, "console error: {}", message),
        }
    }
}

// =============================================================================
// Crate-Public Interface
// =============================================================================

/// Represents one provisioning run. Use the `factory()` function to get an
/// instance then run it by calling its `run()` method.
pub(crate) struct Provisioner {
    sm: ProvisionStates,
}
impl Provisioner {
    /// The event loop runs until `Booted` or `Failed` is reached. It returns
    /// every state visited, in order, along with the outcome of the run.
    pub fn run(mut self, ctx: &mut Context) -> (Vec<ProvisioningState>, Result<()>) {
        let mut history = vec![self.sm.state()];
        loop {
            match &mut self.sm {
                ProvisionStates::Booted(_) => return (history, Ok(())),
                ProvisionStates::Failed(sm) => {
                    let error = sm
                        .state
                        .error
                        .take()
                        .unwrap_or_else(|| Error::Critical(sm.state.reason.to_string()));
                    return (history, Err(error));
                }
                _ => {}
            }
            self.sm = self.sm.step(ctx);
            history.push(self.sm.state());
        }
    }
}

/// Factory function for the provisioning state machine. Every run starts
/// from `Idle`.
pub(crate) fn factory() -> Provisioner {
    Provisioner {
        sm: ProvisionStates::Idle(ProvisionSM::new()),
    }
}

// =============================================================================
// Private stuff
// =============================================================================

/// The raw state machine. The state is wrapped to keep the time it was
/// entered, for the logs.
#[derive(Debug)]
struct ProvisionSM<S> {
    entered: Instant,
    state: S,
}
impl<S: Runnable + fmt::Debug> ProvisionSM<S> {
    fn run(&mut self, ctx: &mut Context) -> Event {
        let event = self.state.run(ctx);
        debug!("{:?} done after {:?}", self.state, self.entered.elapsed());
        event
    }
}

/// The state machine starts in the `IdleState`.
impl ProvisionSM<IdleState> {
    fn new() -> Self {
        ProvisionSM {
            entered: Instant::now(),
            state: IdleState {},
        }
    }
}

/// An enum wrapper around the states of the provisioning state machine.
enum ProvisionStates {
    Idle(ProvisionSM<IdleState>),
    EnteringBootloader(ProvisionSM<EnteringBootloaderState>),
    Flashing(ProvisionSM<FlashingState>),
    AwaitingKernelBoot(ProvisionSM<AwaitingKernelBootState>),
    AwaitingUserspaceBoot(ProvisionSM<AwaitingUserspaceBootState>),
    PostBootCustomizing(ProvisionSM<PostBootCustomizingState>),
    Booted(ProvisionSM<BootedState>),
    Failed(ProvisionSM<FailedState>),
}
impl ProvisionStates {
    /// The unit of work in the event loop. It runs the current state and
    /// decides the next transition from the event it returns. Terminal states
    /// are never stepped.
    fn step(&mut self, ctx: &mut Context) -> Self {
        match self {
            ProvisionStates::Idle(sm) => {
                let event = sm.run(ctx);
                match event {
                    Event::EnterBootloader(ev) => ProvisionStates::EnteringBootloader(ev.into()),
                    Event::Booted(ev) => ProvisionStates::Booted(ev.into()),
                    _ => unreachable!("illegal event {:#?} at current state {:#?}", event, sm),
                }
            }
            ProvisionStates::EnteringBootloader(sm) => {
                let event = sm.run(ctx);
                match event {
                    Event::Flash(ev) => ProvisionStates::Flashing(ev.into()),
                    Event::Failed(ev) => ProvisionStates::Failed(ev.into()),
                    _ => unreachable!("illegal event {:#?} at current state {:#?}", event, sm),
                }
            }
            ProvisionStates::Flashing(sm) => {
                let event = sm.run(ctx);
                match event {
                    Event::AwaitKernelBoot(ev) => ProvisionStates::AwaitingKernelBoot(ev.into()),
                    Event::Booted(ev) => ProvisionStates::Booted(ev.into()),
                    Event::Failed(ev) => ProvisionStates::Failed(ev.into()),
                    _ => unreachable!("illegal event {:#?} at current state {:#?}", event, sm),
                }
            }
            ProvisionStates::AwaitingKernelBoot(sm) => {
                let event = sm.run(ctx);
                match event {
                    Event::AwaitUserspaceBoot(ev) => {
                        ProvisionStates::AwaitingUserspaceBoot(ev.into())
                    }
                    Event::Failed(ev) => ProvisionStates::Failed(ev.into()),
                    _ => unreachable!("illegal event {:#?} at current state {:#?}", event, sm),
                }
            }
            ProvisionStates::AwaitingUserspaceBoot(sm) => {
                let event = sm.run(ctx);
                match event {
                    Event::Customize(ev) => ProvisionStates::PostBootCustomizing(ev.into()),
                    Event::Failed(ev) => ProvisionStates::Failed(ev.into()),
                    _ => unreachable!("illegal event {:#?} at current state {:#?}", event, sm),
                }
            }
            ProvisionStates::PostBootCustomizing(sm) => {
                let event = sm.run(ctx);
                match event {
                    Event::Booted(ev) => ProvisionStates::Booted(ev.into()),
                    Event::Failed(ev) => ProvisionStates::Failed(ev.into()),
                    _ => unreachable!("illegal event {:#?} at current state {:#?}", event, sm),
                }
            }
            ProvisionStates::Booted(sm) => unreachable!("stepping terminal state {:#?}", sm),
            ProvisionStates::Failed(sm) => unreachable!("stepping terminal state {:#?}", sm),
        }
    }

    fn state(&self) -> ProvisioningState {
        match self {
            ProvisionStates::Idle(_) => ProvisioningState::Idle,
            ProvisionStates::EnteringBootloader(_) => ProvisioningState::EnteringBootloader,
            ProvisionStates::Flashing(_) => ProvisioningState::Flashing,
            ProvisionStates::AwaitingKernelBoot(_) => ProvisioningState::AwaitingKernelBoot,
            ProvisionStates::AwaitingUserspaceBoot(_) => ProvisioningState::AwaitingUserspaceBoot,
            ProvisionStates::PostBootCustomizing(_) => ProvisioningState::PostBootCustomizing,
            ProvisionStates::Booted(_) => ProvisioningState::Booted,
            ProvisionStates::Failed(sm) => ProvisioningState::Failed(sm.state.reason.clone()),
        }
    }
}

// -----------------------------------------------------------------------------
// State from Event transitions
// -----------------------------------------------------------------------------

impl From<EnterBootloaderEvent> for ProvisionSM<EnteringBootloaderState> {
    fn from(_: EnterBootloaderEvent) -> ProvisionSM<EnteringBootloaderState> {
        ProvisionSM {
            entered: Instant::now(),
            state: EnteringBootloaderState {},
        }
    }
}

impl From<FlashEvent> for ProvisionSM<FlashingState> {
    fn from(_: FlashEvent) -> ProvisionSM<FlashingState> {
        ProvisionSM {
            entered: Instant::now(),
            state: FlashingState {},
        }
    }
}

impl From<AwaitKernelBootEvent> for ProvisionSM<AwaitingKernelBootState> {
    fn from(_: AwaitKernelBootEvent) -> ProvisionSM<AwaitingKernelBootState> {
        ProvisionSM {
            entered: Instant::now(),
            state: AwaitingKernelBootState {},
        }
    }
}

impl From<AwaitUserspaceBootEvent> for ProvisionSM<AwaitingUserspaceBootState> {
    fn from(_: AwaitUserspaceBootEvent) -> ProvisionSM<AwaitingUserspaceBootState> {
        ProvisionSM {
            entered: Instant::now(),
            state: AwaitingUserspaceBootState {},
        }
    }
}

impl From<CustomizeEvent> for ProvisionSM<PostBootCustomizingState> {
    fn from(_: CustomizeEvent) -> ProvisionSM<PostBootCustomizingState> {
        ProvisionSM {
            entered: Instant::now(),
            state: PostBootCustomizingState {},
        }
    }
}

impl From<BootedEvent> for ProvisionSM<BootedState> {
    fn from(_: BootedEvent) -> ProvisionSM<BootedState> {
        ProvisionSM {
            entered: Instant::now(),
            state: BootedState {},
        }
    }
}

impl From<FailedEvent> for ProvisionSM<FailedState> {
    fn from(event: FailedEvent) -> ProvisionSM<FailedState> {
        ProvisionSM {
            entered: Instant::now(),
            state: FailedState {
                reason: event.reason,
                error: Some(event.error),
            },
        }
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
        results::Outcome,
        session::{ReplayScript, Sent},
        settings::SettingsBuilder,
    };

    const PROMPT: &str = "<< MStar >># ";

    /// A healthy MStar board: a shell on ctrl-C, a bootloader behind reboot,
    /// and a kernel behind every reset.
    fn healthy_mstar() -> ReplayScript {
        ReplayScript::new()
            .on(r"^\^C$", "shell@helios:/ $ ")
            .on("^reboot$", "U-Boot 2011.06 (Mar 01 2017 - 10:12:45)\r\n")
            .on(
                "^saveenv$",
                "Saving Environment to MMC...\r\nWriting to MMC(0)... done\r\n<< MStar >># ",
            )
            .on(
                "^reset$",
                "Hit any key to stop autoboot:  1 \r\n\
                 Starting kernel ...\r\n\
                 [    2.345] Freeing init memory: 256K\r\n",
            )
            .on("^mstar ", "Hit any key to stop autoboot:  1 \r\n")
            .on("^dumpsys", "mFocusedApp=AppWindowToken{com.helios.launcher/.Launcher}\r\nshell@helios:/ $ ")
            .on("^(setenv|cleanallenv|estart|dhcp|$)", PROMPT)
    }

    #[test]
    fn normal_boot_walks_every_state() {
        let config = SettingsBuilder::new()
            .macaddr("00:30:1B:BA:02:DB")
            .sn("HLS20170301A0001")
            .boot_cmds(
                "boot_cmds",
                "setenv bootargs console=ttyS0,115200\nmstar helios/20170301/images/auto_update.txt",
            )
            .finalize();
        let mut fixture = Fixture::new(config, healthy_mstar());
        let (history, result) = fixture.run(|ctx| factory().run(ctx));
        result.unwrap();
        assert_eq!(
            history,
            vec![
                ProvisioningState::Idle,
                ProvisioningState::EnteringBootloader,
                ProvisioningState::Flashing,
                ProvisioningState::AwaitingKernelBoot,
                ProvisioningState::AwaitingUserspaceBoot,
                ProvisioningState::PostBootCustomizing,
                ProvisioningState::Booted,
            ]
        );

        let results = &fixture.results;
        for id in [
            "enter_bootloader",
            "execute_boot_cmds",
            "wait_for_image_boot_msg",
            "wait_for_kernel_boot_msg",
        ] {
            assert_eq!(results.find(id).unwrap().result, Outcome::Pass, "{}", id);
        }
        assert!(results.find("skip_guide_whaley").is_none());
        assert!(fixture
            .console
            .log()
            .entries()
            .contains(&Sent::Line("echo ro.device.serialno=HLS20170301A0001 >> /factory/factory.prop".into())));
    }

    #[test]
    fn skipped_boot_never_touches_the_console() {
        let mut fixture = Fixture::new(SettingsBuilder::new().finalize(), ReplayScript::new());
        fixture.boot.skip = true;
        let (history, result) = fixture.run(|ctx| factory().run(ctx));
        result.unwrap();
        assert_eq!(history, vec![ProvisioningState::Idle, ProvisioningState::Booted]);
        assert!(fixture.console.log().is_empty());
        assert!(fixture.results.is_empty());
    }

    #[test]
    fn missing_reset_banner_fails_the_run() {
        let script = ReplayScript::new().on(r"^\^C$", "shell@helios:/ $ ");
        let mut fixture = Fixture::new(SettingsBuilder::new().finalize(), script);
        let (history, result) = fixture.run(|ctx| factory().run(ctx));
        assert!(result.unwrap_err().is_timeout());
        assert_eq!(
            history.last(),
            Some(&ProvisioningState::Failed(FailureReason::BootloaderTimeout))
        );
        assert_eq!(history.len(), 3);
        assert!(fixture
            .console
            .log()
            .lines()
            .contains(&"reboot".to_owned()));
    }

    #[test]
    fn failed_state_names_its_reason() {
        let state = ProvisioningState::Failed(FailureReason::BootCommand("dhcp".into()));
        assert_eq!(state.to_string(), "Failed (boot command `dhcp` failed)");
        assert!(state.is_terminal());
        assert!(!ProvisioningState::Flashing.is_terminal());
    }
}
