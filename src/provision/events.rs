//! Events for the provisioning state machine.
//!
//! This modules is private and restricted to the
//! [`provision`](crate::provision) scope.
//!
//! ```ignore
//! use super::events::*;
//! ```
//!
//! Refer to the [`state_machine`](super::state_machine) module for an overview
//! of states, events and transitions.

use super::state_machine::FailureReason;
use crate::error::Error;

// =============================================================================
// Crate-Public Interface
// =============================================================================

// EnterBootloaderEvent ========================================================

/// Event fired to trigger a transition to
/// [`EnteringBootloaderState`](super::states::EnteringBootloaderState).
///
/// Fired by the idle state when the boot is not skipped.
#[derive(Debug)]
pub(crate) struct EnterBootloaderEvent;

// FlashEvent ==================================================================

/// Event fired once the device sits at the bootloader prompt with its MAC
/// address set.
#[derive(Debug)]
pub(crate) struct FlashEvent;

// AwaitKernelBootEvent ========================================================

/// Event fired after a normal-mode flash, when the device has been reset into
/// the new image.
#[derive(Debug)]
pub(crate) struct AwaitKernelBootEvent;

// AwaitUserspaceBootEvent =====================================================

/// Event fired when the kernel reached its boot marker, or right away on
/// consoles that never show kernel messages.
#[derive(Debug)]
pub(crate) struct AwaitUserspaceBootEvent;

// CustomizeEvent ==============================================================

#[derive(Debug)]
pub(crate) struct CustomizeEvent;

// BootedEvent =================================================================

/// Event fired when the device is ready for tests. It can happen:
///
///  1. from the idle state when the boot is skipped,
///  2. at the end of an EMMC flash, which leaves the device dumping its
///     storage rather than booting,
///  3. after the post-boot customizations.
#[derive(Debug)]
pub(crate) struct BootedEvent;

// FailedEvent =================================================================

/// Event fired by any state hitting an error it cannot recover from. The
/// error is kept so it reaches the caller unchanged.
#[derive(Debug)]
pub(crate) struct FailedEvent {
    pub reason: FailureReason,
    pub error: Error,
}

// Events enum =================================================================

/// Events that can be triggered within the provisioning state machine.
#[derive(Debug)]
pub(crate) enum Event {
    EnterBootloader(EnterBootloaderEvent),
    Flash(FlashEvent),
    AwaitKernelBoot(AwaitKernelBootEvent),
    AwaitUserspaceBoot(AwaitUserspaceBootEvent),
    Customize(CustomizeEvent),
    Booted(BootedEvent),
    Failed(FailedEvent),
}
