//! Bootlab dispatches test jobs to lab set-top boxes. Given a device
//! configuration and an image, it takes the device through its bootloader
//! over the serial or telnet console, flashes the image and the factory data,
//! follows the kernel boot, and customizes the booted Android so tests can
//! run on it.
//!
//! Two device families are supported, MStar (including its 938 variant) and
//! HiSilicon. They share the overall flow and differ in how the bootloader is
//! driven, which lives behind the family capability interface.
//!
//! Provisioning is implemented as a state machine, in terms of **states** and
//! **transitions** between them with the following characteristics:
//!
//! * Can only be in one state at any time.
//! * Each state can have its own associated data if needed.
//! * Transitions between states are triggered via typed **events** and follow
//!   defined semantics.
//! * Only explicitly defined transitions should be permitted and as many errors
//!   should be detected at **compile-time**.
//! * Transitioning from one state to another consumes the original state and
//!   renders it unusable.
//! * Data can be transferred from one state to the next by attaching it to the
//!   transition event, as a failure carries its reason and error.
//!
//! The implementation of state transitions leverages `rust`'s `From` and `Into`
//! pattern. Only transitions for which the `From` trait is implemented are
//! authorized and any other transition would be detected at compile-time as an
//! error.
//!
//! **Example** - Booting a device from its configuration file:
//! ```ignore
//! use bootlab::{BootRequest, DeployRequest, DeviceConfig, Target};
//!
//! let mut target = Target::new(DeviceConfig::load("lab/stb-17.toml")?)?;
//! target.deploy_and_boot(
//!     DeployRequest::new("helios/20170301/images/mstar.img", "172.16.117.9"),
//!     BootRequest::default(),
//! )?;
//! println!("{}", target.results().to_json()?);
//! ```

mod boot_cmds;
mod bootloader;
mod customize;
mod error;
mod factory;
mod family;
mod power;
mod provision;
mod results;
mod session;
mod settings;
mod shell;
mod target;
mod transfer;
mod utils;

pub use boot_cmds::{BootCommandSequence, BootTagMap, KernelFormat};
pub use error::{Error, Result};
pub use factory::{FactoryImage, FactoryParams, NoFactoryImage, ScriptFactoryImage};
pub use power::{CommandPower, NoPower, PowerControl};
pub use provision::{FailureReason, ProvisioningState};
pub use results::{Outcome, ResultLog, TestResult};
pub use session::{
    ConfigConnector, Connector, Console, Match, ReplayConnector, ReplayConsole, ReplayLog, ReplayRule,
    ReplayScript, Sent,
};
pub use settings::{
    Connection, DeviceConfig, FactorySettings, Family, SerialLine, SettingsBuilder,
};
pub use target::{BootRequest, DeployRequest, Target};
pub use transfer::{HttpTransfer, ServedFile, Transfer};
