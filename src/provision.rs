//! Device provisioning: reset, flash, boot and customize a set-top box.
//!
//! **Example** - Importing the interfaces through provision:
//! ```ignore
//! use crate::provision::{self, Context};
//! ```
//!
//! **Example** - Running the state machine over a borrowed context:
//! ```ignore
//! let (history, result) = provision::factory().run(&mut ctx);
//! ```

mod context;
mod events;
mod state_machine;
mod states;

pub(crate) use context::Context;
#[cfg(test)]
pub(crate) use context::Fixture;
pub use state_machine::{FailureReason, ProvisioningState};
pub(crate) use state_machine::factory;
