#![cfg_attr(all(not(debug_assertions), not(test)), deny(warnings))]
#![cfg_attr(
    all(not(debug_assertions), not(test)),
    deny(clippy::all, clippy::pedantic, clippy::nursery)
)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]
#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]
//! Control plane for a multi-bay automatic material system.
//!
//! All hardware access goes through `oams_traits::FeederPort`; all print
//! controller access through `oams_traits::Host`. The crate is a set of
//! cooperatively scheduled state machines driven by a 250 ms tick:
//!
//! - **Feeder driver** ([`feeder`]): per-MCU sensor snapshot, encoder
//!   accumulation, command transport, fault latch.
//! - **Operations** ([`op`]): load/unload with encoder-motion watchdog and
//!   exponential retry.
//! - **FPS tracker** ([`fps`]): per-extruder load state and follower mode.
//! - **Lane groups** ([`group`]): interchangeable (feeder, bay) sets.
//! - **Runout monitor** ([`runout`]): detect → coast → reload → pause.
//! - **Clog detector** ([`clog`]): extruder-vs-encoder flow comparison.
//! - **Coordinator** ([`coordinator`]): owns everything, routes events,
//!   exposes the command surface ([`command`]).

pub mod clog;
pub mod command;
pub mod coordinator;
pub mod error;
pub mod feeder;
pub mod fps;
pub mod group;
pub mod mocks;
pub mod op;
pub mod runout;

pub use clog::{ClogDetector, ClogSensitivity};
pub use command::{CommandReply, GcodeCommand};
pub use coordinator::{
    Coordinator, CoordinatorBuilder, ManagerCfg, StatusReport, TICK_MS, Ticket, TicketState,
    tick_period,
};
pub use error::{AmsError, BuildError, FailReason};
pub use feeder::{Feeder, FeederCfg, FeederState};
pub use fps::{Binding, FpsCfg, FpsTracker, LoadState};
pub use group::LaneGroup;
pub use op::{OpDriver, OpKind, OpProgress, backoff_delay_ms};
pub use runout::{RunoutCfg, RunoutMonitor, RunoutState};
