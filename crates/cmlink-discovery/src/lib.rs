//! # cmlink Discovery
//!
//! CM server selection.
//!
//! [`SmartCmServerList`] keeps one entry per (endpoint, protocol) pair with a
//! health weighting, and hands out candidates by weighted random draw so that
//! healthy servers are preferred without starving recovering ones.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod clock;
pub mod server_list;

pub use clock::{Clock, ManualClock, SystemClock};
pub use server_list::{
    BAD_WEIGHTING, BASE_WEIGHTING, DEFAULT_VALIDITY, GOOD_WEIGHTING, ServerListConfig,
    ServerListError, ServerQuality, ServerRecord, SmartCmServerList,
};
