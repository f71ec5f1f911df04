//! # Brivas SCCP Engine
//!
//! SCCP layer (ITU-T Q.711-Q.716) sitting between an MTP3 transfer service
//! and upper-layer users such as TCAP:
//!
//! - **GTT** - global title translation with primary/backup and load sharing
//! - **Routing** - local delivery, transit relay, return on error
//! - **Segmentation** - XUDT segmentation and timer-bounded reassembly
//! - **SCMG** - remote point code and subsystem availability, status tests
//!
//! The MTP3 transport is a collaborator: implement [`Mtp3Transport`] and feed
//! inbound traffic through the [`TransportHandle`] returned by
//! [`SccpStack::bind_transport`].
//!
//! ## Example
//! ```rust,ignore
//! use brivas_sccp::{SccpConfig, SccpStack, TranslationTable};
//!
//! let stack = SccpStack::new(SccpConfig::default(), TranslationTable::default())?;
//! stack.start()?;
//! let link = stack.bind_transport(1, transport, vec![])?;
//! stack.register_local_subsystem(ssn::MSC, user)?;
//! ```

pub mod config;
pub mod errors;
pub mod sccp;
pub mod telemetry;
pub mod timer;
pub mod transport;
pub mod types;

// Re-exports
pub use config::SccpConfig;
pub use errors::{LinkUnavailable, Result, ReturnCause, SccpError};
pub use types::*;

pub use sccp::{
    Concern, ConcernTable, DataIndication, GlobalTitle, LocalSubsystemState, NoticeIndication,
    RoutingOutcome, SccpAddress, SccpStack, SccpUser, SelectionMode, StateIndication,
    TranslationRule, TranslationTable,
};
pub use transport::{Mtp3Transport, TransportHandle};

/// Protocol version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Service Indicator for SCCP
pub const SI_SCCP: u8 = 3;

/// Subsystem Numbers
pub mod ssn {
    pub const SCMG: u8 = 1;
    pub const HLR: u8 = 6;
    pub const VLR: u8 = 7;
    pub const MSC: u8 = 8;
    pub const SMSC: u8 = 8;
    pub const GSMSCF: u8 = 147;
    pub const USSD: u8 = 147;
}
