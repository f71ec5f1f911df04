//! SCCP (Signaling Connection Control Part)
//!
//! ITU-T Q.711-Q.716 connectionless service: global title translation,
//! routing, segmentation/reassembly and SCCP management.

pub mod address;
pub mod gtt;
pub mod management;
pub mod messages;
pub mod reassembly;
pub mod resource;
pub mod routing;
pub mod stack;
pub mod status;

pub use address::{GlobalTitle, RoutingIndicator, SccpAddress};
pub use gtt::{
    DestinationAvailability, ResolvedDestination, Router, SelectionMode, TranslationRule,
    TranslationTable,
};
pub use management::{ManagementStateMachine, ScmgMessage, ScmgType};
pub use messages::SccpMessage;
pub use reassembly::{Admission, ReassemblyCache, ReassemblyKey};
pub use resource::{
    Concern, ConcernTable, DataIndication, LocalSubsystemState, NoticeIndication, SccpUser,
    StateIndication, SubsystemResource,
};
pub use routing::{DiagnosticEvent, RoutingControl, RoutingOutcome, UnitdataRequest};
pub use stack::SccpStack;
pub use status::{SignalingPointState, SignalingPointStatus, SubsystemState, SubsystemStatus};

use crate::errors::SccpError;

/// SSN of SCCP management
pub const SCMG_SSN: u8 = 1;

/// SCCP Message Types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Cr = 0x01,       // Connection Request
    Cc = 0x02,       // Connection Confirm
    Cref = 0x03,     // Connection Refused
    Rlsd = 0x04,     // Released
    Rlc = 0x05,      // Release Complete
    Dt1 = 0x06,      // Data Form 1
    Dt2 = 0x07,      // Data Form 2
    Ak = 0x08,       // Data Acknowledgement
    Udt = 0x09,      // Unitdata
    Udts = 0x0A,     // Unitdata Service
    Ed = 0x0B,       // Expedited Data
    Ea = 0x0C,       // Expedited Data Acknowledgement
    Rsr = 0x0D,      // Reset Request
    Rsc = 0x0E,      // Reset Confirm
    Err = 0x0F,      // Protocol Error
    It = 0x10,       // Inactivity Test
    Xudt = 0x11,     // Extended Unitdata
    Xudts = 0x12,    // Extended Unitdata Service
    Ludt = 0x13,     // Long Unitdata
    Ludts = 0x14,    // Long Unitdata Service
}

impl TryFrom<u8> for MessageType {
    type Error = SccpError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        Ok(match v {
            0x01 => Self::Cr,
            0x02 => Self::Cc,
            0x03 => Self::Cref,
            0x04 => Self::Rlsd,
            0x05 => Self::Rlc,
            0x06 => Self::Dt1,
            0x07 => Self::Dt2,
            0x08 => Self::Ak,
            0x09 => Self::Udt,
            0x0A => Self::Udts,
            0x0B => Self::Ed,
            0x0C => Self::Ea,
            0x0D => Self::Rsr,
            0x0E => Self::Rsc,
            0x0F => Self::Err,
            0x10 => Self::It,
            0x11 => Self::Xudt,
            0x12 => Self::Xudts,
            0x13 => Self::Ludt,
            0x14 => Self::Ludts,
            _ => {
                return Err(SccpError::InvalidMessage(format!(
                    "Unknown message type: {:#04x}",
                    v
                )))
            }
        })
    }
}
