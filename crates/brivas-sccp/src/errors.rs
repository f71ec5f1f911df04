//! Error types for the SCCP engine

use crate::types::PointCode;
use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, SccpError>;

/// SCCP layer errors
///
/// Routing and reassembly failures are always recoverable: they are reported
/// to the caller (and, where the protocol asks for it, to the originator) and
/// never stop the engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SccpError {
    // Routing
    #[error("No translation rule matches the called party address")]
    NoRouteFound,

    #[error("All candidate destinations are prohibited")]
    AllRoutesProhibited,

    #[error("Route to destination prohibited")]
    RouteProhibited,

    #[error("Subsystem not available: SSN {ssn} at PC {point_code}")]
    SubsystemNotAvailable { point_code: PointCode, ssn: u8 },

    #[error("Subsystem congested: SSN {0}")]
    SubsystemCongested(u8),

    #[error("Hop counter violation")]
    HopCounterViolation,

    // Reassembly
    #[error("Segmentation mismatch: {0}")]
    SegmentationMismatch(String),

    #[error("Reassembly cache full ({0} entries in progress)")]
    ReassemblyCacheFull(usize),

    #[error("Reassembly timed out")]
    ReassemblyTimeout,

    // Local registration
    #[error("Subsystem {0} already registered")]
    AlreadyRegistered(u8),

    #[error("Subsystem {0} not registered")]
    NotFound(u8),

    // Transport bindings
    #[error("Transport binding {0} already bound")]
    BindingExists(u32),

    #[error("Transport binding {0} not found")]
    BindingNotFound(u32),

    // Input
    #[error("Address error: {0}")]
    InvalidAddress(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    // Lifecycle
    #[error("SCCP stack is not running")]
    StackNotRunning,

    #[error("Configuration error: {0}")]
    Config(String),
}

impl SccpError {
    /// Q.713 return cause carried in UDTS/XUDTS for an undeliverable message
    pub fn return_cause(&self) -> ReturnCause {
        match self {
            Self::NoRouteFound => ReturnCause::NoTranslationForAddress,
            Self::AllRoutesProhibited | Self::RouteProhibited => ReturnCause::MtpFailure,
            Self::SubsystemNotAvailable { .. } => ReturnCause::SubsystemFailure,
            Self::SubsystemCongested(_) => ReturnCause::SubsystemCongestion,
            Self::HopCounterViolation => ReturnCause::HopCounterViolation,
            Self::SegmentationMismatch(_) | Self::ReassemblyCacheFull(_) => {
                ReturnCause::SegmentationFailure
            }
            Self::ReassemblyTimeout => ReturnCause::ErrorInReassembly,
            _ => ReturnCause::Unqualified,
        }
    }
}

/// Return cause (Q.713 3.12)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReturnCause {
    NoTranslationForNatureOfAddress = 0x00,
    NoTranslationForAddress = 0x01,
    SubsystemCongestion = 0x02,
    SubsystemFailure = 0x03,
    UnequippedUser = 0x04,
    MtpFailure = 0x05,
    NetworkCongestion = 0x06,
    Unqualified = 0x07,
    ErrorInMessageTransport = 0x08,
    ErrorInLocalProcessing = 0x09,
    DestinationCannotReassemble = 0x0A,
    SccpFailure = 0x0B,
    HopCounterViolation = 0x0C,
    SegmentationNotSupported = 0x0D,
    SegmentationFailure = 0x0E,
    ErrorInReassembly = 0x0F,
}

impl From<u8> for ReturnCause {
    fn from(v: u8) -> Self {
        match v {
            0x00 => Self::NoTranslationForNatureOfAddress,
            0x01 => Self::NoTranslationForAddress,
            0x02 => Self::SubsystemCongestion,
            0x03 => Self::SubsystemFailure,
            0x04 => Self::UnequippedUser,
            0x05 => Self::MtpFailure,
            0x06 => Self::NetworkCongestion,
            0x08 => Self::ErrorInMessageTransport,
            0x09 => Self::ErrorInLocalProcessing,
            0x0A => Self::DestinationCannotReassemble,
            0x0B => Self::SccpFailure,
            0x0C => Self::HopCounterViolation,
            0x0D => Self::SegmentationNotSupported,
            0x0E => Self::SegmentationFailure,
            0x0F => Self::ErrorInReassembly,
            _ => Self::Unqualified,
        }
    }
}

/// Transport-level send failure reported by the MTP3 collaborator
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Link unavailable towards PC {point_code}")]
pub struct LinkUnavailable {
    pub point_code: PointCode,
}
