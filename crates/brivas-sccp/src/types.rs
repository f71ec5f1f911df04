//! Common types used across the SCCP engine

use serde::{Deserialize, Serialize};
use std::fmt;

/// Point Code (14-bit ITU carried in a u32)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PointCode(pub u32);

impl PointCode {
    /// Largest value representable in the 14-bit ITU format
    pub const ITU_MAX: u32 = 0x3FFF;

    /// Create ITU format point code (3-8-3)
    pub fn itu(zone: u8, network: u8, sp: u8) -> Self {
        let pc = ((zone as u32 & 0x07) << 11)
            | ((network as u32 & 0xFF) << 3)
            | (sp as u32 & 0x07);
        Self(pc)
    }

    /// Get raw value
    pub fn value(&self) -> u32 {
        self.0
    }
}

impl From<u32> for PointCode {
    fn from(v: u32) -> Self {
        Self(v)
    }
}

impl fmt::Display for PointCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Signalling Link Selection value
pub type Sls = u8;

/// Protocol Class for SCCP
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolClass {
    pub class: u8,
    pub return_on_error: bool,
}

impl ProtocolClass {
    pub const CLASS_0: Self = Self { class: 0, return_on_error: false };
    pub const CLASS_1: Self = Self { class: 1, return_on_error: false };
    pub const CLASS_2: Self = Self { class: 2, return_on_error: false };
    pub const CLASS_3: Self = Self { class: 3, return_on_error: false };

    pub fn with_return_on_error(mut self) -> Self {
        self.return_on_error = true;
        self
    }

    /// Classes 2 and 3 are connection-oriented
    pub fn is_connection_oriented(&self) -> bool {
        self.class >= 2
    }

    pub fn encode(&self) -> u8 {
        (self.class & 0x0F) | if self.return_on_error { 0x80 } else { 0 }
    }

    pub fn decode(v: u8) -> Self {
        Self {
            class: v & 0x0F,
            return_on_error: (v & 0x80) != 0,
        }
    }
}

/// Numbering Plan for Global Titles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum NumberingPlan {
    Unknown = 0,
    IsdnTelephony = 1,  // E.164
    Generic = 2,
    Data = 3,           // X.121
    Telex = 4,
    MaritimeMobile = 5,
    LandMobile = 6,
    IsdnMobile = 7,     // E.214
    PrivateNetwork = 14,
}

impl From<u8> for NumberingPlan {
    fn from(v: u8) -> Self {
        match v & 0x0F {
            1 => Self::IsdnTelephony,
            2 => Self::Generic,
            3 => Self::Data,
            4 => Self::Telex,
            5 => Self::MaritimeMobile,
            6 => Self::LandMobile,
            7 => Self::IsdnMobile,
            14 => Self::PrivateNetwork,
            _ => Self::Unknown,
        }
    }
}

/// Nature of Address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum NatureOfAddress {
    Unknown = 0,
    SubscriberNumber = 1,
    Reserved = 2,
    NationalSignificant = 3,
    International = 4,
}

impl From<u8> for NatureOfAddress {
    fn from(v: u8) -> Self {
        match v & 0x7F {
            1 => Self::SubscriberNumber,
            2 => Self::Reserved,
            3 => Self::NationalSignificant,
            4 => Self::International,
            _ => Self::Unknown,
        }
    }
}

/// Encoding Scheme for digits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum EncodingScheme {
    Unknown = 0,
    BcdOdd = 1,
    BcdEven = 2,
}

impl EncodingScheme {
    /// BCD scheme matching the parity of the digit count
    pub fn for_digits(digits: &str) -> Self {
        if digits.len() % 2 == 0 {
            Self::BcdEven
        } else {
            Self::BcdOdd
        }
    }
}

impl From<u8> for EncodingScheme {
    fn from(v: u8) -> Self {
        match v & 0x0F {
            1 => Self::BcdOdd,
            2 => Self::BcdEven,
            _ => Self::Unknown,
        }
    }
}

/// Segmentation optional parameter (Q.713 3.17)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segmentation {
    /// First segment indication
    pub first: bool,
    /// Class 1 (in-sequence delivery) requested
    pub class: u8,
    /// Number of segments still to follow this one
    pub remaining_segments: u8,
    /// Segmentation local reference (24 bits)
    pub reference: u32,
}

impl Segmentation {
    /// Encoded parameter length
    pub const LENGTH: usize = 4;

    pub fn encode(&self) -> [u8; Self::LENGTH] {
        let mut octet = self.remaining_segments & 0x0F;
        if self.first {
            octet |= 0x80;
        }
        if self.class == 1 {
            octet |= 0x40;
        }
        [
            octet,
            self.reference as u8,
            (self.reference >> 8) as u8,
            (self.reference >> 16) as u8,
        ]
    }

    pub fn decode(data: &[u8]) -> Option<Self> {
        if data.len() < Self::LENGTH {
            return None;
        }
        Some(Self {
            first: data[0] & 0x80 != 0,
            class: if data[0] & 0x40 != 0 { 1 } else { 0 },
            remaining_segments: data[0] & 0x0F,
            reference: data[1] as u32 | (data[2] as u32) << 8 | (data[3] as u32) << 16,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segmentation_octets() {
        let seg = Segmentation { first: true, class: 1, remaining_segments: 2, reference: 0x0A0B0C };
        let encoded = seg.encode();
        assert_eq!(encoded, [0xC2, 0x0C, 0x0B, 0x0A]);
        assert_eq!(Segmentation::decode(&encoded), Some(seg));
        assert_eq!(Segmentation::decode(&encoded[..2]), None);
    }

    #[test]
    fn test_protocol_class() {
        let class = ProtocolClass::CLASS_1.with_return_on_error();
        assert_eq!(class.encode(), 0x81);
        assert_eq!(ProtocolClass::decode(0x81), class);
        assert!(!class.is_connection_oriented());
        assert!(ProtocolClass::CLASS_2.is_connection_oriented());
    }
}
