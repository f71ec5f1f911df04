//! SCCP Addressing (Q.713 3.4)

use crate::errors::SccpError;
use crate::types::{EncodingScheme, NatureOfAddress, NumberingPlan, PointCode};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Routing indicator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoutingIndicator {
    /// Route on Global Title
    RouteOnGt,
    /// Route on DPC + SSN
    RouteOnSsn,
}

/// SCCP Address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SccpAddress {
    pub routing_indicator: RoutingIndicator,
    /// Global Title (optional)
    pub global_title: Option<GlobalTitle>,
    /// Point Code (optional)
    pub point_code: Option<PointCode>,
    /// Subsystem Number (optional)
    pub subsystem_number: Option<u8>,
}

/// Address Indicator octet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressIndicator {
    pub routing_indicator: RoutingIndicator,
    /// Global Title Indicator (0-4)
    pub gti: u8,
    pub ssn_indicator: bool,
    pub pc_indicator: bool,
}

impl AddressIndicator {
    pub fn encode(&self) -> u8 {
        let mut ai = 0u8;
        if self.routing_indicator == RoutingIndicator::RouteOnSsn {
            ai |= 0x40;
        }
        ai |= (self.gti & 0x0F) << 2;
        if self.ssn_indicator {
            ai |= 0x02;
        }
        if self.pc_indicator {
            ai |= 0x01;
        }
        ai
    }

    pub fn decode(v: u8) -> Self {
        Self {
            routing_indicator: if v & 0x40 != 0 {
                RoutingIndicator::RouteOnSsn
            } else {
                RoutingIndicator::RouteOnGt
            },
            gti: (v >> 2) & 0x0F,
            ssn_indicator: (v & 0x02) != 0,
            pc_indicator: (v & 0x01) != 0,
        }
    }
}

/// Global Title
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GlobalTitle {
    /// GTI = 0001: Nature of Address only
    Gt0001 {
        nature_of_address: NatureOfAddress,
        digits: String,
    },
    /// GTI = 0010: Translation Type only
    Gt0010 {
        translation_type: u8,
        digits: String,
    },
    /// GTI = 0011: Translation Type + Numbering Plan + Encoding
    Gt0011 {
        translation_type: u8,
        numbering_plan: NumberingPlan,
        digits: String,
    },
    /// GTI = 0100: Full (most common for ITU)
    Gt0100 {
        translation_type: u8,
        numbering_plan: NumberingPlan,
        nature_of_address: NatureOfAddress,
        digits: String,
    },
}

impl GlobalTitle {
    /// Create E.164 Global Title (most common)
    pub fn e164(digits: &str) -> Self {
        Self::Gt0100 {
            translation_type: 0,
            numbering_plan: NumberingPlan::IsdnTelephony,
            nature_of_address: NatureOfAddress::International,
            digits: digits.to_string(),
        }
    }

    /// Get GTI value
    pub fn gti(&self) -> u8 {
        match self {
            Self::Gt0001 { .. } => 1,
            Self::Gt0010 { .. } => 2,
            Self::Gt0011 { .. } => 3,
            Self::Gt0100 { .. } => 4,
        }
    }

    /// Get digits
    pub fn digits(&self) -> &str {
        match self {
            Self::Gt0001 { digits, .. }
            | Self::Gt0010 { digits, .. }
            | Self::Gt0011 { digits, .. }
            | Self::Gt0100 { digits, .. } => digits,
        }
    }

    /// Translation type; GTI 1 carries none and translates as type 0
    pub fn translation_type(&self) -> u8 {
        match self {
            Self::Gt0001 { .. } => 0,
            Self::Gt0010 { translation_type, .. }
            | Self::Gt0011 { translation_type, .. }
            | Self::Gt0100 { translation_type, .. } => *translation_type,
        }
    }

    pub fn numbering_plan(&self) -> Option<NumberingPlan> {
        match self {
            Self::Gt0011 { numbering_plan, .. } | Self::Gt0100 { numbering_plan, .. } => {
                Some(*numbering_plan)
            }
            _ => None,
        }
    }

    pub fn nature_of_address(&self) -> Option<NatureOfAddress> {
        match self {
            Self::Gt0001 { nature_of_address, .. } | Self::Gt0100 { nature_of_address, .. } => {
                Some(*nature_of_address)
            }
            _ => None,
        }
    }

    /// Encode to bytes
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        let digits = self.digits();
        let scheme = EncodingScheme::for_digits(digits);

        match self {
            Self::Gt0001 { nature_of_address, .. } => {
                let odd = if scheme == EncodingScheme::BcdOdd { 0x80 } else { 0 };
                buf.put_u8(odd | (*nature_of_address as u8 & 0x7F));
            }
            Self::Gt0010 { translation_type, .. } => {
                buf.put_u8(*translation_type);
            }
            Self::Gt0011 { translation_type, numbering_plan, .. } => {
                buf.put_u8(*translation_type);
                buf.put_u8((scheme as u8 & 0x0F) | ((*numbering_plan as u8 & 0x0F) << 4));
            }
            Self::Gt0100 { translation_type, numbering_plan, nature_of_address, .. } => {
                buf.put_u8(*translation_type);
                buf.put_u8((scheme as u8 & 0x0F) | ((*numbering_plan as u8 & 0x0F) << 4));
                buf.put_u8(*nature_of_address as u8 & 0x7F);
            }
        }
        buf.put_slice(&encode_bcd_digits(digits));

        buf
    }

    /// Decode from bytes
    pub fn decode(gti: u8, mut data: Bytes) -> Result<Self, SccpError> {
        let short = || SccpError::InvalidAddress(format!("global title {} truncated", gti));
        match gti {
            1 => {
                if data.remaining() < 1 {
                    return Err(short());
                }
                let noa = data.get_u8();
                let odd = noa & 0x80 != 0;
                Ok(Self::Gt0001 {
                    nature_of_address: NatureOfAddress::from(noa),
                    digits: decode_bcd_digits(&data, odd),
                })
            }
            2 => {
                if data.remaining() < 1 {
                    return Err(short());
                }
                let tt = data.get_u8();
                // No encoding scheme: trailing filler nibble marks odd length
                Ok(Self::Gt0010 {
                    translation_type: tt,
                    digits: decode_bcd_digits(&data, ends_with_filler(&data)),
                })
            }
            3 => {
                if data.remaining() < 2 {
                    return Err(short());
                }
                let tt = data.get_u8();
                let np_es = data.get_u8();
                let odd = EncodingScheme::from(np_es) == EncodingScheme::BcdOdd;
                Ok(Self::Gt0011 {
                    translation_type: tt,
                    numbering_plan: NumberingPlan::from(np_es >> 4),
                    digits: decode_bcd_digits(&data, odd),
                })
            }
            4 => {
                if data.remaining() < 3 {
                    return Err(short());
                }
                let tt = data.get_u8();
                let np_es = data.get_u8();
                let noa = data.get_u8();
                let odd = EncodingScheme::from(np_es) == EncodingScheme::BcdOdd;
                Ok(Self::Gt0100 {
                    translation_type: tt,
                    numbering_plan: NumberingPlan::from(np_es >> 4),
                    nature_of_address: NatureOfAddress::from(noa),
                    digits: decode_bcd_digits(&data, odd),
                })
            }
            other => Err(SccpError::InvalidAddress(format!("unsupported GTI {}", other))),
        }
    }
}

impl SccpAddress {
    /// Create address with SSN and PC
    pub fn from_ssn_pc(ssn: u8, pc: PointCode) -> Self {
        Self {
            routing_indicator: RoutingIndicator::RouteOnSsn,
            global_title: None,
            point_code: Some(pc),
            subsystem_number: Some(ssn),
        }
    }

    /// Create address with Global Title
    pub fn from_gt(gt: GlobalTitle, ssn: Option<u8>) -> Self {
        Self {
            routing_indicator: RoutingIndicator::RouteOnGt,
            global_title: Some(gt),
            point_code: None,
            subsystem_number: ssn,
        }
    }

    pub fn is_route_on_gt(&self) -> bool {
        self.routing_indicator == RoutingIndicator::RouteOnGt
    }

    /// Check that the address can be routed
    pub fn validate(&self) -> Result<(), SccpError> {
        let has_pc_ssn = self.point_code.is_some() && self.subsystem_number.is_some();
        if !has_pc_ssn && self.global_title.is_none() {
            return Err(SccpError::InvalidAddress(
                "address needs a global title or a point code and SSN".to_string(),
            ));
        }
        match self.routing_indicator {
            RoutingIndicator::RouteOnGt if self.global_title.is_none() => Err(
                SccpError::InvalidAddress("route on GT without a global title".to_string()),
            ),
            RoutingIndicator::RouteOnSsn if self.subsystem_number.is_none() => Err(
                SccpError::InvalidAddress("route on SSN without a subsystem number".to_string()),
            ),
            _ => Ok(()),
        }
    }

    fn indicator(&self) -> AddressIndicator {
        AddressIndicator {
            routing_indicator: self.routing_indicator,
            gti: self.global_title.as_ref().map(GlobalTitle::gti).unwrap_or(0),
            ssn_indicator: self.subsystem_number.is_some(),
            pc_indicator: self.point_code.is_some(),
        }
    }

    /// Encode to bytes
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_u8(self.indicator().encode());

        if let Some(pc) = self.point_code {
            // ITU format: 14-bit PC in 2 bytes
            buf.put_u16_le((pc.value() & PointCode::ITU_MAX) as u16);
        }
        if let Some(ssn) = self.subsystem_number {
            buf.put_u8(ssn);
        }
        if let Some(ref gt) = self.global_title {
            buf.put_slice(&gt.encode());
        }

        buf
    }

    /// Decode from bytes
    pub fn decode(mut data: Bytes) -> Result<Self, SccpError> {
        if data.remaining() < 1 {
            return Err(SccpError::InvalidAddress("empty address".to_string()));
        }

        let ai = AddressIndicator::decode(data.get_u8());

        let point_code = if ai.pc_indicator {
            if data.remaining() < 2 {
                return Err(SccpError::InvalidAddress("point code truncated".to_string()));
            }
            Some(PointCode((data.get_u16_le() as u32) & PointCode::ITU_MAX))
        } else {
            None
        };

        let subsystem_number = if ai.ssn_indicator {
            if data.remaining() < 1 {
                return Err(SccpError::InvalidAddress("SSN truncated".to_string()));
            }
            Some(data.get_u8())
        } else {
            None
        };

        let global_title = if ai.gti > 0 {
            Some(GlobalTitle::decode(ai.gti, data)?)
        } else {
            None
        };

        Ok(Self {
            routing_indicator: ai.routing_indicator,
            global_title,
            point_code,
            subsystem_number,
        })
    }
}

/// Encode digits to BCD, filler 0xF in the last high nibble for odd counts
fn encode_bcd_digits(digits: &str) -> Vec<u8> {
    let nibbles: Vec<u8> = digits
        .chars()
        .filter_map(|c| c.to_digit(16).map(|d| d as u8))
        .collect();

    nibbles
        .chunks(2)
        .map(|chunk| match chunk {
            [low, high] => low | (high << 4),
            [low] => low | 0xF0,
            _ => 0,
        })
        .collect()
}

/// Decode BCD digits; `odd` drops the high nibble of the last octet
fn decode_bcd_digits(data: &Bytes, odd: bool) -> String {
    const DIGITS: &[u8; 16] = b"0123456789ABCDEF";
    let mut result = String::with_capacity(data.len() * 2);
    let last = data.len().saturating_sub(1);

    for (i, &byte) in data.iter().enumerate() {
        result.push(DIGITS[(byte & 0x0F) as usize] as char);
        if !(odd && i == last) {
            result.push(DIGITS[(byte >> 4) as usize] as char);
        }
    }

    result
}

fn ends_with_filler(data: &Bytes) -> bool {
    data.last().map(|b| b >> 4 == 0x0F).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gt_address_wire_format() {
        let addr = SccpAddress::from_gt(GlobalTitle::e164("18005551234"), Some(8));
        let encoded = addr.encode();
        // RI=GT, GTI=4, SSN present, no PC
        assert_eq!(encoded[0], 0x12);
        assert_eq!(encoded[1], 8);
        assert_eq!(encoded[2], 0); // translation type
        assert_eq!(encoded[3], 0x11); // E.164, BCD odd
        assert_eq!(encoded[4], 0x04); // international
        assert_eq!(&encoded[5..], &[0x81, 0x00, 0x55, 0x15, 0x32, 0xF4]);

        let decoded = SccpAddress::decode(encoded.freeze()).unwrap();
        assert_eq!(decoded, addr);
        assert_eq!(decoded.global_title.unwrap().digits(), "18005551234");
    }

    #[test]
    fn test_pc_ssn_address_wire_format() {
        let addr = SccpAddress::from_ssn_pc(6, PointCode(0x1234));
        let encoded = addr.encode();
        assert_eq!(&encoded[..], &[0x43, 0x34, 0x12, 0x06]);
        assert_eq!(SccpAddress::decode(encoded.freeze()).unwrap(), addr);
    }

    #[test]
    fn test_gti2_even_digits() {
        let gt = GlobalTitle::Gt0010 { translation_type: 9, digits: "2348".to_string() };
        let decoded = GlobalTitle::decode(2, gt.encode().freeze()).unwrap();
        assert_eq!(decoded, gt);
    }

    #[test]
    fn test_truncated_address_is_rejected() {
        assert!(SccpAddress::decode(Bytes::from_static(&[0x43, 0x34])).is_err());
        assert!(SccpAddress::decode(Bytes::from_static(&[0x12])).is_err());
        assert!(SccpAddress::decode(Bytes::new()).is_err());
    }

    #[test]
    fn test_validate() {
        assert!(SccpAddress::from_ssn_pc(8, PointCode(5)).validate().is_ok());
        assert!(SccpAddress::from_gt(GlobalTitle::e164("1800"), None).validate().is_ok());

        let no_ssn = SccpAddress {
            routing_indicator: RoutingIndicator::RouteOnSsn,
            global_title: Some(GlobalTitle::e164("1800")),
            point_code: Some(PointCode(5)),
            subsystem_number: None,
        };
        assert!(no_ssn.validate().is_err());

        let empty = SccpAddress {
            routing_indicator: RoutingIndicator::RouteOnGt,
            global_title: None,
            point_code: Some(PointCode(5)),
            subsystem_number: None,
        };
        assert!(empty.validate().is_err());
    }
}
