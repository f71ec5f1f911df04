//! SCCP Message Types (Q.713 4.10-4.19, connectionless subset)

use super::address::SccpAddress;
use super::MessageType;
use crate::errors::{ReturnCause, SccpError};
use crate::types::{ProtocolClass, Segmentation};
use bytes::{BufMut, Bytes, BytesMut};

/// Optional parameter names
const PARAM_END_OF_OPTIONAL: u8 = 0x00;
const PARAM_SEGMENTATION: u8 = 0x10;
const PARAM_IMPORTANCE: u8 = 0x12;

/// Largest data parameter a single message can carry
pub const MAX_DATA_LENGTH: usize = 255;

/// SCCP Message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SccpMessage {
    /// Unitdata
    Udt {
        protocol_class: ProtocolClass,
        called_party: SccpAddress,
        calling_party: SccpAddress,
        data: Bytes,
    },
    /// Extended Unitdata
    Xudt {
        protocol_class: ProtocolClass,
        hop_counter: u8,
        called_party: SccpAddress,
        calling_party: SccpAddress,
        data: Bytes,
        segmentation: Option<Segmentation>,
        importance: Option<u8>,
    },
    /// Unitdata Service
    Udts {
        return_cause: ReturnCause,
        called_party: SccpAddress,
        calling_party: SccpAddress,
        data: Bytes,
    },
    /// Extended Unitdata Service
    Xudts {
        return_cause: ReturnCause,
        hop_counter: u8,
        called_party: SccpAddress,
        calling_party: SccpAddress,
        data: Bytes,
        segmentation: Option<Segmentation>,
        importance: Option<u8>,
    },
}

impl SccpMessage {
    /// Get message type
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Udt { .. } => MessageType::Udt,
            Self::Xudt { .. } => MessageType::Xudt,
            Self::Udts { .. } => MessageType::Udts,
            Self::Xudts { .. } => MessageType::Xudts,
        }
    }

    pub fn called_party(&self) -> &SccpAddress {
        match self {
            Self::Udt { called_party, .. }
            | Self::Xudt { called_party, .. }
            | Self::Udts { called_party, .. }
            | Self::Xudts { called_party, .. } => called_party,
        }
    }

    pub fn calling_party(&self) -> &SccpAddress {
        match self {
            Self::Udt { calling_party, .. }
            | Self::Xudt { calling_party, .. }
            | Self::Udts { calling_party, .. }
            | Self::Xudts { calling_party, .. } => calling_party,
        }
    }

    pub fn data(&self) -> &Bytes {
        match self {
            Self::Udt { data, .. }
            | Self::Xudt { data, .. }
            | Self::Udts { data, .. }
            | Self::Xudts { data, .. } => data,
        }
    }

    pub fn segmentation(&self) -> Option<&Segmentation> {
        match self {
            Self::Xudt { segmentation, .. } | Self::Xudts { segmentation, .. } => {
                segmentation.as_ref()
            }
            _ => None,
        }
    }

    /// True for UDTS/XUDTS
    pub fn is_service(&self) -> bool {
        matches!(self, Self::Udts { .. } | Self::Xudts { .. })
    }

    /// Protocol class of UDT/XUDT
    pub fn protocol_class(&self) -> Option<ProtocolClass> {
        match self {
            Self::Udt { protocol_class, .. } | Self::Xudt { protocol_class, .. } => {
                Some(*protocol_class)
            }
            _ => None,
        }
    }

    pub fn hop_counter(&self) -> Option<u8> {
        match self {
            Self::Xudt { hop_counter, .. } | Self::Xudts { hop_counter, .. } => Some(*hop_counter),
            _ => None,
        }
    }

    /// Same message addressed to `address`
    pub fn with_called_party(mut self, address: SccpAddress) -> Self {
        match &mut self {
            Self::Udt { called_party, .. }
            | Self::Xudt { called_party, .. }
            | Self::Udts { called_party, .. }
            | Self::Xudts { called_party, .. } => *called_party = address,
        }
        self
    }

    /// Decrement the hop counter of a relayed XUDT/XUDTS
    pub fn decrement_hop_counter(mut self) -> Result<Self, SccpError> {
        match &mut self {
            Self::Xudt { hop_counter, .. } | Self::Xudts { hop_counter, .. } => {
                if *hop_counter <= 1 {
                    return Err(SccpError::HopCounterViolation);
                }
                *hop_counter -= 1;
            }
            Self::Udt { .. } | Self::Udts { .. } => {}
        }
        Ok(self)
    }

    /// The complete message rebuilt from this segment and the reassembled
    /// user data
    pub fn reassembled(mut self, payload: Bytes) -> Self {
        if let Self::Xudt { data, segmentation, .. } = &mut self {
            *data = payload;
            *segmentation = None;
        }
        self
    }

    /// UDTS/XUDTS returning this message to its originator, or `None` when
    /// it must be discarded silently
    pub fn service_response(&self, return_cause: ReturnCause, hop_counter: u8) -> Option<Self> {
        match self {
            Self::Udt { protocol_class, called_party, calling_party, data }
                if wants_return(protocol_class) =>
            {
                Some(Self::Udts {
                    return_cause,
                    called_party: calling_party.clone(),
                    calling_party: called_party.clone(),
                    data: data.clone(),
                })
            }
            Self::Xudt {
                protocol_class,
                called_party,
                calling_party,
                data,
                segmentation,
                importance,
                ..
            } if wants_return(protocol_class) => Some(Self::Xudts {
                return_cause,
                hop_counter,
                called_party: calling_party.clone(),
                calling_party: called_party.clone(),
                data: data.slice(..data.len().min(MAX_DATA_LENGTH)),
                segmentation: *segmentation,
                importance: *importance,
            }),
            _ => None,
        }
    }

    /// Encode to bytes
    pub fn encode(&self) -> Result<BytesMut, SccpError> {
        let mut buf = BytesMut::with_capacity(256);
        buf.put_u8(self.message_type() as u8);

        match self {
            Self::Udt { protocol_class, called_party, calling_party, data } => {
                buf.put_u8(protocol_class.encode());
                put_variable_part(
                    &mut buf,
                    &[&called_party.encode()[..], &calling_party.encode()[..], &data[..]],
                    None,
                )?;
            }
            Self::Udts { return_cause, called_party, calling_party, data } => {
                buf.put_u8(*return_cause as u8);
                put_variable_part(
                    &mut buf,
                    &[&called_party.encode()[..], &calling_party.encode()[..], &data[..]],
                    None,
                )?;
            }
            Self::Xudt {
                protocol_class,
                hop_counter,
                called_party,
                calling_party,
                data,
                segmentation,
                importance,
            } => {
                buf.put_u8(protocol_class.encode());
                buf.put_u8(*hop_counter);
                let optional = encode_optional(segmentation, importance);
                put_variable_part(
                    &mut buf,
                    &[&called_party.encode()[..], &calling_party.encode()[..], &data[..]],
                    Some(&optional),
                )?;
            }
            Self::Xudts {
                return_cause,
                hop_counter,
                called_party,
                calling_party,
                data,
                segmentation,
                importance,
            } => {
                buf.put_u8(*return_cause as u8);
                buf.put_u8(*hop_counter);
                let optional = encode_optional(segmentation, importance);
                put_variable_part(
                    &mut buf,
                    &[&called_party.encode()[..], &calling_party.encode()[..], &data[..]],
                    Some(&optional),
                )?;
            }
        }

        Ok(buf)
    }

    /// Decode from bytes
    pub fn decode(data: &Bytes) -> Result<Self, SccpError> {
        let msg_type = *data
            .first()
            .ok_or_else(|| SccpError::InvalidMessage("Empty message".to_string()))?;

        match MessageType::try_from(msg_type)? {
            MessageType::Udt => {
                let protocol_class = ProtocolClass::decode(byte_at(data, 1)?);
                let [called, calling, user_data] = read_mandatory::<3>(data, 2)?;
                Ok(Self::Udt {
                    protocol_class,
                    called_party: SccpAddress::decode(called)?,
                    calling_party: SccpAddress::decode(calling)?,
                    data: user_data,
                })
            }
            MessageType::Udts => {
                let return_cause = ReturnCause::from(byte_at(data, 1)?);
                let [called, calling, user_data] = read_mandatory::<3>(data, 2)?;
                Ok(Self::Udts {
                    return_cause,
                    called_party: SccpAddress::decode(called)?,
                    calling_party: SccpAddress::decode(calling)?,
                    data: user_data,
                })
            }
            MessageType::Xudt => {
                let protocol_class = ProtocolClass::decode(byte_at(data, 1)?);
                let hop_counter = byte_at(data, 2)?;
                let [called, calling, user_data] = read_mandatory::<3>(data, 3)?;
                let (segmentation, importance) = read_optional(data, 6)?;
                Ok(Self::Xudt {
                    protocol_class,
                    hop_counter,
                    called_party: SccpAddress::decode(called)?,
                    calling_party: SccpAddress::decode(calling)?,
                    data: user_data,
                    segmentation,
                    importance,
                })
            }
            MessageType::Xudts => {
                let return_cause = ReturnCause::from(byte_at(data, 1)?);
                let hop_counter = byte_at(data, 2)?;
                let [called, calling, user_data] = read_mandatory::<3>(data, 3)?;
                let (segmentation, importance) = read_optional(data, 6)?;
                Ok(Self::Xudts {
                    return_cause,
                    hop_counter,
                    called_party: SccpAddress::decode(called)?,
                    calling_party: SccpAddress::decode(calling)?,
                    data: user_data,
                    segmentation,
                    importance,
                })
            }
            other => Err(SccpError::InvalidMessage(format!(
                "Unsupported message type: {:?}",
                other
            ))),
        }
    }
}

/// Write pointers followed by length-prefixed mandatory variable parameters.
///
/// Each pointer holds the distance from itself to its parameter's length
/// octet. The optional-part pointer is 0 when there are no optional
/// parameters.
fn put_variable_part(
    buf: &mut BytesMut,
    parts: &[&[u8]],
    optional: Option<&[u8]>,
) -> Result<(), SccpError> {
    let pointer_count = parts.len() + usize::from(optional.is_some());

    let mut offset = pointer_count;
    for (i, part) in parts.iter().enumerate() {
        if part.len() > u8::MAX as usize {
            return Err(SccpError::InvalidMessage(format!(
                "variable parameter of {} octets exceeds 255",
                part.len()
            )));
        }
        buf.put_u8(pointer_value(offset - i)?);
        offset += 1 + part.len();
    }
    if let Some(optional) = optional {
        let i = parts.len();
        buf.put_u8(if optional.is_empty() { 0 } else { pointer_value(offset - i)? });
    }

    for part in parts {
        buf.put_u8(part.len() as u8);
        buf.put_slice(part);
    }
    if let Some(optional) = optional {
        buf.put_slice(optional);
    }
    Ok(())
}

/// Return option set, or connection-oriented traffic
fn wants_return(protocol_class: &ProtocolClass) -> bool {
    protocol_class.return_on_error || protocol_class.is_connection_oriented()
}

fn pointer_value(distance: usize) -> Result<u8, SccpError> {
    u8::try_from(distance)
        .map_err(|_| SccpError::InvalidMessage("pointer out of range".to_string()))
}

fn encode_optional(segmentation: &Option<Segmentation>, importance: &Option<u8>) -> Vec<u8> {
    let mut optional = Vec::new();
    if let Some(seg) = segmentation {
        optional.push(PARAM_SEGMENTATION);
        optional.push(Segmentation::LENGTH as u8);
        optional.extend_from_slice(&seg.encode());
    }
    if let Some(importance) = importance {
        optional.push(PARAM_IMPORTANCE);
        optional.push(1);
        optional.push(importance & 0x07);
    }
    if !optional.is_empty() {
        optional.push(PARAM_END_OF_OPTIONAL);
    }
    optional
}

fn byte_at(data: &Bytes, index: usize) -> Result<u8, SccpError> {
    data.get(index)
        .copied()
        .ok_or_else(|| SccpError::InvalidMessage(format!("message truncated at octet {}", index)))
}

/// Read `N` mandatory variable parameters whose pointers start at `first_pointer`
fn read_mandatory<const N: usize>(
    data: &Bytes,
    first_pointer: usize,
) -> Result<[Bytes; N], SccpError> {
    let mut params: [Bytes; N] = std::array::from_fn(|_| Bytes::new());
    for (i, param) in params.iter_mut().enumerate() {
        let pointer_at = first_pointer + i;
        let pointer = byte_at(data, pointer_at)? as usize;
        if pointer == 0 {
            return Err(SccpError::InvalidMessage("null mandatory pointer".to_string()));
        }
        let start = pointer_at + pointer;
        let len = byte_at(data, start)? as usize;
        let end = start + 1 + len;
        if end > data.len() {
            return Err(SccpError::InvalidMessage(format!(
                "parameter at octet {} overruns message",
                start
            )));
        }
        *param = data.slice(start + 1..end);
    }
    Ok(params)
}

fn read_optional(
    data: &Bytes,
    pointer_at: usize,
) -> Result<(Option<Segmentation>, Option<u8>), SccpError> {
    let pointer = byte_at(data, pointer_at)? as usize;
    let mut segmentation = None;
    let mut importance = None;
    if pointer == 0 {
        return Ok((segmentation, importance));
    }

    let mut pos = pointer_at + pointer;
    loop {
        let name = byte_at(data, pos)?;
        if name == PARAM_END_OF_OPTIONAL {
            break;
        }
        let len = byte_at(data, pos + 1)? as usize;
        let end = pos + 2 + len;
        if end > data.len() {
            return Err(SccpError::InvalidMessage("optional parameter overruns message".to_string()));
        }
        let value = &data[pos + 2..end];
        match name {
            PARAM_SEGMENTATION => {
                segmentation = Some(Segmentation::decode(value).ok_or_else(|| {
                    SccpError::InvalidMessage("short segmentation parameter".to_string())
                })?);
            }
            PARAM_IMPORTANCE => importance = value.first().map(|v| v & 0x07),
            _ => {}
        }
        pos = end;
    }
    Ok((segmentation, importance))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sccp::address::GlobalTitle;
    use crate::types::PointCode;

    fn called() -> SccpAddress {
        SccpAddress::from_gt(GlobalTitle::e164("2348012345678"), Some(6))
    }

    fn calling() -> SccpAddress {
        SccpAddress::from_ssn_pc(8, PointCode(1001))
    }

    #[test]
    fn test_udt_pointers() {
        let msg = SccpMessage::Udt {
            protocol_class: ProtocolClass::CLASS_0,
            called_party: SccpAddress::from_ssn_pc(6, PointCode(2)),
            calling_party: SccpAddress::from_ssn_pc(8, PointCode(1)),
            data: Bytes::from_static(b"\x01\x02"),
        };
        let encoded = msg.encode().unwrap();
        assert_eq!(
            &encoded[..],
            &[
                0x09, 0x00, // type, class
                0x03, 0x07, 0x0B, // pointers
                0x04, 0x43, 0x02, 0x00, 0x06, // called
                0x04, 0x43, 0x01, 0x00, 0x08, // calling
                0x02, 0x01, 0x02, // data
            ]
        );
        assert_eq!(SccpMessage::decode(&encoded.freeze()).unwrap(), msg);
    }

    #[test]
    fn test_xudt_with_segmentation() {
        let msg = SccpMessage::Xudt {
            protocol_class: ProtocolClass::CLASS_1,
            hop_counter: 15,
            called_party: called(),
            calling_party: calling(),
            data: Bytes::from_static(b"segment payload"),
            segmentation: Some(Segmentation {
                first: true,
                class: 1,
                remaining_segments: 2,
                reference: 0x00ABCD,
            }),
            importance: None,
        };
        let decoded = SccpMessage::decode(&msg.encode().unwrap().freeze()).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.segmentation().unwrap().remaining_segments, 2);
    }

    #[test]
    fn test_xudt_without_optional_part() {
        let msg = SccpMessage::Xudt {
            protocol_class: ProtocolClass::CLASS_0,
            hop_counter: 7,
            called_party: called(),
            calling_party: calling(),
            data: Bytes::from_static(b"x"),
            segmentation: None,
            importance: None,
        };
        let encoded = msg.encode().unwrap();
        assert_eq!(encoded[6], 0);
        assert_eq!(SccpMessage::decode(&encoded.freeze()).unwrap(), msg);
    }

    #[test]
    fn test_udts_carries_return_cause() {
        let msg = SccpMessage::Udts {
            return_cause: ReturnCause::SubsystemFailure,
            called_party: calling(),
            calling_party: called(),
            data: Bytes::from_static(b"returned"),
        };
        let decoded = SccpMessage::decode(&msg.encode().unwrap().freeze()).unwrap();
        assert!(decoded.is_service());
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_malformed_input() {
        assert!(SccpMessage::decode(&Bytes::new()).is_err());
        assert!(SccpMessage::decode(&Bytes::from_static(&[0x09, 0x00, 0x03])).is_err());
        // Pointer past the end
        assert!(SccpMessage::decode(&Bytes::from_static(&[0x09, 0x00, 0x30, 0x01, 0x01])).is_err());
        // Connection-oriented types are not handled here
        assert!(SccpMessage::decode(&Bytes::from_static(&[0x01, 0x00])).is_err());
        assert!(SccpMessage::decode(&Bytes::from_static(&[0xEE])).is_err());
    }

    #[test]
    fn test_oversized_parameter_rejected() {
        let msg = SccpMessage::Udt {
            protocol_class: ProtocolClass::CLASS_0,
            called_party: called(),
            calling_party: calling(),
            data: Bytes::from(vec![0u8; 300]),
        };
        assert!(msg.encode().is_err());
    }

    #[test]
    fn test_service_response_swaps_addresses() {
        let udt = SccpMessage::Udt {
            protocol_class: ProtocolClass::CLASS_0.with_return_on_error(),
            called_party: called(),
            calling_party: calling(),
            data: Bytes::from_static(b"abc"),
        };
        let udts = udt.service_response(ReturnCause::SubsystemFailure, 15).unwrap();
        assert_eq!(udts.message_type(), MessageType::Udts);
        assert_eq!(udts.called_party(), &calling());
        assert_eq!(udts.calling_party(), &called());
        assert_eq!(udts.data(), &Bytes::from_static(b"abc"));

        // Class 0 without return option is discarded silently
        let plain = SccpMessage::Udt {
            protocol_class: ProtocolClass::CLASS_0,
            called_party: called(),
            calling_party: calling(),
            data: Bytes::new(),
        };
        assert!(plain.service_response(ReturnCause::SubsystemFailure, 15).is_none());
        // Connection-oriented traffic is always returned
        let co = SccpMessage::Udt {
            protocol_class: ProtocolClass::CLASS_2,
            called_party: called(),
            calling_party: calling(),
            data: Bytes::new(),
        };
        assert!(co.service_response(ReturnCause::Unqualified, 15).is_some());
        assert!(udts.service_response(ReturnCause::Unqualified, 15).is_none());
    }

    #[test]
    fn test_reassembled_message_returns_first_octets() {
        let segment = SccpMessage::Xudt {
            protocol_class: ProtocolClass::CLASS_1.with_return_on_error(),
            hop_counter: 12,
            called_party: called(),
            calling_party: calling(),
            data: Bytes::from_static(b"seg"),
            segmentation: Some(Segmentation { first: true, class: 1, remaining_segments: 1, reference: 7 }),
            importance: None,
        };
        let whole = segment.reassembled(Bytes::from(vec![0x5A; 400]));
        assert_eq!(whole.segmentation(), None);
        assert_eq!(whole.data().len(), 400);
        assert!(whole.encode().is_err());

        let xudts = whole.service_response(ReturnCause::MtpFailure, 15).unwrap();
        assert_eq!(xudts.data().len(), MAX_DATA_LENGTH);
        assert!(xudts.encode().is_ok());
    }

    #[test]
    fn test_hop_counter_decrement() {
        let xudt = |hop_counter| SccpMessage::Xudt {
            protocol_class: ProtocolClass::CLASS_0,
            hop_counter,
            called_party: called(),
            calling_party: calling(),
            data: Bytes::new(),
            segmentation: None,
            importance: None,
        };
        assert_eq!(xudt(5).decrement_hop_counter().unwrap().hop_counter(), Some(4));
        assert_eq!(xudt(1).decrement_hop_counter(), Err(SccpError::HopCounterViolation));
    }
}
