//! MQTT 3.1.1 control packet types and fixed-header helpers.

use crate::error::{ProtocolError, Result};

/// MQTT Control Packet Types (high nibble of the fixed header).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Connect = 1,
    Connack = 2,
    Publish = 3,
    Puback = 4,
    Pubrec = 5,
    Pubrel = 6,
    Pubcomp = 7,
    Subscribe = 8,
    Suback = 9,
    Unsubscribe = 10,
    Unsuback = 11,
    Pingreq = 12,
    Pingresp = 13,
    Disconnect = 14,
}

impl TryFrom<u8> for PacketType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(PacketType::Connect),
            2 => Ok(PacketType::Connack),
            3 => Ok(PacketType::Publish),
            4 => Ok(PacketType::Puback),
            5 => Ok(PacketType::Pubrec),
            6 => Ok(PacketType::Pubrel),
            7 => Ok(PacketType::Pubcomp),
            8 => Ok(PacketType::Subscribe),
            9 => Ok(PacketType::Suback),
            10 => Ok(PacketType::Unsubscribe),
            11 => Ok(PacketType::Unsuback),
            12 => Ok(PacketType::Pingreq),
            13 => Ok(PacketType::Pingresp),
            14 => Ok(PacketType::Disconnect),
            _ => Err(ProtocolError::InvalidPacketType(value)),
        }
    }
}

/// Quality of Service levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
#[repr(u8)]
#[allow(clippy::enum_variant_names)] // MQTT spec names
pub enum QoS {
    #[default]
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl TryFrom<u8> for QoS {
    type Error = ProtocolError;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            _ => Err(ProtocolError::InvalidQos(value)),
        }
    }
}

// CONNECT variable-header flag bits (MQTT 3.1.1 section 3.1.2)
pub const CONNECT_FLAG_CLEAN_SESSION: u8 = 0x02;
pub const CONNECT_FLAG_WILL: u8 = 0x04;
pub const CONNECT_FLAG_WILL_QOS_SHIFT: u8 = 3;
pub const CONNECT_FLAG_WILL_RETAIN: u8 = 0x20;
pub const CONNECT_FLAG_PASSWORD: u8 = 0x40;
pub const CONNECT_FLAG_USERNAME: u8 = 0x80;

/// Assemble a fixed-header byte.
///
/// The low nibble is zero for every packet type except PUBLISH, which
/// carries DUP/QoS/RETAIN, and PUBREL/SUBSCRIBE/UNSUBSCRIBE, which MQTT
/// 3.1.1 mandates carry the flag value 0x02 ([MQTT-3.6.1-1],
/// [MQTT-3.8.1-1], [MQTT-3.10.1-1]). `dup`, `qos` and `retain` are only
/// consulted for PUBLISH.
pub fn fixed_header_byte(packet_type: PacketType, dup: bool, qos: QoS, retain: bool) -> u8 {
    let mut b = (packet_type as u8) << 4;
    match packet_type {
        PacketType::Publish => {
            b |= u8::from(dup) << 3 | (qos as u8) << 1 | u8::from(retain);
        }
        PacketType::Pubrel | PacketType::Subscribe | PacketType::Unsubscribe => b |= 0x02,
        _ => {}
    }
    b
}

/// Packet type of a received fixed-header byte.
pub fn packet_type(hdr: u8) -> Result<PacketType> {
    PacketType::try_from(hdr >> 4)
}

/// DUP flag of a received PUBLISH fixed-header byte.
pub fn publish_dup(hdr: u8) -> bool {
    hdr & 0x08 != 0
}

/// QoS of a received PUBLISH fixed-header byte.
pub fn publish_qos(hdr: u8) -> Result<QoS> {
    QoS::try_from((hdr >> 1) & 0x03)
}

/// RETAIN flag of a received PUBLISH fixed-header byte.
pub fn publish_retain(hdr: u8) -> bool {
    hdr & 0x01 != 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_type_roundtrip() {
        for raw in 1u8..=14 {
            let packet_type = PacketType::try_from(raw).unwrap();
            assert_eq!(packet_type as u8, raw);
        }
        assert!(PacketType::try_from(0).is_err());
        assert!(PacketType::try_from(15).is_err());
    }

    #[test]
    fn test_publish_header_roundtrip() {
        for dup in [false, true] {
            for qos in [QoS::AtMostOnce, QoS::AtLeastOnce, QoS::ExactlyOnce] {
                for retain in [false, true] {
                    let hdr = fixed_header_byte(PacketType::Publish, dup, qos, retain);
                    assert_eq!(packet_type(hdr).unwrap(), PacketType::Publish);
                    assert_eq!(publish_dup(hdr), dup);
                    assert_eq!(publish_qos(hdr).unwrap(), qos);
                    assert_eq!(publish_retain(hdr), retain);
                }
            }
        }
    }

    #[test]
    fn test_mandated_flag_bits() {
        assert_eq!(
            fixed_header_byte(PacketType::Pubrel, false, QoS::AtMostOnce, false),
            0x62
        );
        assert_eq!(
            fixed_header_byte(PacketType::Subscribe, false, QoS::AtMostOnce, false),
            0x82
        );
        assert_eq!(
            fixed_header_byte(PacketType::Unsubscribe, false, QoS::AtMostOnce, false),
            0xA2
        );
        // Flag arguments must not leak into non-PUBLISH headers
        assert_eq!(
            fixed_header_byte(PacketType::Puback, true, QoS::ExactlyOnce, true),
            0x40
        );
        assert_eq!(
            fixed_header_byte(PacketType::Pingreq, false, QoS::AtMostOnce, false),
            0xC0
        );
    }
}
