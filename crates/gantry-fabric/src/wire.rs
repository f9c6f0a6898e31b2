//! Fixed-layout control-plane wire formats.
//!
//! A control payload is a one-byte tag followed by the message body.
//! Notification bodies use a fixed-size little-endian record so the
//! receiver can reject malformed payloads by length alone.

use std::collections::HashSet;

use thiserror::Error;

/// NUL-padded agent-name field width.
pub const AGENT_NAME_LEN: usize = 32;
/// NUL-padded message field width.
pub const MESSAGE_LEN: usize = 128;
/// Maximum transfer ids one notification can carry.
pub const MAX_XFER_IDS: usize = 256;
/// Exact encoded size of a notification record.
pub const NOTIFICATION_RECORD_SIZE: usize = AGENT_NAME_LEN + MESSAGE_LEN + 2 + MAX_XFER_IDS * 4;

/// Wire-format failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    /// Notification payload length differs from the fixed record size.
    #[error("bad notification length: {got} bytes, expected {expected}")]
    BadLength {
        /// Received payload length.
        got: usize,
        /// The record size.
        expected: usize,
    },

    /// A field exceeded its fixed width.
    #[error("field too long: {field} is {got} bytes, max {max}")]
    FieldTooLong {
        /// Field name.
        field: &'static str,
        /// Actual width.
        got: usize,
        /// Allowed width.
        max: usize,
    },

    /// The id count field exceeds [`MAX_XFER_IDS`].
    #[error("xfer id count {0} out of range")]
    BadIdCount(u16),

    /// Unknown control tag byte.
    #[error("unknown control tag {0:#04x}")]
    UnknownTag(u8),
}

/// Type tag preceding every control payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ControlTag {
    /// User notification record.
    Notification = 0x01,
    /// Connection establishment request.
    ConnectionReq = 0x02,
    /// Connection acknowledgment.
    ConnectionAck = 0x03,
    /// Disconnection request.
    DisconnectReq = 0x04,
}

impl ControlTag {
    /// Parse a tag byte.
    pub fn from_u8(byte: u8) -> Result<Self, WireError> {
        match byte {
            0x01 => Ok(ControlTag::Notification),
            0x02 => Ok(ControlTag::ConnectionReq),
            0x03 => Ok(ControlTag::ConnectionAck),
            0x04 => Ok(ControlTag::DisconnectReq),
            other => Err(WireError::UnknownTag(other)),
        }
    }
}

/// A decoded notification: sender, message, and the transfer ids whose
/// arrival gates delivery.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NotificationRecord {
    /// Sending agent's name.
    pub agent: String,
    /// User message.
    pub message: String,
    /// Transfer ids this notification waits for.
    pub xfer_ids: Vec<u32>,
}

impl NotificationRecord {
    /// Build a record, validating field widths.
    pub fn new(agent: &str, message: &str) -> Result<Self, WireError> {
        if agent.len() > AGENT_NAME_LEN {
            return Err(WireError::FieldTooLong {
                field: "agent",
                got: agent.len(),
                max: AGENT_NAME_LEN,
            });
        }
        if message.len() > MESSAGE_LEN {
            return Err(WireError::FieldTooLong {
                field: "message",
                got: message.len(),
                max: MESSAGE_LEN,
            });
        }
        Ok(NotificationRecord {
            agent: agent.to_string(),
            message: message.to_string(),
            xfer_ids: Vec::new(),
        })
    }

    /// Append a transfer id. Fails once the record is full.
    pub fn push_xfer_id(&mut self, id: u32) -> Result<(), WireError> {
        if self.xfer_ids.len() >= MAX_XFER_IDS {
            return Err(WireError::BadIdCount(self.xfer_ids.len() as u16 + 1));
        }
        self.xfer_ids.push(id);
        Ok(())
    }

    /// The expected-id set, keyed by the low 16 bits carried on the
    /// wire as write immediates.
    pub fn expected_low_ids(&self) -> HashSet<u16> {
        self.xfer_ids.iter().map(|id| (id & 0xFFFF) as u16).collect()
    }

    /// Encode to the fixed record layout.
    pub fn encode(&self) -> [u8; NOTIFICATION_RECORD_SIZE] {
        let mut out = [0u8; NOTIFICATION_RECORD_SIZE];
        out[..self.agent.len()].copy_from_slice(self.agent.as_bytes());
        let msg_off = AGENT_NAME_LEN;
        out[msg_off..msg_off + self.message.len()].copy_from_slice(self.message.as_bytes());
        let count_off = AGENT_NAME_LEN + MESSAGE_LEN;
        out[count_off..count_off + 2].copy_from_slice(&(self.xfer_ids.len() as u16).to_le_bytes());
        let ids_off = count_off + 2;
        for (i, id) in self.xfer_ids.iter().enumerate() {
            out[ids_off + i * 4..ids_off + i * 4 + 4].copy_from_slice(&id.to_le_bytes());
        }
        out
    }

    /// Decode a payload, rejecting any length other than the record
    /// size.
    pub fn decode(data: &[u8]) -> Result<Self, WireError> {
        if data.len() != NOTIFICATION_RECORD_SIZE {
            return Err(WireError::BadLength {
                got: data.len(),
                expected: NOTIFICATION_RECORD_SIZE,
            });
        }
        let agent = read_padded(&data[..AGENT_NAME_LEN]);
        let message = read_padded(&data[AGENT_NAME_LEN..AGENT_NAME_LEN + MESSAGE_LEN]);
        let count_off = AGENT_NAME_LEN + MESSAGE_LEN;
        let count = u16::from_le_bytes([data[count_off], data[count_off + 1]]);
        if count as usize > MAX_XFER_IDS {
            return Err(WireError::BadIdCount(count));
        }
        let ids_off = count_off + 2;
        let xfer_ids = (0..count as usize)
            .map(|i| {
                let b = &data[ids_off + i * 4..ids_off + i * 4 + 4];
                u32::from_le_bytes([b[0], b[1], b[2], b[3]])
            })
            .collect();
        Ok(NotificationRecord { agent, message, xfer_ids })
    }
}

fn read_padded(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

/// Compose the immediate word for a data write: sender's agent index in
/// the high half, the transfer id's low half in the low half.
pub fn pack_data_immediate(agent_idx: u16, xfer_id: u32) -> u32 {
    ((agent_idx as u32) << 16) | (xfer_id & 0xFFFF)
}

/// Split a data-write immediate back into `(agent_idx, xfer_id_low)`.
pub fn unpack_data_immediate(immediate: u32) -> (u16, u16) {
    ((immediate >> 16) as u16, (immediate & 0xFFFF) as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_size() {
        assert_eq!(NOTIFICATION_RECORD_SIZE, 1186);
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let mut record = NotificationRecord::new("agent-a", "done").unwrap();
        record.push_xfer_id(7).unwrap();
        record.push_xfer_id(0xFFFF_0001).unwrap();

        let decoded = NotificationRecord::decode(&record.encode()).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_empty_record_round_trip() {
        let record = NotificationRecord::new("a", "").unwrap();
        let decoded = NotificationRecord::decode(&record.encode()).unwrap();
        assert_eq!(decoded.agent, "a");
        assert_eq!(decoded.message, "");
        assert!(decoded.xfer_ids.is_empty());
    }

    #[test]
    fn test_decode_rejects_wrong_length() {
        let err = NotificationRecord::decode(&[0u8; 100]).unwrap_err();
        assert_eq!(err, WireError::BadLength { got: 100, expected: NOTIFICATION_RECORD_SIZE });
    }

    #[test]
    fn test_decode_rejects_bad_count() {
        let mut data = [0u8; NOTIFICATION_RECORD_SIZE];
        let count_off = AGENT_NAME_LEN + MESSAGE_LEN;
        data[count_off..count_off + 2].copy_from_slice(&300u16.to_le_bytes());
        assert_eq!(NotificationRecord::decode(&data).unwrap_err(), WireError::BadIdCount(300));
    }

    #[test]
    fn test_field_limits() {
        let long_name = "n".repeat(AGENT_NAME_LEN + 1);
        assert!(NotificationRecord::new(&long_name, "m").is_err());

        let long_msg = "m".repeat(MESSAGE_LEN + 1);
        assert!(NotificationRecord::new("a", &long_msg).is_err());

        let mut record = NotificationRecord::new("a", "m").unwrap();
        for i in 0..MAX_XFER_IDS as u32 {
            record.push_xfer_id(i).unwrap();
        }
        assert!(record.push_xfer_id(9999).is_err());
    }

    #[test]
    fn test_control_tags() {
        for (byte, tag) in [
            (0x01, ControlTag::Notification),
            (0x02, ControlTag::ConnectionReq),
            (0x03, ControlTag::ConnectionAck),
            (0x04, ControlTag::DisconnectReq),
        ] {
            assert_eq!(ControlTag::from_u8(byte).unwrap(), tag);
            assert_eq!(tag as u8, byte);
        }
        assert_eq!(ControlTag::from_u8(0x09).unwrap_err(), WireError::UnknownTag(0x09));
    }

    #[test]
    fn test_immediate_packing() {
        let imm = pack_data_immediate(3, 0xABCD_1234);
        assert_eq!(imm, 0x0003_1234);
        assert_eq!(unpack_data_immediate(imm), (3, 0x1234));
    }

    #[test]
    fn test_expected_low_ids() {
        let mut record = NotificationRecord::new("a", "m").unwrap();
        record.push_xfer_id(0x0001_0005).unwrap();
        record.push_xfer_id(0x0006).unwrap();
        let low = record.expected_low_ids();
        assert!(low.contains(&5));
        assert!(low.contains(&6));
        assert_eq!(low.len(), 2);
    }
}
