//! PTP/IP packet framing: `length:u32_le | type:u32_le | payload:bytes`,
//! where `length` counts the full frame including its own 8-byte header.
//! Pure encode/decode, no I/O.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::wire::{read_nul_terminated_utf16, write_nul_terminated_utf16};

pub const HEADER_LEN: usize = 8;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FramingError {
    #[error("frame shorter than the 8-byte header")]
    ShortFrame,
    #[error("unknown packet type 0x{0:08x}")]
    UnknownType(u32),
    #[error("malformed UTF-16LE string in payload")]
    BadString,
    #[error("frame length field {declared} does not match actual size {actual}")]
    LengthMismatch { declared: u32, actual: usize },
}

/// The guid carried in `InitCommandRequest`/`InitEventRequest` is a plain
/// 16-byte value, not a hyphenated string.
pub type WireGuid = [u8; 16];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    InitCommandRequest {
        guid: WireGuid,
        host_name: String,
        protocol_version: u32,
    },
    InitCommandAck {
        connection_number: u32,
        device_guid: WireGuid,
        device_name: String,
        device_version: u32,
    },
    InitEventRequest {
        connection_number: u32,
    },
    InitEventAck,
    InitFail {
        reason: u32,
    },
    Command {
        transaction_id: u32,
        opcode: u16,
        params: Vec<u32>,
    },
    Data {
        transaction_id: u32,
        payload: Bytes,
    },
    Response {
        transaction_id: u32,
        code: u16,
        params: Vec<u32>,
    },
    StartData {
        transaction_id: u32,
        total_len: u64,
    },
    EndData {
        transaction_id: u32,
        payload: Bytes,
    },
}

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PacketType {
    InitCommandRequest = 1,
    InitCommandAck = 2,
    InitEventRequest = 3,
    InitEventAck = 4,
    InitFail = 5,
    Command = 6,
    Response = 7,
    StartData = 8,
    Data = 9,
    Cancel = 10,
    EndData = 12,
}

impl PacketType {
    fn from_u32(v: u32) -> Option<Self> {
        Some(match v {
            1 => Self::InitCommandRequest,
            2 => Self::InitCommandAck,
            3 => Self::InitEventRequest,
            4 => Self::InitEventAck,
            5 => Self::InitFail,
            6 => Self::Command,
            7 => Self::Response,
            8 => Self::StartData,
            9 => Self::Data,
            10 => Self::Cancel,
            12 => Self::EndData,
            _ => return None,
        })
    }
}

/// Encodes a packet into a contiguous buffer: `length:u32_le | type:u32_le |
/// payload`. `length` is the total frame length, header included.
pub fn encode(packet: &Packet) -> Vec<u8> {
    let (packet_type, mut payload) = match packet {
        Packet::InitCommandRequest {
            guid,
            host_name,
            protocol_version,
        } => {
            let mut buf = BytesMut::new();
            buf.put_slice(guid);
            write_nul_terminated_utf16(&mut buf, host_name);
            buf.put_u32_le(*protocol_version);
            (PacketType::InitCommandRequest, buf)
        }
        Packet::InitCommandAck {
            connection_number,
            device_guid,
            device_name,
            device_version,
        } => {
            let mut buf = BytesMut::new();
            buf.put_u32_le(*connection_number);
            buf.put_slice(device_guid);
            write_nul_terminated_utf16(&mut buf, device_name);
            buf.put_u32_le(*device_version);
            (PacketType::InitCommandAck, buf)
        }
        Packet::InitEventRequest { connection_number } => {
            let mut buf = BytesMut::new();
            buf.put_u32_le(*connection_number);
            (PacketType::InitEventRequest, buf)
        }
        Packet::InitEventAck => (PacketType::InitEventAck, BytesMut::new()),
        Packet::InitFail { reason } => {
            let mut buf = BytesMut::new();
            buf.put_u32_le(*reason);
            (PacketType::InitFail, buf)
        }
        Packet::Command {
            transaction_id,
            opcode,
            params,
        } => {
            let mut buf = BytesMut::new();
            buf.put_u16_le(*opcode);
            buf.put_u32_le(*transaction_id);
            for &p in params {
                buf.put_u32_le(p);
            }
            (PacketType::Command, buf)
        }
        Packet::Data {
            transaction_id,
            payload,
        } => {
            let mut buf = BytesMut::new();
            buf.put_u32_le(*transaction_id);
            buf.put_slice(payload);
            (PacketType::Data, buf)
        }
        Packet::Response {
            transaction_id,
            code,
            params,
        } => {
            let mut buf = BytesMut::new();
            buf.put_u16_le(*code);
            buf.put_u32_le(*transaction_id);
            for &p in params {
                buf.put_u32_le(p);
            }
            (PacketType::Response, buf)
        }
        Packet::StartData {
            transaction_id,
            total_len,
        } => {
            let mut buf = BytesMut::new();
            buf.put_u32_le(*transaction_id);
            buf.put_u64_le(*total_len);
            (PacketType::StartData, buf)
        }
        Packet::EndData {
            transaction_id,
            payload,
        } => {
            let mut buf = BytesMut::new();
            buf.put_u32_le(*transaction_id);
            buf.put_slice(payload);
            (PacketType::EndData, buf)
        }
    };

    let length = (HEADER_LEN + payload.len()) as u32;
    let mut frame = BytesMut::with_capacity(length as usize);
    frame.put_u32_le(length);
    frame.put_u32_le(packet_type as u32);
    frame.append(&mut payload);
    frame.to_vec()
}

/// Decodes a single frame. `bytes.len()` must equal the frame's declared
/// `length` exactly — the transport layer is responsible for reading
/// exactly that many bytes before calling this.
pub fn decode(bytes: &[u8]) -> Result<Packet, FramingError> {
    if bytes.len() < HEADER_LEN {
        return Err(FramingError::ShortFrame);
    }
    let mut buf = bytes;
    let length = buf.get_u32_le();
    if length as usize != bytes.len() {
        return Err(FramingError::LengthMismatch {
            declared: length,
            actual: bytes.len(),
        });
    }
    let raw_type = buf.get_u32_le();
    let packet_type = PacketType::from_u32(raw_type).ok_or(FramingError::UnknownType(raw_type))?;

    let packet = match packet_type {
        PacketType::InitCommandRequest => {
            if buf.remaining() < 16 {
                return Err(FramingError::ShortFrame);
            }
            let mut guid = [0u8; 16];
            buf.copy_to_slice(&mut guid);
            let host_name = read_nul_terminated_utf16(&mut buf);
            if buf.remaining() < 4 {
                return Err(FramingError::ShortFrame);
            }
            let protocol_version = buf.get_u32_le();
            Packet::InitCommandRequest {
                guid,
                host_name,
                protocol_version,
            }
        }
        PacketType::InitCommandAck => {
            if buf.remaining() < 4 {
                return Err(FramingError::ShortFrame);
            }
            let connection_number = buf.get_u32_le();
            if buf.remaining() < 16 {
                return Err(FramingError::ShortFrame);
            }
            let mut device_guid = [0u8; 16];
            buf.copy_to_slice(&mut device_guid);
            let device_name = read_nul_terminated_utf16(&mut buf);
            let device_version = if buf.remaining() >= 4 {
                buf.get_u32_le()
            } else {
                0
            };
            Packet::InitCommandAck {
                connection_number,
                device_guid,
                device_name,
                device_version,
            }
        }
        PacketType::InitEventRequest => {
            if buf.remaining() < 4 {
                return Err(FramingError::ShortFrame);
            }
            Packet::InitEventRequest {
                connection_number: buf.get_u32_le(),
            }
        }
        PacketType::InitEventAck => Packet::InitEventAck,
        PacketType::InitFail => {
            if buf.remaining() < 4 {
                return Err(FramingError::ShortFrame);
            }
            Packet::InitFail {
                reason: buf.get_u32_le(),
            }
        }
        PacketType::Command => {
            if buf.remaining() < 6 {
                return Err(FramingError::ShortFrame);
            }
            let opcode = buf.get_u16_le();
            let transaction_id = buf.get_u32_le();
            let mut params = Vec::new();
            while buf.remaining() >= 4 {
                params.push(buf.get_u32_le());
            }
            Packet::Command {
                transaction_id,
                opcode,
                params,
            }
        }
        PacketType::Response => {
            if buf.remaining() < 6 {
                return Err(FramingError::ShortFrame);
            }
            let code = buf.get_u16_le();
            let transaction_id = buf.get_u32_le();
            let mut params = Vec::new();
            while buf.remaining() >= 4 {
                params.push(buf.get_u32_le());
            }
            Packet::Response {
                transaction_id,
                code,
                params,
            }
        }
        PacketType::Data | PacketType::Cancel => {
            if buf.remaining() < 4 {
                return Err(FramingError::ShortFrame);
            }
            let transaction_id = buf.get_u32_le();
            let payload = Bytes::copy_from_slice(buf);
            Packet::Data {
                transaction_id,
                payload,
            }
        }
        PacketType::StartData => {
            if buf.remaining() < 12 {
                return Err(FramingError::ShortFrame);
            }
            let transaction_id = buf.get_u32_le();
            let total_len = buf.get_u64_le();
            Packet::StartData {
                transaction_id,
                total_len,
            }
        }
        PacketType::EndData => {
            if buf.remaining() < 4 {
                return Err(FramingError::ShortFrame);
            }
            let transaction_id = buf.get_u32_le();
            let payload = Bytes::copy_from_slice(buf);
            Packet::EndData {
                transaction_id,
                payload,
            }
        }
    };

    Ok(packet)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(packet: Packet) {
        let encoded = encode(&packet);
        assert_eq!(encoded.len(), u32::from_le_bytes(encoded[..4].try_into().unwrap()) as usize);
        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn round_trip_init_command_request() {
        round_trip(Packet::InitCommandRequest {
            guid: [7u8; 16],
            host_name: "framefast".into(),
            protocol_version: 0x0001_0000,
        });
    }

    #[test]
    fn round_trip_init_command_ack() {
        round_trip(Packet::InitCommandAck {
            connection_number: 42,
            device_guid: [9u8; 16],
            device_name: "EOS R5".into(),
            device_version: 1,
        });
    }

    #[test]
    fn round_trip_command_with_params() {
        round_trip(Packet::Command {
            transaction_id: 5,
            opcode: 0x1002,
            params: vec![0xdead_beef, 1, 2, 3, 4],
        });
    }

    #[test]
    fn round_trip_response() {
        round_trip(Packet::Response {
            transaction_id: 5,
            code: 0x2001,
            params: vec![],
        });
    }

    #[test]
    fn round_trip_data() {
        round_trip(Packet::Data {
            transaction_id: 9,
            payload: Bytes::from_static(b"hello world"),
        });
    }

    #[test]
    fn round_trip_start_end_data() {
        round_trip(Packet::StartData {
            transaction_id: 3,
            total_len: 3_200_000,
        });
        round_trip(Packet::EndData {
            transaction_id: 3,
            payload: Bytes::from_static(b"tail"),
        });
    }

    #[test]
    fn short_frame_under_header() {
        assert_eq!(decode(&[0, 1, 2]), Err(FramingError::ShortFrame));
    }

    #[test]
    fn unknown_type_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(8);
        buf.put_u32_le(0xdead_beef);
        assert_eq!(
            decode(&buf),
            Err(FramingError::UnknownType(0xdead_beef))
        );
    }

    #[test]
    fn length_mismatch_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(100);
        buf.put_u32_le(4); // InitEventAck
        assert!(matches!(
            decode(&buf),
            Err(FramingError::LengthMismatch { declared: 100, actual: 8 })
        ));
    }
}
