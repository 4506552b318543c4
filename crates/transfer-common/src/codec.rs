//! Wire codec for the file-transfer protocol
//!
//! All multi-byte integers are little-endian. See the request/response
//! header layouts and per-opcode payload tables in the protocol spec.
//! Built on `bytes::{Buf, BufMut}` the same way the teacher's packet
//! framing builds and parses its frames.

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;

/// Size of a request header in bytes: client_id(16) + version(1) + code(2) + payload_size(4)
pub const REQUEST_HEADER_SIZE: usize = 23;
/// Size of a response header in bytes: version(1) + code(2) + payload_size(4)
pub const RESPONSE_HEADER_SIZE: usize = 7;

const CLIENT_ID_SIZE: usize = 16;
const NAME_FIELD_SIZE: usize = 255;
const PUBLIC_KEY_FIELD_SIZE: usize = 160;
const FILE_NAME_FIELD_SIZE: usize = 255;
const SEND_FILE_PREFIX_SIZE: usize = 4 + 4 + 2 + 2;
const SEND_FILE_MIN_PAYLOAD: usize = SEND_FILE_PREFIX_SIZE + FILE_NAME_FIELD_SIZE;

/// Errors produced while decoding a request header or payload.
///
/// Every variant maps to a 1607 generic-failure response at the
/// dispatcher boundary; the connection stays open.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("header too short: need {REQUEST_HEADER_SIZE} bytes, got {0}")]
    ShortHeader(usize),
    #[error("unknown opcode: {0}")]
    UnknownOpcode(u16),
    #[error("payload size mismatch for opcode {opcode}: expected {expected}, got {got}")]
    PayloadSizeMismatch {
        opcode: u16,
        expected: usize,
        got: usize,
    },
    #[error("fixed-width string field is not valid UTF-8")]
    InvalidUtf8,
}

/// Request opcodes. Values match the wire protocol exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Register = 825,
    SendPublicKey = 826,
    Reconnect = 827,
    SendFile = 828,
    CrcOk = 900,
    CrcNotOk = 901,
    CrcTerminate = 902,
}

impl Opcode {
    pub fn from_u16(code: u16) -> Option<Self> {
        match code {
            825 => Some(Self::Register),
            826 => Some(Self::SendPublicKey),
            827 => Some(Self::Reconnect),
            828 => Some(Self::SendFile),
            900 => Some(Self::CrcOk),
            901 => Some(Self::CrcNotOk),
            902 => Some(Self::CrcTerminate),
            _ => None,
        }
    }
}

/// Request header, fixed 23 bytes on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHeader {
    pub client_id: [u8; CLIENT_ID_SIZE],
    pub version: u8,
    pub code: u16,
    pub payload_size: u32,
}

impl RequestHeader {
    pub fn opcode(&self) -> Option<Opcode> {
        Opcode::from_u16(self.code)
    }

    pub fn client_id_hex(&self) -> String {
        hex::encode(self.client_id)
    }

    /// Decode a header from exactly `REQUEST_HEADER_SIZE` bytes.
    pub fn decode(mut data: &[u8]) -> Result<Self, CodecError> {
        if data.len() < REQUEST_HEADER_SIZE {
            return Err(CodecError::ShortHeader(data.len()));
        }
        let mut client_id = [0u8; CLIENT_ID_SIZE];
        data.copy_to_slice(&mut client_id);
        let version = data.get_u8();
        let code = data.get_u16_le();
        let payload_size = data.get_u32_le();
        Ok(Self {
            client_id,
            version,
            code,
            payload_size,
        })
    }

    /// Encode the header back to its 23-byte wire form.
    pub fn encode(&self) -> [u8; REQUEST_HEADER_SIZE] {
        let mut buf = BytesMut::with_capacity(REQUEST_HEADER_SIZE);
        buf.put_slice(&self.client_id);
        buf.put_u8(self.version);
        buf.put_u16_le(self.code);
        buf.put_u32_le(self.payload_size);
        let mut out = [0u8; REQUEST_HEADER_SIZE];
        out.copy_from_slice(&buf);
        out
    }
}

/// Decoded per-opcode request payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestPayload {
    Register {
        name: String,
    },
    SendPublicKey {
        name: String,
        public_key: Vec<u8>,
    },
    Reconnect {
        name: String,
    },
    SendFile {
        content_size: u32,
        original_file_size: u32,
        packet_number: u16,
        total_packets: u16,
        file_name: String,
        ciphertext: Vec<u8>,
    },
    CrcOk {
        file_name: String,
    },
    CrcNotOk {
        file_name: String,
    },
    CrcTerminate {
        file_name: String,
    },
}

/// Truncate a fixed-width zero-padded field at its first zero byte and
/// decode the remainder as UTF-8.
fn decode_fixed_string(field: &[u8]) -> Result<String, CodecError> {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8(field[..end].to_vec()).map_err(|_| CodecError::InvalidUtf8)
}

/// Zero-pad `s` into a fixed-width field, truncating if necessary.
fn encode_fixed_string(s: &str, width: usize) -> Vec<u8> {
    let mut field = vec![0u8; width];
    let bytes = s.as_bytes();
    let len = bytes.len().min(width);
    field[..len].copy_from_slice(&bytes[..len]);
    field
}

/// Decode the payload for `opcode` from exactly `payload.len()` bytes,
/// which must equal `header.payload_size`.
pub fn decode_request_payload(
    opcode: Opcode,
    payload: &[u8],
) -> Result<RequestPayload, CodecError> {
    match opcode {
        Opcode::Register => {
            expect_size(opcode, payload.len(), NAME_FIELD_SIZE)?;
            Ok(RequestPayload::Register {
                name: decode_fixed_string(&payload[..NAME_FIELD_SIZE])?,
            })
        }
        Opcode::SendPublicKey => {
            expect_size(
                opcode,
                payload.len(),
                NAME_FIELD_SIZE + PUBLIC_KEY_FIELD_SIZE,
            )?;
            let name = decode_fixed_string(&payload[..NAME_FIELD_SIZE])?;
            let public_key =
                payload[NAME_FIELD_SIZE..NAME_FIELD_SIZE + PUBLIC_KEY_FIELD_SIZE].to_vec();
            Ok(RequestPayload::SendPublicKey { name, public_key })
        }
        Opcode::Reconnect => {
            expect_size(opcode, payload.len(), NAME_FIELD_SIZE)?;
            Ok(RequestPayload::Reconnect {
                name: decode_fixed_string(&payload[..NAME_FIELD_SIZE])?,
            })
        }
        Opcode::SendFile => {
            if payload.len() < SEND_FILE_MIN_PAYLOAD {
                return Err(CodecError::PayloadSizeMismatch {
                    opcode: 828,
                    expected: SEND_FILE_MIN_PAYLOAD,
                    got: payload.len(),
                });
            }
            let mut cur = &payload[..SEND_FILE_PREFIX_SIZE];
            let content_size = cur.get_u32_le();
            let original_file_size = cur.get_u32_le();
            let packet_number = cur.get_u16_le();
            let total_packets = cur.get_u16_le();
            let file_name_start = SEND_FILE_PREFIX_SIZE;
            let file_name_end = file_name_start + FILE_NAME_FIELD_SIZE;
            let file_name = decode_fixed_string(&payload[file_name_start..file_name_end])?;
            let ciphertext = payload[file_name_end..].to_vec();
            Ok(RequestPayload::SendFile {
                content_size,
                original_file_size,
                packet_number,
                total_packets,
                file_name,
                ciphertext,
            })
        }
        Opcode::CrcOk => {
            expect_size(opcode, payload.len(), FILE_NAME_FIELD_SIZE)?;
            Ok(RequestPayload::CrcOk {
                file_name: decode_fixed_string(&payload[..FILE_NAME_FIELD_SIZE])?,
            })
        }
        Opcode::CrcNotOk => {
            expect_size(opcode, payload.len(), FILE_NAME_FIELD_SIZE)?;
            Ok(RequestPayload::CrcNotOk {
                file_name: decode_fixed_string(&payload[..FILE_NAME_FIELD_SIZE])?,
            })
        }
        Opcode::CrcTerminate => {
            expect_size(opcode, payload.len(), FILE_NAME_FIELD_SIZE)?;
            Ok(RequestPayload::CrcTerminate {
                file_name: decode_fixed_string(&payload[..FILE_NAME_FIELD_SIZE])?,
            })
        }
    }
}

fn expect_size(opcode: Opcode, got: usize, expected: usize) -> Result<(), CodecError> {
    if got != expected {
        return Err(CodecError::PayloadSizeMismatch {
            opcode: opcode as u16,
            expected,
            got,
        });
    }
    Ok(())
}

/// Response codes, as sent in the 7-byte response header.
pub mod response_code {
    pub const REGISTER_SUCCESS: u16 = 1600;
    pub const REGISTER_FAILURE: u16 = 1601;
    pub const SEND_AES: u16 = 1602;
    pub const ACCEPTED_FILE: u16 = 1603;
    pub const MESSAGE_CONFIRM: u16 = 1604;
    pub const RECONNECT_SUCCESS: u16 = 1605;
    pub const RECONNECT_FAILURE: u16 = 1606;
    pub const GENERIC_FAILURE: u16 = 1607;
}

/// Response header, fixed 7 bytes on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    pub version: u8,
    pub code: u16,
    pub payload_size: u32,
}

impl ResponseHeader {
    pub fn encode(&self) -> [u8; RESPONSE_HEADER_SIZE] {
        let mut buf = BytesMut::with_capacity(RESPONSE_HEADER_SIZE);
        buf.put_u8(self.version);
        buf.put_u16_le(self.code);
        buf.put_u32_le(self.payload_size);
        let mut out = [0u8; RESPONSE_HEADER_SIZE];
        out.copy_from_slice(&buf);
        out
    }

    pub fn decode(mut data: &[u8]) -> Result<Self, CodecError> {
        if data.len() < RESPONSE_HEADER_SIZE {
            return Err(CodecError::ShortHeader(data.len()));
        }
        let version = data.get_u8();
        let code = data.get_u16_le();
        let payload_size = data.get_u32_le();
        Ok(Self {
            version,
            code,
            payload_size,
        })
    }
}

/// A fully-formed response, ready to encode to wire bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    RegisterSuccess {
        client_id: [u8; CLIENT_ID_SIZE],
    },
    RegisterFailure,
    SendAes {
        client_id: [u8; CLIENT_ID_SIZE],
        encrypted_key: Vec<u8>,
    },
    AcceptedFile {
        client_id: [u8; CLIENT_ID_SIZE],
        content_size: u32,
        file_name: String,
        crc: u32,
    },
    MessageConfirm {
        client_id: [u8; CLIENT_ID_SIZE],
    },
    ReconnectSuccess {
        client_id: [u8; CLIENT_ID_SIZE],
        encrypted_key: Vec<u8>,
    },
    ReconnectFailure {
        client_id: [u8; CLIENT_ID_SIZE],
    },
    GenericFailure,
}

impl Response {
    fn code(&self) -> u16 {
        match self {
            Response::RegisterSuccess { .. } => response_code::REGISTER_SUCCESS,
            Response::RegisterFailure => response_code::REGISTER_FAILURE,
            Response::SendAes { .. } => response_code::SEND_AES,
            Response::AcceptedFile { .. } => response_code::ACCEPTED_FILE,
            Response::MessageConfirm { .. } => response_code::MESSAGE_CONFIRM,
            Response::ReconnectSuccess { .. } => response_code::RECONNECT_SUCCESS,
            Response::ReconnectFailure { .. } => response_code::RECONNECT_FAILURE,
            Response::GenericFailure => response_code::GENERIC_FAILURE,
        }
    }

    fn payload(&self) -> Vec<u8> {
        match self {
            Response::RegisterSuccess { client_id } => client_id.to_vec(),
            Response::RegisterFailure => Vec::new(),
            Response::SendAes {
                client_id,
                encrypted_key,
            } => {
                let mut buf = client_id.to_vec();
                buf.extend_from_slice(encrypted_key);
                buf
            }
            Response::AcceptedFile {
                client_id,
                content_size,
                file_name,
                crc,
            } => {
                let mut buf = BytesMut::with_capacity(
                    CLIENT_ID_SIZE + 4 + FILE_NAME_FIELD_SIZE + 4,
                );
                buf.put_slice(client_id);
                buf.put_u32_le(*content_size);
                buf.put_slice(&encode_fixed_string(file_name, FILE_NAME_FIELD_SIZE));
                buf.put_u32_le(*crc);
                buf.to_vec()
            }
            Response::MessageConfirm { client_id } => client_id.to_vec(),
            Response::ReconnectSuccess {
                client_id,
                encrypted_key,
            } => {
                let mut buf = client_id.to_vec();
                buf.extend_from_slice(encrypted_key);
                buf
            }
            Response::ReconnectFailure { client_id } => client_id.to_vec(),
            Response::GenericFailure => Vec::new(),
        }
    }

    /// Encode the full response (header + payload) to wire bytes.
    pub fn encode(&self, version: u8) -> Vec<u8> {
        let payload = self.payload();
        let header = ResponseHeader {
            version,
            code: self.code(),
            payload_size: payload.len() as u32,
        };
        let mut out = header.encode().to_vec();
        out.extend(payload);
        out
    }
}
