//! Binary codec for encoding and decoding GroupLink envelopes.
//!
//! Wire format:
//! ```text
//! [version:1][kind:1][reserved:2][body_len:4][body:N]
//! body = [sender_id:str16][sender_name:str16][payload_len:4][payload]
//! str16 = [len:2][utf-8 bytes]
//! ```
//! Header size: 8 bytes. All multi-byte integers are big-endian.
//!
//! Device descriptors inside Join/Leave/SyncSet payloads are encoded as:
//! ```text
//! [id:str16][display_name:str16][has_endpoint:1]([family:1][ip:4|16][port:2])?
//! ```
//! and a SyncSet payload is `[count:2][descriptor]*count`.
//!
//! Each connection carries exactly one envelope, so [`decode_envelope`]
//! expects the whole byte stream and rejects trailing bytes.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use thiserror::Error;

use crate::domain::device::{Device, DeviceId};
use crate::protocol::envelope::{Envelope, EnvelopeKind, HEADER_SIZE, PROTOCOL_VERSION};

/// Errors that can occur during envelope encoding or decoding.
///
/// Every decode variant means the bytes on the connection were a malformed
/// envelope; the listener logs the variant and discards the connection.
#[derive(Debug, Error, PartialEq)]
pub enum ProtocolError {
    /// The byte slice is shorter than the header.
    #[error("insufficient data: need at least {needed} bytes, got {available}")]
    InsufficientData { needed: usize, available: usize },

    /// The protocol version in the header is not supported.
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    /// The kind byte in the header is not a recognized value.
    #[error("unknown envelope kind: 0x{0:02X}")]
    UnknownKind(u8),

    /// The header's body length does not match the bytes that followed it.
    #[error("body length mismatch: header says {declared}, stream carried {available}")]
    LengthMismatch { declared: usize, available: usize },

    /// The body or payload could not be parsed.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// A field is too large to be represented on the wire.
    #[error("{field} is {len} bytes long; the wire limit is {max}")]
    FieldTooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },
}

const IPV4_FAMILY: u8 = 4;
const IPV6_FAMILY: u8 = 6;

// ── Public API ────────────────────────────────────────────────────────────────

/// Encodes an [`Envelope`] into a byte vector including the 8-byte header.
///
/// # Errors
///
/// Returns [`ProtocolError::FieldTooLong`] if a string exceeds `u16::MAX`
/// bytes or the payload exceeds `u32::MAX` bytes.
///
/// # Examples
///
/// ```rust
/// use grouplink_core::{decode_envelope, encode_envelope, Device, Envelope};
///
/// let sender = Device::new("aa:bb:cc:00:11:22", "kitchen-tablet");
/// let envelope = Envelope::data(&sender, b"hello".to_vec());
/// let bytes = encode_envelope(&envelope).unwrap();
/// assert_eq!(decode_envelope(&bytes).unwrap(), envelope);
/// ```
pub fn encode_envelope(envelope: &Envelope) -> Result<Vec<u8>, ProtocolError> {
    let mut body = Vec::with_capacity(
        4 + envelope.sender_id.as_str().len()
            + envelope.sender_name.len()
            + 4
            + envelope.payload.len(),
    );
    write_str16(&mut body, envelope.sender_id.as_str(), "sender id")?;
    write_str16(&mut body, &envelope.sender_name, "sender name")?;
    let payload_len = checked_u32(envelope.payload.len(), "payload")?;
    body.extend_from_slice(&payload_len.to_be_bytes());
    body.extend_from_slice(&envelope.payload);

    let body_len = checked_u32(body.len(), "envelope body")?;

    let mut buf = Vec::with_capacity(HEADER_SIZE + body.len());
    buf.push(PROTOCOL_VERSION);
    buf.push(envelope.kind as u8);
    buf.push(0x00); // reserved
    buf.push(0x00); // reserved
    buf.extend_from_slice(&body_len.to_be_bytes());
    buf.extend_from_slice(&body);
    Ok(buf)
}

/// Decodes one [`Envelope`] occupying all of `bytes`.
///
/// Join, Leave, and SyncSet payloads are validated here as well, so a
/// successfully decoded envelope always has a payload matching its kind.
///
/// # Errors
///
/// Returns [`ProtocolError`] if the bytes are not exactly one well-formed
/// envelope.
pub fn decode_envelope(bytes: &[u8]) -> Result<Envelope, ProtocolError> {
    if bytes.len() < HEADER_SIZE {
        return Err(ProtocolError::InsufficientData {
            needed: HEADER_SIZE,
            available: bytes.len(),
        });
    }

    let version = bytes[0];
    if version != PROTOCOL_VERSION {
        return Err(ProtocolError::UnsupportedVersion(version));
    }

    let kind_byte = bytes[1];
    let kind =
        EnvelopeKind::try_from(kind_byte).map_err(|_| ProtocolError::UnknownKind(kind_byte))?;

    // bytes[2..4] are reserved – ignored on decode

    let body_len = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;
    let available = bytes.len() - HEADER_SIZE;
    if available != body_len {
        return Err(ProtocolError::LengthMismatch {
            declared: body_len,
            available,
        });
    }

    let body = &bytes[HEADER_SIZE..];
    let (sender_id, off) = read_str16(body, 0, "sender id")?;
    if sender_id.is_empty() {
        return Err(ProtocolError::MalformedPayload("empty sender id".to_string()));
    }
    let (sender_name, off) = read_str16(body, off, "sender name")?;
    let payload_len = read_u32(body, off, "payload length")? as usize;
    let payload_start = off + 4;
    if body.len() != payload_start + payload_len {
        return Err(ProtocolError::MalformedPayload(format!(
            "payload declares {payload_len} bytes, body has {} after the length field",
            body.len() - payload_start
        )));
    }

    let envelope = Envelope {
        kind,
        sender_id: DeviceId::new(sender_id),
        sender_name,
        payload: body[payload_start..].to_vec(),
    };

    match kind {
        EnvelopeKind::Join | EnvelopeKind::Leave => {
            decode_device_payload(&envelope.payload)?;
        }
        EnvelopeKind::SyncSet => {
            decode_device_list_payload(&envelope.payload)?;
        }
        EnvelopeKind::Data => {}
    }

    Ok(envelope)
}

// ── Device payloads ───────────────────────────────────────────────────────────

/// Encodes a single device descriptor as a Join/Leave payload.
pub(crate) fn encode_device_payload(device: &Device) -> Result<Vec<u8>, ProtocolError> {
    let mut buf = Vec::new();
    encode_device(&mut buf, device)?;
    Ok(buf)
}

/// Decodes a Join/Leave payload; the descriptor must occupy all bytes.
pub(crate) fn decode_device_payload(p: &[u8]) -> Result<Device, ProtocolError> {
    let (device, end) = decode_device(p, 0)?;
    require_consumed(p, end, "device payload")?;
    Ok(device)
}

/// Encodes a SyncSet payload, preserving the order of `devices`.
pub(crate) fn encode_device_list_payload(devices: &[Device]) -> Result<Vec<u8>, ProtocolError> {
    if devices.len() > u16::MAX as usize {
        return Err(ProtocolError::FieldTooLong {
            field: "device list",
            len: devices.len(),
            max: u16::MAX as usize,
        });
    }
    let mut buf = Vec::new();
    buf.extend_from_slice(&(devices.len() as u16).to_be_bytes());
    for device in devices {
        encode_device(&mut buf, device)?;
    }
    Ok(buf)
}

/// Decodes a SyncSet payload.
pub(crate) fn decode_device_list_payload(p: &[u8]) -> Result<Vec<Device>, ProtocolError> {
    require_len(p, 2, "SyncSet count")?;
    let count = u16::from_be_bytes([p[0], p[1]]) as usize;
    let mut devices = Vec::with_capacity(count.min(p.len() / 5));
    let mut off = 2;
    for _ in 0..count {
        let (device, end) = decode_device(p, off)?;
        devices.push(device);
        off = end;
    }
    require_consumed(p, off, "SyncSet payload")?;
    Ok(devices)
}

fn encode_device(buf: &mut Vec<u8>, device: &Device) -> Result<(), ProtocolError> {
    write_str16(buf, device.id.as_str(), "device id")?;
    write_str16(buf, &device.display_name, "display name")?;
    match device.endpoint {
        None => buf.push(0x00),
        Some(addr) => {
            buf.push(0x01);
            match addr.ip() {
                IpAddr::V4(ip) => {
                    buf.push(IPV4_FAMILY);
                    buf.extend_from_slice(&ip.octets());
                }
                IpAddr::V6(ip) => {
                    buf.push(IPV6_FAMILY);
                    buf.extend_from_slice(&ip.octets());
                }
            }
            buf.extend_from_slice(&addr.port().to_be_bytes());
        }
    }
    Ok(())
}

/// Decodes one descriptor starting at `offset`; returns it and the offset of
/// the byte after it.
fn decode_device(p: &[u8], offset: usize) -> Result<(Device, usize), ProtocolError> {
    let (id, off) = read_str16(p, offset, "device id")?;
    if id.is_empty() {
        return Err(ProtocolError::MalformedPayload("empty device id".to_string()));
    }
    let (display_name, off) = read_str16(p, off, "display name")?;
    require_len(p, off + 1, "endpoint flag")?;
    let (endpoint, end) = match p[off] {
        0x00 => (None, off + 1),
        0x01 => {
            let (addr, end) = read_socket_addr(p, off + 1)?;
            (Some(addr), end)
        }
        flag => {
            return Err(ProtocolError::MalformedPayload(format!(
                "invalid endpoint flag: {flag}"
            )))
        }
    };
    Ok((
        Device {
            id: DeviceId::new(id),
            display_name,
            endpoint,
        },
        end,
    ))
}

fn read_socket_addr(p: &[u8], offset: usize) -> Result<(SocketAddr, usize), ProtocolError> {
    require_len(p, offset + 1, "address family")?;
    let (ip, port_off) = match p[offset] {
        IPV4_FAMILY => {
            let start = offset + 1;
            require_len(p, start + 4, "IPv4 address")?;
            let octets: [u8; 4] = [p[start], p[start + 1], p[start + 2], p[start + 3]];
            (IpAddr::V4(Ipv4Addr::from(octets)), start + 4)
        }
        IPV6_FAMILY => {
            let start = offset + 1;
            require_len(p, start + 16, "IPv6 address")?;
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&p[start..start + 16]);
            (IpAddr::V6(Ipv6Addr::from(octets)), start + 16)
        }
        family => {
            return Err(ProtocolError::MalformedPayload(format!(
                "unknown address family: {family}"
            )))
        }
    };
    require_len(p, port_off + 2, "port")?;
    let port = u16::from_be_bytes([p[port_off], p[port_off + 1]]);
    Ok((SocketAddr::new(ip, port), port_off + 2))
}

// ── Utility helpers ───────────────────────────────────────────────────────────

fn require_len(buf: &[u8], needed: usize, context: &str) -> Result<(), ProtocolError> {
    if buf.len() < needed {
        Err(ProtocolError::MalformedPayload(format!(
            "{context}: need {needed} bytes, got {}",
            buf.len()
        )))
    } else {
        Ok(())
    }
}

fn require_consumed(buf: &[u8], end: usize, context: &str) -> Result<(), ProtocolError> {
    if end != buf.len() {
        Err(ProtocolError::MalformedPayload(format!(
            "{context}: {} trailing bytes",
            buf.len() - end
        )))
    } else {
        Ok(())
    }
}

fn checked_u32(len: usize, field: &'static str) -> Result<u32, ProtocolError> {
    u32::try_from(len).map_err(|_| ProtocolError::FieldTooLong {
        field,
        len,
        max: u32::MAX as usize,
    })
}

fn read_u32(buf: &[u8], offset: usize, context: &str) -> Result<u32, ProtocolError> {
    require_len(buf, offset + 4, context)?;
    Ok(u32::from_be_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ]))
}

/// Writes a 2-byte length prefix followed by the UTF-8 string bytes.
fn write_str16(buf: &mut Vec<u8>, s: &str, field: &'static str) -> Result<(), ProtocolError> {
    let bytes = s.as_bytes();
    if bytes.len() > u16::MAX as usize {
        return Err(ProtocolError::FieldTooLong {
            field,
            len: bytes.len(),
            max: u16::MAX as usize,
        });
    }
    buf.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
    buf.extend_from_slice(bytes);
    Ok(())
}

/// Reads a 2-byte length prefix and then that many UTF-8 bytes.
/// Returns the string and the offset of the byte after the string.
fn read_str16(buf: &[u8], offset: usize, context: &str) -> Result<(String, usize), ProtocolError> {
    require_len(buf, offset + 2, context)?;
    let len = u16::from_be_bytes([buf[offset], buf[offset + 1]]) as usize;
    let start = offset + 2;
    if buf.len() < start + len {
        return Err(ProtocolError::MalformedPayload(format!(
            "{context}: string of length {len} at offset {start} exceeds buffer"
        )));
    }
    let s = std::str::from_utf8(&buf[start..start + len])
        .map_err(|e| ProtocolError::MalformedPayload(format!("{context}: invalid UTF-8: {e}")))?
        .to_string();
    Ok((s, start + len))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
