//! VarInts and length-prefixed packet framing for the Minecraft TCP protocol.

use std::io::Read;

use tokio::io::{AsyncRead, AsyncReadExt};

use super::ProbeError;

/// VarInts are never longer than 5 bytes.
pub const MAX_VARINT_LEN: usize = 5;

/// Anything bigger than this is almost certainly not a Minecraft server (the
/// vanilla client caps its packets at 2 MiB too).
pub const MAX_PACKET_LEN: i32 = 2 * 1024 * 1024;

pub fn write_varint(writer: &mut Vec<u8>, value: i32) {
    // negative numbers are encoded as their two's complement, which always
    // takes 5 bytes
    let mut value = value as u32;
    loop {
        if value & !0x7f == 0 {
            writer.push(value as u8);
            return;
        }
        writer.push((value & 0x7f) as u8 | 0x80);
        value >>= 7;
    }
}

pub fn read_varint(reader: &mut impl Read) -> Result<i32, ProbeError> {
    let mut buffer = [0];
    let mut ans: u32 = 0;
    for i in 0..MAX_VARINT_LEN {
        reader.read_exact(&mut buffer)?;
        ans |= ((buffer[0] & 0x7f) as u32) << (7 * i);
        if buffer[0] & 0x80 == 0 {
            return Ok(ans as i32);
        }
    }
    Err(ProbeError::MalformedVarInt)
}

pub async fn read_varint_async<R>(reader: &mut R) -> Result<i32, ProbeError>
where
    R: AsyncRead + Unpin,
{
    let mut ans: u32 = 0;
    for i in 0..MAX_VARINT_LEN {
        let byte = reader.read_u8().await?;
        ans |= ((byte & 0x7f) as u32) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(ans as i32);
        }
    }
    Err(ProbeError::MalformedVarInt)
}

/// Write a VarInt-prefixed UTF-8 string.
pub fn write_string(writer: &mut Vec<u8>, s: &str) {
    write_varint(writer, s.len() as i32);
    writer.extend_from_slice(s.as_bytes());
}

/// Read a VarInt-prefixed string from an already-received packet body.
/// Invalid UTF-8 is replaced rather than rejected.
pub fn read_string(reader: &mut &[u8]) -> Result<String, ProbeError> {
    let len = read_varint(reader)?;
    if len < 0 || len as usize > reader.len() {
        return Err(ProbeError::decode(format!(
            "string length {len} doesn't fit in the packet"
        )));
    }
    let (string, rest) = reader.split_at(len as usize);
    *reader = rest;
    Ok(String::from_utf8_lossy(string).into_owned())
}

/// Prefix a payload (which already starts with its packet id) with its length.
pub fn frame(payload: &[u8]) -> Vec<u8> {
    let mut framed = Vec::with_capacity(payload.len() + MAX_VARINT_LEN);
    write_varint(&mut framed, payload.len() as i32);
    framed.extend_from_slice(payload);
    framed
}

/// A packet that was read off the wire, with its id already split off.
#[derive(Debug)]
pub struct Packet {
    pub id: i32,
    pub body: Vec<u8>,
}

/// Read one length-prefixed packet. The whole packet is buffered before it's
/// returned, so callers never see a partial body.
pub async fn read_packet<R>(reader: &mut R) -> Result<Packet, ProbeError>
where
    R: AsyncRead + Unpin,
{
    let length = read_varint_async(reader).await?;
    if length <= 0 || length > MAX_PACKET_LEN {
        return Err(ProbeError::decode(format!("invalid packet length {length}")));
    }
    let mut data = vec![0; length as usize];
    reader.read_exact(&mut data).await?;

    let mut cursor = data.as_slice();
    let id = read_varint(&mut cursor)?;
    let id_len = data.len() - cursor.len();
    data.drain(..id_len);

    Ok(Packet { id, body: data })
}

/// Build the handshake packet payload (without the length prefix).
pub fn handshake(host: &str, port: u16, protocol_version: i32, next_state: i32) -> Vec<u8> {
    let mut buffer = vec![
        // 0 for handshake packet
        0x00,
    ];
    write_varint(&mut buffer, protocol_version);
    // some server implementations require hostname and port to be properly set
    // (notchian does not)
    write_string(&mut buffer, host);
    buffer.extend_from_slice(&port.to_be_bytes());
    write_varint(&mut buffer, next_state);
    buffer
}
