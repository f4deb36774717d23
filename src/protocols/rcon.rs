//! Checks whether something is listening for RCON. We never actually log in,
//! so the password is always empty.

use std::net::SocketAddr;

use tokio::io::AsyncWriteExt;

use super::{ProbeError, ProbeTimeouts, connect, with_io_timeout};

pub const DEFAULT_RCON_PORT: u16 = 25575;

const LOGIN_TYPE: i32 = 3;
const PROBE_REQUEST_ID: i32 = 1;

/// RCON packets are little-endian, `length || request id || type || payload ||
/// 0x00 0x00`, where the length counts everything after itself.
pub fn login_packet(request_id: i32, password: &str) -> Vec<u8> {
    let length = (4 + 4 + password.len() + 2) as i32;
    let mut packet = Vec::with_capacity(4 + length as usize);
    packet.extend_from_slice(&length.to_le_bytes());
    packet.extend_from_slice(&request_id.to_le_bytes());
    packet.extend_from_slice(&LOGIN_TYPE.to_le_bytes());
    packet.extend_from_slice(password.as_bytes());
    packet.extend_from_slice(&[0x00, 0x00]);
    packet
}

/// Succeeds if we could connect and send a login packet. This says nothing
/// about whether the login would have worked.
pub async fn probe_rcon(addr: SocketAddr, timeouts: &ProbeTimeouts) -> Result<(), ProbeError> {
    let mut stream = connect(addr, timeouts.connect).await?;
    with_io_timeout(timeouts.read, async {
        stream.write_all(&login_packet(PROBE_REQUEST_ID, "")).await?;
        stream.flush().await?;
        Ok::<_, ProbeError>(())
    })
    .await
}
