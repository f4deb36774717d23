//! Starts a login with a throwaway account to find out whether the server has
//! a whitelist.

use std::net::SocketAddr;

use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use super::{
    ProbeError, ProbeTimeouts,
    codec::{frame, handshake, read_packet, read_string, write_string},
    connect, with_io_timeout,
};

const LOGIN_STATE: i32 = 2;
const LOGIN_START_ID: u8 = 0x00;
const DISCONNECT_ID: i32 = 0x00;

pub const PROBE_USERNAME: &str = "McCrawler";
const PROBE_UUID: Uuid = Uuid::from_u128(0xdeadbeef_deadbeef_deadbeef_deadbeef);

/// 1.20.2, the uuid became mandatory
const PROTOCOL_MANDATORY_UUID: i32 = 764;
/// 1.19, the uuid was added as an optional field
const PROTOCOL_OPTIONAL_UUID: i32 = 759;

/// Build the login start payload for the given protocol version, since its
/// layout changed a couple of times.
pub fn login_start(protocol: i32) -> Vec<u8> {
    let mut buffer = vec![LOGIN_START_ID];
    write_string(&mut buffer, PROBE_USERNAME);
    if protocol >= PROTOCOL_MANDATORY_UUID {
        buffer.extend_from_slice(PROBE_UUID.as_bytes());
    } else if protocol >= PROTOCOL_OPTIONAL_UUID {
        // has uuid
        buffer.push(0x01);
        buffer.extend_from_slice(PROBE_UUID.as_bytes());
    }
    buffer
}

pub fn is_whitelist_reason(reason: &str) -> bool {
    let reason = reason.to_lowercase();
    reason.contains("whitelist") || reason.contains("not on the list")
}

/// Returns whether the server kicked us for not being whitelisted. Anything
/// other than a disconnect (usually an encryption request) means we would've
/// been let in.
pub async fn probe_login(
    addr: SocketAddr,
    protocol: i32,
    timeouts: &ProbeTimeouts,
) -> Result<bool, ProbeError> {
    let mut stream = connect(addr, timeouts.connect).await?;
    let host = addr.ip().to_string();

    with_io_timeout(timeouts.read, async {
        let mut request = frame(&handshake(&host, addr.port(), protocol, LOGIN_STATE));
        request.extend_from_slice(&frame(&login_start(protocol)));
        stream.write_all(&request).await?;

        let packet = read_packet(&mut stream).await?;
        if packet.id != DISCONNECT_ID {
            return Ok::<_, ProbeError>(false);
        }
        let reason = read_string(&mut packet.body.as_slice())?;
        Ok(is_whitelist_reason(&reason))
    })
    .await
}
