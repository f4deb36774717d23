//! Server list ping: handshake with next state 1, then a status request.

use std::{collections::BTreeMap, net::SocketAddr};

use base64::{Engine, engine::general_purpose::STANDARD};
use serde::Deserialize;
use simd_json::{
    OwnedValue,
    derived::{ValueObjectAccess, ValueObjectAccessAsArray, ValueObjectAccessAsScalar},
};
use tokio::io::AsyncWriteExt;

use super::{
    ProbeError, ProbeTimeouts,
    codec::{frame, handshake, read_packet, read_string},
    connect, sanitize_text, with_io_timeout,
};

const STATUS_STATE: i32 = 1;
const STATUS_REQUEST_ID: u8 = 0x00;
const STATUS_RESPONSE_ID: i32 = 0x00;

const FAVICON_PREFIX: &str = "data:image/png;base64,";

/// The parts of a status response that we keep. Servers control this JSON
/// completely, so every field has a default and nothing in here fails the
/// decode except the payload not being a JSON object at all.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusResponse {
    pub version_name: String,
    pub protocol: i32,
    pub players_online: i32,
    pub players_max: i32,
    /// Plain text version of the description, if there was one.
    pub motd: Option<String>,
    /// Decoded PNG bytes.
    pub favicon: Option<Vec<u8>>,
    pub enforces_secure_chat: bool,
    /// Mod id to version, from forge's `forgeData` or the older `modinfo`.
    pub mods: BTreeMap<String, String>,
}

pub async fn probe_status(
    addr: SocketAddr,
    protocol_version: i32,
    timeouts: &ProbeTimeouts,
) -> Result<StatusResponse, ProbeError> {
    let mut stream = connect(addr, timeouts.connect).await?;
    let host = addr.ip().to_string();

    let json = with_io_timeout(timeouts.read, async {
        let mut request = frame(&handshake(
            &host,
            addr.port(),
            protocol_version,
            STATUS_STATE,
        ));
        request.extend_from_slice(&frame(&[STATUS_REQUEST_ID]));
        stream.write_all(&request).await?;

        let packet = read_packet(&mut stream).await?;
        if packet.id != STATUS_RESPONSE_ID {
            return Err(ProbeError::ProtocolMismatch {
                expected: STATUS_RESPONSE_ID,
                found: packet.id,
            });
        }
        read_string(&mut packet.body.as_slice())
    })
    .await?;

    parse_status_json(json)
}

pub fn parse_status_json(json: String) -> Result<StatusResponse, ProbeError> {
    let mut data = json.into_bytes();
    let v = simd_json::to_owned_value(&mut data)
        .map_err(|err| ProbeError::decode(format!("invalid status json: {err}")))?;
    if !matches!(v, OwnedValue::Object(_)) {
        return Err(ProbeError::decode("status json isn't an object"));
    }

    let version = v.get("version");
    let version_name = version
        .get_str("name")
        .map(sanitize_text)
        .unwrap_or_default();
    let protocol = version.get_i32("protocol").unwrap_or_default();

    let players = v.get("players");
    let players_online = players.get_i32("online").unwrap_or_default();
    let players_max = players.get_i32("max").unwrap_or_default();

    // the description is either a string or a chat component, we just want it
    // readable
    let motd = v.get("description").map(|description| {
        sanitize_text(
            &azalea_chat::FormattedText::deserialize(description)
                .unwrap_or_default()
                .to_string(),
        )
    });

    let favicon = v
        .get_str("favicon")
        .and_then(|f| f.strip_prefix(FAVICON_PREFIX))
        // a broken favicon isn't a reason to throw away the rest
        .and_then(|b64| STANDARD.decode(b64.trim()).ok());

    let enforces_secure_chat = v.get_bool("enforcesSecureChat").unwrap_or_default();

    let mut mods = BTreeMap::new();
    let forge_data = v.get("forgeData");
    let modinfo = v.get("modinfo");
    let forge_mods = forge_data.get_array("mods");
    let legacy_mods = modinfo.get_array("modList");
    for m in forge_mods.into_iter().chain(legacy_mods).flatten() {
        let Some(mod_id) = m.get_str("modId").or_else(|| m.get_str("modid")) else {
            continue;
        };
        let version = m
            .get_str("version")
            .or_else(|| m.get_str("modmarker"))
            .unwrap_or_default();
        mods.insert(sanitize_text(mod_id), sanitize_text(version));
    }

    Ok(StatusResponse {
        version_name,
        protocol,
        players_online,
        players_max,
        motd,
        favicon,
        enforces_secure_chat,
        mods,
    })
}
