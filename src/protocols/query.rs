//! The GameSpy-style UDP query protocol: a challenge handshake followed by a
//! full stat request.

use std::{
    collections::HashMap,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
    time::Duration,
};

use tokio::net::UdpSocket;

use super::{ProbeError, with_io_timeout};

const MAGIC: [u8; 2] = [0xfe, 0xfd];
const TYPE_HANDSHAKE: u8 = 0x09;
const TYPE_STAT: u8 = 0x00;

/// The protocol ignores the high nibble of every byte in the session id.
const SESSION_ID_MASK: i32 = 0x0f0f_0f0f;

/// Type, session id, and the constant padding before the key-values start.
const FULL_STAT_HEADER_LEN: usize = 11;
const PLAYER_SECTION_MARKER: &[u8] = b"\x00\x01player_\x00\x00";

const MAX_DATAGRAM_LEN: usize = 16 * 1024;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryStatistics {
    pub values: HashMap<String, String>,
    pub plugins: Vec<String>,
}

impl QueryStatistics {
    /// The `server_mod` key, or whatever's before the plugin list if that
    /// isn't there.
    pub fn software(&self) -> Option<&str> {
        if let Some(software) = self.values.get("server_mod") {
            return Some(software);
        }
        self.values
            .get("plugins")
            .and_then(|p| p.split(':').next())
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    pub fn map_name(&self) -> Option<&str> {
        self.values.get("map").map(String::as_str)
    }
}

pub fn handshake_request(session_id: i32) -> Vec<u8> {
    let mut request = MAGIC.to_vec();
    request.push(TYPE_HANDSHAKE);
    request.extend_from_slice(&session_id.to_be_bytes());
    request
}

/// The challenge response is the type, the session id, and the token as a
/// NUL-terminated decimal string. Some servers don't care about the token, so
/// one that doesn't parse becomes 0 instead of an error.
pub fn parse_challenge_token(response: &[u8]) -> Result<i32, ProbeError> {
    if response.len() < 5 {
        return Err(ProbeError::decode(format!(
            "challenge response is only {} bytes",
            response.len()
        )));
    }
    let token = &response[5..];
    let token = match token.iter().position(|&b| b == 0) {
        Some(end) => &token[..end],
        None => token,
    };
    Ok(String::from_utf8_lossy(token)
        .trim()
        .parse::<i32>()
        .unwrap_or_default())
}

pub fn full_stat_request(session_id: i32, token: i32) -> Vec<u8> {
    let mut request = MAGIC.to_vec();
    request.push(TYPE_STAT);
    request.extend_from_slice(&session_id.to_be_bytes());
    request.extend_from_slice(&token.to_be_bytes());
    // padding, asks for the full stat instead of the basic one
    request.extend_from_slice(&[0x00; 4]);
    request
}

pub fn parse_full_stat(response: &[u8]) -> Result<QueryStatistics, ProbeError> {
    if response.len() < FULL_STAT_HEADER_LEN {
        return Err(ProbeError::decode(format!(
            "full stat response is only {} bytes",
            response.len()
        )));
    }
    let data = &response[FULL_STAT_HEADER_LEN..];

    let kv_section = match data
        .windows(PLAYER_SECTION_MARKER.len())
        .position(|w| w == PLAYER_SECTION_MARKER)
    {
        Some(marker) => &data[..marker],
        None => data,
    };

    let mut values = HashMap::new();
    let mut parts = kv_section.split(|&b| b == 0);
    while let (Some(key), Some(value)) = (parts.next(), parts.next()) {
        if key.is_empty() {
            break;
        }
        values.insert(
            String::from_utf8_lossy(key).into_owned(),
            String::from_utf8_lossy(value).into_owned(),
        );
    }

    let plugins = values
        .get("plugins")
        .map(|p| parse_plugins(p))
        .unwrap_or_default();

    Ok(QueryStatistics { values, plugins })
}

/// Plugins look like `"Paper on 1.20.1: WorldEdit 7.2; EssentialsX 2.20"`.
pub fn parse_plugins(value: &str) -> Vec<String> {
    let Some(list) = value.split(':').nth(1) else {
        return Vec::new();
    };
    list.split(';')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_owned)
        .collect()
}

pub async fn probe_query(addr: SocketAddr, limit: Duration) -> Result<QueryStatistics, ProbeError> {
    let bind_addr: SocketAddr = if addr.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let socket = UdpSocket::bind(bind_addr).await?;
    socket.connect(addr).await?;

    let session_id = rand::random::<i32>() & SESSION_ID_MASK;
    let mut buf = vec![0; MAX_DATAGRAM_LEN];

    let token = with_io_timeout(limit, async {
        socket.send(&handshake_request(session_id)).await?;
        let n = socket.recv(&mut buf).await?;
        parse_challenge_token(&buf[..n])
    })
    .await?;

    with_io_timeout(limit, async {
        socket.send(&full_stat_request(session_id, token)).await?;
        let n = socket.recv(&mut buf).await?;
        parse_full_stat(&buf[..n])
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::mock::{full_stat, query_server};

    const SESSION: [u8; 4] = [0x01, 0x02, 0x03, 0x04];

    fn stat_response(kv: &[(&str, &str)], players: &[&str]) -> Vec<u8> {
        let mut response = vec![TYPE_STAT];
        response.extend_from_slice(&SESSION);
        response.extend_from_slice(b"splitn");
        for (k, v) in kv {
            response.extend_from_slice(k.as_bytes());
            response.push(0);
            response.extend_from_slice(v.as_bytes());
            response.push(0);
        }
        // end of the key-values
        response.push(0);
        response.extend_from_slice(b"\x01player_\x00\x00");
        for p in players {
            response.extend_from_slice(p.as_bytes());
            response.push(0);
        }
        response.push(0);
        response
    }

    #[test]
    fn test_requests() {
        assert_eq!(
            handshake_request(0x01020304),
            vec![0xfe, 0xfd, 0x09, 0x01, 0x02, 0x03, 0x04]
        );
        assert_eq!(
            full_stat_request(0x01020304, 9513307),
            vec![
                0xfe, 0xfd, 0x00, 0x01, 0x02, 0x03, 0x04, 0x00, 0x91, 0x29, 0x5b, 0x00, 0x00,
                0x00, 0x00
            ]
        );
    }

    #[test]
    fn test_challenge_token() {
        let mut response = vec![0x09, 0x01, 0x02, 0x03, 0x04];
        response.extend_from_slice(b"9513307\0");
        assert_eq!(parse_challenge_token(&response).unwrap(), 9513307);

        let mut response = vec![0x09, 0x01, 0x02, 0x03, 0x04];
        response.extend_from_slice(b"-36424659\0");
        assert_eq!(parse_challenge_token(&response).unwrap(), -36424659);

        let mut response = vec![0x09, 0x01, 0x02, 0x03, 0x04];
        response.extend_from_slice(b"garbage\0");
        assert_eq!(parse_challenge_token(&response).unwrap(), 0);

        assert!(matches!(
            parse_challenge_token(&[0x09, 0x01]),
            Err(ProbeError::Decode(_))
        ));
    }

    #[test]
    fn test_parse_full_stat() {
        let response = stat_response(
            &[
                ("hostname", "A Minecraft Server"),
                ("server_mod", "Paper (MC: 1.20.1)"),
                ("map", "world"),
            ],
            &["Notch", "jeb_"],
        );
        let stats = parse_full_stat(&response).unwrap();
        assert_eq!(stats.software(), Some("Paper (MC: 1.20.1)"));
        assert_eq!(stats.map_name(), Some("world"));
        assert_eq!(stats.values["hostname"], "A Minecraft Server");
        assert_eq!(stats.values.len(), 3);
        assert!(stats.plugins.is_empty());
    }

    #[test]
    fn test_parse_full_stat_plugins() {
        let response = stat_response(
            &[
                ("hostname", "A Minecraft Server"),
                ("plugins", "Paper on 1.20.1: WorldEdit 7.2.15;  EssentialsX 2.20.1 ; ;LuckPerms"),
                ("map", "world"),
            ],
            &[],
        );
        let stats = parse_full_stat(&response).unwrap();
        assert_eq!(
            stats.plugins,
            vec!["WorldEdit 7.2.15", "EssentialsX 2.20.1", "LuckPerms"]
        );
        // falls back to the plugins prefix
        assert_eq!(stats.software(), Some("Paper on 1.20.1"));
    }

    #[test]
    fn test_parse_full_stat_vanilla_padding() {
        let response = full_stat(
            SESSION,
            &[
                ("hostname", "A Minecraft Server"),
                ("server_mod", "Paper (MC: 1.20.1)"),
                ("plugins", "Paper: WorldEdit; Vault"),
                ("map", "world"),
            ],
            &["Notch"],
        );
        assert_eq!(&response[5..16], b"splitnum\x00\x80\x00");

        let stats = parse_full_stat(&response).unwrap();
        assert_eq!(stats.software(), Some("Paper (MC: 1.20.1)"));
        assert_eq!(stats.map_name(), Some("world"));
        assert_eq!(stats.values["hostname"], "A Minecraft Server");
        assert_eq!(stats.plugins, vec!["WorldEdit", "Vault"]);
        // what's left of the padding shows up as one extra pair
        assert!(stats.values.contains_key("um"));
        assert_eq!(stats.values.len(), 5);
        assert!(!stats.values.contains_key("Notch"));
    }

    #[test]
    fn test_parse_plugins_without_list() {
        assert!(parse_plugins("CraftBukkit on Bukkit 1.2.5-R4.0").is_empty());
        assert!(parse_plugins("").is_empty());
    }

    #[test]
    fn test_parse_full_stat_without_marker() {
        let mut response = vec![TYPE_STAT];
        response.extend_from_slice(&SESSION);
        response.extend_from_slice(b"splitn");
        response.extend_from_slice(b"map\0world\0hostname");
        let stats = parse_full_stat(&response).unwrap();
        assert_eq!(stats.map_name(), Some("world"));
        // dangling key without a value
        assert!(!stats.values.contains_key("hostname"));

        assert!(matches!(
            parse_full_stat(&[0x00, 0x01, 0x02]),
            Err(ProbeError::Decode(_))
        ));
    }

    #[tokio::test]
    async fn test_probe_query_mock_server() {
        let response = stat_response(
            &[
                ("hostname", "A Minecraft Server"),
                ("server_mod", "Paper (MC: 1.20.1)"),
                ("map", "world"),
            ],
            &[],
        );
        let (addr, server) = query_server("987654321", response).await;

        let stats = probe_query(addr, Duration::from_secs(1)).await.unwrap();
        assert_eq!(stats.software(), Some("Paper (MC: 1.20.1)"));
        assert_eq!(stats.map_name(), Some("world"));

        let received = server.await.unwrap();
        let handshake = &received[0];
        assert_eq!(&handshake[..3], &[0xfe, 0xfd, 0x09]);
        let session = &handshake[3..7];
        for b in session {
            assert_eq!(b & 0xf0, 0);
        }
        let stat = &received[1];
        assert_eq!(stat.len(), 15);
        assert_eq!(&stat[..3], &[0xfe, 0xfd, 0x00]);
        assert_eq!(&stat[3..7], session);
        assert_eq!(&stat[7..11], &987654321i32.to_be_bytes());
        assert_eq!(&stat[11..], &[0, 0, 0, 0]);
    }

    #[tokio::test]
    async fn test_probe_query_no_answer() {
        // bound but never answers
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        assert!(matches!(
            probe_query(addr, Duration::from_millis(100)).await,
            Err(ProbeError::ReadTimeout)
        ));
    }
}
