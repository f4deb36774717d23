//! Runs the protocol phases for one candidate and folds them into a single
//! [`ServerRecord`].

use std::{
    collections::BTreeMap,
    future::Future,
    net::{IpAddr, SocketAddr},
};

use chrono::{DateTime, Utc};
use tracing::{debug, trace};

use crate::{
    protocols::{
        ProbeError, ProbeTimeouts, probe_login, probe_query, probe_rcon, probe_status,
        rcon::DEFAULT_RCON_PORT,
    },
    scanner::Candidate,
};

/// What we found out about one server. Built once at the end of a probe and
/// never changed afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerRecord {
    pub ip: IpAddr,
    pub port: u16,
    pub timestamp: DateTime<Utc>,
    pub version_name: String,
    pub protocol: i32,
    pub motd: Option<String>,
    pub players_online: i32,
    pub players_max: i32,
    pub favicon: Option<Vec<u8>>,
    pub mods: BTreeMap<String, String>,
    pub plugins: Vec<String>,
    pub software: String,
    pub is_whitelisted: bool,
    pub enforces_secure_chat: bool,
    pub rcon_open: bool,
}

impl ServerRecord {
    /// A record with only the address filled in.
    pub fn empty(ip: IpAddr, port: u16) -> Self {
        Self {
            ip,
            port,
            timestamp: Utc::now(),
            version_name: String::new(),
            protocol: 0,
            motd: None,
            players_online: 0,
            players_max: 0,
            favicon: None,
            mods: BTreeMap::new(),
            plugins: Vec::new(),
            software: String::new(),
            is_whitelisted: false,
            enforces_secure_chat: false,
            rcon_open: false,
        }
    }
}

/// Something that turns a candidate into a record, or fails. The scan pipeline
/// only knows about this trait, which keeps it testable without a network.
pub trait Probe: Send + Sync + 'static {
    fn probe(
        &self,
        candidate: Candidate,
    ) -> impl Future<Output = Result<ServerRecord, ProbeError>> + Send;
}

#[derive(Debug, Clone)]
pub struct ProbeSettings {
    /// The protocol version we claim in the status handshake. Servers reply
    /// with their own version, so this doesn't need to match.
    pub protocol_version: i32,
    pub timeouts: ProbeTimeouts,
    pub rcon_port: u16,
    pub login: bool,
    pub query: bool,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            protocol_version: 763,
            timeouts: ProbeTimeouts::default(),
            rcon_port: DEFAULT_RCON_PORT,
            login: true,
            query: true,
        }
    }
}

/// The real prober, speaking the Minecraft protocols.
#[derive(Debug, Clone, Default)]
pub struct MinecraftProber {
    pub settings: ProbeSettings,
}

impl MinecraftProber {
    pub fn new(settings: ProbeSettings) -> Self {
        Self { settings }
    }

    async fn probe_rcon_only(&self, addr: SocketAddr) -> Result<ServerRecord, ProbeError> {
        probe_rcon(addr, &self.settings.timeouts).await?;
        Ok(ServerRecord {
            software: "RCON Service".to_string(),
            rcon_open: true,
            ..ServerRecord::empty(addr.ip(), addr.port())
        })
    }

    async fn probe_minecraft(&self, addr: SocketAddr) -> Result<ServerRecord, ProbeError> {
        let settings = &self.settings;

        // if this fails then it's not a server we care about
        let status = probe_status(addr, settings.protocol_version, &settings.timeouts).await?;

        let is_whitelisted = if settings.login {
            match probe_login(addr, status.protocol, &settings.timeouts).await {
                Ok(is_whitelisted) => is_whitelisted,
                Err(err) => {
                    debug!("login phase failed for {addr}: {err}");
                    false
                }
            }
        } else {
            false
        };

        let query = if settings.query {
            match probe_query(addr, settings.timeouts.query).await {
                Ok(query) => Some(query),
                Err(err) => {
                    // most servers don't have query enabled
                    trace!("query phase failed for {addr}: {err}");
                    None
                }
            }
        } else {
            None
        };

        let (software, plugins) = match query {
            Some(query) => (
                query.software().unwrap_or_default().to_string(),
                query.plugins,
            ),
            None => (String::new(), Vec::new()),
        };

        Ok(ServerRecord {
            ip: addr.ip(),
            port: addr.port(),
            timestamp: Utc::now(),
            version_name: status.version_name,
            protocol: status.protocol,
            motd: status.motd,
            players_online: status.players_online,
            players_max: status.players_max,
            favicon: status.favicon,
            mods: status.mods,
            plugins,
            software,
            is_whitelisted,
            enforces_secure_chat: status.enforces_secure_chat,
            rcon_open: false,
        })
    }
}

impl Probe for MinecraftProber {
    async fn probe(&self, candidate: Candidate) -> Result<ServerRecord, ProbeError> {
        let addr = candidate.addr();
        if candidate.port == self.settings.rcon_port {
            self.probe_rcon_only(addr).await
        } else {
            self.probe_minecraft(addr).await
        }
    }
}
