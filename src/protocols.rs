pub mod codec;
pub mod login;
pub mod query;
pub mod rcon;
pub mod status;

#[cfg(test)]
pub(crate) mod mock;

use std::{future::Future, io, time::Duration};

use tokio::{net::TcpStream, time::timeout};

pub use login::probe_login;
pub use query::{QueryStatistics, probe_query};
pub use rcon::probe_rcon;
pub use status::{StatusResponse, probe_status};

/// How long each phase may block on the network. A timeout is a normal
/// outcome for a probe, not something that gets retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeTimeouts {
    pub connect: Duration,
    pub read: Duration,
    /// Applies to each leg of the UDP query exchange separately.
    pub query: Duration,
}

impl Default for ProbeTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(4),
            read: Duration::from_secs(4),
            query: Duration::from_secs(2),
        }
    }
}

/// Everything that can end a single probe phase.
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("timed out while connecting")]
    ConnectTimeout,
    #[error("timed out while waiting for a response")]
    ReadTimeout,
    #[error("varint is longer than 5 bytes")]
    MalformedVarInt,
    #[error("expected packet id {expected:#04x}, got {found:#04x}")]
    ProtocolMismatch { expected: i32, found: i32 },
    #[error("couldn't decode response: {0}")]
    Decode(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ProbeError {
    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }
}

/// Open a TCP connection, failing with [`ProbeError::ConnectTimeout`] if it
/// takes longer than `limit`.
pub async fn connect(addr: std::net::SocketAddr, limit: Duration) -> Result<TcpStream, ProbeError> {
    let stream = timeout(limit, TcpStream::connect(addr))
        .await
        .map_err(|_| ProbeError::ConnectTimeout)??;
    // the handshake is tiny and we want it on the wire immediately
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Run an io future, mapping an elapsed deadline to
/// [`ProbeError::ReadTimeout`].
pub async fn with_io_timeout<T, F>(limit: Duration, fut: F) -> Result<T, ProbeError>
where
    F: Future<Output = Result<T, ProbeError>>,
{
    timeout(limit, fut)
        .await
        .map_err(|_| ProbeError::ReadTimeout)?
}

/// Strip NUL bytes, which servers sometimes put in text fields and which we
/// don't want in the database.
pub fn sanitize_text(s: &str) -> String {
    s.replace('\0', "")
}
