//! Fake Minecraft servers for tests.

use std::{net::SocketAddr, time::Duration};

use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener, UdpSocket},
    task::JoinHandle,
};

use super::codec::{Packet, frame, read_packet, write_string};

/// A TCP server that answers one connection per canned response. On each
/// connection it reads the handshake plus the packet after it, sends the
/// response payload (framed), and hangs up.
pub struct MockServer {
    pub addr: SocketAddr,
    handle: JoinHandle<Vec<Vec<Packet>>>,
}

impl MockServer {
    pub async fn start(responses: Vec<Vec<u8>>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let mut received = Vec::new();
            for response in responses {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                let mut packets = Vec::new();
                for _ in 0..2 {
                    match read_packet(&mut stream).await {
                        Ok(packet) => packets.push(packet),
                        Err(_) => break,
                    }
                }
                received.push(packets);
                let _ = stream.write_all(&frame(&response)).await;
                let _ = stream.shutdown().await;
            }
            received
        });
        Self { addr, handle }
    }

    /// Accepts connections and never says anything back.
    pub async fn silent() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
            Vec::new()
        });
        Self { addr, handle }
    }

    /// The packets the server got on each connection.
    pub async fn received(self) -> Vec<Vec<Packet>> {
        tokio::time::timeout(Duration::from_secs(5), self.handle)
            .await
            .expect("mock server didn't finish")
            .unwrap()
    }
}

pub fn status_response(json: &str) -> Vec<u8> {
    let mut payload = vec![0x00];
    write_string(&mut payload, json);
    payload
}

pub fn disconnect(reason: &str) -> Vec<u8> {
    let mut payload = vec![0x00];
    write_string(&mut payload, reason);
    payload
}

/// A query server that answers the challenge with `token` and then replies to
/// the stat request with `stat` (sent verbatim).
pub async fn query_server(token: &'static str, stat: Vec<u8>) -> (SocketAddr, JoinHandle<Vec<Vec<u8>>>) {
    query_server_at("127.0.0.1:0".parse().unwrap(), token, stat).await
}

/// Same as [`query_server`], on a specific address. Servers usually run query
/// on the same port number as the game.
pub async fn query_server_at(
    bind: SocketAddr,
    token: &'static str,
    stat: Vec<u8>,
) -> (SocketAddr, JoinHandle<Vec<Vec<u8>>>) {
    let socket = UdpSocket::bind(bind).await.unwrap();
    let addr = socket.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        let mut received = Vec::new();
        let mut buf = [0; 2048];

        let (n, client) = socket.recv_from(&mut buf).await.unwrap();
        received.push(buf[..n].to_vec());
        let mut challenge = vec![0x09];
        challenge.extend_from_slice(&buf[3..7]);
        challenge.extend_from_slice(token.as_bytes());
        challenge.push(0x00);
        socket.send_to(&challenge, client).await.unwrap();

        let (n, client) = socket.recv_from(&mut buf).await.unwrap();
        received.push(buf[..n].to_vec());
        socket.send_to(&stat, client).await.unwrap();

        received
    });
    (addr, handle)
}

/// A full stat response the way vanilla servers send it, with the 11 bytes of
/// `splitnum\0\x80\0` padding after the session id.
pub fn full_stat(session: [u8; 4], kv: &[(&str, &str)], players: &[&str]) -> Vec<u8> {
    let mut response = vec![0x00];
    response.extend_from_slice(&session);
    response.extend_from_slice(b"splitnum\x00\x80\x00");
    for (k, v) in kv {
        response.extend_from_slice(k.as_bytes());
        response.push(0);
        response.extend_from_slice(v.as_bytes());
        response.push(0);
    }
    response.extend_from_slice(b"\x00\x01player_\x00\x00");
    for p in players {
        response.extend_from_slice(p.as_bytes());
        response.push(0);
    }
    response.push(0);
    response
}
