//! Encrypted framed TCP channel.
//!
//! Handshake: each side sends `KEM1` followed by a fresh compressed secp256k1
//! public key. The ECDH secret, the network key and both public keys derive
//! one AES-256-GCM key per direction. Frames are a big-endian `u32` length
//! followed by the ciphertext.

use crate::crypto::{
    derive_session_keys, EphemeralKey, FrameCipher, NetworkKey, Role, HANDSHAKE_LEN,
    HANDSHAKE_MAGIC,
};
use crate::error::{ChainError, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, ToSocketAddrs};

pub const MAX_FRAME_LEN: usize = 4 * 1024 * 1024;
const TAG_LEN: usize = 16;

fn net_err(context: &str, err: std::io::Error) -> ChainError {
    ChainError::NetworkError(format!("{}: {}", context, err))
}

pub struct SecureChannel {
    stream: TcpStream,
    sealer: FrameCipher,
    opener: FrameCipher,
}

impl SecureChannel {
    pub async fn connect(addr: impl ToSocketAddrs, network_key: &NetworkKey) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| net_err("connect failed", e))?;
        Self::client(stream, network_key).await
    }

    /// Initiator side: send our hello, then read the responder's.
    pub async fn client(mut stream: TcpStream, network_key: &NetworkKey) -> Result<Self> {
        let local = EphemeralKey::generate();
        write_hello(&mut stream, &local).await?;
        let remote = read_hello(&mut stream).await?;
        Self::establish(stream, network_key, &local, &remote, Role::Initiator)
    }

    /// Responder side: read the initiator's hello, then answer.
    pub async fn server(mut stream: TcpStream, network_key: &NetworkKey) -> Result<Self> {
        let local = EphemeralKey::generate();
        let remote = read_hello(&mut stream).await?;
        write_hello(&mut stream, &local).await?;
        Self::establish(stream, network_key, &local, &remote, Role::Responder)
    }

    fn establish(
        stream: TcpStream,
        network_key: &NetworkKey,
        local: &EphemeralKey,
        remote: &[u8],
        role: Role,
    ) -> Result<Self> {
        let shared = local.shared_secret(remote)?;
        let local_public = local.public_bytes();
        let keys = match role {
            Role::Initiator => {
                derive_session_keys(&shared, network_key, &local_public, remote, role)
            }
            Role::Responder => {
                derive_session_keys(&shared, network_key, remote, &local_public, role)
            }
        };
        Ok(Self {
            stream,
            sealer: FrameCipher::new(&keys.send)?,
            opener: FrameCipher::new(&keys.recv)?,
        })
    }

    pub async fn send(&mut self, payload: &[u8]) -> Result<()> {
        if payload.len() > MAX_FRAME_LEN {
            return Err(ChainError::NetworkError(format!(
                "Frame of {} bytes exceeds limit of {}",
                payload.len(),
                MAX_FRAME_LEN
            )));
        }
        let frame = self.sealer.seal(payload)?;
        let len = u32::try_from(frame.len())
            .map_err(|_| ChainError::NetworkError("Frame length overflow".to_string()))?;
        self.stream
            .write_u32(len)
            .await
            .map_err(|e| net_err("write failed", e))?;
        self.stream
            .write_all(&frame)
            .await
            .map_err(|e| net_err("write failed", e))?;
        self.stream
            .flush()
            .await
            .map_err(|e| net_err("flush failed", e))
    }

    pub async fn recv(&mut self) -> Result<Vec<u8>> {
        let len = self
            .stream
            .read_u32()
            .await
            .map_err(|e| net_err("read failed", e))? as usize;
        if len > MAX_FRAME_LEN + TAG_LEN {
            return Err(ChainError::NetworkError(format!(
                "Peer announced a {} byte frame",
                len
            )));
        }
        let mut frame = vec![0u8; len];
        self.stream
            .read_exact(&mut frame)
            .await
            .map_err(|e| net_err("read failed", e))?;
        self.opener.open(&frame)
    }

    pub async fn request(&mut self, payload: &[u8]) -> Result<Vec<u8>> {
        self.send(payload).await?;
        self.recv().await
    }

    pub async fn shutdown(mut self) {
        let _ = self.stream.shutdown().await;
    }
}

async fn write_hello(stream: &mut TcpStream, key: &EphemeralKey) -> Result<()> {
    let mut hello = Vec::with_capacity(HANDSHAKE_LEN);
    hello.extend_from_slice(HANDSHAKE_MAGIC);
    hello.extend_from_slice(&key.public_bytes());
    stream
        .write_all(&hello)
        .await
        .map_err(|e| net_err("handshake write failed", e))
}

async fn read_hello(stream: &mut TcpStream) -> Result<Vec<u8>> {
    let mut hello = [0u8; HANDSHAKE_LEN];
    stream
        .read_exact(&mut hello)
        .await
        .map_err(|e| net_err("handshake read failed", e))?;
    if &hello[..HANDSHAKE_MAGIC.len()] != HANDSHAKE_MAGIC {
        return Err(ChainError::NetworkError(
            "Handshake magic mismatch".to_string(),
        ));
    }
    Ok(hello[HANDSHAKE_MAGIC.len()..].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_channel_round_trip() {
        tokio::time::timeout(Duration::from_secs(5), async {
            let key = NetworkKey::from_passphrase("testnet");
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();

            let server_key = key.clone();
            let server = tokio::spawn(async move {
                let (stream, _) = listener.accept().await.unwrap();
                let mut channel = SecureChannel::server(stream, &server_key).await.unwrap();
                let request = channel.recv().await.unwrap();
                channel.send(&[request, b"-ack".to_vec()].concat()).await.unwrap();
            });

            let mut client = SecureChannel::connect(addr, &key).await.unwrap();
            let reply = client.request(b"ping").await.unwrap();
            assert_eq!(reply, b"ping-ack");
            server.await.unwrap();
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_wrong_network_key_fails_first_frame() {
        tokio::time::timeout(Duration::from_secs(5), async {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();

            let server = tokio::spawn(async move {
                let (stream, _) = listener.accept().await.unwrap();
                let mut channel =
                    SecureChannel::server(stream, &NetworkKey::from_passphrase("mainnet"))
                        .await
                        .unwrap();
                channel.recv().await
            });

            let mut client =
                SecureChannel::connect(addr, &NetworkKey::from_passphrase("testnet"))
                    .await
                    .unwrap();
            client.send(b"ping").await.unwrap();
            let result = server.await.unwrap();
            assert!(matches!(result, Err(ChainError::CryptoError(_))));
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_bad_magic_is_refused() {
        tokio::time::timeout(Duration::from_secs(5), async {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();

            let server = tokio::spawn(async move {
                let (stream, _) = listener.accept().await.unwrap();
                SecureChannel::server(stream, &NetworkKey::from_passphrase("x"))
                    .await
                    .map(|_| ())
            });

            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream.write_all(&[0u8; HANDSHAKE_LEN]).await.unwrap();
            assert!(server.await.unwrap().is_err());
        })
        .await
        .unwrap();
    }
}
