//! Invitation signaling over TCP
//!
//! Each invitation uses one short-lived TCP connection framed with a
//! 4-byte length prefix; every frame is one JSON [`SignalingMessage`]:
//!
//! ```text
//! inviter -> invitee   { "type": "invite", "from": {..}, "context": "command", "sdp": ".." }
//! invitee -> inviter   { "type": "accept", "sdp": ".." } | { "type": "reject", "reason": ".." }
//! ```

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use super::PeerInfo;
use crate::error::{AppError, Result};
use crate::utils::bind_tokio_listener;

/// Largest accepted signaling frame (SDP with all candidates fits easily)
pub const MAX_FRAME_SIZE: usize = 256 * 1024;

/// Signaling message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalingMessage {
    Invite {
        from: PeerInfo,
        context: String,
        sdp: String,
    },
    Accept {
        sdp: String,
    },
    Reject {
        reason: String,
    },
}

fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .max_frame_length(MAX_FRAME_SIZE)
        .new_codec()
}

/// One framed signaling connection
pub struct SignalingConnection {
    framed: Framed<TcpStream, LengthDelimitedCodec>,
    remote: SocketAddr,
}

impl SignalingConnection {
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr).await.map_err(|e| {
            AppError::Transport(format!("signaling connect to {} failed: {}", addr, e))
        })?;
        stream.set_nodelay(true)?;
        Ok(Self::from_stream(stream, addr))
    }

    fn from_stream(stream: TcpStream, remote: SocketAddr) -> Self {
        Self {
            framed: Framed::new(stream, codec()),
            remote,
        }
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub async fn send(&mut self, message: &SignalingMessage) -> Result<()> {
        let body = serde_json::to_vec(message)?;
        self.framed
            .send(Bytes::from(body))
            .await
            .map_err(|e| AppError::Transport(format!("signaling send failed: {}", e)))
    }

    /// Next message; `None` when the peer closed the connection
    pub async fn recv(&mut self) -> Result<Option<SignalingMessage>> {
        match self.framed.next().await {
            Some(Ok(frame)) => Ok(Some(serde_json::from_slice(&frame)?)),
            Some(Err(e)) => Err(AppError::Transport(format!("signaling receive failed: {}", e))),
            None => Ok(None),
        }
    }
}

/// Accepts signaling connections
pub struct SignalingListener {
    listener: TcpListener,
}

impl SignalingListener {
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = bind_tokio_listener(addr)?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn accept(&self) -> Result<SignalingConnection> {
        let (stream, remote) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        Ok(SignalingConnection::from_stream(stream, remote))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::PeerRole;

    #[test]
    fn test_message_format() {
        let msg = SignalingMessage::Reject {
            reason: "busy".to_string(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"type":"reject","reason":"busy"}"#);
    }

    #[tokio::test]
    async fn test_invite_exchange_over_tcp() {
        let listener = SignalingListener::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let mut conn = listener.accept().await.unwrap();
            let invite = conn.recv().await.unwrap().unwrap();
            assert!(matches!(
                invite,
                SignalingMessage::Invite { ref context, .. } if context == "command"
            ));
            conn.send(&SignalingMessage::Accept {
                sdp: "answer".to_string(),
            })
            .await
            .unwrap();
        });

        let mut conn = SignalingConnection::connect(addr).await.unwrap();
        conn.send(&SignalingMessage::Invite {
            from: PeerInfo::new("a", "A", PeerRole::Phone),
            context: "command".to_string(),
            sdp: "offer".to_string(),
        })
        .await
        .unwrap();

        assert_eq!(
            conn.recv().await.unwrap(),
            Some(SignalingMessage::Accept {
                sdp: "answer".to_string()
            })
        );
        server.await.unwrap();
        assert_eq!(conn.recv().await.unwrap(), None);
    }
}
