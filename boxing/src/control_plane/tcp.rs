use bytes::{BufMut, BytesMut};
use futures::future::BoxFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use super::{ControlPlane, LocalControlPlane};
use crate::error::{BoxingError, Result};

const OP_PUSH: u8 = 1;
const OP_PULL: u8 = 2;
const OP_ACK: u8 = 3;
const OP_VALUE: u8 = 4;

/// Upper bound on a key or value; communicator handles are a few hundred bytes.
const MAX_FIELD_LEN: u32 = 1 << 20;

/// One frame: `[op: u8][key_len: u32 LE][key][val_len: u32 LE][val]`.
#[derive(Debug, PartialEq, Eq)]
struct Frame {
    op: u8,
    key: String,
    value: Vec<u8>,
}

impl Frame {
    fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(9 + self.key.len() + self.value.len());
        buf.put_u8(self.op);
        buf.put_u32_le(self.key.len() as u32);
        buf.put_slice(self.key.as_bytes());
        buf.put_u32_le(self.value.len() as u32);
        buf.put_slice(&self.value);
        buf
    }

    /// Read one frame. `Ok(None)` on clean EOF before the first byte.
    async fn read<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Self>> {
        let op = match reader.read_u8().await {
            Ok(op) => op,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let key = read_field(reader).await?;
        let key = String::from_utf8(key)
            .map_err(|e| BoxingError::ControlPlane(format!("non-utf8 key: {e}")))?;
        let value = read_field(reader).await?;
        Ok(Some(Self { op, key, value }))
    }
}

async fn read_field<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>> {
    let len = reader.read_u32_le().await?;
    if len > MAX_FIELD_LEN {
        return Err(BoxingError::ControlPlane(format!(
            "field of {len} bytes exceeds limit"
        )));
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}

/// TCP front end for a [`LocalControlPlane`].
///
/// Pull requests are parked on the server until the key is pushed, so a
/// client connection carrying a pull may stay silent for a long time.
pub struct ControlPlaneServer {
    listener: TcpListener,
    store: Arc<LocalControlPlane>,
}

impl ControlPlaneServer {
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            store: Arc::new(LocalControlPlane::new()),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Shared handle to the backing store.
    pub fn store(&self) -> Arc<LocalControlPlane> {
        Arc::clone(&self.store)
    }

    /// Accept connections until the listener fails.
    pub async fn serve(self) -> Result<()> {
        let addr = self.local_addr()?;
        tracing::info!(%addr, "control plane listening");
        loop {
            let (stream, peer) = self.listener.accept().await?;
            if let Err(e) = stream.set_nodelay(true) {
                tracing::warn!(%peer, error = %e, "failed to set TCP_NODELAY");
            }
            let store = Arc::clone(&self.store);
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, &store).await {
                    tracing::warn!(%peer, error = %e, "control plane connection failed");
                }
            });
        }
    }
}

async fn handle_connection<S>(mut stream: S, store: &LocalControlPlane) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(frame) = Frame::read(&mut stream).await? {
        let reply = match frame.op {
            OP_PUSH => {
                store.push_kv(&frame.key, &frame.value).await?;
                Frame {
                    op: OP_ACK,
                    key: frame.key,
                    value: Vec::new(),
                }
            }
            OP_PULL => {
                let value = tokio::select! {
                    value = store.pull_kv(&frame.key) => value?,
                    () = hang_up(&mut stream) => {
                        tracing::debug!(key = %frame.key, "pulling peer went away");
                        return Ok(());
                    }
                };
                Frame {
                    op: OP_VALUE,
                    key: frame.key,
                    value,
                }
            }
            op => {
                return Err(BoxingError::ControlPlane(format!("unknown op {op}")));
            }
        };
        stream.write_all(&reply.encode()).await?;
    }
    Ok(())
}

/// Resolves once the peer closes its side, or breaks protocol by sending
/// more bytes while a pull is parked.
async fn hang_up<S: AsyncRead + Unpin>(stream: &mut S) {
    let mut byte = [0u8; 1];
    let _ = stream.read(&mut byte).await;
}

/// Client side of [`ControlPlaneServer`]. Each request uses its own
/// connection so a parked pull never blocks a push.
#[derive(Debug, Clone)]
pub struct TcpControlPlane {
    server: SocketAddr,
}

impl TcpControlPlane {
    /// Check the server is reachable and return a client for it.
    pub async fn connect(server: SocketAddr) -> Result<Self> {
        TcpStream::connect(server).await?;
        Ok(Self { server })
    }

    async fn round_trip(&self, request: Frame, expect: u8) -> Result<Frame> {
        let mut stream = TcpStream::connect(self.server).await?;
        stream.set_nodelay(true)?;
        stream.write_all(&request.encode()).await?;
        let reply = Frame::read(&mut stream)
            .await?
            .ok_or_else(|| BoxingError::ControlPlane("server closed connection".into()))?;
        if reply.op != expect || reply.key != request.key {
            return Err(BoxingError::ControlPlane(format!(
                "unexpected reply op {} for key `{}`",
                reply.op, reply.key
            )));
        }
        Ok(reply)
    }
}

impl ControlPlane for TcpControlPlane {
    fn push_kv<'a>(&'a self, key: &'a str, value: &'a [u8]) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let request = Frame {
                op: OP_PUSH,
                key: key.to_owned(),
                value: value.to_vec(),
            };
            self.round_trip(request, OP_ACK).await?;
            Ok(())
        })
    }

    fn pull_kv<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Vec<u8>>> {
        Box::pin(async move {
            let request = Frame {
                op: OP_PULL,
                key: key.to_owned(),
                value: Vec::new(),
            };
            Ok(self.round_trip(request, OP_VALUE).await?.value)
        })
    }
}
