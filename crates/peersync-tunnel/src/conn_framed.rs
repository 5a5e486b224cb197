use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::conn::TunnelConn;
use crate::frame::{FrameStream, DEFAULT_MAX_FRAME_SIZE};
use crate::TunnelError;

/// Length-prefixed MessagePack frames over a [`TunnelConn`].
///
/// Lets any [`FrameStream`] protocol run inside a tunnel connection.
pub struct ConnFramed<T> {
    conn: Arc<TunnelConn>,
    max_frame_size: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<T> ConnFramed<T> {
    pub fn new(conn: Arc<TunnelConn>) -> Self {
        Self::with_max_frame_size(conn, DEFAULT_MAX_FRAME_SIZE)
    }

    pub fn with_max_frame_size(conn: Arc<TunnelConn>, max_frame_size: usize) -> Self {
        Self {
            conn,
            max_frame_size,
            _marker: PhantomData,
        }
    }

    pub fn conn(&self) -> &Arc<TunnelConn> {
        &self.conn
    }
}

#[async_trait]
impl<T> FrameStream<T> for ConnFramed<T>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    async fn send(&self, item: T) -> Result<(), TunnelError> {
        let payload = rmp_serde::to_vec_named(&item)?;
        if payload.len() > self.max_frame_size {
            return Err(TunnelError::FrameTooLarge {
                size: payload.len(),
                max: self.max_frame_size,
            });
        }
        let mut buf = Vec::with_capacity(4 + payload.len());
        buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&payload);
        self.conn.write(&buf).await?;
        Ok(())
    }

    async fn recv(&self) -> Result<Option<T>, TunnelError> {
        let mut len_buf = [0u8; 4];
        if !self.conn.read_exact(&mut len_buf).await? {
            return Ok(None);
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        if len > self.max_frame_size {
            return Err(TunnelError::FrameTooLarge {
                size: len,
                max: self.max_frame_size,
            });
        }
        let mut payload = vec![0u8; len];
        if len > 0 && !self.conn.read_exact(&mut payload).await? {
            return Err(TunnelError::ConnClosed {
                conn_id: self.conn.conn_id(),
            });
        }
        Ok(Some(rmp_serde::from_slice(&payload)?))
    }

    async fn close(&self) {
        self.conn.close();
    }
}
