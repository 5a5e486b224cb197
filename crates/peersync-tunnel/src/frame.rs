/// Length-prefixed MessagePack framing over ordered duplex byte streams.
///
/// Every frame is a 4-byte big-endian length followed by that many bytes of
/// `rmp_serde` (named-field) payload. Readers reject frames larger than the
/// configured maximum before allocating.
use std::marker::PhantomData;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, Mutex};

use crate::TunnelError;

/// Default upper bound on a single frame (16 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// A bidirectional stream of typed messages.
///
/// `recv` returns `Ok(None)` on a clean end of stream.
#[async_trait]
pub trait FrameStream<T>: Send + Sync
where
    T: Send + 'static,
{
    async fn send(&self, item: T) -> Result<(), TunnelError>;
    async fn recv(&self) -> Result<Option<T>, TunnelError>;
    async fn close(&self);
}

/// Write a single length-prefixed frame.
pub async fn write_framed<W>(writer: &mut W, data: &[u8], max_size: usize) -> Result<(), TunnelError>
where
    W: AsyncWrite + Unpin,
{
    if data.len() > max_size || data.len() > u32::MAX as usize {
        return Err(TunnelError::FrameTooLarge {
            size: data.len(),
            max: max_size,
        });
    }
    let len = (data.len() as u32).to_be_bytes();
    writer.write_all(&len).await?;
    writer.write_all(data).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a single length-prefixed frame. Returns `None` when the stream ends
/// cleanly on a frame boundary.
pub async fn read_framed<R>(reader: &mut R, max_size: usize) -> Result<Option<Vec<u8>>, TunnelError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_size {
        return Err(TunnelError::FrameTooLarge {
            size: len,
            max: max_size,
        });
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

/// [`FrameStream`] over any reader/writer pair.
pub struct FramedStream<R, W, T> {
    reader: Mutex<R>,
    writer: Mutex<W>,
    max_frame_size: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<R, W, T> FramedStream<R, W, T> {
    pub fn new(reader: R, writer: W) -> Self {
        Self::with_max_frame_size(reader, writer, DEFAULT_MAX_FRAME_SIZE)
    }

    pub fn with_max_frame_size(reader: R, writer: W, max_frame_size: usize) -> Self {
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            max_frame_size,
            _marker: PhantomData,
        }
    }
}

/// Split one duplex byte stream into a [`FramedStream`].
pub fn framed_duplex<S, T>(stream: S, max_frame_size: usize) -> FramedStream<ReadHalf<S>, WriteHalf<S>, T>
where
    S: AsyncRead + AsyncWrite,
{
    let (reader, writer) = tokio::io::split(stream);
    FramedStream::with_max_frame_size(reader, writer, max_frame_size)
}

#[async_trait]
impl<R, W, T> FrameStream<T> for FramedStream<R, W, T>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
    T: Serialize + DeserializeOwned + Send + 'static,
{
    async fn send(&self, item: T) -> Result<(), TunnelError> {
        let bytes = rmp_serde::to_vec_named(&item)?;
        let mut writer = self.writer.lock().await;
        write_framed(&mut *writer, &bytes, self.max_frame_size).await
    }

    async fn recv(&self) -> Result<Option<T>, TunnelError> {
        let mut reader = self.reader.lock().await;
        match read_framed(&mut *reader, self.max_frame_size).await? {
            Some(bytes) => Ok(Some(rmp_serde::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn close(&self) {
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            tracing::debug!("framed stream shutdown: {e}");
        }
    }
}

/// In-memory [`FrameStream`], one half of a [`memory_pair`].
pub struct MemoryStream<T> {
    tx: Mutex<Option<mpsc::Sender<T>>>,
    rx: Mutex<mpsc::Receiver<T>>,
}

/// Two connected in-memory streams. Items sent on one are received on the other.
pub fn memory_pair<T: Send + 'static>(buffer: usize) -> (MemoryStream<T>, MemoryStream<T>) {
    let (a_tx, b_rx) = mpsc::channel(buffer);
    let (b_tx, a_rx) = mpsc::channel(buffer);
    (
        MemoryStream {
            tx: Mutex::new(Some(a_tx)),
            rx: Mutex::new(a_rx),
        },
        MemoryStream {
            tx: Mutex::new(Some(b_tx)),
            rx: Mutex::new(b_rx),
        },
    )
}

#[async_trait]
impl<T: Send + 'static> FrameStream<T> for MemoryStream<T> {
    async fn send(&self, item: T) -> Result<(), TunnelError> {
        // Clone the sender so the lock is not held while waiting for capacity.
        let tx = self.tx.lock().await.clone();
        match tx {
            Some(tx) => tx.send(item).await.map_err(|_| TunnelError::StreamClosed),
            None => Err(TunnelError::StreamClosed),
        }
    }

    async fn recv(&self) -> Result<Option<T>, TunnelError> {
        Ok(self.rx.lock().await.recv().await)
    }

    async fn close(&self) {
        self.tx.lock().await.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn framed_roundtrip_over_duplex() {
        let (a, b) = tokio::io::duplex(1024);
        let left: FramedStream<_, _, Vec<String>> = framed_duplex(a, 1024);
        let right: FramedStream<_, _, Vec<String>> = framed_duplex(b, 1024);

        left.send(vec!["hello".into(), "world".into()]).await.unwrap();
        let got = right.recv().await.unwrap().unwrap();
        assert_eq!(got, vec!["hello".to_string(), "world".to_string()]);
    }

    #[tokio::test]
    async fn read_rejects_oversized_frame() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(100u32).to_be_bytes());
        buf.extend_from_slice(&[0u8; 100]);
        let mut cursor = std::io::Cursor::new(buf);
        let err = read_framed(&mut cursor, 10).await.unwrap_err();
        assert!(matches!(err, TunnelError::FrameTooLarge { size: 100, max: 10 }));
    }

    #[tokio::test]
    async fn write_rejects_oversized_frame() {
        let mut out = Vec::new();
        let err = write_framed(&mut out, &[1u8; 11], 10).await.unwrap_err();
        assert!(matches!(err, TunnelError::FrameTooLarge { size: 11, max: 10 }));
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn clean_eof_is_none() {
        let mut cursor = std::io::Cursor::new(Vec::<u8>::new());
        assert!(read_framed(&mut cursor, 10).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn memory_pair_close_ends_peer() {
        let (a, b) = memory_pair::<u32>(4);
        a.send(7).await.unwrap();
        a.close().await;
        assert_eq!(b.recv().await.unwrap(), Some(7));
        assert_eq!(b.recv().await.unwrap(), None);
        assert!(matches!(a.send(8).await, Err(TunnelError::StreamClosed)));
    }
}
