use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::errors::WireError;

/// Writes SVN wire-protocol tokens to an [`AsyncWrite`] stream.
///
/// Every primitive is a thin framing wrapper; callers assemble tuples by
/// bracketing a sequence of primitive writes with [`WireWriter::list_begin`]
/// and [`WireWriter::list_end`].
pub struct WireWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> WireWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }

    async fn raw(&mut self, bytes: &[u8]) -> Result<(), WireError> {
        self.inner.write_all(bytes).await.map_err(WireError::IoError)
    }

    pub async fn list_begin(&mut self) -> Result<(), WireError> {
        self.raw(b"( ").await
    }

    pub async fn list_end(&mut self) -> Result<(), WireError> {
        self.raw(b") ").await
    }

    pub async fn word(&mut self, w: &str) -> Result<(), WireError> {
        self.raw(w.as_bytes()).await?;
        self.raw(b" ").await
    }

    pub async fn number(&mut self, n: i64) -> Result<(), WireError> {
        self.raw(n.to_string().as_bytes()).await?;
        self.raw(b" ").await
    }

    pub async fn string(&mut self, data: &[u8]) -> Result<(), WireError> {
        self.raw(data.len().to_string().as_bytes()).await?;
        self.raw(b":").await?;
        self.raw(data).await?;
        self.raw(b" ").await
    }

    /// Write raw bytes with no framing, for embedding pre-framed payloads
    /// (e.g. a whole svndiff window assembled by the delta encoder).
    pub async fn raw_bytes(&mut self, data: &[u8]) -> Result<(), WireError> {
        self.raw(data).await
    }

    pub async fn flush(&mut self) -> Result<(), WireError> {
        self.inner.flush().await.map_err(WireError::IoError)
    }
}
