use std::io;

use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::{LEN_TYPE_SIZE, LenType, MAX_FRAME_LEN, Serialize, frame_too_large};

/// The writing half of a framed channel.
pub struct OnoSender<W>
where
    W: AsyncWrite + Unpin,
{
    tx: W,
    head: Vec<u8>,
}

impl<W: AsyncWrite + Unpin> OnoSender<W> {
    pub(super) fn new(tx: W) -> Self {
        Self {
            tx,
            head: Vec::new(),
        }
    }

    /// Writes `msg` as a single frame and flushes it.
    ///
    /// The bytes `msg` writes into the frame buffer go first, followed by the
    /// borrowed tail it may hand back, which is written without being copied.
    ///
    /// # Returns
    /// An io error if the frame is too large or the writer failed.
    pub async fn send<'a, T: Serialize<'a>>(&mut self, msg: &'a T) -> io::Result<()> {
        self.head.clear();
        self.head.extend_from_slice(&[0; LEN_TYPE_SIZE]);

        let tail = msg.serialize(&mut self.head).unwrap_or_default();
        let len = self.head.len() - LEN_TYPE_SIZE + tail.len();
        if len > MAX_FRAME_LEN {
            return Err(frame_too_large(len));
        }

        self.head[..LEN_TYPE_SIZE].copy_from_slice(&(len as LenType).to_be_bytes());
        self.tx.write_all(&self.head).await?;
        if !tail.is_empty() {
            self.tx.write_all(tail).await?;
        }

        self.tx.flush().await
    }
}
