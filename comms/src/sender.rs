use std::io;

use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::{LEN_TYPE_SIZE, LenType, MAX_FRAME_LEN, Serialize};

/// Writes length-prefixed frames onto a trainer or engine connection.
///
/// The frame header is staged in a reused buffer, tensor bytes are written
/// from the caller's slice without being copied into it.
pub struct OnoSender<W>
where
    W: AsyncWrite + Unpin,
{
    tx: W,
    buf: Vec<u8>,
}

impl<W: AsyncWrite + Unpin> OnoSender<W> {
    pub(super) fn new(tx: W) -> Self {
        Self {
            tx,
            buf: Vec::new(),
        }
    }

    /// Sends `msg` as one frame and flushes it.
    ///
    /// # Arguments
    /// * `msg` - The message, its borrowed tail goes out as is.
    ///
    /// # Returns
    /// `InvalidInput` if the frame wouldn't fit in `MAX_FRAME_LEN`, or any
    /// error of the underlying writer.
    pub async fn send<'a, T: Serialize<'a>>(&mut self, msg: &'a T) -> io::Result<()> {
        let Self { buf, tx } = self;

        buf.clear();
        buf.resize(LEN_TYPE_SIZE, 0);

        let tail = msg.serialize(buf)?;
        let len = (buf.len() - LEN_TYPE_SIZE + tail.map(<[_]>::len).unwrap_or_default()) as LenType;
        if len > MAX_FRAME_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("frame of {len} bytes exceeds the {MAX_FRAME_LEN} bytes limit"),
            ));
        }

        buf[..LEN_TYPE_SIZE].copy_from_slice(&len.to_be_bytes());
        tx.write_all(buf).await?;

        if let Some(data) = tail {
            tx.write_all(data).await?;
        }

        tx.flush().await
    }
}
