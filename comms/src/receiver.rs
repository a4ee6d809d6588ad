use std::io;

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{Deserialize, LEN_TYPE_SIZE, LenType, MAX_FRAME_LEN};

/// Reads length-prefixed frames off a trainer or engine connection.
///
/// Frames borrow from a caller-owned buffer, so tensor payloads are decoded
/// straight out of the bytes read from the socket.
pub struct OnoReceiver<R: AsyncRead + Unpin> {
    rx: R,
}

impl<R: AsyncRead + Unpin> OnoReceiver<R> {
    pub(super) fn new(rx: R) -> Self {
        Self { rx }
    }

    /// Reads the next frame into `buf` and decodes it.
    ///
    /// The length prefix is checked against `MAX_FRAME_LEN` before `buf` grows,
    /// a corrupt or hostile prefix can't make the receiver allocate past it.
    ///
    /// # Arguments
    /// * `buf` - Reused across calls, the returned `T` borrows from it.
    ///
    /// # Returns
    /// The decoded frame, `InvalidData` for an oversized frame or any
    /// error of the underlying reader.
    pub async fn recv_into<'buf, T>(&mut self, buf: &'buf mut Vec<u8>) -> io::Result<T>
    where
        T: Deserialize<'buf>,
    {
        let mut size_buf = [0; LEN_TYPE_SIZE];
        self.rx.read_exact(&mut size_buf).await?;
        let len = LenType::from_be_bytes(size_buf);

        if len > MAX_FRAME_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame of {len} bytes exceeds the {MAX_FRAME_LEN} bytes limit"),
            ));
        }

        buf.resize(len as usize, 0);
        self.rx.read_exact(buf).await?;

        T::deserialize(buf)
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncWriteExt;

    use super::*;
    use crate::msg::Msg;

    #[tokio::test]
    async fn oversized_prefix_is_rejected_before_allocating() {
        let (mut one, two) = tokio::io::duplex(64);
        let mut rx = OnoReceiver::new(two);

        one.write_all(&(MAX_FRAME_LEN + 1).to_be_bytes()).await.unwrap();

        let mut buf = Vec::new();
        let err = rx.recv_into::<Msg>(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert_eq!(buf.capacity(), 0);
    }

    #[tokio::test]
    async fn truncated_frame_is_unexpected_eof() {
        let (mut one, two) = tokio::io::duplex(64);
        let mut rx = OnoReceiver::new(two);

        one.write_all(&16u64.to_be_bytes()).await.unwrap();
        one.write_all(&[0; 4]).await.unwrap();
        drop(one);

        let mut buf = Vec::new();
        let err = rx.recv_into::<Msg>(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
