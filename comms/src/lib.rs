//! Framing between trainer ranks and rollout engines.
//!
//! Every frame is a big endian `u64` length followed by a `Msg` body. Control
//! commands travel as JSON, tensor payloads as raw little endian bytes.

mod deserialize;
pub mod msg;
mod receiver;
mod sender;
mod serialize;
pub mod specs;

use tokio::io::{AsyncRead, AsyncWrite};

pub use deserialize::Deserialize;
pub use receiver::OnoReceiver;
pub use sender::OnoSender;
pub use serialize::Serialize;

type LenType = u64;
const LEN_TYPE_SIZE: usize = size_of::<LenType>();

/// The largest frame either end accepts, enough for any single weight tensor.
pub const MAX_FRAME_LEN: u64 = 4 << 30;

/// Wraps the halves of a connection into a frame receiver and sender.
///
/// # Arguments
/// * `rx` - The read half.
/// * `tx` - The write half.
///
/// # Returns
/// The receiver and sender of the connection.
pub fn channel<R, W>(rx: R, tx: W) -> (OnoReceiver<R>, OnoSender<W>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    (OnoReceiver::new(rx), OnoSender::new(tx))
}
