use std::io;

/// Decodes a frame body, borrowing tensor bytes from the receive buffer.
pub trait Deserialize<'a>: Sized {
    fn deserialize(buf: &'a [u8]) -> io::Result<Self>;
}
