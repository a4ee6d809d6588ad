use std::io;

/// Writes a message's header into `buf` and optionally hands back a borrowed tail
/// that the sender writes without copying.
pub trait Serialize<'a> {
    fn serialize(&'a self, buf: &mut Vec<u8>) -> io::Result<Option<&'a [u8]>>;
}
