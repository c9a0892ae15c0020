/// Writes a message into a frame buffer.
///
/// Implementors may append their bytes to `buf` and/or hand back a borrowed
/// tail that is written right after it without being copied.
pub trait Serialize<'a> {
    fn serialize(&'a self, buf: &mut Vec<u8>) -> Option<&'a [u8]>;
}
