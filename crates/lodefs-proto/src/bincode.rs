//! Little-endian cursor codec used for keys, values and message bodies.
//!
//! The format is deliberately minimal and deterministic:
//! - scalars are fixed-width little-endian
//! - byte strings carry a single length byte (so they are at most 255 bytes)
//! - lists carry a two-byte length (at most 65535 elements); lists of
//!   integral elements are packed contiguously
//!
//! Every decoded message must consume its buffer exactly unless the caller
//! opts out (responses embedded in signed frames leave the trailing MAC).

use crate::error::LodeError;

/// Maximum length of a length-prefixed byte string.
pub const MAX_BYTES_LEN: usize = 255;

/// Write-side cursor. Appends to an owned buffer.
pub struct Packer {
    buf: Vec<u8>,
}

impl Packer {
    /// Creates an empty packer.
    pub fn new() -> Self {
        Packer { buf: Vec::new() }
    }

    /// Creates a packer with the given capacity hint.
    pub fn with_capacity(cap: usize) -> Self {
        Packer {
            buf: Vec::with_capacity(cap),
        }
    }

    /// Number of bytes written so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Returns true if nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Consumes the packer, returning the encoded bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    /// The bytes written so far.
    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn pack_u8(&mut self, x: u8) {
        self.buf.push(x);
    }

    pub fn pack_u16(&mut self, x: u16) {
        self.buf.extend_from_slice(&x.to_le_bytes());
    }

    pub fn pack_u32(&mut self, x: u32) {
        self.buf.extend_from_slice(&x.to_le_bytes());
    }

    pub fn pack_u64(&mut self, x: u64) {
        self.buf.extend_from_slice(&x.to_le_bytes());
    }

    pub fn pack_i64(&mut self, x: i64) {
        self.buf.extend_from_slice(&x.to_le_bytes());
    }

    pub fn pack_fixed<const N: usize>(&mut self, x: &[u8; N]) {
        self.buf.extend_from_slice(x);
    }

    /// Packs a short byte string with its one-byte length prefix.
    ///
    /// Panics if the string is longer than 255 bytes; producers are expected
    /// to have validated names and notes before packing.
    pub fn pack_bytes(&mut self, x: &[u8]) {
        assert!(x.len() <= MAX_BYTES_LEN, "short bytes too long: {}", x.len());
        self.buf.push(x.len() as u8);
        self.buf.extend_from_slice(x);
    }

    /// Packs a list with its two-byte length prefix, element by element.
    pub fn pack_list<T: Pack>(&mut self, xs: &[T]) {
        assert!(xs.len() < (1 << 16), "list too long: {}", xs.len());
        self.pack_u16(xs.len() as u16);
        for x in xs {
            x.pack(self);
        }
    }
}

impl Default for Packer {
    fn default() -> Self {
        Self::new()
    }
}

/// Read-side cursor over a borrowed buffer.
pub struct Unpacker<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Unpacker<'a> {
    /// Creates an unpacker over the whole buffer.
    pub fn new(data: &'a [u8]) -> Self {
        Unpacker { data, pos: 0 }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Fails with `BadEncoding` unless the buffer is fully consumed.
    pub fn ensure_finished(&self) -> Result<(), LodeError> {
        if self.remaining() != 0 {
            return Err(LodeError::BadEncoding);
        }
        Ok(())
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], LodeError> {
        if self.remaining() < n {
            return Err(LodeError::BadEncoding);
        }
        let s = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    pub fn unpack_u8(&mut self) -> Result<u8, LodeError> {
        Ok(self.take(1)?[0])
    }

    pub fn unpack_u16(&mut self) -> Result<u16, LodeError> {
        let s = self.take(2)?;
        Ok(u16::from_le_bytes([s[0], s[1]]))
    }

    pub fn unpack_u32(&mut self) -> Result<u32, LodeError> {
        let s = self.take(4)?;
        Ok(u32::from_le_bytes([s[0], s[1], s[2], s[3]]))
    }

    pub fn unpack_u64(&mut self) -> Result<u64, LodeError> {
        let s = self.take(8)?;
        let mut b = [0u8; 8];
        b.copy_from_slice(s);
        Ok(u64::from_le_bytes(b))
    }

    pub fn unpack_i64(&mut self) -> Result<i64, LodeError> {
        let s = self.take(8)?;
        let mut b = [0u8; 8];
        b.copy_from_slice(s);
        Ok(i64::from_le_bytes(b))
    }

    pub fn unpack_fixed<const N: usize>(&mut self) -> Result<[u8; N], LodeError> {
        let s = self.take(N)?;
        let mut b = [0u8; N];
        b.copy_from_slice(s);
        Ok(b)
    }

    /// Unpacks a short byte string (one-byte length prefix).
    pub fn unpack_bytes(&mut self) -> Result<Vec<u8>, LodeError> {
        let len = self.unpack_u8()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    /// Unpacks a list (two-byte length prefix).
    pub fn unpack_list<T: Pack>(&mut self) -> Result<Vec<T>, LodeError> {
        let len = self.unpack_u16()? as usize;
        let mut xs = Vec::with_capacity(len.min(1024));
        for _ in 0..len {
            xs.push(T::unpack(self)?);
        }
        Ok(xs)
    }
}

/// Types with a deterministic packed representation.
///
/// `packed_size` must agree exactly with what `pack` writes; the read path
/// relies on it for MTU budgeting.
pub trait Pack: Sized {
    fn packed_size(&self) -> usize;
    fn pack(&self, p: &mut Packer);
    fn unpack(u: &mut Unpacker<'_>) -> Result<Self, LodeError>;
}

impl Pack for u8 {
    fn packed_size(&self) -> usize {
        1
    }
    fn pack(&self, p: &mut Packer) {
        p.pack_u8(*self);
    }
    fn unpack(u: &mut Unpacker<'_>) -> Result<Self, LodeError> {
        u.unpack_u8()
    }
}

impl Pack for u16 {
    fn packed_size(&self) -> usize {
        2
    }
    fn pack(&self, p: &mut Packer) {
        p.pack_u16(*self);
    }
    fn unpack(u: &mut Unpacker<'_>) -> Result<Self, LodeError> {
        u.unpack_u16()
    }
}

impl Pack for u32 {
    fn packed_size(&self) -> usize {
        4
    }
    fn pack(&self, p: &mut Packer) {
        p.pack_u32(*self);
    }
    fn unpack(u: &mut Unpacker<'_>) -> Result<Self, LodeError> {
        u.unpack_u32()
    }
}

impl Pack for u64 {
    fn packed_size(&self) -> usize {
        8
    }
    fn pack(&self, p: &mut Packer) {
        p.pack_u64(*self);
    }
    fn unpack(u: &mut Unpacker<'_>) -> Result<Self, LodeError> {
        u.unpack_u64()
    }
}

impl Pack for bool {
    fn packed_size(&self) -> usize {
        1
    }
    fn pack(&self, p: &mut Packer) {
        p.pack_u8(*self as u8);
    }
    fn unpack(u: &mut Unpacker<'_>) -> Result<Self, LodeError> {
        match u.unpack_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(LodeError::BadEncoding),
        }
    }
}

impl<const N: usize> Pack for [u8; N] {
    fn packed_size(&self) -> usize {
        N
    }
    fn pack(&self, p: &mut Packer) {
        p.pack_fixed(self);
    }
    fn unpack(u: &mut Unpacker<'_>) -> Result<Self, LodeError> {
        u.unpack_fixed()
    }
}

/// Lists pack with their two-byte length prefix.
impl<T: Pack> Pack for Vec<T> {
    fn packed_size(&self) -> usize {
        list_packed_size(self)
    }
    fn pack(&self, p: &mut Packer) {
        p.pack_list(self);
    }
    fn unpack(u: &mut Unpacker<'_>) -> Result<Self, LodeError> {
        u.unpack_list()
    }
}

/// An owned byte string of at most 255 bytes, packed with a one-byte length
/// prefix. Used for edge names, transient-file notes and inline span bodies.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Default)]
pub struct ShortBytes(Vec<u8>);

impl ShortBytes {
    /// Wraps the bytes; fails if they exceed 255 bytes.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Result<ShortBytes, LodeError> {
        let bytes = bytes.into();
        if bytes.len() > MAX_BYTES_LEN {
            return Err(LodeError::BadEncoding);
        }
        Ok(ShortBytes(bytes))
    }

    /// Wraps the bytes, panicking on overlong input. For literals.
    pub fn from_static(bytes: &[u8]) -> ShortBytes {
        ShortBytes::new(bytes).expect("short bytes literal too long")
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::ops::Deref for ShortBytes {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Display for ShortBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

impl Pack for ShortBytes {
    fn packed_size(&self) -> usize {
        1 + self.0.len()
    }
    fn pack(&self, p: &mut Packer) {
        p.pack_bytes(&self.0);
    }
    fn unpack(u: &mut Unpacker<'_>) -> Result<Self, LodeError> {
        Ok(ShortBytes(u.unpack_bytes()?))
    }
}

/// Packed size of a short byte string (length prefix included).
pub fn bytes_packed_size(b: &[u8]) -> usize {
    1 + b.len()
}

/// Packed size of a list of packable elements (length prefix included).
pub fn list_packed_size<T: Pack>(xs: &[T]) -> usize {
    2 + xs.iter().map(|x| x.packed_size()).sum::<usize>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_scalar_roundtrip() {
        let mut p = Packer::new();
        p.pack_u8(0xAB);
        p.pack_u16(0xCDEF);
        p.pack_u32(0xDEADBEEF);
        p.pack_u64(0x0123456789ABCDEF);
        p.pack_i64(-42);
        let bytes = p.into_bytes();

        let mut u = Unpacker::new(&bytes);
        assert_eq!(u.unpack_u8().unwrap(), 0xAB);
        assert_eq!(u.unpack_u16().unwrap(), 0xCDEF);
        assert_eq!(u.unpack_u32().unwrap(), 0xDEADBEEF);
        assert_eq!(u.unpack_u64().unwrap(), 0x0123456789ABCDEF);
        assert_eq!(u.unpack_i64().unwrap(), -42);
        u.ensure_finished().unwrap();
    }

    #[test]
    fn test_scalars_are_little_endian() {
        let mut p = Packer::new();
        p.pack_u32(0x01020304);
        assert_eq!(p.bytes(), &[0x04, 0x03, 0x02, 0x01]);
    }

    #[test]
    fn test_bytes_roundtrip() {
        let mut p = Packer::new();
        p.pack_bytes(b"hello");
        p.pack_bytes(b"");
        let bytes = p.into_bytes();
        assert_eq!(bytes[0], 5);

        let mut u = Unpacker::new(&bytes);
        assert_eq!(u.unpack_bytes().unwrap(), b"hello");
        assert_eq!(u.unpack_bytes().unwrap(), b"");
        u.ensure_finished().unwrap();
    }

    #[test]
    fn test_list_roundtrip() {
        let mut p = Packer::new();
        p.pack_list(&[1u32, 2, 3]);
        let bytes = p.into_bytes();
        assert_eq!(bytes.len(), 2 + 3 * 4);

        let mut u = Unpacker::new(&bytes);
        assert_eq!(u.unpack_list::<u32>().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_truncated_input_is_bad_encoding() {
        let mut p = Packer::new();
        p.pack_u64(7);
        let bytes = p.into_bytes();

        let mut u = Unpacker::new(&bytes[..5]);
        assert!(matches!(u.unpack_u64(), Err(LodeError::BadEncoding)));
    }

    #[test]
    fn test_truncated_bytes_is_bad_encoding() {
        // length byte says 10, only 3 bytes follow
        let bytes = [10u8, 1, 2, 3];
        let mut u = Unpacker::new(&bytes);
        assert!(matches!(u.unpack_bytes(), Err(LodeError::BadEncoding)));
    }

    #[test]
    fn test_trailing_bytes_detected() {
        let mut p = Packer::new();
        p.pack_u8(1);
        p.pack_u8(2);
        let bytes = p.into_bytes();

        let mut u = Unpacker::new(&bytes);
        u.unpack_u8().unwrap();
        assert!(matches!(u.ensure_finished(), Err(LodeError::BadEncoding)));
    }

    proptest! {
        #[test]
        fn prop_bytes_roundtrip(data in proptest::collection::vec(any::<u8>(), 0..=255)) {
            let mut p = Packer::new();
            p.pack_bytes(&data);
            prop_assert_eq!(p.len(), bytes_packed_size(&data));
            let bytes = p.into_bytes();
            let mut u = Unpacker::new(&bytes);
            prop_assert_eq!(u.unpack_bytes().unwrap(), data);
            u.ensure_finished().unwrap();
        }

        #[test]
        fn prop_u64_list_roundtrip(xs in proptest::collection::vec(any::<u64>(), 0..64)) {
            let mut p = Packer::new();
            p.pack_list(&xs);
            prop_assert_eq!(p.len(), list_packed_size(&xs));
            let bytes = p.into_bytes();
            let mut u = Unpacker::new(&bytes);
            prop_assert_eq!(u.unpack_list::<u64>().unwrap(), xs);
            u.ensure_finished().unwrap();
        }
    }
}
