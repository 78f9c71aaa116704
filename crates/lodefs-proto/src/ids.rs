//! Core identifier and time types shared by the wire protocol and the
//! on-disk schema.

use std::fmt;

use crate::bincode::{Pack, Packer, Unpacker};
use crate::error::LodeError;

/// A metadata shard. An inode id's low byte names the shard that owns it.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShardId(pub u8);

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The kind of inode an [`InodeId`] names.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum InodeType {
    Directory = 1,
    File = 2,
    Symlink = 3,
}

/// A 64-bit inode id.
///
/// Layout: bit 63 is reserved (used as a flag when an id is stored inside an
/// edge body, always zero in a bare id), bits 61-62 are the [`InodeType`],
/// the low byte is the owning shard, and the bits in between are the
/// per-shard counter.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InodeId(u64);

/// The null inode id. Used as "no inode" in owner fields and deletion edges.
pub const NULL_INODE_ID: InodeId = InodeId(0);

/// The root directory. Lives on shard 0 with counter 0.
pub const ROOT_DIR_INODE_ID: InodeId = InodeId((InodeType::Directory as u64) << 61);

impl InodeId {
    const TYPE_SHIFT: u64 = 61;
    const TYPE_MASK: u64 = 0b11;
    const EXTRA_BIT: u64 = 1 << 63;

    /// Builds an id from its parts. The counter occupies bits 8..61.
    pub fn new(ty: InodeType, shard: ShardId, counter: u64) -> InodeId {
        debug_assert!(counter < (1 << 53));
        InodeId(((ty as u64) << Self::TYPE_SHIFT) | (counter << 8) | shard.0 as u64)
    }

    /// Reinterprets a raw u64 as an inode id, without validation.
    pub fn from_u64(x: u64) -> InodeId {
        InodeId(x)
    }

    /// The raw u64 value.
    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// The owning shard.
    pub fn shard(self) -> ShardId {
        ShardId(self.0 as u8)
    }

    /// The inode type, if the type bits hold a valid one.
    pub fn inode_type(self) -> Option<InodeType> {
        match (self.0 >> Self::TYPE_SHIFT) & Self::TYPE_MASK {
            1 => Some(InodeType::Directory),
            2 => Some(InodeType::File),
            3 => Some(InodeType::Symlink),
            _ => None,
        }
    }

    /// True for FILE and SYMLINK ids.
    pub fn is_file_or_symlink(self) -> bool {
        matches!(
            self.inode_type(),
            Some(InodeType::File) | Some(InodeType::Symlink)
        )
    }

    /// True for DIRECTORY ids.
    pub fn is_directory(self) -> bool {
        self.inode_type() == Some(InodeType::Directory)
    }

    /// True for the null id.
    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Id with the per-shard counter advanced by one (the low byte, and
    /// therefore the shard, never changes).
    pub fn next_allocated(self) -> InodeId {
        InodeId(self.0 + 0x100)
    }

    fn with_extra(self, extra: bool) -> u64 {
        debug_assert_eq!(self.0 & Self::EXTRA_BIT, 0);
        self.0 | if extra { Self::EXTRA_BIT } else { 0 }
    }
}

impl fmt::Display for InodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

impl Pack for InodeId {
    fn packed_size(&self) -> usize {
        8
    }
    fn pack(&self, p: &mut Packer) {
        p.pack_u64(self.0);
    }
    fn unpack(u: &mut Unpacker<'_>) -> Result<Self, LodeError> {
        Ok(InodeId(u.unpack_u64()?))
    }
}

/// An inode id carrying one extra flag in the top bit.
///
/// Edge bodies store their target this way: the flag is "locked" on current
/// edges and "owned" on snapshot edges.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct InodeIdExtra(u64);

impl InodeIdExtra {
    pub fn new(id: InodeId, extra: bool) -> InodeIdExtra {
        InodeIdExtra(id.with_extra(extra))
    }

    pub fn id(self) -> InodeId {
        InodeId(self.0 & !InodeId::EXTRA_BIT)
    }

    pub fn extra(self) -> bool {
        self.0 & InodeId::EXTRA_BIT != 0
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    pub fn from_u64(x: u64) -> InodeIdExtra {
        InodeIdExtra(x)
    }
}

impl fmt::Display for InodeIdExtra {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.id(), self.extra())
    }
}

impl Pack for InodeIdExtra {
    fn packed_size(&self) -> usize {
        8
    }
    fn pack(&self, p: &mut Packer) {
        p.pack_u64(self.0);
    }
    fn unpack(u: &mut Unpacker<'_>) -> Result<Self, LodeError> {
        Ok(InodeIdExtra(u.unpack_u64()?))
    }
}

/// Nanoseconds since the Unix epoch. Zero is the null time.
///
/// A few request fields overload the high bit as a "field present" flag; see
/// the SetTime handler.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LodeTime(pub u64);

impl LodeTime {
    pub const ZERO: LodeTime = LodeTime(0);

    /// The current wall-clock time.
    pub fn now() -> LodeTime {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("system time before epoch");
        LodeTime(now.as_nanos() as u64)
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// This time advanced by a duration.
    pub fn plus(self, d: std::time::Duration) -> LodeTime {
        LodeTime(self.0 + d.as_nanos() as u64)
    }

    pub fn ns(self) -> u64 {
        self.0
    }
}

impl fmt::Display for LodeTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ns", self.0)
    }
}

impl Pack for LodeTime {
    fn packed_size(&self) -> usize {
        8
    }
    fn pack(&self, p: &mut Packer) {
        p.pack_u64(self.0);
    }
    fn unpack(u: &mut Unpacker<'_>) -> Result<Self, LodeError> {
        Ok(LodeTime(u.unpack_u64()?))
    }
}

/// A block storage daemon, identified cluster-wide by 64 bits.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockServiceId(pub u64);

impl fmt::Display for BlockServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl Pack for BlockServiceId {
    fn packed_size(&self) -> usize {
        8
    }
    fn pack(&self, p: &mut Packer) {
        p.pack_u64(self.0);
    }
    fn unpack(u: &mut Unpacker<'_>) -> Result<Self, LodeError> {
        Ok(BlockServiceId(u.unpack_u64()?))
    }
}

/// An opaque 16-byte failure-domain tag. Two blocks of the same span must
/// never share one.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct FailureDomain(pub [u8; 16]);

impl Pack for FailureDomain {
    fn packed_size(&self) -> usize {
        16
    }
    fn pack(&self, p: &mut Packer) {
        p.pack_fixed(&self.0);
    }
    fn unpack(u: &mut Unpacker<'_>) -> Result<Self, LodeError> {
        Ok(FailureDomain(u.unpack_fixed()?))
    }
}

/// A location (roughly: a datacenter). One byte.
pub type LocationId = u8;

/// The location new spans go to unless the request says otherwise.
pub const DEFAULT_LOCATION: LocationId = 0;

/// Storage class of a span or block service.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum StorageClass {
    /// Zero-length spans.
    Empty = 0,
    /// Span bytes stored inline in the metadata value.
    Inline = 1,
    Flash = 2,
    Hdd = 3,
}

impl StorageClass {
    pub fn from_u8(x: u8) -> Result<StorageClass, LodeError> {
        match x {
            0 => Ok(StorageClass::Empty),
            1 => Ok(StorageClass::Inline),
            2 => Ok(StorageClass::Flash),
            3 => Ok(StorageClass::Hdd),
            _ => Err(LodeError::BadEncoding),
        }
    }
}

impl fmt::Display for StorageClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StorageClass::Empty => "EMPTY",
            StorageClass::Inline => "INLINE",
            StorageClass::Flash => "FLASH",
            StorageClass::Hdd => "HDD",
        };
        write!(f, "{}", s)
    }
}

impl Pack for StorageClass {
    fn packed_size(&self) -> usize {
        1
    }
    fn pack(&self, p: &mut Packer) {
        p.pack_u8(*self as u8);
    }
    fn unpack(u: &mut Unpacker<'_>) -> Result<Self, LodeError> {
        StorageClass::from_u8(u.unpack_u8()?)
    }
}

/// Erasure coding shape: D data blocks plus P parity blocks, one nibble each.
///
/// `D == 1` means plain mirroring; `D > 1` means Reed-Solomon with parity
/// block 0 equal to the XOR of the data blocks.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Parity(u8);

impl Parity {
    pub fn new(data: u8, parity: u8) -> Parity {
        assert!(data >= 1 && data <= 15, "bad data block count {}", data);
        assert!(parity <= 15, "bad parity block count {}", parity);
        Parity((data << 4) | parity)
    }

    pub fn from_u8(x: u8) -> Result<Parity, LodeError> {
        if x >> 4 == 0 {
            return Err(LodeError::BadEncoding);
        }
        Ok(Parity(x))
    }

    pub fn as_u8(self) -> u8 {
        self.0
    }

    pub fn data_blocks(self) -> usize {
        (self.0 >> 4) as usize
    }

    pub fn parity_blocks(self) -> usize {
        (self.0 & 0xF) as usize
    }

    /// Total number of blocks (D + P).
    pub fn blocks(self) -> usize {
        self.data_blocks() + self.parity_blocks()
    }
}

impl fmt::Display for Parity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{})", self.data_blocks(), self.parity_blocks())
    }
}

impl Pack for Parity {
    fn packed_size(&self) -> usize {
        1
    }
    fn pack(&self, p: &mut Packer) {
        p.pack_u8(self.0);
    }
    fn unpack(u: &mut Unpacker<'_>) -> Result<Self, LodeError> {
        Parity::from_u8(u.unpack_u8()?)
    }
}

/// State of the tail span of a transient file.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SpanState {
    /// No in-flight change.
    Clean = 0,
    /// Ingest in progress, awaiting add-certification.
    Dirty = 1,
    /// Reclaim in progress, awaiting delete-certification.
    Condemned = 2,
}

impl SpanState {
    pub fn from_u8(x: u8) -> Result<SpanState, LodeError> {
        match x {
            0 => Ok(SpanState::Clean),
            1 => Ok(SpanState::Dirty),
            2 => Ok(SpanState::Condemned),
            _ => Err(LodeError::BadEncoding),
        }
    }
}

impl fmt::Display for SpanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SpanState::Clean => "CLEAN",
            SpanState::Dirty => "DIRTY",
            SpanState::Condemned => "CONDEMNED",
        };
        write!(f, "{}", s)
    }
}
