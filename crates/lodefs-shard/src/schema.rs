//! Key and value layouts for the shard column families.
//!
//! Keys pack big-endian so the store's lexicographic order matches numeric
//! order; values use the little-endian wire codec. Edge keys sort by
//! (directory, current-before-snapshot, name hash, name, creation time);
//! the creation time only exists on snapshot edges, so the name carries a
//! length byte to delimit it.

use lodefs_proto::bincode::{Pack, Packer, ShortBytes, Unpacker};
use lodefs_proto::hash::HashMode;
use lodefs_proto::ids::{
    BlockServiceId, InodeId, InodeIdExtra, LocationId, LodeTime, Parity, SpanState, StorageClass,
};
use lodefs_proto::msgs::DirectoryInfo;
use lodefs_proto::LodeError;

/// Keys of the default column family.
pub mod meta_key {
    /// Shard id and secret.
    pub const SHARD_INFO: u8 = 1;
    /// Next FILE inode id.
    pub const NEXT_FILE_ID: u8 = 2;
    /// Next SYMLINK inode id.
    pub const NEXT_SYMLINK_ID: u8 = 3;
    /// Next block id.
    pub const NEXT_BLOCK_ID: u8 = 4;
    /// The applied-log cursor.
    pub const LAST_APPLIED_LOG_ENTRY: u8 = 5;
}

/// The one-byte key of a default-CF record.
pub fn metadata_key(key: u8) -> Vec<u8> {
    vec![key]
}

/// Encodes a value through its `Pack` impl.
pub fn encode<T: Pack>(value: &T) -> Vec<u8> {
    let mut p = Packer::with_capacity(value.packed_size());
    value.pack(&mut p);
    p.into_bytes()
}

/// Decodes a value, requiring the buffer to be fully consumed.
///
/// Stored values are written by this process; a decode failure means the
/// schema is broken and the caller is expected to treat it as fatal.
pub fn decode<T: Pack>(bytes: &[u8]) -> Result<T, LodeError> {
    let mut u = Unpacker::new(bytes);
    let v = T::unpack(&mut u)?;
    u.ensure_finished()?;
    Ok(v)
}

// ----------------------------------------------------------------
// keys

/// Key of the directories/files/transient column families.
pub fn inode_id_key(id: InodeId) -> Vec<u8> {
    id.as_u64().to_be_bytes().to_vec()
}

/// Decodes an inode-id key.
pub fn parse_inode_id_key(key: &[u8]) -> InodeId {
    let mut b = [0u8; 8];
    b.copy_from_slice(&key[..8]);
    InodeId::from_u64(u64::from_be_bytes(b))
}

/// Key of the spans column family: `(file, byte offset)`.
pub fn span_key(file_id: InodeId, byte_offset: u64) -> Vec<u8> {
    let mut k = Vec::with_capacity(16);
    k.extend_from_slice(&file_id.as_u64().to_be_bytes());
    k.extend_from_slice(&byte_offset.to_be_bytes());
    k
}

/// Decodes a span key.
pub fn parse_span_key(key: &[u8]) -> (InodeId, u64) {
    let mut a = [0u8; 8];
    a.copy_from_slice(&key[..8]);
    let mut b = [0u8; 8];
    b.copy_from_slice(&key[8..16]);
    (InodeId::from_u64(u64::from_be_bytes(a)), u64::from_be_bytes(b))
}

/// Key of the reverse index: `(block service, file)`.
pub fn block_service_to_file_key(bs: BlockServiceId, file_id: InodeId) -> Vec<u8> {
    let mut k = Vec::with_capacity(16);
    k.extend_from_slice(&bs.0.to_be_bytes());
    k.extend_from_slice(&file_id.as_u64().to_be_bytes());
    k
}

/// Decodes a reverse-index key.
pub fn parse_block_service_to_file_key(key: &[u8]) -> (BlockServiceId, InodeId) {
    let mut a = [0u8; 8];
    a.copy_from_slice(&key[..8]);
    let mut b = [0u8; 8];
    b.copy_from_slice(&key[8..16]);
    (
        BlockServiceId(u64::from_be_bytes(a)),
        InodeId::from_u64(u64::from_be_bytes(b)),
    )
}

/// Current edges sort before snapshot edges of the same directory.
const EDGE_CURRENT: u8 = 0;
const EDGE_SNAPSHOT: u8 = 1;

/// Key of a current edge.
pub fn current_edge_key(dir_id: InodeId, name_hash: u64, name: &[u8]) -> Vec<u8> {
    let mut k = edge_scan_start(dir_id, true, name_hash);
    k.push(name.len() as u8);
    k.extend_from_slice(name);
    k
}

/// Key of a snapshot edge.
pub fn snapshot_edge_key(
    dir_id: InodeId,
    name_hash: u64,
    name: &[u8],
    creation_time: LodeTime,
) -> Vec<u8> {
    let mut k = edge_scan_start(dir_id, false, name_hash);
    k.push(name.len() as u8);
    k.extend_from_slice(name);
    k.extend_from_slice(&creation_time.ns().to_be_bytes());
    k
}

/// Prefix of all edges of `(dir, current)` from `name_hash` upward.
pub fn edge_scan_start(dir_id: InodeId, current: bool, name_hash: u64) -> Vec<u8> {
    let mut k = Vec::with_capacity(33);
    k.extend_from_slice(&dir_id.as_u64().to_be_bytes());
    k.push(if current { EDGE_CURRENT } else { EDGE_SNAPSHOT });
    k.extend_from_slice(&name_hash.to_be_bytes());
    k
}

/// Exclusive upper bound for scanning all edges of `(dir, current)`.
pub fn edge_scan_end(dir_id: InodeId, current: bool) -> Vec<u8> {
    let mut k = Vec::with_capacity(9);
    if current {
        k.extend_from_slice(&dir_id.as_u64().to_be_bytes());
        k.push(EDGE_SNAPSHOT);
    } else {
        k.extend_from_slice(&(dir_id.as_u64() + 1).to_be_bytes());
        k.push(EDGE_CURRENT);
    }
    k
}

/// Largest possible key of a `(dir, current, hash, name)` snapshot group;
/// seek-for-prev from here lands on the newest snapshot edge of the name.
pub fn snapshot_edge_group_end(dir_id: InodeId, name_hash: u64, name: &[u8]) -> Vec<u8> {
    snapshot_edge_key(dir_id, name_hash, name, LodeTime(u64::MAX))
}

/// A decoded edge key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EdgeKey {
    pub dir_id: InodeId,
    pub current: bool,
    pub name_hash: u64,
    pub name: Vec<u8>,
    /// Zero for current edges.
    pub creation_time: LodeTime,
}

/// Decodes an edge key. Keys come straight out of the store, so a malformed
/// one is a fatal schema violation.
pub fn parse_edge_key(key: &[u8]) -> EdgeKey {
    assert!(key.len() >= 18, "edge key too short: {}", key.len());
    let mut a = [0u8; 8];
    a.copy_from_slice(&key[..8]);
    let dir_id = InodeId::from_u64(u64::from_be_bytes(a));
    let current = key[8] == EDGE_CURRENT;
    let mut h = [0u8; 8];
    h.copy_from_slice(&key[9..17]);
    let name_hash = u64::from_be_bytes(h);
    let name_len = key[17] as usize;
    let name = key[18..18 + name_len].to_vec();
    let creation_time = if current {
        assert_eq!(key.len(), 18 + name_len, "bad current edge key length");
        LodeTime::ZERO
    } else {
        assert_eq!(key.len(), 18 + name_len + 8, "bad snapshot edge key length");
        let mut t = [0u8; 8];
        t.copy_from_slice(&key[18 + name_len..]);
        LodeTime(u64::from_be_bytes(t))
    };
    EdgeKey {
        dir_id,
        current,
        name_hash,
        name,
        creation_time,
    }
}

// ----------------------------------------------------------------
// values

/// Little-endian u64 value (id allocators, applied-log cursor).
pub fn encode_u64_value(x: u64) -> Vec<u8> {
    x.to_le_bytes().to_vec()
}

/// Decodes a little-endian u64 value.
pub fn decode_u64_value(bytes: &[u8]) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(b)
}

/// Decodes the little-endian i64 count of the reverse index.
pub fn decode_i64_value(bytes: &[u8]) -> i64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&bytes[..8]);
    i64::from_le_bytes(b)
}

/// The shard-identity record written at first start-up.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShardInfoBody {
    pub shard_id: u8,
    pub secret_key: [u8; 16],
}

impl Pack for ShardInfoBody {
    fn packed_size(&self) -> usize {
        1 + 16
    }
    fn pack(&self, p: &mut Packer) {
        p.pack_u8(self.shard_id);
        p.pack_fixed(&self.secret_key);
    }
    fn unpack(u: &mut Unpacker<'_>) -> Result<Self, LodeError> {
        Ok(ShardInfoBody {
            shard_id: u.unpack_u8()?,
            secret_key: u.unpack_fixed()?,
        })
    }
}

/// A committed file or symlink inode.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileBody {
    pub version: u8,
    pub mtime: LodeTime,
    pub atime: LodeTime,
    pub size: u64,
}

impl Pack for FileBody {
    fn packed_size(&self) -> usize {
        1 + 8 + 8 + 8
    }
    fn pack(&self, p: &mut Packer) {
        p.pack_u8(self.version);
        self.mtime.pack(p);
        self.atime.pack(p);
        p.pack_u64(self.size);
    }
    fn unpack(u: &mut Unpacker<'_>) -> Result<Self, LodeError> {
        Ok(FileBody {
            version: u.unpack_u8()?,
            mtime: LodeTime::unpack(u)?,
            atime: LodeTime::unpack(u)?,
            size: u.unpack_u64()?,
        })
    }
}

/// A file in construction or reclamation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransientFileBody {
    pub version: u8,
    pub size: u64,
    pub mtime: LodeTime,
    /// After this passes, the GC may scrap the file.
    pub deadline: LodeTime,
    pub last_span_state: SpanState,
    /// Free-form provenance note (the original name for unlinked files).
    pub note: ShortBytes,
}

impl Pack for TransientFileBody {
    fn packed_size(&self) -> usize {
        1 + 8 + 8 + 8 + 1 + self.note.packed_size()
    }
    fn pack(&self, p: &mut Packer) {
        p.pack_u8(self.version);
        p.pack_u64(self.size);
        self.mtime.pack(p);
        self.deadline.pack(p);
        p.pack_u8(self.last_span_state as u8);
        self.note.pack(p);
    }
    fn unpack(u: &mut Unpacker<'_>) -> Result<Self, LodeError> {
        Ok(TransientFileBody {
            version: u.unpack_u8()?,
            size: u.unpack_u64()?,
            mtime: LodeTime::unpack(u)?,
            deadline: LodeTime::unpack(u)?,
            last_span_state: SpanState::from_u8(u.unpack_u8()?)?,
            note: ShortBytes::unpack(u)?,
        })
    }
}

/// A directory inode. `owner_id == NULL` (except for the root) marks a
/// snapshot directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirectoryBody {
    pub version: u8,
    pub owner_id: InodeId,
    pub mtime: LodeTime,
    pub hash_mode: HashMode,
    pub info: DirectoryInfo,
}

impl Pack for DirectoryBody {
    fn packed_size(&self) -> usize {
        1 + 8 + 8 + 1 + self.info.packed_size()
    }
    fn pack(&self, p: &mut Packer) {
        p.pack_u8(self.version);
        self.owner_id.pack(p);
        self.mtime.pack(p);
        p.pack_u8(self.hash_mode as u8);
        self.info.pack(p);
    }
    fn unpack(u: &mut Unpacker<'_>) -> Result<Self, LodeError> {
        Ok(DirectoryBody {
            version: u.unpack_u8()?,
            owner_id: InodeId::unpack(u)?,
            mtime: LodeTime::unpack(u)?,
            hash_mode: HashMode::from_u8(u.unpack_u8()?)?,
            info: DirectoryInfo::unpack(u)?,
        })
    }
}

/// Body of a current edge; the extra bit on the target is "locked".
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CurrentEdgeBody {
    pub version: u8,
    pub target_id: InodeIdExtra,
    pub creation_time: LodeTime,
}

impl CurrentEdgeBody {
    pub fn locked(&self) -> bool {
        self.target_id.extra()
    }
}

impl Pack for CurrentEdgeBody {
    fn packed_size(&self) -> usize {
        1 + 8 + 8
    }
    fn pack(&self, p: &mut Packer) {
        p.pack_u8(self.version);
        self.target_id.pack(p);
        self.creation_time.pack(p);
    }
    fn unpack(u: &mut Unpacker<'_>) -> Result<Self, LodeError> {
        Ok(CurrentEdgeBody {
            version: u.unpack_u8()?,
            target_id: InodeIdExtra::unpack(u)?,
            creation_time: LodeTime::unpack(u)?,
        })
    }
}

/// Body of a snapshot edge; the extra bit on the target is "owned". A NULL
/// target marks a deletion edge.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SnapshotEdgeBody {
    pub version: u8,
    pub target_id: InodeIdExtra,
}

impl SnapshotEdgeBody {
    pub fn owned(&self) -> bool {
        self.target_id.extra()
    }
}

impl Pack for SnapshotEdgeBody {
    fn packed_size(&self) -> usize {
        1 + 8
    }
    fn pack(&self, p: &mut Packer) {
        p.pack_u8(self.version);
        self.target_id.pack(p);
    }
    fn unpack(u: &mut Unpacker<'_>) -> Result<Self, LodeError> {
        Ok(SnapshotEdgeBody {
            version: u.unpack_u8()?,
            target_id: InodeIdExtra::unpack(u)?,
        })
    }
}

/// One block of a stored span location.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockBody {
    pub block_service_id: BlockServiceId,
    pub block_id: u64,
    pub crc: u32,
}

impl Pack for BlockBody {
    fn packed_size(&self) -> usize {
        8 + 8 + 4
    }
    fn pack(&self, p: &mut Packer) {
        self.block_service_id.pack(p);
        p.pack_u64(self.block_id);
        p.pack_u32(self.crc);
    }
    fn unpack(u: &mut Unpacker<'_>) -> Result<Self, LodeError> {
        Ok(BlockBody {
            block_service_id: BlockServiceId::unpack(u)?,
            block_id: u.unpack_u64()?,
            crc: u.unpack_u32()?,
        })
    }
}

/// Block placement of a span at one location.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocationBlocksBody {
    pub location_id: LocationId,
    pub storage_class: StorageClass,
    pub parity: Parity,
    pub stripes: u8,
    pub cell_size: u32,
    pub blocks: Vec<BlockBody>,
    pub stripe_crcs: Vec<u32>,
}

impl LocationBlocksBody {
    /// Size of each block: one cell per stripe.
    pub fn block_size(&self) -> u32 {
        self.cell_size * self.stripes as u32
    }
}

impl Pack for LocationBlocksBody {
    fn packed_size(&self) -> usize {
        1 + 1 + 1 + 1 + 4 + self.blocks.packed_size() + self.stripe_crcs.packed_size()
    }
    fn pack(&self, p: &mut Packer) {
        p.pack_u8(self.location_id);
        self.storage_class.pack(p);
        self.parity.pack(p);
        p.pack_u8(self.stripes);
        p.pack_u32(self.cell_size);
        self.blocks.pack(p);
        self.stripe_crcs.pack(p);
    }
    fn unpack(u: &mut Unpacker<'_>) -> Result<Self, LodeError> {
        Ok(LocationBlocksBody {
            location_id: u.unpack_u8()?,
            storage_class: StorageClass::unpack(u)?,
            parity: Parity::unpack(u)?,
            stripes: u.unpack_u8()?,
            cell_size: u.unpack_u32()?,
            blocks: Vec::unpack(u)?,
            stripe_crcs: Vec::unpack(u)?,
        })
    }
}

/// Content of a stored span.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SpanStorage {
    /// Bytes stored in the metadata value itself.
    Inline(ShortBytes),
    /// Block placements, one entry per location holding the content.
    Blocked(Vec<LocationBlocksBody>),
}

/// A stored span: `[byte_offset, byte_offset + size)` of a file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpanBody {
    pub size: u32,
    /// CRC32C of the logical span content.
    pub crc: u32,
    pub storage: SpanStorage,
}

impl SpanBody {
    pub fn is_inline(&self) -> bool {
        matches!(self.storage, SpanStorage::Inline(_))
    }

    /// The span's locations; empty for inline spans.
    pub fn locations(&self) -> &[LocationBlocksBody] {
        match &self.storage {
            SpanStorage::Inline(_) => &[],
            SpanStorage::Blocked(locations) => locations,
        }
    }

    pub fn locations_mut(&mut self) -> &mut [LocationBlocksBody] {
        match &mut self.storage {
            SpanStorage::Inline(_) => &mut [],
            SpanStorage::Blocked(locations) => locations,
        }
    }

    /// The location entry with the given id, if present.
    pub fn find_location(&self, location_id: LocationId) -> Option<&LocationBlocksBody> {
        self.locations().iter().find(|l| l.location_id == location_id)
    }

    /// Finds a block by id across all locations, returning
    /// `(location index, block index)`.
    pub fn find_block(&self, block_id: u64) -> Option<(usize, usize)> {
        for (li, location) in self.locations().iter().enumerate() {
            for (bi, block) in location.blocks.iter().enumerate() {
                if block.block_id == block_id {
                    return Some((li, bi));
                }
            }
        }
        None
    }

    /// True if the span's block ids, in location-then-block order, equal
    /// `blocks`.
    pub fn blocks_match(&self, blocks: &[u64]) -> bool {
        let mut ix = 0;
        for location in self.locations() {
            for block in &location.blocks {
                if ix >= blocks.len() || block.block_id != blocks[ix] {
                    return false;
                }
                ix += 1;
            }
        }
        ix == blocks.len()
    }
}

impl Pack for SpanBody {
    fn packed_size(&self) -> usize {
        4 + 4
            + 1
            + match &self.storage {
                SpanStorage::Inline(body) => body.packed_size(),
                SpanStorage::Blocked(locations) => locations.packed_size(),
            }
    }
    fn pack(&self, p: &mut Packer) {
        p.pack_u32(self.size);
        p.pack_u32(self.crc);
        match &self.storage {
            SpanStorage::Inline(body) => {
                p.pack_u8(0);
                body.pack(p);
            }
            SpanStorage::Blocked(locations) => {
                p.pack_u8(1);
                locations.pack(p);
            }
        }
    }
    fn unpack(u: &mut Unpacker<'_>) -> Result<Self, LodeError> {
        let size = u.unpack_u32()?;
        let crc = u.unpack_u32()?;
        let storage = match u.unpack_u8()? {
            0 => SpanStorage::Inline(ShortBytes::unpack(u)?),
            1 => SpanStorage::Blocked(Vec::unpack(u)?),
            _ => return Err(LodeError::BadEncoding),
        };
        Ok(SpanBody { size, crc, storage })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lodefs_proto::ids::{InodeType, ShardId};
    use proptest::prelude::*;

    fn dir_id(counter: u64) -> InodeId {
        InodeId::new(InodeType::Directory, ShardId(0), counter)
    }

    proptest! {
        // snapshot edge keys must order exactly like the tuple
        // (hash, (name length, name), creation time)
        #[test]
        fn prop_snapshot_edge_keys_sort_like_tuples(
            hash1 in 0u64..1 << 63, hash2 in 0u64..1 << 63,
            name1 in proptest::collection::vec(any::<u8>(), 0..16),
            name2 in proptest::collection::vec(any::<u8>(), 0..16),
            t1 in any::<u64>(), t2 in any::<u64>(),
        ) {
            let dir = dir_id(1);
            let k1 = snapshot_edge_key(dir, hash1, &name1, LodeTime(t1));
            let k2 = snapshot_edge_key(dir, hash2, &name2, LodeTime(t2));
            let tuple1 = (hash1, name1.len(), name1.clone(), t1);
            let tuple2 = (hash2, name2.len(), name2.clone(), t2);
            prop_assert_eq!(k1.cmp(&k2), tuple1.cmp(&tuple2));
        }

        #[test]
        fn prop_edge_key_parse_roundtrip(
            hash in 0u64..1 << 63,
            name in proptest::collection::vec(any::<u8>(), 0..32),
            t in any::<u64>(),
        ) {
            let dir = dir_id(7);
            let parsed = parse_edge_key(&snapshot_edge_key(dir, hash, &name, LodeTime(t)));
            prop_assert_eq!(parsed.dir_id, dir);
            prop_assert!(!parsed.current);
            prop_assert_eq!(parsed.name_hash, hash);
            prop_assert_eq!(parsed.name, name);
            prop_assert_eq!(parsed.creation_time, LodeTime(t));
        }
    }

    #[test]
    fn test_edge_key_ordering() {
        let dir = dir_id(1);
        // current edges sort before snapshot edges of the same directory
        let current = current_edge_key(dir, 5, b"name");
        let snapshot = snapshot_edge_key(dir, 5, b"name", LodeTime(100));
        assert!(current < snapshot);

        // within (dir, current), lower hashes sort first
        let low = current_edge_key(dir, 4, b"zzz");
        assert!(low < current);

        // all edges of dir sort before any edge of dir+1
        let next_dir = current_edge_key(dir_id(2), 0, b"");
        assert!(snapshot < next_dir);
        assert!(snapshot < edge_scan_end(dir, false));
        assert!(current < edge_scan_end(dir, true));
        assert!(edge_scan_end(dir, true) <= snapshot);
    }

    #[test]
    fn test_snapshot_edges_order_by_time() {
        let dir = dir_id(1);
        let old = snapshot_edge_key(dir, 7, b"a", LodeTime(100));
        let new = snapshot_edge_key(dir, 7, b"a", LodeTime(200));
        assert!(old < new);
        assert!(new < snapshot_edge_group_end(dir, 7, b"a"));

        let parsed = parse_edge_key(&new);
        assert_eq!(parsed.dir_id, dir);
        assert!(!parsed.current);
        assert_eq!(parsed.name_hash, 7);
        assert_eq!(parsed.name, b"a");
        assert_eq!(parsed.creation_time, LodeTime(200));
    }

    #[test]
    fn test_current_edge_key_roundtrip() {
        let dir = dir_id(9);
        let key = current_edge_key(dir, 0xABCDEF, b"file.txt");
        let parsed = parse_edge_key(&key);
        assert_eq!(parsed.dir_id, dir);
        assert!(parsed.current);
        assert_eq!(parsed.name_hash, 0xABCDEF);
        assert_eq!(parsed.name, b"file.txt");
        assert_eq!(parsed.creation_time, LodeTime::ZERO);
    }

    #[test]
    fn test_span_key_ordering() {
        let f1 = InodeId::new(InodeType::File, ShardId(0), 1);
        let f2 = InodeId::new(InodeType::File, ShardId(0), 2);
        assert!(span_key(f1, 0) < span_key(f1, 4096));
        assert!(span_key(f1, u64::MAX) < span_key(f2, 0));
        assert_eq!(parse_span_key(&span_key(f1, 77)), (f1, 77));
    }

    #[test]
    fn test_block_service_to_file_key_roundtrip() {
        let bs = BlockServiceId(0xDEAD);
        let f = InodeId::new(InodeType::File, ShardId(3), 4);
        let key = block_service_to_file_key(bs, f);
        assert_eq!(parse_block_service_to_file_key(&key), (bs, f));
        assert!(key < block_service_to_file_key(BlockServiceId(0xDEAE), f));
    }

    #[test]
    fn test_file_body_roundtrip() {
        let body = FileBody {
            version: 0,
            mtime: LodeTime(1),
            atime: LodeTime(2),
            size: 1234,
        };
        assert_eq!(decode::<FileBody>(&encode(&body)).unwrap(), body);
    }

    #[test]
    fn test_transient_file_body_roundtrip() {
        let body = TransientFileBody {
            version: 0,
            size: 8192,
            mtime: LodeTime(5),
            deadline: LodeTime(10),
            last_span_state: SpanState::Dirty,
            note: ShortBytes::from_static(b"constructing"),
        };
        assert_eq!(decode::<TransientFileBody>(&encode(&body)).unwrap(), body);
    }

    #[test]
    fn test_directory_body_roundtrip() {
        let body = DirectoryBody {
            version: 0,
            owner_id: dir_id(1),
            mtime: LodeTime(9),
            hash_mode: HashMode::Xxh3_63,
            info: lodefs_proto::msgs::default_directory_info(),
        };
        assert_eq!(decode::<DirectoryBody>(&encode(&body)).unwrap(), body);
    }

    #[test]
    fn test_span_body_roundtrip() {
        let inline = SpanBody {
            size: 10,
            crc: 0xAA,
            storage: SpanStorage::Inline(ShortBytes::from_static(b"0123456789")),
        };
        assert_eq!(decode::<SpanBody>(&encode(&inline)).unwrap(), inline);

        let blocked = SpanBody {
            size: 8192,
            crc: 0xBB,
            storage: SpanStorage::Blocked(vec![LocationBlocksBody {
                location_id: 0,
                storage_class: StorageClass::Flash,
                parity: Parity::new(2, 2),
                stripes: 1,
                cell_size: 4096,
                blocks: vec![
                    BlockBody {
                        block_service_id: BlockServiceId(1),
                        block_id: 0x100,
                        crc: 1,
                    },
                    BlockBody {
                        block_service_id: BlockServiceId(2),
                        block_id: 0x200,
                        crc: 2,
                    },
                    BlockBody {
                        block_service_id: BlockServiceId(3),
                        block_id: 0x300,
                        crc: 3,
                    },
                    BlockBody {
                        block_service_id: BlockServiceId(4),
                        block_id: 0x400,
                        crc: 4,
                    },
                ],
                stripe_crcs: vec![5],
            }]),
        };
        let decoded = decode::<SpanBody>(&encode(&blocked)).unwrap();
        assert_eq!(decoded, blocked);
        assert!(!decoded.is_inline());
        assert_eq!(decoded.find_block(0x300), Some((0, 2)));
        assert!(decoded.blocks_match(&[0x100, 0x200, 0x300, 0x400]));
        assert!(!decoded.blocks_match(&[0x100, 0x200, 0x300]));
    }
}
