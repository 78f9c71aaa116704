//! Shard request and response messages.
//!
//! Every message travels as `[u32 protocol][u64 request id][u8 kind][body]`;
//! the response kind equals the request kind on success, or
//! [`ShardMessageKind::Error`] with a `u16` error code. All bodies use the
//! codec in [`crate::bincode`].

use crate::bincode::{list_packed_size, Pack, Packer, ShortBytes, Unpacker};
use crate::crypto::ExpandedKey;
use crate::error::LodeError;
use crate::ids::{
    BlockServiceId, FailureDomain, InodeId, InodeIdExtra, LocationId, LodeTime, Parity,
    StorageClass,
};

/// Version tag on every request/response frame.
pub const SHARD_PROTOCOL_VERSION: u32 = 1;

/// Frame header: protocol version, request id, kind byte.
pub const FRAME_HEADER_SIZE: usize = 4 + 8 + 1;

/// 1500 minus IP and ICMP headers.
pub const DEFAULT_UDP_MTU: usize = 1472;
/// 9000 minus IP and ICMP headers.
pub const MAX_UDP_MTU: usize = 8972;

/// Span byte offsets and cell sizes are page-aligned.
pub const PAGE_SIZE: u64 = 4096;

/// Upper bound on a single span's logical size (100 MiB).
pub const MAXIMUM_SPAN_SIZE: u32 = 100 << 20;

/// Block service flag bits.
pub const BLOCK_SERVICE_STALE: u8 = 1;
pub const BLOCK_SERVICE_NO_READ: u8 = 1 << 1;
pub const BLOCK_SERVICE_NO_WRITE: u8 = 1 << 2;
pub const BLOCK_SERVICE_DECOMMISSIONED: u8 = 1 << 3;
pub const BLOCK_SERVICE_DONT_READ: u8 =
    BLOCK_SERVICE_STALE | BLOCK_SERVICE_NO_READ | BLOCK_SERVICE_DECOMMISSIONED;
pub const BLOCK_SERVICE_DONT_WRITE: u8 =
    BLOCK_SERVICE_STALE | BLOCK_SERVICE_NO_WRITE | BLOCK_SERVICE_DECOMMISSIONED;

/// `FullReadDir` flag bits.
pub const FULL_READ_DIR_CURRENT: u8 = 1;
pub const FULL_READ_DIR_BACKWARDS: u8 = 1 << 1;
pub const FULL_READ_DIR_SAME_NAME: u8 = 1 << 2;

/// Checks an edge name: non-empty, at most 255 bytes, no '/', no NUL, and
/// not one of the dot entries.
pub fn valid_name(name: &[u8]) -> bool {
    if name.is_empty() || name.len() > 255 {
        return false;
    }
    if name == b"." || name == b".." {
        return false;
    }
    !name.iter().any(|&b| b == b'/' || b == 0)
}

macro_rules! packable {
    ($(#[$meta:meta])* pub struct $name:ident { $( $(#[$fmeta:meta])* pub $field:ident: $ty:ty, )* }) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq)]
        pub struct $name { $( $(#[$fmeta])* pub $field: $ty, )* }

        impl Pack for $name {
            fn packed_size(&self) -> usize {
                0 $( + self.$field.packed_size() )*
            }
            #[allow(unused_variables)]
            fn pack(&self, p: &mut Packer) {
                $( self.$field.pack(p); )*
            }
            #[allow(unused_variables)]
            fn unpack(u: &mut Unpacker<'_>) -> Result<Self, LodeError> {
                Ok($name { $( $field: Pack::unpack(u)?, )* })
            }
        }
    };
}
pub(crate) use packable;

// ----------------------------------------------------------------
// shared payload types

packable! {
    /// An `ip:port` endpoint of a block service.
    pub struct IpPort {
        pub ip: [u8; 4],
        pub port: u16,
    }
}

packable! {
    /// The two published endpoints of a block service.
    pub struct AddrsInfo {
        pub addr1: IpPort,
        pub addr2: IpPort,
    }
}

impl AddrsInfo {
    /// A zeroed placeholder for tests and unknown services.
    pub fn empty() -> AddrsInfo {
        AddrsInfo {
            addr1: IpPort { ip: [0; 4], port: 0 },
            addr2: IpPort { ip: [0; 4], port: 0 },
        }
    }
}

packable! {
    /// One entry of a block-service blacklist: matched by id or by failure
    /// domain.
    pub struct BlacklistEntry {
        pub failure_domain: FailureDomain,
        pub block_service: BlockServiceId,
    }
}

packable! {
    /// A client-returned proof for one block.
    pub struct BlockProof {
        pub block_id: u64,
        pub proof: [u8; 8],
    }
}

packable! {
    /// A current directory entry, as returned by `ReadDir`.
    pub struct CurrentEdge {
        pub target_id: InodeId,
        pub name_hash: u64,
        pub name: ShortBytes,
        pub creation_time: LodeTime,
    }
}

packable! {
    /// A directory entry (current or snapshot), as returned by
    /// `FullReadDir`. The extra bit on `target_id` is "locked" for current
    /// edges and "owned" for snapshot edges.
    pub struct Edge {
        pub current: bool,
        pub target_id: InodeIdExtra,
        pub name_hash: u64,
        pub name: ShortBytes,
        pub creation_time: LodeTime,
    }
}

packable! {
    /// Continuation cursor for `FullReadDir`.
    pub struct FullReadDirCursor {
        pub current: bool,
        pub start_name: ShortBytes,
        pub start_time: LodeTime,
    }
}

impl FullReadDirCursor {
    /// The "done" cursor.
    pub fn finished() -> FullReadDirCursor {
        FullReadDirCursor {
            current: false,
            start_name: ShortBytes::default(),
            start_time: LodeTime::ZERO,
        }
    }
}

packable! {
    /// A block service referenced from a spans response, with the contact
    /// details a client needs.
    pub struct BlockServiceEntry {
        pub id: BlockServiceId,
        pub addrs: AddrsInfo,
        pub flags: u8,
    }
}

packable! {
    /// Offset, size and content CRC of one span.
    pub struct SpanHeader {
        pub byte_offset: u64,
        pub size: u32,
        pub crc: u32,
    }
}

packable! {
    /// One block inside a fetched span; the service is an index into the
    /// response's block service table.
    pub struct FetchedBlock {
        pub block_service_ix: u8,
        pub block_id: u64,
        pub crc: u32,
    }
}

packable! {
    /// Block placement of a fetched span at one location.
    pub struct FetchedBlocksSpan {
        pub location_id: LocationId,
        pub storage_class: StorageClass,
        pub parity: Parity,
        pub stripes: u8,
        pub cell_size: u32,
        pub blocks: Vec<FetchedBlock>,
        pub stripes_crc: Vec<u32>,
    }
}

/// Content of a fetched span: inline bytes or block placements.
///
/// `LocalFileSpans` returns a single location; `FileSpans` returns them all.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FetchedSpanBody {
    Inline(ShortBytes),
    Blocks(Vec<FetchedBlocksSpan>),
}

packable! {
    /// One span of a spans response.
    pub struct FetchedSpan {
        pub header: SpanHeader,
        pub body: FetchedSpanBody,
    }
}

impl Pack for FetchedSpanBody {
    fn packed_size(&self) -> usize {
        1 + match self {
            FetchedSpanBody::Inline(body) => body.packed_size(),
            FetchedSpanBody::Blocks(locations) => list_packed_size(locations),
        }
    }
    fn pack(&self, p: &mut Packer) {
        match self {
            FetchedSpanBody::Inline(body) => {
                p.pack_u8(0);
                body.pack(p);
            }
            FetchedSpanBody::Blocks(locations) => {
                p.pack_u8(1);
                locations.pack(p);
            }
        }
    }
    fn unpack(u: &mut Unpacker<'_>) -> Result<Self, LodeError> {
        match u.unpack_u8()? {
            0 => Ok(FetchedSpanBody::Inline(Pack::unpack(u)?)),
            1 => Ok(FetchedSpanBody::Blocks(Pack::unpack(u)?)),
            _ => Err(LodeError::BadEncoding),
        }
    }
}

packable! {
    /// One block handed out by `AddSpanInitiate`, with the write
    /// certificate the client forwards to the block service.
    pub struct AddSpanInitiateBlockInfo {
        pub block_service_id: BlockServiceId,
        pub block_service_addrs: AddrsInfo,
        pub block_service_failure_domain: FailureDomain,
        pub block_id: u64,
        pub certificate: [u8; 8],
    }
}

packable! {
    /// One block to erase, handed out by `RemoveSpanInitiate` with its
    /// erase certificate.
    pub struct RemoveSpanInitiateBlockInfo {
        pub block_service_id: BlockServiceId,
        pub block_service_addrs: AddrsInfo,
        pub block_service_flags: u8,
        pub block_id: u64,
        pub certificate: [u8; 8],
    }
}

packable! {
    /// One transient file of a `VisitTransientFiles` page.
    pub struct TransientFileEntry {
        pub id: InodeId,
        pub cookie: [u8; 8],
        pub deadline_time: LodeTime,
    }
}

// ----------------------------------------------------------------
// directory info policy blob

/// Tag for [`SnapshotPolicy`] segments.
pub const SNAPSHOT_POLICY_TAG: u8 = 1;
/// Tag for [`BlockPolicy`] segments.
pub const BLOCK_POLICY_TAG: u8 = 2;
/// Tag for [`SpanPolicy`] segments.
pub const SPAN_POLICY_TAG: u8 = 3;
/// Tag for [`StripePolicy`] segments.
pub const STRIPE_POLICY_TAG: u8 = 4;

packable! {
    /// One tagged, opaque policy segment.
    pub struct DirectoryInfoEntry {
        pub tag: u8,
        pub body: ShortBytes,
    }
}

packable! {
    /// The per-directory policy blob. The engine stores it opaquely;
    /// inheritance is the coordinator's business.
    pub struct DirectoryInfo {
        pub entries: Vec<DirectoryInfoEntry>,
    }
}

impl DirectoryInfo {
    pub fn empty() -> DirectoryInfo {
        DirectoryInfo { entries: Vec::new() }
    }
}

packable! {
    /// When snapshot edges get garbage collected. The high bit of
    /// `delete_after_time` flags the field as set.
    pub struct SnapshotPolicy {
        pub delete_after_time: u64,
        pub delete_after_versions: u16,
    }
}

packable! {
    /// One size threshold of a [`BlockPolicy`].
    pub struct BlockPolicyEntry {
        pub storage_class: StorageClass,
        pub min_size: u32,
    }
}

packable! {
    /// Storage class by block size.
    pub struct BlockPolicy {
        pub entries: Vec<BlockPolicyEntry>,
    }
}

packable! {
    /// One size threshold of a [`SpanPolicy`].
    pub struct SpanPolicyEntry {
        pub max_size: u32,
        pub parity: Parity,
    }
}

packable! {
    /// Parity by span size.
    pub struct SpanPolicy {
        pub entries: Vec<SpanPolicyEntry>,
    }
}

packable! {
    /// Target stripe size for new spans.
    pub struct StripePolicy {
        pub target_stripe_size: u32,
    }
}

fn info_segment<T: Pack>(tag: u8, segment: &T) -> DirectoryInfoEntry {
    let mut p = Packer::with_capacity(segment.packed_size());
    segment.pack(&mut p);
    DirectoryInfoEntry {
        tag,
        body: ShortBytes::new(p.into_bytes()).expect("policy segment too large"),
    }
}

/// The policy blob installed on the root directory at first start-up.
pub fn default_directory_info() -> DirectoryInfo {
    let mut entries = Vec::new();

    // snapshots: delete after 30 days, never by version count
    entries.push(info_segment(
        SNAPSHOT_POLICY_TAG,
        &SnapshotPolicy {
            delete_after_time: (30 * 24 * 60 * 60 * 1_000_000_000u64) | (1 << 63),
            delete_after_versions: 0,
        },
    ));

    // blocks: FLASH until ~2.5MB (page aligned), HDD beyond
    entries.push(info_segment(
        BLOCK_POLICY_TAG,
        &BlockPolicy {
            entries: vec![
                BlockPolicyEntry {
                    storage_class: StorageClass::Flash,
                    min_size: 0,
                },
                BlockPolicyEntry {
                    storage_class: StorageClass::Hdd,
                    min_size: 610 << 12,
                },
            ],
        },
    ));

    // spans: (10,4) up to ~5MB, then (2,4)..(10,4) stepping ~2.5MB
    let mut span_entries = vec![SpanPolicyEntry {
        max_size: (2 * 610) << 12,
        parity: Parity::new(10, 4),
    }];
    for i in 1..10u8 {
        let prev = span_entries.last().unwrap().max_size;
        span_entries.push(SpanPolicyEntry {
            max_size: prev + (610 << 12),
            parity: Parity::new(i + 1, 4),
        });
    }
    entries.push(info_segment(SPAN_POLICY_TAG, &SpanPolicy { entries: span_entries }));

    // stripes: aim for 1MiB
    entries.push(info_segment(
        STRIPE_POLICY_TAG,
        &StripePolicy {
            target_stripe_size: 1 << 20,
        },
    ));

    DirectoryInfo { entries }
}

// ----------------------------------------------------------------
// read requests/responses

packable! {
    pub struct LookupReq {
        pub dir_id: InodeId,
        pub name: ShortBytes,
    }
}

packable! {
    pub struct LookupResp {
        pub target_id: InodeId,
        pub creation_time: LodeTime,
    }
}

packable! {
    pub struct StatFileReq {
        pub id: InodeId,
    }
}

packable! {
    pub struct StatFileResp {
        pub mtime: LodeTime,
        pub atime: LodeTime,
        pub size: u64,
    }
}

packable! {
    pub struct StatDirectoryReq {
        pub id: InodeId,
    }
}

packable! {
    pub struct StatDirectoryResp {
        pub mtime: LodeTime,
        pub owner: InodeId,
        pub info: DirectoryInfo,
    }
}

packable! {
    pub struct StatTransientFileReq {
        pub id: InodeId,
    }
}

packable! {
    pub struct StatTransientFileResp {
        pub mtime: LodeTime,
        pub size: u64,
        pub note: ShortBytes,
    }
}

packable! {
    /// Pages the current edges of a directory by name hash.
    pub struct ReadDirReq {
        pub dir_id: InodeId,
        pub start_hash: u64,
        pub mtu: u16,
    }
}

packable! {
    pub struct ReadDirResp {
        pub next_hash: u64,
        pub results: Vec<CurrentEdge>,
    }
}

packable! {
    /// Walks current and/or snapshot edges, forward or backward, optionally
    /// restricted to a single name. See the `FULL_READ_DIR_*` flags.
    pub struct FullReadDirReq {
        pub dir_id: InodeId,
        pub flags: u8,
        pub start_name: ShortBytes,
        pub start_time: LodeTime,
        pub limit: u16,
        pub mtu: u16,
    }
}

packable! {
    pub struct FullReadDirResp {
        pub next: FullReadDirCursor,
        pub results: Vec<Edge>,
    }
}

packable! {
    /// Spans intersecting `[byte_offset, ..)`, blocks of one location only.
    pub struct LocalFileSpansReq {
        pub file_id: InodeId,
        pub byte_offset: u64,
        pub limit: u32,
        pub mtu: u16,
    }
}

packable! {
    pub struct LocalFileSpansResp {
        pub next_offset: u64,
        pub block_services: Vec<BlockServiceEntry>,
        pub spans: Vec<FetchedSpan>,
    }
}

packable! {
    /// Spans intersecting `[byte_offset, ..)`, all locations.
    pub struct FileSpansReq {
        pub file_id: InodeId,
        pub byte_offset: u64,
        pub limit: u32,
        pub mtu: u16,
    }
}

packable! {
    pub struct FileSpansResp {
        pub next_offset: u64,
        pub block_services: Vec<BlockServiceEntry>,
        pub spans: Vec<FetchedSpan>,
    }
}

packable! {
    pub struct VisitDirectoriesReq {
        pub begin_id: InodeId,
        pub mtu: u16,
    }
}

packable! {
    pub struct VisitDirectoriesResp {
        pub next_id: InodeId,
        pub ids: Vec<InodeId>,
    }
}

packable! {
    pub struct VisitFilesReq {
        pub begin_id: InodeId,
        pub mtu: u16,
    }
}

packable! {
    pub struct VisitFilesResp {
        pub next_id: InodeId,
        pub ids: Vec<InodeId>,
    }
}

packable! {
    pub struct VisitTransientFilesReq {
        pub begin_id: InodeId,
        pub mtu: u16,
    }
}

packable! {
    pub struct VisitTransientFilesResp {
        pub next_id: InodeId,
        pub files: Vec<TransientFileEntry>,
    }
}

packable! {
    /// First file with a positive block count for this service, at or after
    /// `start_from`.
    pub struct BlockServiceFilesReq {
        pub block_service_id: BlockServiceId,
        pub start_from: InodeId,
    }
}

packable! {
    pub struct BlockServiceFilesResp {
        pub file_ids: Vec<InodeId>,
    }
}

// ----------------------------------------------------------------
// write requests/responses

packable! {
    /// Creates a transient file or symlink inode.
    pub struct ConstructFileReq {
        pub file_type: u8,
        pub note: ShortBytes,
    }
}

packable! {
    pub struct ConstructFileResp {
        pub id: InodeId,
        pub cookie: [u8; 8],
    }
}

packable! {
    /// Promotes a clean transient file to a committed file under a new
    /// current edge.
    pub struct LinkFileReq {
        pub file_id: InodeId,
        pub cookie: [u8; 8],
        pub owner_id: InodeId,
        pub name: ShortBytes,
    }
}

packable! {
    pub struct LinkFileResp {
        pub creation_time: LodeTime,
    }
}

packable! {
    pub struct SameDirectoryRenameReq {
        pub target_id: InodeId,
        pub dir_id: InodeId,
        pub old_name: ShortBytes,
        pub old_creation_time: LodeTime,
        pub new_name: ShortBytes,
    }
}

packable! {
    pub struct SameDirectoryRenameResp {
        pub new_creation_time: LodeTime,
    }
}

packable! {
    /// Rename that revives an owned snapshot edge as the source.
    pub struct SameDirectoryRenameSnapshotReq {
        pub target_id: InodeId,
        pub dir_id: InodeId,
        pub old_name: ShortBytes,
        pub old_creation_time: LodeTime,
        pub new_name: ShortBytes,
    }
}

packable! {
    pub struct SameDirectoryRenameSnapshotResp {
        pub new_creation_time: LodeTime,
    }
}

packable! {
    pub struct SoftUnlinkFileReq {
        pub owner_id: InodeId,
        pub file_id: InodeId,
        pub name: ShortBytes,
        pub creation_time: LodeTime,
    }
}

packable! {
    pub struct SoftUnlinkFileResp {
        pub delete_creation_time: LodeTime,
    }
}

packable! {
    /// GC: removes an owned snapshot edge and makes its target transient.
    pub struct SameShardHardFileUnlinkReq {
        pub owner_id: InodeId,
        pub target_id: InodeId,
        pub name: ShortBytes,
        pub creation_time: LodeTime,
    }
}

packable! {
    pub struct SameShardHardFileUnlinkResp {}
}

packable! {
    /// The CDC hands out directory inode ids; the shard just materializes
    /// them.
    pub struct CreateDirectoryInodeReq {
        pub id: InodeId,
        pub owner_id: InodeId,
        pub info: DirectoryInfo,
    }
}

packable! {
    pub struct CreateDirectoryInodeResp {
        pub mtime: LodeTime,
    }
}

packable! {
    pub struct SetDirectoryOwnerReq {
        pub dir_id: InodeId,
        pub owner_id: InodeId,
    }
}

packable! {
    pub struct SetDirectoryOwnerResp {}
}

packable! {
    /// Clears the owner, turning the directory into a snapshot directory.
    /// Carries the info blob to store alongside (policies may need to
    /// outlive the owner).
    pub struct RemoveDirectoryOwnerReq {
        pub dir_id: InodeId,
        pub info: DirectoryInfo,
    }
}

packable! {
    pub struct RemoveDirectoryOwnerResp {}
}

packable! {
    pub struct SetDirectoryInfoReq {
        pub id: InodeId,
        pub info: DirectoryInfo,
    }
}

packable! {
    pub struct SetDirectoryInfoResp {}
}

packable! {
    /// Cross-directory rename step: create an edge born locked.
    pub struct CreateLockedCurrentEdgeReq {
        pub dir_id: InodeId,
        pub name: ShortBytes,
        pub target_id: InodeId,
        pub old_creation_time: LodeTime,
    }
}

packable! {
    pub struct CreateLockedCurrentEdgeResp {
        pub creation_time: LodeTime,
    }
}

packable! {
    pub struct LockCurrentEdgeReq {
        pub dir_id: InodeId,
        pub name: ShortBytes,
        pub target_id: InodeId,
        pub creation_time: LodeTime,
    }
}

packable! {
    pub struct LockCurrentEdgeResp {}
}

packable! {
    /// Unlock an edge; `was_moved` additionally retires it into a snapshot
    /// edge plus a deletion marker (the rename took the target elsewhere).
    pub struct UnlockCurrentEdgeReq {
        pub dir_id: InodeId,
        pub name: ShortBytes,
        pub target_id: InodeId,
        pub creation_time: LodeTime,
        pub was_moved: bool,
    }
}

packable! {
    pub struct UnlockCurrentEdgeResp {}
}

packable! {
    /// Final inode removal: directories must be ownerless and edgeless,
    /// files must be transient, past deadline and spanless.
    pub struct RemoveInodeReq {
        pub id: InodeId,
    }
}

packable! {
    pub struct RemoveInodeResp {}
}

packable! {
    pub struct RemoveNonOwnedEdgeReq {
        pub dir_id: InodeId,
        pub name: ShortBytes,
        pub creation_time: LodeTime,
    }
}

packable! {
    pub struct RemoveNonOwnedEdgeResp {}
}

packable! {
    pub struct RemoveOwnedSnapshotFileEdgeReq {
        pub owner_id: InodeId,
        pub target_id: InodeId,
        pub name: ShortBytes,
        pub creation_time: LodeTime,
    }
}

packable! {
    pub struct RemoveOwnedSnapshotFileEdgeResp {}
}

packable! {
    /// Appends an EMPTY or INLINE span; clean-to-clean, no certification.
    pub struct AddInlineSpanReq {
        pub file_id: InodeId,
        pub cookie: [u8; 8],
        pub storage_class: StorageClass,
        pub byte_offset: u64,
        pub size: u32,
        pub crc: u32,
        pub body: ShortBytes,
    }
}

packable! {
    pub struct AddInlineSpanResp {}
}

packable! {
    /// Starts ingest of a blocked span at the tail of a transient file.
    pub struct AddSpanInitiateReq {
        pub file_id: InodeId,
        pub cookie: [u8; 8],
        pub byte_offset: u64,
        pub size: u32,
        pub crc: u32,
        pub storage_class: StorageClass,
        pub blacklist: Vec<BlacklistEntry>,
        pub parity: Parity,
        pub stripes: u8,
        pub cell_size: u32,
        pub crcs: Vec<u32>,
    }
}

packable! {
    pub struct AddSpanInitiateResp {
        pub blocks: Vec<AddSpanInitiateBlockInfo>,
    }
}

packable! {
    /// `AddSpanInitiate` seeding block service choice from another file's
    /// first and last spans.
    pub struct AddSpanInitiateWithReferenceReq {
        pub req: AddSpanInitiateReq,
        pub reference: InodeId,
    }
}

packable! {
    pub struct AddSpanInitiateWithReferenceResp {
        pub resp: AddSpanInitiateResp,
    }
}

packable! {
    /// `AddSpanInitiate` targeting an explicit location.
    pub struct AddSpanAtLocationInitiateReq {
        pub location_id: LocationId,
        pub req: AddSpanInitiateWithReferenceReq,
    }
}

packable! {
    pub struct AddSpanAtLocationInitiateResp {
        pub resp: AddSpanInitiateResp,
    }
}

packable! {
    pub struct AddSpanCertifyReq {
        pub file_id: InodeId,
        pub cookie: [u8; 8],
        pub byte_offset: u64,
        pub proofs: Vec<BlockProof>,
    }
}

packable! {
    pub struct AddSpanCertifyResp {}
}

packable! {
    /// Grafts the blocks held by a transient file's tail span onto a
    /// committed file's span as an additional location.
    pub struct AddSpanLocationReq {
        pub file_id1: InodeId,
        pub byte_offset1: u64,
        pub blocks1: Vec<u64>,
        pub file_id2: InodeId,
        pub byte_offset2: u64,
    }
}

packable! {
    pub struct AddSpanLocationResp {}
}

packable! {
    /// Starts reclaiming the tail span of a transient file.
    pub struct RemoveSpanInitiateReq {
        pub file_id: InodeId,
        pub cookie: [u8; 8],
    }
}

packable! {
    pub struct RemoveSpanInitiateResp {
        pub byte_offset: u64,
        pub blocks: Vec<RemoveSpanInitiateBlockInfo>,
    }
}

packable! {
    pub struct RemoveSpanCertifyReq {
        pub file_id: InodeId,
        pub cookie: [u8; 8],
        pub byte_offset: u64,
        pub proofs: Vec<BlockProof>,
    }
}

packable! {
    pub struct RemoveSpanCertifyResp {}
}

packable! {
    /// Moves a committed file back to transient so its spans can be
    /// reclaimed.
    pub struct MakeFileTransientReq {
        pub id: InodeId,
        pub note: ShortBytes,
    }
}

packable! {
    pub struct MakeFileTransientResp {}
}

packable! {
    /// GC: pulls a transient file's deadline forward to now.
    pub struct ScrapTransientFileReq {
        pub id: InodeId,
        pub cookie: [u8; 8],
    }
}

packable! {
    pub struct ScrapTransientFileResp {}
}

packable! {
    /// Migration: swaps one block between two spans of equal shape.
    pub struct SwapBlocksReq {
        pub file_id1: InodeId,
        pub byte_offset1: u64,
        pub block_id1: u64,
        pub file_id2: InodeId,
        pub byte_offset2: u64,
        pub block_id2: u64,
    }
}

packable! {
    pub struct SwapBlocksResp {}
}

packable! {
    /// Defrag: swaps two whole spans of identical size and crc.
    pub struct SwapSpansReq {
        pub file_id1: InodeId,
        pub byte_offset1: u64,
        pub blocks1: Vec<u64>,
        pub file_id2: InodeId,
        pub byte_offset2: u64,
        pub blocks2: Vec<u64>,
    }
}

packable! {
    pub struct SwapSpansResp {}
}

packable! {
    /// Moves the dirty tail span of one transient file onto the clean tail
    /// of another.
    pub struct MoveSpanReq {
        pub file_id1: InodeId,
        pub cookie1: [u8; 8],
        pub byte_offset1: u64,
        pub file_id2: InodeId,
        pub cookie2: [u8; 8],
        pub byte_offset2: u64,
        pub span_size: u32,
    }
}

packable! {
    pub struct MoveSpanResp {}
}

packable! {
    /// Sets atime/mtime on a committed file. Each field applies only when
    /// its high bit is set; the low 63 bits carry the time.
    pub struct SetTimeReq {
        pub id: InodeId,
        pub atime: u64,
        pub mtime: u64,
    }
}

packable! {
    pub struct SetTimeResp {}
}

packable! {
    /// GC: sweeps up to 1000 zero-count entries of the reverse index.
    pub struct RemoveZeroBlockServiceFilesReq {
        pub start_block_service: BlockServiceId,
        pub start_file: InodeId,
    }
}

packable! {
    pub struct RemoveZeroBlockServiceFilesResp {
        pub removed: u64,
        pub next_block_service: BlockServiceId,
        pub next_file: InodeId,
    }
}

// ----------------------------------------------------------------
// containers

macro_rules! shard_messages {
    ($( $kind:ident = $code:literal ),* $(,)?) => {
        /// Wire discriminant for requests and responses.
        #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum ShardMessageKind {
            /// Response-only kind carrying a `u16` error code.
            Error = 0,
            $( $kind = $code, )*
        }

        impl ShardMessageKind {
            pub fn from_u8(x: u8) -> Result<ShardMessageKind, LodeError> {
                match x {
                    0 => Ok(ShardMessageKind::Error),
                    $( $code => Ok(ShardMessageKind::$kind), )*
                    _ => Err(LodeError::BadEncoding),
                }
            }
        }

        /// A client request, one variant per kind.
        #[derive(Clone, Debug, PartialEq, Eq)]
        pub enum ShardRequest {
            $( $kind(paste_req!($kind)), )*
        }

        impl ShardRequest {
            pub fn kind(&self) -> ShardMessageKind {
                match self {
                    $( ShardRequest::$kind(_) => ShardMessageKind::$kind, )*
                }
            }

            pub fn packed_size(&self) -> usize {
                1 + match self {
                    $( ShardRequest::$kind(body) => body.packed_size(), )*
                }
            }

            pub fn pack(&self, p: &mut Packer) {
                p.pack_u8(self.kind() as u8);
                match self {
                    $( ShardRequest::$kind(body) => body.pack(p), )*
                }
            }

            pub fn unpack(u: &mut Unpacker<'_>) -> Result<ShardRequest, LodeError> {
                match ShardMessageKind::from_u8(u.unpack_u8()?)? {
                    ShardMessageKind::Error => Err(LodeError::BadEncoding),
                    $( ShardMessageKind::$kind => Ok(ShardRequest::$kind(Pack::unpack(u)?)), )*
                }
            }
        }

        /// A shard response: the request's kind on success, `Error`
        /// otherwise.
        #[derive(Clone, Debug, PartialEq, Eq)]
        pub enum ShardResponse {
            Error(LodeError),
            $( $kind(paste_resp!($kind)), )*
        }

        impl ShardResponse {
            pub fn kind(&self) -> ShardMessageKind {
                match self {
                    ShardResponse::Error(_) => ShardMessageKind::Error,
                    $( ShardResponse::$kind(_) => ShardMessageKind::$kind, )*
                }
            }

            pub fn packed_size(&self) -> usize {
                1 + match self {
                    ShardResponse::Error(_) => 2,
                    $( ShardResponse::$kind(body) => body.packed_size(), )*
                }
            }

            pub fn pack(&self, p: &mut Packer) {
                p.pack_u8(self.kind() as u8);
                match self {
                    ShardResponse::Error(err) => p.pack_u16(err.code()),
                    $( ShardResponse::$kind(body) => body.pack(p), )*
                }
            }

            pub fn unpack(u: &mut Unpacker<'_>) -> Result<ShardResponse, LodeError> {
                match ShardMessageKind::from_u8(u.unpack_u8()?)? {
                    ShardMessageKind::Error => {
                        Ok(ShardResponse::Error(LodeError::from_code(u.unpack_u16()?)?))
                    }
                    $( ShardMessageKind::$kind => Ok(ShardResponse::$kind(Pack::unpack(u)?)), )*
                }
            }
        }
    };
}

macro_rules! paste_req {
    ($kind:ident) => { paste_concat!($kind, Req) };
}
macro_rules! paste_resp {
    ($kind:ident) => { paste_concat!($kind, Resp) };
}

// The request/response type names are the kind name suffixed with Req/Resp;
// spelled out since macro_rules cannot concatenate identifiers.
macro_rules! paste_concat {
    (Lookup, Req) => { LookupReq };
    (Lookup, Resp) => { LookupResp };
    (StatFile, Req) => { StatFileReq };
    (StatFile, Resp) => { StatFileResp };
    (StatDirectory, Req) => { StatDirectoryReq };
    (StatDirectory, Resp) => { StatDirectoryResp };
    (StatTransientFile, Req) => { StatTransientFileReq };
    (StatTransientFile, Resp) => { StatTransientFileResp };
    (ReadDir, Req) => { ReadDirReq };
    (ReadDir, Resp) => { ReadDirResp };
    (FullReadDir, Req) => { FullReadDirReq };
    (FullReadDir, Resp) => { FullReadDirResp };
    (LocalFileSpans, Req) => { LocalFileSpansReq };
    (LocalFileSpans, Resp) => { LocalFileSpansResp };
    (FileSpans, Req) => { FileSpansReq };
    (FileSpans, Resp) => { FileSpansResp };
    (VisitDirectories, Req) => { VisitDirectoriesReq };
    (VisitDirectories, Resp) => { VisitDirectoriesResp };
    (VisitFiles, Req) => { VisitFilesReq };
    (VisitFiles, Resp) => { VisitFilesResp };
    (VisitTransientFiles, Req) => { VisitTransientFilesReq };
    (VisitTransientFiles, Resp) => { VisitTransientFilesResp };
    (BlockServiceFiles, Req) => { BlockServiceFilesReq };
    (BlockServiceFiles, Resp) => { BlockServiceFilesResp };
    (ConstructFile, Req) => { ConstructFileReq };
    (ConstructFile, Resp) => { ConstructFileResp };
    (LinkFile, Req) => { LinkFileReq };
    (LinkFile, Resp) => { LinkFileResp };
    (SameDirectoryRename, Req) => { SameDirectoryRenameReq };
    (SameDirectoryRename, Resp) => { SameDirectoryRenameResp };
    (SameDirectoryRenameSnapshot, Req) => { SameDirectoryRenameSnapshotReq };
    (SameDirectoryRenameSnapshot, Resp) => { SameDirectoryRenameSnapshotResp };
    (SoftUnlinkFile, Req) => { SoftUnlinkFileReq };
    (SoftUnlinkFile, Resp) => { SoftUnlinkFileResp };
    (SameShardHardFileUnlink, Req) => { SameShardHardFileUnlinkReq };
    (SameShardHardFileUnlink, Resp) => { SameShardHardFileUnlinkResp };
    (CreateDirectoryInode, Req) => { CreateDirectoryInodeReq };
    (CreateDirectoryInode, Resp) => { CreateDirectoryInodeResp };
    (SetDirectoryOwner, Req) => { SetDirectoryOwnerReq };
    (SetDirectoryOwner, Resp) => { SetDirectoryOwnerResp };
    (RemoveDirectoryOwner, Req) => { RemoveDirectoryOwnerReq };
    (RemoveDirectoryOwner, Resp) => { RemoveDirectoryOwnerResp };
    (SetDirectoryInfo, Req) => { SetDirectoryInfoReq };
    (SetDirectoryInfo, Resp) => { SetDirectoryInfoResp };
    (CreateLockedCurrentEdge, Req) => { CreateLockedCurrentEdgeReq };
    (CreateLockedCurrentEdge, Resp) => { CreateLockedCurrentEdgeResp };
    (LockCurrentEdge, Req) => { LockCurrentEdgeReq };
    (LockCurrentEdge, Resp) => { LockCurrentEdgeResp };
    (UnlockCurrentEdge, Req) => { UnlockCurrentEdgeReq };
    (UnlockCurrentEdge, Resp) => { UnlockCurrentEdgeResp };
    (RemoveInode, Req) => { RemoveInodeReq };
    (RemoveInode, Resp) => { RemoveInodeResp };
    (RemoveNonOwnedEdge, Req) => { RemoveNonOwnedEdgeReq };
    (RemoveNonOwnedEdge, Resp) => { RemoveNonOwnedEdgeResp };
    (RemoveOwnedSnapshotFileEdge, Req) => { RemoveOwnedSnapshotFileEdgeReq };
    (RemoveOwnedSnapshotFileEdge, Resp) => { RemoveOwnedSnapshotFileEdgeResp };
    (AddInlineSpan, Req) => { AddInlineSpanReq };
    (AddInlineSpan, Resp) => { AddInlineSpanResp };
    (AddSpanInitiate, Req) => { AddSpanInitiateReq };
    (AddSpanInitiate, Resp) => { AddSpanInitiateResp };
    (AddSpanInitiateWithReference, Req) => { AddSpanInitiateWithReferenceReq };
    (AddSpanInitiateWithReference, Resp) => { AddSpanInitiateWithReferenceResp };
    (AddSpanAtLocationInitiate, Req) => { AddSpanAtLocationInitiateReq };
    (AddSpanAtLocationInitiate, Resp) => { AddSpanAtLocationInitiateResp };
    (AddSpanCertify, Req) => { AddSpanCertifyReq };
    (AddSpanCertify, Resp) => { AddSpanCertifyResp };
    (AddSpanLocation, Req) => { AddSpanLocationReq };
    (AddSpanLocation, Resp) => { AddSpanLocationResp };
    (RemoveSpanInitiate, Req) => { RemoveSpanInitiateReq };
    (RemoveSpanInitiate, Resp) => { RemoveSpanInitiateResp };
    (RemoveSpanCertify, Req) => { RemoveSpanCertifyReq };
    (RemoveSpanCertify, Resp) => { RemoveSpanCertifyResp };
    (MakeFileTransient, Req) => { MakeFileTransientReq };
    (MakeFileTransient, Resp) => { MakeFileTransientResp };
    (ScrapTransientFile, Req) => { ScrapTransientFileReq };
    (ScrapTransientFile, Resp) => { ScrapTransientFileResp };
    (SwapBlocks, Req) => { SwapBlocksReq };
    (SwapBlocks, Resp) => { SwapBlocksResp };
    (SwapSpans, Req) => { SwapSpansReq };
    (SwapSpans, Resp) => { SwapSpansResp };
    (MoveSpan, Req) => { MoveSpanReq };
    (MoveSpan, Resp) => { MoveSpanResp };
    (SetTime, Req) => { SetTimeReq };
    (SetTime, Resp) => { SetTimeResp };
    (RemoveZeroBlockServiceFiles, Req) => { RemoveZeroBlockServiceFilesReq };
    (RemoveZeroBlockServiceFiles, Resp) => { RemoveZeroBlockServiceFilesResp };
}

shard_messages! {
    Lookup = 1,
    StatFile = 2,
    StatDirectory = 3,
    StatTransientFile = 4,
    ReadDir = 5,
    FullReadDir = 6,
    LocalFileSpans = 7,
    FileSpans = 8,
    VisitDirectories = 9,
    VisitFiles = 10,
    VisitTransientFiles = 11,
    BlockServiceFiles = 12,
    ConstructFile = 32,
    LinkFile = 33,
    SameDirectoryRename = 34,
    SameDirectoryRenameSnapshot = 35,
    SoftUnlinkFile = 36,
    SameShardHardFileUnlink = 37,
    CreateDirectoryInode = 38,
    SetDirectoryOwner = 39,
    RemoveDirectoryOwner = 40,
    SetDirectoryInfo = 41,
    CreateLockedCurrentEdge = 42,
    LockCurrentEdge = 43,
    UnlockCurrentEdge = 44,
    RemoveInode = 45,
    RemoveNonOwnedEdge = 46,
    RemoveOwnedSnapshotFileEdge = 47,
    AddInlineSpan = 48,
    AddSpanInitiate = 49,
    AddSpanInitiateWithReference = 50,
    AddSpanAtLocationInitiate = 51,
    AddSpanCertify = 52,
    AddSpanLocation = 53,
    RemoveSpanInitiate = 54,
    RemoveSpanCertify = 55,
    MakeFileTransient = 56,
    ScrapTransientFile = 57,
    SwapBlocks = 58,
    SwapSpans = 59,
    MoveSpan = 60,
    SetTime = 61,
    RemoveZeroBlockServiceFiles = 62,
}

impl ShardMessageKind {
    /// True for kinds served under a read snapshot; false for kinds that go
    /// through prepare/apply.
    pub fn is_read_only(self) -> bool {
        (self as u8) < 32 && self != ShardMessageKind::Error
    }
}

// ----------------------------------------------------------------
// framing

/// Packs a request into a full frame.
pub fn pack_request(request_id: u64, req: &ShardRequest) -> Vec<u8> {
    let mut p = Packer::with_capacity(FRAME_HEADER_SIZE + req.packed_size());
    p.pack_u32(SHARD_PROTOCOL_VERSION);
    p.pack_u64(request_id);
    req.pack(&mut p);
    p.into_bytes()
}

/// Unpacks a request frame, rejecting version mismatches and trailing bytes.
pub fn unpack_request(frame: &[u8]) -> Result<(u64, ShardRequest), LodeError> {
    let mut u = Unpacker::new(frame);
    if u.unpack_u32()? != SHARD_PROTOCOL_VERSION {
        return Err(LodeError::BadEncoding);
    }
    let request_id = u.unpack_u64()?;
    let req = ShardRequest::unpack(&mut u)?;
    u.ensure_finished()?;
    Ok((request_id, req))
}

/// Packs a response into a full frame.
pub fn pack_response(request_id: u64, resp: &ShardResponse) -> Vec<u8> {
    let mut p = Packer::with_capacity(FRAME_HEADER_SIZE + resp.packed_size());
    p.pack_u32(SHARD_PROTOCOL_VERSION);
    p.pack_u64(request_id);
    resp.pack(&mut p);
    p.into_bytes()
}

/// Unpacks a response frame, rejecting version mismatches and trailing bytes.
pub fn unpack_response(frame: &[u8]) -> Result<(u64, ShardResponse), LodeError> {
    let mut u = Unpacker::new(frame);
    if u.unpack_u32()? != SHARD_PROTOCOL_VERSION {
        return Err(LodeError::BadEncoding);
    }
    let request_id = u.unpack_u64()?;
    let resp = ShardResponse::unpack(&mut u)?;
    u.ensure_finished()?;
    Ok((request_id, resp))
}

/// Appends the 8-byte CBC-MAC trailer of a signed frame.
pub fn sign_frame(key: &ExpandedKey, frame: &mut Vec<u8>) {
    let mac = key.cbcmac(frame);
    frame.extend_from_slice(&mac);
}

/// Verifies and strips the MAC trailer of a signed frame, returning the
/// inner frame.
pub fn verify_signed_frame<'a>(key: &ExpandedKey, frame: &'a [u8]) -> Result<&'a [u8], LodeError> {
    if frame.len() < 8 {
        return Err(LodeError::BadEncoding);
    }
    let (inner, mac) = frame.split_at(frame.len() - 8);
    if key.cbcmac(inner) != mac {
        return Err(LodeError::BadEncoding);
    }
    Ok(inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{InodeType, ShardId, ROOT_DIR_INODE_ID};

    fn file_id(counter: u64) -> InodeId {
        InodeId::new(InodeType::File, ShardId(0), counter)
    }

    #[test]
    fn test_valid_name() {
        assert!(valid_name(b"file.txt"));
        assert!(!valid_name(b""));
        assert!(!valid_name(b"."));
        assert!(!valid_name(b".."));
        assert!(!valid_name(b"a/b"));
        assert!(!valid_name(b"a\0b"));
        assert!(!valid_name(&[b'a'; 256]));
        assert!(valid_name(&[b'a'; 255]));
        assert!(valid_name(b"...")); // only the two dot entries are special
    }

    #[test]
    fn test_request_frame_roundtrip() {
        let req = ShardRequest::Lookup(LookupReq {
            dir_id: ROOT_DIR_INODE_ID,
            name: ShortBytes::from_static(b"etc"),
        });
        let frame = pack_request(77, &req);
        let (id, decoded) = unpack_request(&frame).unwrap();
        assert_eq!(id, 77);
        assert_eq!(decoded, req);
    }

    #[test]
    fn test_response_frame_roundtrip() {
        let resp = ShardResponse::Lookup(LookupResp {
            target_id: file_id(3),
            creation_time: LodeTime(12345),
        });
        let frame = pack_response(9, &resp);
        let (id, decoded) = unpack_response(&frame).unwrap();
        assert_eq!(id, 9);
        assert_eq!(decoded, resp);
    }

    #[test]
    fn test_error_response_roundtrip() {
        let resp = ShardResponse::Error(LodeError::BadCookie);
        let frame = pack_response(1, &resp);
        let (_, decoded) = unpack_response(&frame).unwrap();
        assert_eq!(decoded, ShardResponse::Error(LodeError::BadCookie));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let req = ShardRequest::StatFile(StatFileReq { id: file_id(1) });
        let mut frame = pack_request(5, &req);
        frame.push(0);
        assert_eq!(unpack_request(&frame), Err(LodeError::BadEncoding));
    }

    #[test]
    fn test_bad_version_rejected() {
        let req = ShardRequest::StatFile(StatFileReq { id: file_id(1) });
        let mut frame = pack_request(5, &req);
        frame[0] ^= 0xFF;
        assert_eq!(unpack_request(&frame), Err(LodeError::BadEncoding));
    }

    #[test]
    fn test_signed_frame_roundtrip() {
        let key = ExpandedKey::expand(&[9u8; 16]);
        let resp = ShardResponse::SetTime(SetTimeResp {});
        let mut frame = pack_response(3, &resp);
        sign_frame(&key, &mut frame);

        let inner = verify_signed_frame(&key, &frame).unwrap();
        let (id, decoded) = unpack_response(inner).unwrap();
        assert_eq!(id, 3);
        assert_eq!(decoded, resp);
    }

    #[test]
    fn test_signed_frame_tamper_detected() {
        let key = ExpandedKey::expand(&[9u8; 16]);
        let mut frame = pack_response(3, &ShardResponse::SetTime(SetTimeResp {}));
        sign_frame(&key, &mut frame);
        frame[6] ^= 1;
        assert!(verify_signed_frame(&key, &frame).is_err());
    }

    #[test]
    fn test_packed_size_matches_for_complex_request() {
        let req = ShardRequest::AddSpanInitiate(AddSpanInitiateReq {
            file_id: file_id(8),
            cookie: [1; 8],
            byte_offset: 4096,
            size: 8192,
            crc: 0xABCD,
            storage_class: StorageClass::Flash,
            blacklist: vec![BlacklistEntry {
                failure_domain: FailureDomain([2; 16]),
                block_service: BlockServiceId(5),
            }],
            parity: Parity::new(2, 2),
            stripes: 1,
            cell_size: 4096,
            crcs: vec![1, 2, 3, 4],
        });
        let frame = pack_request(0, &req);
        // version + request id, then the kind byte counted by packed_size
        assert_eq!(frame.len(), 12 + req.packed_size());
        let (_, decoded) = unpack_request(&frame).unwrap();
        assert_eq!(decoded, req);
    }

    #[test]
    fn test_fetched_span_roundtrip() {
        let span = FetchedSpan {
            header: SpanHeader {
                byte_offset: 0,
                size: 8192,
                crc: 7,
            },
            body: FetchedSpanBody::Blocks(vec![FetchedBlocksSpan {
                location_id: 0,
                storage_class: StorageClass::Flash,
                parity: Parity::new(2, 2),
                stripes: 1,
                cell_size: 4096,
                blocks: vec![
                    FetchedBlock {
                        block_service_ix: 0,
                        block_id: 0x100,
                        crc: 1,
                    },
                    FetchedBlock {
                        block_service_ix: 1,
                        block_id: 0x200,
                        crc: 2,
                    },
                ],
                stripes_crc: vec![3],
            }]),
        };
        let mut p = Packer::new();
        span.pack(&mut p);
        assert_eq!(p.len(), span.packed_size());
        let bytes = p.into_bytes();
        let mut u = Unpacker::new(&bytes);
        assert_eq!(FetchedSpan::unpack(&mut u).unwrap(), span);
        u.ensure_finished().unwrap();
    }

    #[test]
    fn test_default_directory_info_segments() {
        let info = default_directory_info();
        let tags: Vec<u8> = info.entries.iter().map(|e| e.tag).collect();
        assert_eq!(
            tags,
            vec![
                SNAPSHOT_POLICY_TAG,
                BLOCK_POLICY_TAG,
                SPAN_POLICY_TAG,
                STRIPE_POLICY_TAG
            ]
        );
        // the span policy decodes back to ten entries
        let span_seg = &info.entries[2];
        let mut u = Unpacker::new(span_seg.body.as_bytes());
        let policy = SpanPolicy::unpack(&mut u).unwrap();
        u.ensure_finished().unwrap();
        assert_eq!(policy.entries.len(), 10);
        assert_eq!(policy.entries[0].parity, Parity::new(10, 4));
        assert_eq!(policy.entries[9].parity, Parity::new(10, 4));
    }

    #[test]
    fn test_read_only_kinds() {
        assert!(ShardMessageKind::Lookup.is_read_only());
        assert!(ShardMessageKind::BlockServiceFiles.is_read_only());
        assert!(!ShardMessageKind::ConstructFile.is_read_only());
        assert!(!ShardMessageKind::Error.is_read_only());
    }
}
