//! Deterministic log entries.
//!
//! The prepare phase turns a write request into one of these; the
//! log/consensus layer persists and orders them; the apply phase consumes
//! them. All non-determinism (wall-clock time, block-service picks, derived
//! deadlines) is resolved at prepare time, so applying an entry is a pure
//! function of the previous state.

use crate::bincode::{Pack, Packer, ShortBytes, Unpacker};
use crate::error::LodeError;
use crate::ids::{BlockServiceId, InodeId, LocationId, LodeTime, Parity, StorageClass};
use crate::msgs::{packable, BlockProof, DirectoryInfo};

/// Version tag on packed log entries; distinct from the request protocol
/// version.
pub const SHARD_LOG_PROTOCOL_VERSION: u32 = 2;

packable! {
    pub struct ConstructFileEntry {
        pub file_type: u8,
        pub note: ShortBytes,
        pub deadline_time: LodeTime,
    }
}

packable! {
    pub struct LinkFileEntry {
        pub file_id: InodeId,
        pub owner_id: InodeId,
        pub name: ShortBytes,
    }
}

packable! {
    pub struct SameDirectoryRenameEntry {
        pub target_id: InodeId,
        pub dir_id: InodeId,
        pub old_name: ShortBytes,
        pub old_creation_time: LodeTime,
        pub new_name: ShortBytes,
    }
}

packable! {
    pub struct SameDirectoryRenameSnapshotEntry {
        pub target_id: InodeId,
        pub dir_id: InodeId,
        pub old_name: ShortBytes,
        pub old_creation_time: LodeTime,
        pub new_name: ShortBytes,
    }
}

packable! {
    pub struct SoftUnlinkFileEntry {
        pub owner_id: InodeId,
        pub file_id: InodeId,
        pub name: ShortBytes,
        pub creation_time: LodeTime,
    }
}

packable! {
    pub struct SameShardHardFileUnlinkEntry {
        pub owner_id: InodeId,
        pub target_id: InodeId,
        pub name: ShortBytes,
        pub creation_time: LodeTime,
        pub deadline_time: LodeTime,
    }
}

packable! {
    pub struct CreateDirectoryInodeEntry {
        pub id: InodeId,
        pub owner_id: InodeId,
        pub info: DirectoryInfo,
    }
}

packable! {
    pub struct SetDirectoryOwnerEntry {
        pub dir_id: InodeId,
        pub owner_id: InodeId,
    }
}

packable! {
    pub struct RemoveDirectoryOwnerEntry {
        pub dir_id: InodeId,
        pub info: DirectoryInfo,
    }
}

packable! {
    pub struct SetDirectoryInfoEntry {
        pub dir_id: InodeId,
        pub info: DirectoryInfo,
    }
}

packable! {
    pub struct CreateLockedCurrentEdgeEntry {
        pub dir_id: InodeId,
        pub name: ShortBytes,
        pub target_id: InodeId,
        pub old_creation_time: LodeTime,
    }
}

packable! {
    pub struct LockCurrentEdgeEntry {
        pub dir_id: InodeId,
        pub name: ShortBytes,
        pub target_id: InodeId,
        pub creation_time: LodeTime,
    }
}

packable! {
    pub struct UnlockCurrentEdgeEntry {
        pub dir_id: InodeId,
        pub name: ShortBytes,
        pub target_id: InodeId,
        pub creation_time: LodeTime,
        pub was_moved: bool,
    }
}

packable! {
    pub struct RemoveInodeEntry {
        pub id: InodeId,
    }
}

packable! {
    pub struct RemoveNonOwnedEdgeEntry {
        pub dir_id: InodeId,
        pub name: ShortBytes,
        pub creation_time: LodeTime,
    }
}

packable! {
    pub struct RemoveOwnedSnapshotFileEdgeEntry {
        pub owner_id: InodeId,
        pub target_id: InodeId,
        pub name: ShortBytes,
        pub creation_time: LodeTime,
    }
}

packable! {
    pub struct AddInlineSpanEntry {
        pub file_id: InodeId,
        pub storage_class: StorageClass,
        pub byte_offset: u64,
        pub size: u32,
        pub crc: u32,
        pub body: ShortBytes,
    }
}

packable! {
    /// A block picked at prepare time. The block id itself is allocated at
    /// apply time from persisted state.
    pub struct EntryNewBlockInfo {
        pub block_service_id: BlockServiceId,
        pub crc: u32,
    }
}

packable! {
    /// Blocked-span ingest with the prepare phase's choices baked in:
    /// per-block services and CRCs, and per-stripe CRCs.
    pub struct AddSpanInitiateEntry {
        pub with_reference: bool,
        pub file_id: InodeId,
        pub byte_offset: u64,
        pub size: u32,
        pub crc: u32,
        pub storage_class: StorageClass,
        pub parity: Parity,
        pub stripes: u8,
        pub cell_size: u32,
        pub body_blocks: Vec<EntryNewBlockInfo>,
        pub body_stripes: Vec<u32>,
    }
}

packable! {
    pub struct AddSpanAtLocationInitiateEntry {
        pub location_id: LocationId,
        pub span: AddSpanInitiateEntry,
    }
}

packable! {
    pub struct AddSpanCertifyEntry {
        pub file_id: InodeId,
        pub byte_offset: u64,
        pub proofs: Vec<BlockProof>,
    }
}

packable! {
    pub struct AddSpanLocationEntry {
        pub file_id1: InodeId,
        pub byte_offset1: u64,
        pub blocks1: Vec<u64>,
        pub file_id2: InodeId,
        pub byte_offset2: u64,
    }
}

packable! {
    pub struct RemoveSpanInitiateEntry {
        pub file_id: InodeId,
    }
}

packable! {
    pub struct RemoveSpanCertifyEntry {
        pub file_id: InodeId,
        pub byte_offset: u64,
        pub proofs: Vec<BlockProof>,
    }
}

packable! {
    pub struct MakeFileTransientEntry {
        pub id: InodeId,
        pub note: ShortBytes,
        pub deadline_time: LodeTime,
    }
}

packable! {
    pub struct ScrapTransientFileEntry {
        pub id: InodeId,
        pub deadline_time: LodeTime,
    }
}

packable! {
    pub struct SwapBlocksEntry {
        pub file_id1: InodeId,
        pub byte_offset1: u64,
        pub block_id1: u64,
        pub file_id2: InodeId,
        pub byte_offset2: u64,
        pub block_id2: u64,
    }
}

packable! {
    pub struct SwapSpansEntry {
        pub file_id1: InodeId,
        pub byte_offset1: u64,
        pub blocks1: Vec<u64>,
        pub file_id2: InodeId,
        pub byte_offset2: u64,
        pub blocks2: Vec<u64>,
    }
}

packable! {
    pub struct MoveSpanEntry {
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
    pub struct SetTimeEntry {
        pub id: InodeId,
        pub atime: u64,
        pub mtime: u64,
    }
}

packable! {
    pub struct RemoveZeroBlockServiceFilesEntry {
        pub start_block_service: BlockServiceId,
        pub start_file: InodeId,
    }
}

macro_rules! log_entry_body {
    ($( $kind:ident($body:ident) = $code:literal ),* $(,)?) => {
        /// Wire discriminant of a log entry body.
        #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum ShardLogEntryKind {
            $( $kind = $code, )*
        }

        impl ShardLogEntryKind {
            pub fn from_u8(x: u8) -> Result<ShardLogEntryKind, LodeError> {
                match x {
                    $( $code => Ok(ShardLogEntryKind::$kind), )*
                    _ => Err(LodeError::BadEncoding),
                }
            }
        }

        /// The per-kind payload of a log entry.
        #[derive(Clone, Debug, PartialEq, Eq)]
        pub enum ShardLogEntryBody {
            $( $kind($body), )*
        }

        impl ShardLogEntryBody {
            pub fn kind(&self) -> ShardLogEntryKind {
                match self {
                    $( ShardLogEntryBody::$kind(_) => ShardLogEntryKind::$kind, )*
                }
            }

            pub fn packed_size(&self) -> usize {
                1 + match self {
                    $( ShardLogEntryBody::$kind(body) => body.packed_size(), )*
                }
            }

            pub fn pack(&self, p: &mut Packer) {
                p.pack_u8(self.kind() as u8);
                match self {
                    $( ShardLogEntryBody::$kind(body) => body.pack(p), )*
                }
            }

            pub fn unpack(u: &mut Unpacker<'_>) -> Result<ShardLogEntryBody, LodeError> {
                match ShardLogEntryKind::from_u8(u.unpack_u8()?)? {
                    $( ShardLogEntryKind::$kind => Ok(ShardLogEntryBody::$kind(Pack::unpack(u)?)), )*
                }
            }
        }
    };
}

log_entry_body! {
    ConstructFile(ConstructFileEntry) = 1,
    LinkFile(LinkFileEntry) = 2,
    SameDirectoryRename(SameDirectoryRenameEntry) = 3,
    SameDirectoryRenameSnapshot(SameDirectoryRenameSnapshotEntry) = 4,
    SoftUnlinkFile(SoftUnlinkFileEntry) = 5,
    SameShardHardFileUnlink(SameShardHardFileUnlinkEntry) = 6,
    CreateDirectoryInode(CreateDirectoryInodeEntry) = 7,
    SetDirectoryOwner(SetDirectoryOwnerEntry) = 8,
    RemoveDirectoryOwner(RemoveDirectoryOwnerEntry) = 9,
    SetDirectoryInfo(SetDirectoryInfoEntry) = 10,
    CreateLockedCurrentEdge(CreateLockedCurrentEdgeEntry) = 11,
    LockCurrentEdge(LockCurrentEdgeEntry) = 12,
    UnlockCurrentEdge(UnlockCurrentEdgeEntry) = 13,
    RemoveInode(RemoveInodeEntry) = 14,
    RemoveNonOwnedEdge(RemoveNonOwnedEdgeEntry) = 15,
    RemoveOwnedSnapshotFileEdge(RemoveOwnedSnapshotFileEdgeEntry) = 16,
    AddInlineSpan(AddInlineSpanEntry) = 17,
    AddSpanInitiate(AddSpanInitiateEntry) = 18,
    AddSpanAtLocationInitiate(AddSpanAtLocationInitiateEntry) = 19,
    AddSpanCertify(AddSpanCertifyEntry) = 20,
    AddSpanLocation(AddSpanLocationEntry) = 21,
    RemoveSpanInitiate(RemoveSpanInitiateEntry) = 22,
    RemoveSpanCertify(RemoveSpanCertifyEntry) = 23,
    MakeFileTransient(MakeFileTransientEntry) = 24,
    ScrapTransientFile(ScrapTransientFileEntry) = 25,
    SwapBlocks(SwapBlocksEntry) = 26,
    SwapSpans(SwapSpansEntry) = 27,
    MoveSpan(MoveSpanEntry) = 28,
    SetTime(SetTimeEntry) = 29,
    RemoveZeroBlockServiceFiles(RemoveZeroBlockServiceFilesEntry) = 30,
}

/// One entry of the replicated log.
///
/// The index is assigned by the log layer; prepare leaves it at zero.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShardLogEntry {
    pub index: u64,
    pub time: LodeTime,
    pub body: ShardLogEntryBody,
}

impl ShardLogEntry {
    pub fn packed_size(&self) -> usize {
        4 + 8 + 8 + self.body.packed_size()
    }

    pub fn pack(&self, p: &mut Packer) {
        p.pack_u32(SHARD_LOG_PROTOCOL_VERSION);
        p.pack_u64(self.index);
        self.time.pack(p);
        self.body.pack(p);
    }

    pub fn unpack(u: &mut Unpacker<'_>) -> Result<ShardLogEntry, LodeError> {
        if u.unpack_u32()? != SHARD_LOG_PROTOCOL_VERSION {
            return Err(LodeError::BadEncoding);
        }
        let index = u.unpack_u64()?;
        let time = LodeTime::unpack(u)?;
        let body = ShardLogEntryBody::unpack(u)?;
        u.ensure_finished()?;
        Ok(ShardLogEntry { index, time, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{InodeType, ShardId, ROOT_DIR_INODE_ID};

    #[test]
    fn test_log_entry_roundtrip() {
        let entry = ShardLogEntry {
            index: 17,
            time: LodeTime(123_456_789),
            body: ShardLogEntryBody::LinkFile(LinkFileEntry {
                file_id: InodeId::new(InodeType::File, ShardId(0), 1),
                owner_id: ROOT_DIR_INODE_ID,
                name: ShortBytes::from_static(b"a"),
            }),
        };
        let mut p = Packer::new();
        entry.pack(&mut p);
        assert_eq!(p.len(), entry.packed_size());
        let bytes = p.into_bytes();
        let decoded = ShardLogEntry::unpack(&mut Unpacker::new(&bytes)).unwrap();
        assert_eq!(decoded, entry);
    }

    #[test]
    fn test_log_entry_version_checked() {
        let entry = ShardLogEntry {
            index: 1,
            time: LodeTime(1),
            body: ShardLogEntryBody::RemoveInode(RemoveInodeEntry {
                id: ROOT_DIR_INODE_ID,
            }),
        };
        let mut p = Packer::new();
        entry.pack(&mut p);
        let mut bytes = p.into_bytes();
        bytes[0] ^= 0xFF;
        assert!(ShardLogEntry::unpack(&mut Unpacker::new(&bytes)).is_err());
    }

    #[test]
    fn test_add_span_entry_roundtrip() {
        let entry = ShardLogEntry {
            index: 2,
            time: LodeTime(99),
            body: ShardLogEntryBody::AddSpanAtLocationInitiate(AddSpanAtLocationInitiateEntry {
                location_id: 1,
                span: AddSpanInitiateEntry {
                    with_reference: true,
                    file_id: InodeId::new(InodeType::File, ShardId(3), 9),
                    byte_offset: 4096,
                    size: 8192,
                    crc: 0xFEED,
                    storage_class: StorageClass::Flash,
                    parity: Parity::new(2, 2),
                    stripes: 1,
                    cell_size: 4096,
                    body_blocks: vec![
                        EntryNewBlockInfo {
                            block_service_id: BlockServiceId(1),
                            crc: 10,
                        },
                        EntryNewBlockInfo {
                            block_service_id: BlockServiceId(2),
                            crc: 20,
                        },
                    ],
                    body_stripes: vec![30],
                },
            }),
        };
        let mut p = Packer::new();
        entry.pack(&mut p);
        let bytes = p.into_bytes();
        let decoded = ShardLogEntry::unpack(&mut Unpacker::new(&bytes)).unwrap();
        assert_eq!(decoded, entry);
    }
}
