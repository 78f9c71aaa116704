//! lodefs wire protocol: the fixed-endian codec, identifier types, CRC32C
//! arithmetic, MAC-based integrity primitives, the shard error taxonomy,
//! request/response messages and replicated-log entries.
//!
//! Everything here is shared between shard servers, clients and the
//! log/consensus layer; the state engine itself lives in `lodefs-shard`.

pub mod bincode;
pub mod crc;
pub mod crypto;
pub mod error;
pub mod hash;
pub mod ids;
pub mod log;
pub mod msgs;

pub use bincode::{Pack, Packer, ShortBytes, Unpacker};
pub use error::LodeError;
pub use ids::{
    BlockServiceId, FailureDomain, InodeId, InodeIdExtra, InodeType, LocationId, LodeTime, Parity,
    ShardId, SpanState, StorageClass, DEFAULT_LOCATION, NULL_INODE_ID, ROOT_DIR_INODE_ID,
};
