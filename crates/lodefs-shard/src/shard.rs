//! The shard database: bootstrap, request dispatch and the glue between the
//! read, prepare and apply paths.
//!
//! Writes follow the replicated-log shape: `prepare_log_entry` turns a
//! request into a deterministic [`ShardLogEntry`] under a read snapshot, the
//! (external) log orders it, and `apply_log_entry` mutates state under the
//! single apply lock. Reads run against the snapshot published by the last
//! `flush`.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::RngCore;
use tracing::{debug, info};

use lodefs_proto::crypto::{inode_cookie, ExpandedKey};
use lodefs_proto::hash::HashMode;
use lodefs_proto::ids::{
    InodeId, LocationId, LodeTime, ShardId, StorageClass, NULL_INODE_ID, ROOT_DIR_INODE_ID,
};
use lodefs_proto::log::ShardLogEntry;
use lodefs_proto::msgs::{default_directory_info, ShardRequest, ShardResponse};
use lodefs_proto::LodeError;

use crate::apply;
use crate::bs_cache::BlockServicesCache;
use crate::prepare;
use crate::reads;
use crate::schema::{
    self, decode_u64_value, encode_u64_value, inode_id_key, metadata_key, DirectoryBody, FileBody,
    ShardInfoBody, TransientFileBody,
};
use crate::store::{ColumnFamily, Store, StoreState, WriteBatch};

/// Storage-class override for one location, replacing the hard-coded
/// failover of older deployments.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct LocationFailover {
    /// Location the override applies to.
    pub location_id: LocationId,
    /// Requested class to replace.
    pub from: StorageClass,
    /// Class actually used.
    pub to: StorageClass,
}

/// Configuration of one shard instance.
#[derive(Clone, Debug)]
pub struct ShardOptions {
    pub shard_id: ShardId,
    /// The location this server runs in; `LocalFileSpans` prefers it.
    pub location_id: LocationId,
    /// How long a modified transient file stays safe from the GC.
    pub transient_deadline_interval: Duration,
    /// Optional storage-class failover, off by default.
    pub location_failover: Option<LocationFailover>,
}

impl ShardOptions {
    /// Options for the given shard with the customary deadline interval.
    pub fn new(shard_id: ShardId) -> ShardOptions {
        ShardOptions {
            shard_id,
            location_id: 0,
            transient_deadline_interval: Duration::from_secs(24 * 60 * 60),
            location_failover: None,
        }
    }
}

/// The per-shard metadata state engine.
pub struct ShardDb {
    pub(crate) opts: ShardOptions,
    pub(crate) store: Store,
    pub(crate) bs_cache: Arc<BlockServicesCache>,
    secret_key: [u8; 16],
    pub(crate) expanded_key: ExpandedKey,
    apply_lock: Mutex<()>,
}

impl ShardDb {
    /// Opens (and on first use, bootstraps) a shard database.
    pub fn new(opts: ShardOptions, bs_cache: Arc<BlockServicesCache>) -> ShardDb {
        let store = Store::new();
        info!(shard = %opts.shard_id, "initializing shard database");
        let secret_key = init_shard_info(&store, opts.shard_id);
        let expanded_key = ExpandedKey::expand(&secret_key);
        init_db(&store, opts.shard_id);
        store.flush();
        ShardDb {
            opts,
            store,
            bs_cache,
            secret_key,
            expanded_key,
            apply_lock: Mutex::new(()),
        }
    }

    /// The shard's 16-byte secret.
    pub fn secret_key(&self) -> &[u8; 16] {
        &self.secret_key
    }

    /// The shard this database serves.
    pub fn shard_id(&self) -> ShardId {
        self.opts.shard_id
    }

    /// Publishes a fresh read snapshot. The server calls this after log
    /// application rounds; reads observe state as of the latest flush.
    pub fn flush(&self) {
        self.store.flush();
    }

    /// The applied-log cursor, from committed state.
    pub fn last_applied_log_entry(&self) -> u64 {
        let bytes = self
            .store
            .get(ColumnFamily::Default, &metadata_key(schema::meta_key::LAST_APPLIED_LOG_ENTRY))
            .expect("applied-log cursor missing");
        decode_u64_value(&bytes)
    }

    /// Serves a read-only request under the current read snapshot. Returns
    /// the response and the applied-log cursor as of that snapshot, so
    /// clients can detect staleness.
    pub fn read(&self, req: &ShardRequest) -> (ShardResponse, u64) {
        debug!(kind = ?req.kind(), "processing read-only request");
        let snapshot = self.store.snapshot();

        let result = match req {
            ShardRequest::Lookup(r) => reads::lookup(&snapshot, r).map(ShardResponse::Lookup),
            ShardRequest::StatFile(r) => {
                reads::stat_file(&snapshot, r).map(ShardResponse::StatFile)
            }
            ShardRequest::StatDirectory(r) => {
                reads::stat_directory(&snapshot, r).map(ShardResponse::StatDirectory)
            }
            ShardRequest::StatTransientFile(r) => {
                reads::stat_transient_file(&snapshot, r).map(ShardResponse::StatTransientFile)
            }
            ShardRequest::ReadDir(r) => reads::read_dir(&snapshot, r).map(ShardResponse::ReadDir),
            ShardRequest::FullReadDir(r) => {
                reads::full_read_dir(&snapshot, r).map(ShardResponse::FullReadDir)
            }
            ShardRequest::LocalFileSpans(r) => {
                reads::local_file_spans(self, &snapshot, r).map(ShardResponse::LocalFileSpans)
            }
            ShardRequest::FileSpans(r) => {
                reads::file_spans(self, &snapshot, r).map(ShardResponse::FileSpans)
            }
            ShardRequest::VisitDirectories(r) => {
                reads::visit_directories(&snapshot, r).map(ShardResponse::VisitDirectories)
            }
            ShardRequest::VisitFiles(r) => {
                reads::visit_files(&snapshot, r).map(ShardResponse::VisitFiles)
            }
            ShardRequest::VisitTransientFiles(r) => reads::visit_transient_files(self, &snapshot, r)
                .map(ShardResponse::VisitTransientFiles),
            ShardRequest::BlockServiceFiles(r) => {
                reads::block_service_files(&snapshot, r).map(ShardResponse::BlockServiceFiles)
            }
            other => panic!("bad read-only shard request kind {:?}", other.kind()),
        };

        let resp = match result {
            Ok(resp) => resp,
            Err(err) => {
                debug!(kind = ?req.kind(), %err, "read failed");
                ShardResponse::Error(err)
            }
        };
        let last_applied = snapshot
            .get(
                ColumnFamily::Default,
                &metadata_key(schema::meta_key::LAST_APPLIED_LOG_ENTRY),
            )
            .map(|v| decode_u64_value(&v))
            .expect("applied-log cursor missing");
        (resp, last_applied)
    }

    /// Validates a write request against the current snapshot and produces
    /// the log entry to replicate. All non-determinism (time, id-free block
    /// placement, deadlines) is resolved here.
    pub fn prepare_log_entry(&self, req: &ShardRequest) -> Result<ShardLogEntry, LodeError> {
        debug!(kind = ?req.kind(), "preparing log entry");
        let time = LodeTime::now();
        let snapshot = self.store.snapshot();

        let body = prepare::prepare(self, &snapshot, time, req).map_err(|err| {
            info!(kind = ?req.kind(), %err, "could not prepare log entry");
            err
        })?;
        Ok(ShardLogEntry {
            index: 0,
            time,
            body,
        })
    }

    /// Applies one log entry. The index must be exactly one past the
    /// current cursor. On a typed error the per-entry mutations are rolled
    /// back but the cursor still advances, and the error is the response.
    pub fn apply_log_entry(&self, log_index: u64, entry: &ShardLogEntry) -> ShardResponse {
        let _guard = self.apply_lock.lock().unwrap();
        debug!(log_index, kind = ?entry.body.kind(), "applying log entry");

        let mut batch = WriteBatch::new();
        let old_index = self.last_applied_log_entry();
        assert!(
            old_index + 1 == log_index,
            "non-contiguous log application: cursor {}, applying {}",
            old_index,
            log_index
        );
        batch.put(
            ColumnFamily::Default,
            metadata_key(schema::meta_key::LAST_APPLIED_LOG_ENTRY),
            encode_u64_value(log_index),
        );
        // the cursor advance survives a failed operation
        batch.set_savepoint();

        let result = apply::apply(self, &mut batch, entry.time, &entry.body);
        let resp = match result {
            Ok(resp) => resp,
            Err(err) => {
                debug!(log_index, kind = ?entry.body.kind(), %err, "log entry failed, rolling back");
                batch.rollback_to_savepoint();
                ShardResponse::Error(err)
            }
        };
        self.store.commit(batch);
        resp
    }

    /// The cookie for a transient inode.
    pub(crate) fn cookie(&self, id: InodeId) -> [u8; 8] {
        inode_cookie(&self.expanded_key, id)
    }

    /// Validates the type and cookie of a request touching a transient
    /// file.
    pub(crate) fn check_transient_cookie(&self, id: InodeId, cookie: [u8; 8]) -> Result<(), LodeError> {
        if !id.is_file_or_symlink() {
            return Err(LodeError::TypeIsDirectory);
        }
        if cookie != self.cookie(id) {
            return Err(LodeError::BadCookie);
        }
        Ok(())
    }
}

fn init_shard_info(store: &Store, shard_id: ShardId) -> [u8; 16] {
    let key = metadata_key(schema::meta_key::SHARD_INFO);
    if let Some(bytes) = store.get(ColumnFamily::Default, &key) {
        let info: ShardInfoBody = schema::decode(&bytes).expect("corrupt shard info");
        assert!(
            info.shard_id == shard_id.0,
            "expected shard id {}, but found {} in the store",
            shard_id,
            info.shard_id
        );
        return info.secret_key;
    }
    info!("creating shard info, since it does not exist");
    let mut secret = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut secret);
    store.put(
        ColumnFamily::Default,
        key,
        schema::encode(&ShardInfoBody {
            shard_id: shard_id.0,
            secret_key: secret,
        }),
    );
    secret
}

fn init_db(store: &Store, shard_id: ShardId) {
    use lodefs_proto::ids::InodeType;

    if shard_id == ROOT_DIR_INODE_ID.shard() {
        let key = inode_id_key(ROOT_DIR_INODE_ID);
        if store.get(ColumnFamily::Directories, &key).is_none() {
            info!("creating root directory, since it does not exist");
            store.put(
                ColumnFamily::Directories,
                key,
                schema::encode(&DirectoryBody {
                    version: 0,
                    owner_id: NULL_INODE_ID,
                    mtime: LodeTime::ZERO,
                    hash_mode: HashMode::Xxh3_63,
                    info: default_directory_info(),
                }),
            );
        }
    }

    let init_u64 = |key: u8, value: u64, what: &str| {
        let key = metadata_key(key);
        if store.get(ColumnFamily::Default, &key).is_none() {
            info!("initializing {}", what);
            store.put(ColumnFamily::Default, key, encode_u64_value(value));
        }
    };
    init_u64(
        schema::meta_key::NEXT_FILE_ID,
        InodeId::new(InodeType::File, shard_id, 0).as_u64(),
        "next file id",
    );
    init_u64(
        schema::meta_key::NEXT_SYMLINK_ID,
        InodeId::new(InodeType::Symlink, shard_id, 0).as_u64(),
        "next symlink id",
    );
    init_u64(
        schema::meta_key::NEXT_BLOCK_ID,
        shard_id.0 as u64,
        "next block id",
    );
    init_u64(
        schema::meta_key::LAST_APPLIED_LOG_ENTRY,
        0,
        "last applied log entry",
    );
}

// ----------------------------------------------------------------
// shared state accessors, used by all three paths

/// Fetches a directory. Snapshot directories (owner NULL, root excepted)
/// are rejected unless `allow_snapshot`.
pub(crate) fn get_directory(
    state: &StoreState,
    id: InodeId,
    allow_snapshot: bool,
) -> Result<DirectoryBody, LodeError> {
    if !id.is_directory() {
        return Err(LodeError::TypeIsNotDirectory);
    }
    let bytes = state
        .get(ColumnFamily::Directories, &inode_id_key(id))
        .ok_or(LodeError::DirectoryNotFound)?;
    let dir: DirectoryBody = schema::decode(&bytes).expect("corrupt directory body");
    if !allow_snapshot && dir.owner_id == NULL_INODE_ID && id != ROOT_DIR_INODE_ID {
        return Err(LodeError::DirectoryNotFound);
    }
    Ok(dir)
}

/// Fetches a committed file or symlink.
pub(crate) fn get_file(state: &StoreState, id: InodeId) -> Result<FileBody, LodeError> {
    if !id.is_file_or_symlink() {
        return Err(LodeError::TypeIsDirectory);
    }
    let bytes = state
        .get(ColumnFamily::Files, &inode_id_key(id))
        .ok_or(LodeError::FileNotFound)?;
    Ok(schema::decode(&bytes).expect("corrupt file body"))
}

/// Fetches a transient file. Files past their deadline are invisible unless
/// `allow_past_deadline` (reclamation keeps working on them, everything
/// else pretends they are gone).
pub(crate) fn get_transient_file(
    state: &StoreState,
    time: LodeTime,
    allow_past_deadline: bool,
    id: InodeId,
) -> Result<TransientFileBody, LodeError> {
    if !id.is_file_or_symlink() {
        return Err(LodeError::TypeIsDirectory);
    }
    let bytes = state
        .get(ColumnFamily::Transient, &inode_id_key(id))
        .ok_or(LodeError::FileNotFound)?;
    let file: TransientFileBody = schema::decode(&bytes).expect("corrupt transient file body");
    if !allow_past_deadline && time > file.deadline {
        info!(
            %id, deadline = %file.deadline, %time,
            "not picking up transient file since its deadline is past the log entry time"
        );
        return Err(LodeError::FileNotFound);
    }
    Ok(file)
}

/// Fetches a span by exact offset.
pub(crate) fn get_span(
    state: &StoreState,
    file_id: InodeId,
    byte_offset: u64,
) -> Option<crate::schema::SpanBody> {
    state
        .get(ColumnFamily::Spans, &schema::span_key(file_id, byte_offset))
        .map(|bytes| schema::decode(&bytes).expect("corrupt span body"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root_shard_db() -> ShardDb {
        ShardDb::new(
            ShardOptions::new(ShardId(0)),
            Arc::new(BlockServicesCache::new()),
        )
    }

    #[test]
    fn test_bootstrap_creates_root_directory() {
        let db = root_shard_db();
        let snapshot = db.store.snapshot();
        let dir = get_directory(&snapshot, ROOT_DIR_INODE_ID, true).unwrap();
        assert_eq!(dir.owner_id, NULL_INODE_ID);
        assert_eq!(dir.mtime, LodeTime::ZERO);
        assert!(!dir.info.entries.is_empty());
        // the root is readable despite having no owner
        assert!(get_directory(&snapshot, ROOT_DIR_INODE_ID, false).is_ok());
    }

    #[test]
    fn test_bootstrap_skips_root_on_other_shards() {
        let db = ShardDb::new(
            ShardOptions::new(ShardId(5)),
            Arc::new(BlockServicesCache::new()),
        );
        assert!(db
            .store
            .get(ColumnFamily::Directories, &inode_id_key(ROOT_DIR_INODE_ID))
            .is_none());
        assert_eq!(db.last_applied_log_entry(), 0);
    }

    #[test]
    fn test_bootstrap_seeds_allocators() {
        let db = root_shard_db();
        let next_file = db
            .store
            .get(ColumnFamily::Default, &metadata_key(schema::meta_key::NEXT_FILE_ID))
            .unwrap();
        let id = InodeId::from_u64(decode_u64_value(&next_file));
        assert_eq!(id.shard(), ShardId(0));
        assert!(id.is_file_or_symlink());
    }

    #[test]
    fn test_cookie_verifies() {
        let db = root_shard_db();
        let id = InodeId::new(lodefs_proto::ids::InodeType::File, ShardId(0), 1);
        let cookie = db.cookie(id);
        assert!(db.check_transient_cookie(id, cookie).is_ok());
        let mut bad = cookie;
        bad[0] ^= 1;
        assert_eq!(
            db.check_transient_cookie(id, bad),
            Err(LodeError::BadCookie)
        );
        assert_eq!(
            db.check_transient_cookie(ROOT_DIR_INODE_ID, cookie),
            Err(LodeError::TypeIsDirectory)
        );
    }
}
