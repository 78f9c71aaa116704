//! Shared fixtures for shard engine integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use lodefs_proto::crypto::ExpandedKey;
use lodefs_proto::ids::{
    BlockServiceId, FailureDomain, InodeId, InodeType, LodeTime, ShardId, StorageClass,
};
use lodefs_proto::msgs::{
    AddrsInfo, ConstructFileReq, LinkFileReq, ShardRequest, ShardResponse,
};
use lodefs_proto::ShortBytes;
use lodefs_shard::{
    BlockServiceInfo, BlockServicesCache, BlockServicesSnapshot, ShardDb, ShardOptions,
};

/// Initializes test logging once; `RUST_LOG=debug` shows the engine's
/// tracing output.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Builds a block service with a one-byte failure domain tag and a
/// predictable secret.
pub fn block_service(id: u64, domain: u8, storage_class: StorageClass) -> BlockServiceInfo {
    BlockServiceInfo {
        id: BlockServiceId(id),
        addrs: AddrsInfo::empty(),
        flags: 0,
        location_id: 0,
        storage_class,
        failure_domain: FailureDomain([domain; 16]),
        secret_key: block_service_key(id),
    }
}

/// The deterministic secret of a test block service; tests use it to forge
/// valid proofs.
pub fn block_service_key(id: u64) -> ExpandedKey {
    ExpandedKey::expand(&[id as u8; 16])
}

/// A shard-0 database with the given block services, all of them current.
pub fn shard_with_services(services: Vec<BlockServiceInfo>) -> ShardDb {
    shard_with_cache(services).0
}

/// Like [`shard_with_services`], but also hands back the cache so a test
/// can change the service topology mid-flight.
pub fn shard_with_cache(services: Vec<BlockServiceInfo>) -> (ShardDb, Arc<BlockServicesCache>) {
    init_tracing();
    let current = services.iter().map(|s| s.id).collect();
    let cache = Arc::new(BlockServicesCache::new());
    cache.update(BlockServicesSnapshot::new(services, current));
    let db = ShardDb::new(ShardOptions::new(ShardId(0)), cache.clone());
    (db, cache)
}

/// A shard-0 database with `n` FLASH services in distinct failure domains.
pub fn shard_with_flash_services(n: u64) -> ShardDb {
    shard_with_services(
        (1..=n)
            .map(|i| block_service(i, i as u8, StorageClass::Flash))
            .collect(),
    )
}

/// A shard-0 database with no block services at all.
pub fn bare_shard() -> ShardDb {
    init_tracing();
    ShardDb::new(
        ShardOptions::new(ShardId(0)),
        Arc::new(BlockServicesCache::new()),
    )
}

thread_local! {
    static LAST_ENTRY_TIME: std::cell::Cell<u64> = const { std::cell::Cell::new(0) };
}

/// Runs a write request end to end: prepare, apply at the next index,
/// flush so reads observe the result. Entry times are nudged to be strictly
/// increasing, as the log layer guarantees in production.
pub fn write(db: &ShardDb, req: ShardRequest) -> ShardResponse {
    let mut entry = match db.prepare_log_entry(&req) {
        Ok(entry) => entry,
        Err(err) => return ShardResponse::Error(err),
    };
    LAST_ENTRY_TIME.with(|last| {
        if entry.time.ns() <= last.get() {
            entry.time = LodeTime(last.get() + 1);
        }
        last.set(entry.time.ns());
    });
    let index = db.last_applied_log_entry() + 1;
    let resp = db.apply_log_entry(index, &entry);
    db.flush();
    resp
}

/// Constructs a transient FILE inode, returning its id and cookie.
pub fn construct_file(db: &ShardDb, note: &[u8]) -> (InodeId, [u8; 8]) {
    let resp = write(
        db,
        ShardRequest::ConstructFile(ConstructFileReq {
            file_type: InodeType::File as u8,
            note: ShortBytes::from_static(note),
        }),
    );
    match resp {
        ShardResponse::ConstructFile(r) => (r.id, r.cookie),
        other => panic!("construct file failed: {:?}", other),
    }
}

/// Links a transient file under the given directory and name, returning the
/// edge's creation time.
pub fn link_file(
    db: &ShardDb,
    file_id: InodeId,
    cookie: [u8; 8],
    owner_id: InodeId,
    name: &[u8],
) -> LodeTime {
    let resp = write(
        db,
        ShardRequest::LinkFile(LinkFileReq {
            file_id,
            cookie,
            owner_id,
            name: ShortBytes::from_static(name),
        }),
    );
    match resp {
        ShardResponse::LinkFile(r) => r.creation_time,
        other => panic!("link file failed: {:?}", other),
    }
}

/// Unwraps an error response.
pub fn expect_error(resp: ShardResponse) -> lodefs_proto::LodeError {
    match resp {
        ShardResponse::Error(err) => err,
        other => panic!("expected an error, got {:?}", other),
    }
}
