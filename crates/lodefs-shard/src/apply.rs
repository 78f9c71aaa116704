//! The apply path: deterministic application of log entries.
//!
//! Every handler reads committed state and buffers its mutations in the
//! write batch; the caller commits the batch after the handler returns, or
//! rolls back to the savepoint on a typed error. Reads never observe the
//! batch, which is exactly what replaying an entry on unchanged state needs:
//! the idempotency checks look at the world as it was before this entry.
//!
//! Anything that cannot legitimately happen under an ordered log (a span
//! referenced by the transient tail missing, a cached block service
//! vanishing mid-entry) is a fatal assertion, not an error.

use tracing::{debug, warn};

use lodefs_proto::bincode::ShortBytes;
use lodefs_proto::crypto::{
    block_add_proof, block_delete_proof, block_erase_certificate, block_write_certificate,
};
use lodefs_proto::hash::name_hash;
use lodefs_proto::ids::{
    InodeId, InodeIdExtra, InodeType, LocationId, LodeTime, SpanState, NULL_INODE_ID,
};
use lodefs_proto::log::*;
use lodefs_proto::msgs::*;
use lodefs_proto::LodeError;

use crate::schema::{
    self, block_service_to_file_key, current_edge_key, edge_scan_start, encode_u64_value,
    inode_id_key, metadata_key, parse_block_service_to_file_key, parse_edge_key, parse_span_key,
    snapshot_edge_group_end, snapshot_edge_key, span_key, BlockBody, CurrentEdgeBody,
    DirectoryBody, FileBody, LocationBlocksBody, SnapshotEdgeBody, SpanBody, SpanStorage,
    TransientFileBody,
};
use crate::shard::{get_directory, get_file, get_span, get_transient_file, ShardDb};
use crate::store::{ColumnFamily, WriteBatch};

/// Applies one log entry body, producing the response.
pub(crate) fn apply(
    db: &ShardDb,
    batch: &mut WriteBatch,
    time: LodeTime,
    body: &ShardLogEntryBody,
) -> Result<ShardResponse, LodeError> {
    match body {
        ShardLogEntryBody::ConstructFile(e) => {
            construct_file(db, batch, time, e).map(ShardResponse::ConstructFile)
        }
        ShardLogEntryBody::LinkFile(e) => {
            link_file(db, batch, time, e).map(ShardResponse::LinkFile)
        }
        ShardLogEntryBody::SameDirectoryRename(e) => {
            same_directory_rename(db, batch, time, e).map(ShardResponse::SameDirectoryRename)
        }
        ShardLogEntryBody::SameDirectoryRenameSnapshot(e) => {
            same_directory_rename_snapshot(db, batch, time, e)
                .map(ShardResponse::SameDirectoryRenameSnapshot)
        }
        ShardLogEntryBody::SoftUnlinkFile(e) => {
            soft_unlink_file(db, batch, time, e).map(ShardResponse::SoftUnlinkFile)
        }
        ShardLogEntryBody::SameShardHardFileUnlink(e) => {
            same_shard_hard_file_unlink(db, batch, time, e)
                .map(ShardResponse::SameShardHardFileUnlink)
        }
        ShardLogEntryBody::CreateDirectoryInode(e) => {
            create_directory_inode(db, batch, time, e).map(ShardResponse::CreateDirectoryInode)
        }
        ShardLogEntryBody::SetDirectoryOwner(e) => {
            set_directory_owner(db, batch, time, e).map(ShardResponse::SetDirectoryOwner)
        }
        ShardLogEntryBody::RemoveDirectoryOwner(e) => {
            remove_directory_owner(db, batch, time, e).map(ShardResponse::RemoveDirectoryOwner)
        }
        ShardLogEntryBody::SetDirectoryInfo(e) => {
            set_directory_info(db, batch, time, e).map(ShardResponse::SetDirectoryInfo)
        }
        ShardLogEntryBody::CreateLockedCurrentEdge(e) => {
            create_locked_current_edge(db, batch, time, e)
                .map(ShardResponse::CreateLockedCurrentEdge)
        }
        ShardLogEntryBody::LockCurrentEdge(e) => {
            lock_current_edge(db, batch, time, e).map(ShardResponse::LockCurrentEdge)
        }
        ShardLogEntryBody::UnlockCurrentEdge(e) => {
            unlock_current_edge(db, batch, time, e).map(ShardResponse::UnlockCurrentEdge)
        }
        ShardLogEntryBody::RemoveInode(e) => {
            remove_inode(db, batch, time, e).map(ShardResponse::RemoveInode)
        }
        ShardLogEntryBody::RemoveNonOwnedEdge(e) => {
            remove_non_owned_edge(db, batch, time, e).map(ShardResponse::RemoveNonOwnedEdge)
        }
        ShardLogEntryBody::RemoveOwnedSnapshotFileEdge(e) => {
            remove_owned_snapshot_file_edge(db, batch, time, e)
                .map(ShardResponse::RemoveOwnedSnapshotFileEdge)
        }
        ShardLogEntryBody::AddInlineSpan(e) => {
            add_inline_span(db, batch, time, e).map(ShardResponse::AddInlineSpan)
        }
        ShardLogEntryBody::AddSpanInitiate(e) => {
            let resp = add_span_initiate(db, batch, time, lodefs_proto::DEFAULT_LOCATION, e)?;
            Ok(if e.with_reference {
                ShardResponse::AddSpanInitiateWithReference(AddSpanInitiateWithReferenceResp {
                    resp,
                })
            } else {
                ShardResponse::AddSpanInitiate(resp)
            })
        }
        ShardLogEntryBody::AddSpanAtLocationInitiate(e) => {
            let resp = add_span_initiate(db, batch, time, e.location_id, &e.span)?;
            Ok(ShardResponse::AddSpanAtLocationInitiate(
                AddSpanAtLocationInitiateResp { resp },
            ))
        }
        ShardLogEntryBody::AddSpanCertify(e) => {
            add_span_certify(db, batch, time, e).map(ShardResponse::AddSpanCertify)
        }
        ShardLogEntryBody::AddSpanLocation(e) => {
            add_span_location(db, batch, time, e).map(ShardResponse::AddSpanLocation)
        }
        ShardLogEntryBody::RemoveSpanInitiate(e) => {
            remove_span_initiate(db, batch, time, e).map(ShardResponse::RemoveSpanInitiate)
        }
        ShardLogEntryBody::RemoveSpanCertify(e) => {
            remove_span_certify(db, batch, time, e).map(ShardResponse::RemoveSpanCertify)
        }
        ShardLogEntryBody::MakeFileTransient(e) => {
            make_file_transient(db, batch, time, e).map(ShardResponse::MakeFileTransient)
        }
        ShardLogEntryBody::ScrapTransientFile(e) => {
            scrap_transient_file(db, batch, time, e).map(ShardResponse::ScrapTransientFile)
        }
        ShardLogEntryBody::SwapBlocks(e) => {
            swap_blocks(db, batch, time, e).map(ShardResponse::SwapBlocks)
        }
        ShardLogEntryBody::SwapSpans(e) => {
            swap_spans(db, batch, time, e).map(ShardResponse::SwapSpans)
        }
        ShardLogEntryBody::MoveSpan(e) => {
            move_span(db, batch, time, e).map(ShardResponse::MoveSpan)
        }
        ShardLogEntryBody::SetTime(e) => set_time(db, batch, e).map(ShardResponse::SetTime),
        ShardLogEntryBody::RemoveZeroBlockServiceFiles(e) => {
            remove_zero_block_service_files(db, batch, e)
                .map(ShardResponse::RemoveZeroBlockServiceFiles)
        }
    }
}

// ----------------------------------------------------------------
// committed-state accessors and shared sub-steps

fn committed_directory(
    db: &ShardDb,
    id: InodeId,
    allow_snapshot: bool,
) -> Result<DirectoryBody, LodeError> {
    db.store.with_committed(|s| get_directory(s, id, allow_snapshot))
}

fn committed_file(db: &ShardDb, id: InodeId) -> Result<FileBody, LodeError> {
    db.store.with_committed(|s| get_file(s, id))
}

fn committed_transient_file(
    db: &ShardDb,
    time: LodeTime,
    allow_past_deadline: bool,
    id: InodeId,
) -> Result<TransientFileBody, LodeError> {
    db.store
        .with_committed(|s| get_transient_file(s, time, allow_past_deadline, id))
}

fn committed_span(db: &ShardDb, file_id: InodeId, byte_offset: u64) -> Option<SpanBody> {
    db.store.with_committed(|s| get_span(s, file_id, byte_offset))
}

fn put_directory(batch: &mut WriteBatch, id: InodeId, dir: &DirectoryBody) {
    batch.put(ColumnFamily::Directories, inode_id_key(id), schema::encode(dir));
}

fn put_transient_file(batch: &mut WriteBatch, id: InodeId, file: &TransientFileBody) {
    batch.put(ColumnFamily::Transient, inode_id_key(id), schema::encode(file));
}

fn put_span(batch: &mut WriteBatch, file_id: InodeId, byte_offset: u64, span: &SpanBody) {
    batch.put(
        ColumnFamily::Spans,
        span_key(file_id, byte_offset),
        schema::encode(span),
    );
}

/// Opens a directory for mutation: the mtime must move strictly forward to
/// the log entry time, which also keeps snapshot edges unique per
/// (name, hash, creation time).
fn initiate_directory_modification(
    db: &ShardDb,
    batch: &mut WriteBatch,
    time: LodeTime,
    allow_snapshot: bool,
    dir_id: InodeId,
) -> Result<DirectoryBody, LodeError> {
    let mut dir = committed_directory(db, dir_id, allow_snapshot)?;
    if dir.mtime >= time {
        warn!(
            %dir_id, mtime = %dir.mtime, %time,
            "refusing to move directory backwards in time"
        );
        return Err(LodeError::MtimeIsTooRecent);
    }
    dir.mtime = time;
    put_directory(batch, dir_id, &dir);
    Ok(dir)
}

fn initiate_directory_modification_and_hash(
    db: &ShardDb,
    batch: &mut WriteBatch,
    time: LodeTime,
    allow_snapshot: bool,
    dir_id: InodeId,
    name: &[u8],
) -> Result<u64, LodeError> {
    let dir = initiate_directory_modification(db, batch, time, allow_snapshot, dir_id)?;
    Ok(name_hash(dir.hash_mode, name))
}

/// Opens a transient file for mutation, bumping mtime and (for operations
/// that respect deadlines) the deadline. Reclamation passes
/// `allow_past_deadline` and leaves the deadline alone, since the point is
/// to let the file die.
fn initiate_transient_file_modification(
    db: &ShardDb,
    batch: &mut WriteBatch,
    time: LodeTime,
    allow_past_deadline: bool,
    id: InodeId,
) -> Result<TransientFileBody, LodeError> {
    let mut file = committed_transient_file(db, time, allow_past_deadline, id)?;
    if file.mtime >= time {
        warn!(
            %id, mtime = %file.mtime, %time,
            "refusing to move transient file backwards in time"
        );
        return Err(LodeError::MtimeIsTooRecent);
    }
    file.mtime = time;
    if !allow_past_deadline {
        file.deadline = time.plus(db.opts.transient_deadline_interval);
    }
    put_transient_file(batch, id, &file);
    Ok(file)
}

/// Creates (or, for locked edges, idempotently re-creates) a current edge.
/// Returns the edge's creation time, which for an existing locked edge is
/// the original one.
fn create_current_edge(
    db: &ShardDb,
    batch: &mut WriteBatch,
    time: LodeTime,
    dir_id: InodeId,
    name: &ShortBytes,
    target_id: InodeId,
    locked: bool,
    old_creation_time: LodeTime,
) -> Result<LodeTime, LodeError> {
    assert!(locked || old_creation_time.is_zero());

    let mut creation_time = time;
    // current edges only live in live directories
    let hash =
        initiate_directory_modification_and_hash(db, batch, time, false, dir_id, name)?;

    let edge_key = current_edge_key(dir_id, hash, name);
    match db.store.get(ColumnFamily::Edges, &edge_key) {
        None => {
            // first at this name: the newest snapshot edge must be older
            // than us, otherwise time would run backwards for this name
            let seek = snapshot_edge_group_end(dir_id, hash, name);
            if let Some((k, _)) = db
                .store
                .with_committed(|s| s.seek_for_prev(ColumnFamily::Edges, &seek))
            {
                let k = parse_edge_key(&k);
                if k.dir_id == dir_id
                    && !k.current
                    && k.name_hash == hash
                    && k.name == **name
                    && k.creation_time >= creation_time
                {
                    return Err(LodeError::MoreRecentSnapshotEdge);
                }
            }
        }
        Some(bytes) => {
            let existing: CurrentEdgeBody = schema::decode(&bytes).expect("corrupt current edge");
            if existing.locked() {
                // an existing locked edge is only acceptable as a replay of
                // the lock that created it
                if !locked {
                    return Err(LodeError::NameIsLocked);
                }
                if existing.target_id.id() != target_id {
                    debug!(expected = %existing.target_id.id(), got = %target_id, "locked edge target mismatch");
                    return Err(LodeError::MismatchingTarget);
                }
                if existing.creation_time != old_creation_time {
                    debug!(expected = %existing.creation_time, got = %old_creation_time, "locked edge time mismatch");
                    return Err(LodeError::MismatchingCreationTime);
                }
                // the replayed edge keeps its original creation time
                creation_time = existing.creation_time;
            } else {
                // overriding an unlocked edge is only allowed file-over-file,
                // as in rename(2)
                if existing.creation_time >= creation_time {
                    return Err(LodeError::MoreRecentCurrentEdge);
                }
                if target_id.is_directory() || existing.target_id.id().is_directory() {
                    return Err(LodeError::CannotOverrideName);
                }
                // the overridden edge becomes an owned snapshot edge
                batch.put(
                    ColumnFamily::Edges,
                    snapshot_edge_key(dir_id, hash, name, existing.creation_time),
                    schema::encode(&SnapshotEdgeBody {
                        version: 0,
                        target_id: InodeIdExtra::new(existing.target_id.id(), true),
                    }),
                );
            }
        }
    }

    batch.put(
        ColumnFamily::Edges,
        edge_key,
        schema::encode(&CurrentEdgeBody {
            version: 0,
            target_id: InodeIdExtra::new(target_id, locked),
            creation_time,
        }),
    );
    Ok(creation_time)
}

/// Retires a current edge: deletes it and writes two snapshot edges, the
/// retired binding (owned or not, per the caller) and the deletion marker at
/// the log entry time.
fn soft_unlink_current_edge(
    db: &ShardDb,
    batch: &mut WriteBatch,
    time: LodeTime,
    dir_id: InodeId,
    name: &ShortBytes,
    creation_time: LodeTime,
    target_id: InodeId,
    owned: bool,
) -> Result<(), LodeError> {
    let hash =
        initiate_directory_modification_and_hash(db, batch, time, false, dir_id, name)?;

    let edge_key = current_edge_key(dir_id, hash, name);
    let bytes = db
        .store
        .get(ColumnFamily::Edges, &edge_key)
        .ok_or(LodeError::EdgeNotFound)?;
    let edge: CurrentEdgeBody = schema::decode(&bytes).expect("corrupt current edge");
    if edge.target_id.id() != target_id {
        debug!(expected = %target_id, got = %edge.target_id.id(), "unlink target mismatch");
        return Err(LodeError::MismatchingTarget);
    }
    if edge.creation_time != creation_time {
        debug!(expected = %edge.creation_time, got = %creation_time, "unlink time mismatch");
        return Err(LodeError::MismatchingCreationTime);
    }
    if edge.locked() {
        return Err(LodeError::EdgeIsLocked);
    }

    batch.delete(ColumnFamily::Edges, edge_key);
    batch.put(
        ColumnFamily::Edges,
        snapshot_edge_key(dir_id, hash, name, edge.creation_time),
        schema::encode(&SnapshotEdgeBody {
            version: 0,
            target_id: InodeIdExtra::new(target_id, owned),
        }),
    );
    batch.put(
        ColumnFamily::Edges,
        snapshot_edge_key(dir_id, hash, name, time),
        schema::encode(&SnapshotEdgeBody {
            version: 0,
            target_id: InodeIdExtra::new(NULL_INODE_ID, false),
        }),
    );
    Ok(())
}

fn add_block_services_to_files(
    batch: &mut WriteBatch,
    bs: lodefs_proto::ids::BlockServiceId,
    file_id: InodeId,
    delta: i64,
) {
    debug!(%bs, %file_id, delta, "adjusting block service to file count");
    batch.merge_add(
        ColumnFamily::BlockServicesToFiles,
        block_service_to_file_key(bs, file_id),
        delta,
    );
}

/// The state of the span ending at `span_end` in the given file: committed
/// files are always clean; a transient file's tail has the recorded state,
/// anything before the tail is clean.
fn fetch_span_state(db: &ShardDb, time: LodeTime, file_id: InodeId, span_end: u64) -> SpanState {
    match committed_file(db, file_id) {
        Ok(_) => SpanState::Clean,
        Err(LodeError::FileNotFound) => {
            let file = committed_transient_file(db, time, true, file_id)
                .expect("file is neither committed nor transient");
            if span_end == file.size {
                file.last_span_state
            } else {
                SpanState::Clean
            }
        }
        Err(err) => panic!("unexpected error fetching file {}: {}", file_id, err),
    }
}

/// Builds the client-visible blocks of an initiated span: contact details
/// plus one write certificate per block.
fn fill_add_span_resp(db: &ShardDb, location: &LocationBlocksBody) -> AddSpanInitiateResp {
    let cache = db.bs_cache.get();
    let blocks = location
        .blocks
        .iter()
        .map(|block| {
            let info = cache.expect(block.block_service_id);
            AddSpanInitiateBlockInfo {
                block_service_id: block.block_service_id,
                block_service_addrs: info.addrs.clone(),
                block_service_failure_domain: info.failure_domain,
                block_id: block.block_id,
                certificate: block_write_certificate(
                    &info.secret_key,
                    block.block_service_id,
                    block.block_id,
                    block.crc,
                    location.block_size(),
                ),
            }
        })
        .collect();
    AddSpanInitiateResp { blocks }
}

// ----------------------------------------------------------------
// handlers

fn construct_file(
    db: &ShardDb,
    batch: &mut WriteBatch,
    time: LodeTime,
    entry: &ConstructFileEntry,
) -> Result<ConstructFileResp, LodeError> {
    let key = if entry.file_type == InodeType::File as u8 {
        schema::meta_key::NEXT_FILE_ID
    } else if entry.file_type == InodeType::Symlink as u8 {
        schema::meta_key::NEXT_SYMLINK_ID
    } else {
        panic!("bad inode type {} in construct file entry", entry.file_type);
    };

    let key = metadata_key(key);
    let prev = schema::decode_u64_value(
        &db.store
            .get(ColumnFamily::Default, &key)
            .expect("id allocator missing"),
    );
    let id = InodeId::from_u64(prev).next_allocated();
    batch.put(ColumnFamily::Default, key, encode_u64_value(id.as_u64()));

    put_transient_file(
        batch,
        id,
        &TransientFileBody {
            version: 0,
            size: 0,
            mtime: time,
            deadline: entry.deadline_time,
            last_span_state: SpanState::Clean,
            note: entry.note.clone(),
        },
    );

    Ok(ConstructFileResp {
        id,
        cookie: db.cookie(id),
    })
}

fn link_file(
    db: &ShardDb,
    batch: &mut WriteBatch,
    time: LodeTime,
    entry: &LinkFileEntry,
) -> Result<LinkFileResp, LodeError> {
    let transient = match committed_transient_file(db, time, false, entry.file_id) {
        Ok(file) => file,
        Err(LodeError::FileNotFound) => {
            // the file may already be linked; let retrying clients succeed
            let dir = committed_directory(db, entry.owner_id, false)
                .map_err(|_| LodeError::FileNotFound)?;
            let hash = name_hash(dir.hash_mode, &entry.name);
            let bytes = db
                .store
                .get(
                    ColumnFamily::Edges,
                    &current_edge_key(entry.owner_id, hash, &entry.name),
                )
                .ok_or(LodeError::FileNotFound)?;
            let edge: CurrentEdgeBody = schema::decode(&bytes).expect("corrupt current edge");
            if edge.target_id.id() != entry.file_id {
                debug!("existing edge points elsewhere after FileNotFound for link file");
                return Err(LodeError::FileNotFound);
            }
            return Ok(LinkFileResp {
                creation_time: edge.creation_time,
            });
        }
        Err(err) => return Err(err),
    };
    if transient.last_span_state != SpanState::Clean {
        return Err(LodeError::LastSpanStateNotClean);
    }

    // promote to a committed file
    let file_key = inode_id_key(entry.file_id);
    batch.delete(ColumnFamily::Transient, file_key.clone());
    batch.put(
        ColumnFamily::Files,
        file_key,
        schema::encode(&FileBody {
            version: 0,
            mtime: time,
            atime: time,
            size: transient.size,
        }),
    );

    let creation_time = create_current_edge(
        db,
        batch,
        time,
        entry.owner_id,
        &entry.name,
        entry.file_id,
        false,
        LodeTime::ZERO,
    )?;
    Ok(LinkFileResp { creation_time })
}

fn same_directory_rename(
    db: &ShardDb,
    batch: &mut WriteBatch,
    time: LodeTime,
    entry: &SameDirectoryRenameEntry,
) -> Result<SameDirectoryRenameResp, LodeError> {
    // the old edge stops being current but is not owned anymore, the new
    // edge takes over ownership
    soft_unlink_current_edge(
        db,
        batch,
        time,
        entry.dir_id,
        &entry.old_name,
        entry.old_creation_time,
        entry.target_id,
        false,
    )?;
    let new_creation_time = create_current_edge(
        db,
        batch,
        time,
        entry.dir_id,
        &entry.new_name,
        entry.target_id,
        false,
        LodeTime::ZERO,
    )?;
    Ok(SameDirectoryRenameResp { new_creation_time })
}

fn same_directory_rename_snapshot(
    db: &ShardDb,
    batch: &mut WriteBatch,
    time: LodeTime,
    entry: &SameDirectoryRenameSnapshotEntry,
) -> Result<SameDirectoryRenameSnapshotResp, LodeError> {
    // disown the snapshot edge the target is revived from
    {
        // owned edges cannot live in snapshot directories
        let hash = initiate_directory_modification_and_hash(
            db,
            batch,
            time,
            false,
            entry.dir_id,
            &entry.old_name,
        )?;
        let key = snapshot_edge_key(entry.dir_id, hash, &entry.old_name, entry.old_creation_time);
        let bytes = db
            .store
            .get(ColumnFamily::Edges, &key)
            .ok_or(LodeError::EdgeNotFound)?;
        let edge: SnapshotEdgeBody = schema::decode(&bytes).expect("corrupt snapshot edge");
        if edge.target_id.id() != entry.target_id {
            debug!(expected = %entry.target_id, got = %edge.target_id.id(), "snapshot rename target mismatch");
            return Err(LodeError::MismatchingTarget);
        }
        if !edge.owned() {
            return Err(LodeError::EdgeNotOwned);
        }
        batch.put(
            ColumnFamily::Edges,
            key,
            schema::encode(&SnapshotEdgeBody {
                version: 0,
                target_id: InodeIdExtra::new(entry.target_id, false),
            }),
        );
    }

    let new_creation_time = create_current_edge(
        db,
        batch,
        time,
        entry.dir_id,
        &entry.new_name,
        entry.target_id,
        false,
        LodeTime::ZERO,
    )?;
    Ok(SameDirectoryRenameSnapshotResp { new_creation_time })
}

fn soft_unlink_file(
    db: &ShardDb,
    batch: &mut WriteBatch,
    time: LodeTime,
    entry: &SoftUnlinkFileEntry,
) -> Result<SoftUnlinkFileResp, LodeError> {
    soft_unlink_current_edge(
        db,
        batch,
        time,
        entry.owner_id,
        &entry.name,
        entry.creation_time,
        entry.file_id,
        true,
    )?;
    Ok(SoftUnlinkFileResp {
        delete_creation_time: time,
    })
}

fn same_shard_hard_file_unlink(
    db: &ShardDb,
    batch: &mut WriteBatch,
    time: LodeTime,
    entry: &SameShardHardFileUnlinkEntry,
) -> Result<SameShardHardFileUnlinkResp, LodeError> {
    let file = match committed_file(db, entry.target_id) {
        Ok(file) => file,
        Err(LodeError::FileNotFound) => {
            // already transient: done
            return match committed_transient_file(db, time, true, entry.target_id) {
                Ok(_) => Ok(SameShardHardFileUnlinkResp {}),
                Err(LodeError::FileNotFound) => Err(LodeError::FileNotFound),
                Err(err) => Err(err),
            };
        }
        Err(err) => return Err(err),
    };

    // the GC also runs this against deleted directories
    let hash = initiate_directory_modification_and_hash(
        db,
        batch,
        time,
        true,
        entry.owner_id,
        &entry.name,
    )?;

    // the owned edge must still be there: the file might have been re-owned
    // in the meantime, and then it is not ours to kill
    {
        let key = snapshot_edge_key(entry.owner_id, hash, &entry.name, entry.creation_time);
        let bytes = db
            .store
            .get(ColumnFamily::Edges, &key)
            .ok_or(LodeError::EdgeNotFound)?;
        let edge: SnapshotEdgeBody = schema::decode(&bytes).expect("corrupt snapshot edge");
        if !edge.owned() {
            return Err(LodeError::EdgeNotFound);
        }
        batch.delete(ColumnFamily::Edges, key);
    }

    let key = inode_id_key(entry.target_id);
    batch.delete(ColumnFamily::Files, key);
    put_transient_file(
        batch,
        entry.target_id,
        &TransientFileBody {
            version: 0,
            size: file.size,
            mtime: time,
            deadline: entry.deadline_time,
            last_span_state: SpanState::Clean,
            note: entry.name.clone(),
        },
    );
    Ok(SameShardHardFileUnlinkResp {})
}

fn create_directory_inode(
    db: &ShardDb,
    batch: &mut WriteBatch,
    time: LodeTime,
    entry: &CreateDirectoryInodeEntry,
) -> Result<CreateDirectoryInodeResp, LodeError> {
    // the CDC doles out directory ids transactionally, so a present
    // directory is a replay, not a conflict -- but the owner must agree
    match committed_directory(db, entry.id, false) {
        Ok(dir) => {
            return if dir.owner_id != entry.owner_id {
                Err(LodeError::MismatchingOwner)
            } else {
                Ok(CreateDirectoryInodeResp {
                    mtime: LodeTime::ZERO,
                })
            };
        }
        Err(LodeError::DirectoryNotFound) => {}
        Err(err) => return Err(err),
    }

    put_directory(
        batch,
        entry.id,
        &DirectoryBody {
            version: 0,
            owner_id: entry.owner_id,
            mtime: time,
            hash_mode: lodefs_proto::hash::HashMode::Xxh3_63,
            info: entry.info.clone(),
        },
    );
    Ok(CreateDirectoryInodeResp { mtime: time })
}

fn create_locked_current_edge(
    db: &ShardDb,
    batch: &mut WriteBatch,
    time: LodeTime,
    entry: &CreateLockedCurrentEdgeEntry,
) -> Result<CreateLockedCurrentEdgeResp, LodeError> {
    let creation_time = create_current_edge(
        db,
        batch,
        time,
        entry.dir_id,
        &entry.name,
        entry.target_id,
        true,
        entry.old_creation_time,
    )?;
    Ok(CreateLockedCurrentEdgeResp { creation_time })
}

fn lock_current_edge(
    db: &ShardDb,
    batch: &mut WriteBatch,
    time: LodeTime,
    entry: &LockCurrentEdgeEntry,
) -> Result<LockCurrentEdgeResp, LodeError> {
    let hash = initiate_directory_modification_and_hash(
        db,
        batch,
        time,
        false,
        entry.dir_id,
        &entry.name,
    )?;
    let key = current_edge_key(entry.dir_id, hash, &entry.name);
    let bytes = db
        .store
        .get(ColumnFamily::Edges, &key)
        .ok_or(LodeError::EdgeNotFound)?;
    let edge: CurrentEdgeBody = schema::decode(&bytes).expect("corrupt current edge");
    if edge.creation_time != entry.creation_time {
        debug!(expected = %edge.creation_time, got = %entry.creation_time, "lock edge time mismatch");
        return Err(LodeError::MismatchingCreationTime);
    }
    if !edge.locked() {
        batch.put(
            ColumnFamily::Edges,
            key,
            schema::encode(&CurrentEdgeBody {
                version: 0,
                target_id: InodeIdExtra::new(entry.target_id, true),
                creation_time: edge.creation_time,
            }),
        );
    }
    Ok(LockCurrentEdgeResp {})
}

fn unlock_current_edge(
    db: &ShardDb,
    batch: &mut WriteBatch,
    time: LodeTime,
    entry: &UnlockCurrentEdgeEntry,
) -> Result<UnlockCurrentEdgeResp, LodeError> {
    let hash = initiate_directory_modification_and_hash(
        db,
        batch,
        time,
        false,
        entry.dir_id,
        &entry.name,
    )?;
    let key = current_edge_key(entry.dir_id, hash, &entry.name);
    let bytes = db
        .store
        .get(ColumnFamily::Edges, &key)
        .ok_or(LodeError::EdgeNotFound)?;
    let edge: CurrentEdgeBody = schema::decode(&bytes).expect("corrupt current edge");
    if edge.creation_time != entry.creation_time {
        debug!(expected = %edge.creation_time, got = %entry.creation_time, "unlock edge time mismatch");
        return Err(LodeError::MismatchingCreationTime);
    }
    if edge.locked() {
        batch.put(
            ColumnFamily::Edges,
            key.clone(),
            schema::encode(&CurrentEdgeBody {
                version: 0,
                target_id: InodeIdExtra::new(entry.target_id, false),
                creation_time: edge.creation_time,
            }),
        );
    }
    if entry.was_moved {
        // the rename moved the target away: retire the edge into a snapshot
        // plus a deletion marker
        batch.delete(ColumnFamily::Edges, key);
        batch.put(
            ColumnFamily::Edges,
            snapshot_edge_key(entry.dir_id, hash, &entry.name, edge.creation_time),
            schema::encode(&SnapshotEdgeBody {
                version: 0,
                target_id: InodeIdExtra::new(entry.target_id, false),
            }),
        );
        batch.put(
            ColumnFamily::Edges,
            snapshot_edge_key(entry.dir_id, hash, &entry.name, time),
            schema::encode(&SnapshotEdgeBody {
                version: 0,
                // deletion edges are never owned
                target_id: InodeIdExtra::new(NULL_INODE_ID, false),
            }),
        );
    }
    Ok(UnlockCurrentEdgeResp {})
}

fn remove_directory_owner(
    db: &ShardDb,
    batch: &mut WriteBatch,
    time: LodeTime,
    entry: &RemoveDirectoryOwnerEntry,
) -> Result<RemoveDirectoryOwnerResp, LodeError> {
    // allow snapshots so a replay of the removal succeeds
    let dir = initiate_directory_modification(db, batch, time, true, entry.dir_id)?;
    if dir.owner_id == NULL_INODE_ID {
        return Ok(RemoveDirectoryOwnerResp {});
    }

    // any current edge blocks the removal
    let mut has_current = false;
    db.store.with_committed(|s| {
        let start = edge_scan_start(entry.dir_id, true, 0);
        if let Some((k, _)) = s.seek(ColumnFamily::Edges, &start) {
            let k = parse_edge_key(&k);
            has_current = k.dir_id == entry.dir_id && k.current;
        }
    });
    if has_current {
        return Err(LodeError::DirectoryNotEmpty);
    }

    // a fresh body: the info may have changed size with the owner gone
    put_directory(
        batch,
        entry.dir_id,
        &DirectoryBody {
            version: 0,
            owner_id: NULL_INODE_ID,
            mtime: time,
            hash_mode: dir.hash_mode,
            info: entry.info.clone(),
        },
    );
    Ok(RemoveDirectoryOwnerResp {})
}

fn remove_directory_inode(
    db: &ShardDb,
    batch: &mut WriteBatch,
    time: LodeTime,
    entry: &RemoveInodeEntry,
) -> Result<RemoveInodeResp, LodeError> {
    let dir = match initiate_directory_modification(db, batch, time, true, entry.id) {
        Ok(dir) => dir,
        // already gone: replays succeed
        Err(LodeError::DirectoryNotFound) => return Ok(RemoveInodeResp {}),
        Err(err) => return Err(err),
    };
    if dir.owner_id != NULL_INODE_ID {
        return Err(LodeError::DirectoryHasOwner);
    }
    // no outgoing edge of either kind may survive the inode
    let mut has_edge = false;
    db.store.with_committed(|s| {
        let start = edge_scan_start(entry.id, true, 0);
        if let Some((k, _)) = s.seek(ColumnFamily::Edges, &start) {
            let k = parse_edge_key(&k);
            if k.dir_id == entry.id {
                debug!(name = ?k.name, "found edge while removing directory");
                has_edge = true;
            }
        }
    });
    if has_edge {
        return Err(LodeError::DirectoryNotEmpty);
    }
    batch.delete(ColumnFamily::Directories, inode_id_key(entry.id));
    Ok(RemoveInodeResp {})
}

fn remove_file_inode(
    db: &ShardDb,
    batch: &mut WriteBatch,
    time: LodeTime,
    entry: &RemoveInodeEntry,
) -> Result<RemoveInodeResp, LodeError> {
    // the file must be transient, past its deadline, and spanless
    let file = match committed_transient_file(db, time, true, entry.id) {
        Ok(file) => file,
        Err(LodeError::FileNotFound) => {
            return match committed_file(db, entry.id) {
                Ok(_) => Err(LodeError::FileIsNotTransient),
                // fully gone already; repeated calls are fine
                Err(LodeError::FileNotFound) => Ok(RemoveInodeResp {}),
                Err(err) => Err(err),
            };
        }
        Err(err) => return Err(err),
    };
    if file.deadline >= time {
        return Err(LodeError::DeadlineNotPassed);
    }
    let mut has_span = false;
    db.store.with_committed(|s| {
        if let Some((k, _)) = s.seek(ColumnFamily::Spans, &span_key(entry.id, 0)) {
            has_span = parse_span_key(&k).0 == entry.id;
        }
    });
    if has_span {
        return Err(LodeError::FileNotEmpty);
    }
    batch.delete(ColumnFamily::Transient, inode_id_key(entry.id));
    Ok(RemoveInodeResp {})
}

fn remove_inode(
    db: &ShardDb,
    batch: &mut WriteBatch,
    time: LodeTime,
    entry: &RemoveInodeEntry,
) -> Result<RemoveInodeResp, LodeError> {
    if entry.id.is_directory() {
        remove_directory_inode(db, batch, time, entry)
    } else {
        remove_file_inode(db, batch, time, entry)
    }
}

fn set_directory_owner(
    db: &ShardDb,
    batch: &mut WriteBatch,
    time: LodeTime,
    entry: &SetDirectoryOwnerEntry,
) -> Result<SetDirectoryOwnerResp, LodeError> {
    let mut dir = initiate_directory_modification(db, batch, time, true, entry.dir_id)?;
    // The stored info might be the post-owner-removal one; re-owning keeps
    // it rather than recomputing inheritance, which is rare enough not to
    // matter.
    dir.owner_id = entry.owner_id;
    put_directory(batch, entry.dir_id, &dir);
    Ok(SetDirectoryOwnerResp {})
}

fn set_directory_info(
    db: &ShardDb,
    batch: &mut WriteBatch,
    time: LodeTime,
    entry: &SetDirectoryInfoEntry,
) -> Result<SetDirectoryInfoResp, LodeError> {
    // deletion policies remain settable on snapshot directories
    let dir = initiate_directory_modification(db, batch, time, true, entry.dir_id)?;
    put_directory(
        batch,
        entry.dir_id,
        &DirectoryBody {
            version: 0,
            owner_id: dir.owner_id,
            mtime: dir.mtime,
            hash_mode: dir.hash_mode,
            info: entry.info.clone(),
        },
    );
    Ok(SetDirectoryInfoResp {})
}

fn remove_non_owned_edge(
    db: &ShardDb,
    batch: &mut WriteBatch,
    time: LodeTime,
    entry: &RemoveNonOwnedEdgeEntry,
) -> Result<RemoveNonOwnedEdgeResp, LodeError> {
    // the GC prunes snapshot directories too
    let hash = initiate_directory_modification_and_hash(
        db,
        batch,
        time,
        true,
        entry.dir_id,
        &entry.name,
    )?;

    let key = snapshot_edge_key(entry.dir_id, hash, &entry.name, entry.creation_time);
    let Some(bytes) = db.store.get(ColumnFamily::Edges, &key) else {
        // already removed; make the client's life easier
        return Ok(RemoveNonOwnedEdgeResp {});
    };
    let edge: SnapshotEdgeBody = schema::decode(&bytes).expect("corrupt snapshot edge");
    if edge.owned() {
        // deleting an owned edge here would orphan its file
        return Err(LodeError::EdgeNotFound);
    }
    batch.delete(ColumnFamily::Edges, key);
    Ok(RemoveNonOwnedEdgeResp {})
}

fn remove_owned_snapshot_file_edge(
    db: &ShardDb,
    batch: &mut WriteBatch,
    time: LodeTime,
    entry: &RemoveOwnedSnapshotFileEdgeEntry,
) -> Result<RemoveOwnedSnapshotFileEdgeResp, LodeError> {
    // the GC drains owned edges out of deleted directories, so snapshots
    // are fine; the caller is responsible for having made the target
    // transient first
    let hash = initiate_directory_modification_and_hash(
        db,
        batch,
        time,
        true,
        entry.owner_id,
        &entry.name,
    )?;
    batch.delete(
        ColumnFamily::Edges,
        snapshot_edge_key(entry.owner_id, hash, &entry.name, entry.creation_time),
    );
    Ok(RemoveOwnedSnapshotFileEdgeResp {})
}

fn add_inline_span(
    db: &ShardDb,
    batch: &mut WriteBatch,
    time: LodeTime,
    entry: &AddInlineSpanEntry,
) -> Result<AddInlineSpanResp, LodeError> {
    let mut file = initiate_transient_file_modification(db, batch, time, false, entry.file_id)?;

    // empty spans leave no record
    if entry.body.is_empty() {
        return Ok(AddInlineSpanResp {});
    }

    if file.size != entry.byte_offset {
        // Replaying the same span add is fine, anything else is not. The
        // replay check compares against what was actually stored, so a
        // replay with different content is rejected.
        if file.size == entry.byte_offset + entry.size as u64 {
            let existing = committed_span(db, entry.file_id, entry.byte_offset)
                .ok_or(LodeError::SpanNotFound)?;
            let matches = existing.size == entry.size
                && existing.crc == entry.crc
                && matches!(&existing.storage, SpanStorage::Inline(body) if *body == entry.body);
            if matches {
                return Ok(AddInlineSpanResp {});
            }
            debug!("file size does not match, and existing span does not match");
            return Err(LodeError::SpanNotFound);
        }
        debug!(
            expected = entry.byte_offset,
            got = file.size,
            "file size does not match for inline span"
        );
        return Err(LodeError::SpanNotFound);
    }

    if file.last_span_state != SpanState::Clean {
        return Err(LodeError::LastSpanStateNotClean);
    }

    // inline spans never go through the dirty window
    file.size = entry.byte_offset + entry.size as u64;
    put_transient_file(batch, entry.file_id, &file);
    put_span(
        batch,
        entry.file_id,
        entry.byte_offset,
        &SpanBody {
            size: entry.size,
            crc: entry.crc,
            storage: SpanStorage::Inline(entry.body.clone()),
        },
    );
    Ok(AddInlineSpanResp {})
}

fn add_span_initiate(
    db: &ShardDb,
    batch: &mut WriteBatch,
    time: LodeTime,
    location_id: LocationId,
    entry: &AddSpanInitiateEntry,
) -> Result<AddSpanInitiateResp, LodeError> {
    let mut file = initiate_transient_file_modification(db, batch, time, false, entry.file_id)?;

    if file.size != entry.byte_offset {
        // Replaying the add returns the blocks chosen the first time; we
        // must never hand out fresh blocks for the same span, or the old
        // ones would leak.
        if file.size == entry.byte_offset + entry.size as u64 {
            let existing = committed_span(db, entry.file_id, entry.byte_offset)
                .ok_or_else(|| {
                    debug!("file size does not match, but could not find existing span");
                    LodeError::SpanNotFound
                })?;
            let locations = existing.locations();
            let matches = existing.size == entry.size
                && !existing.is_inline()
                && existing.crc == entry.crc
                && locations.len() == 1
                && locations[0].cell_size == entry.cell_size
                && locations[0].stripes == entry.stripes
                && locations[0].parity == entry.parity
                && locations[0].location_id == location_id;
            if !matches {
                debug!("file size does not match, and existing span does not match");
                return Err(LodeError::SpanNotFound);
            }
            return Ok(fill_add_span_resp(db, &locations[0]));
        }
        debug!(
            expected = entry.byte_offset,
            got = file.size,
            "file size does not match for span initiate"
        );
        return Err(LodeError::SpanNotFound);
    }

    if file.last_span_state != SpanState::Clean {
        return Err(LodeError::LastSpanStateNotClean);
    }

    file.size = entry.byte_offset + entry.size as u64;
    file.last_span_state = SpanState::Dirty;
    put_transient_file(batch, entry.file_id, &file);

    // materialize the span, allocating block ids as we go and recording
    // each block in the reverse index
    let next_block_id_key = metadata_key(schema::meta_key::NEXT_BLOCK_ID);
    let mut next_block_id = schema::decode_u64_value(
        &db.store
            .get(ColumnFamily::Default, &next_block_id_key)
            .expect("block id allocator missing"),
    );
    let mut blocks = Vec::with_capacity(entry.body_blocks.len());
    for entry_block in &entry.body_blocks {
        // the time is embedded in the id, apart from the shard low byte
        next_block_id = (next_block_id + 0x100)
            .max(db.shard_id().0 as u64 | (time.ns() & !0xFF));
        blocks.push(BlockBody {
            block_service_id: entry_block.block_service_id,
            block_id: next_block_id,
            crc: entry_block.crc,
        });
        add_block_services_to_files(batch, entry_block.block_service_id, entry.file_id, 1);
    }
    batch.put(
        ColumnFamily::Default,
        next_block_id_key,
        encode_u64_value(next_block_id),
    );

    let location = LocationBlocksBody {
        location_id,
        storage_class: entry.storage_class,
        parity: entry.parity,
        stripes: entry.stripes,
        cell_size: entry.cell_size,
        blocks,
        stripe_crcs: entry.body_stripes.clone(),
    };
    let resp = fill_add_span_resp(db, &location);
    put_span(
        batch,
        entry.file_id,
        entry.byte_offset,
        &SpanBody {
            size: entry.size,
            crc: entry.crc,
            storage: SpanStorage::Blocked(vec![location]),
        },
    );
    Ok(resp)
}

fn add_span_certify(
    db: &ShardDb,
    batch: &mut WriteBatch,
    time: LodeTime,
    entry: &AddSpanCertifyEntry,
) -> Result<AddSpanCertifyResp, LodeError> {
    let mut file = initiate_transient_file_modification(db, batch, time, false, entry.file_id)?;

    let span = committed_span(db, entry.file_id, entry.byte_offset)
        .ok_or(LodeError::SpanNotFound)?;
    // is the span still the tail?
    if file.size > entry.byte_offset + span.size as u64 {
        return Ok(AddSpanCertifyResp {}); // already certified, we are past it
    }
    match file.last_span_state {
        SpanState::Clean => return Ok(AddSpanCertifyResp {}), // already certified
        SpanState::Condemned => return Err(LodeError::SpanNotFound),
        SpanState::Dirty => {}
    }

    if span.is_inline() {
        return Err(LodeError::CannotCertifyBlocklessSpan);
    }
    let locations = span.locations();
    assert!(locations.len() == 1, "dirty span with multiple locations");
    let blocks = &locations[0].blocks;
    if blocks.len() != entry.proofs.len() {
        return Err(LodeError::BadNumberOfBlocksProofs);
    }
    let cache = db.bs_cache.get();
    for (block, proof) in blocks.iter().zip(&entry.proofs) {
        let info = cache.expect(block.block_service_id);
        let expected = block_add_proof(&info.secret_key, block.block_service_id, proof.block_id);
        if expected != proof.proof {
            return Err(LodeError::BadBlockProof);
        }
    }

    file.last_span_state = SpanState::Clean;
    put_transient_file(batch, entry.file_id, &file);
    Ok(AddSpanCertifyResp {})
}

fn add_span_location(
    db: &ShardDb,
    batch: &mut WriteBatch,
    time: LodeTime,
    entry: &AddSpanLocationEntry,
) -> Result<AddSpanLocationResp, LodeError> {
    committed_file(db, entry.file_id2)?;

    let mut source_file =
        initiate_transient_file_modification(db, batch, time, false, entry.file_id1)?;
    if source_file.last_span_state != SpanState::Clean {
        return Err(LodeError::LastSpanStateNotClean);
    }

    let mut destination_span = committed_span(db, entry.file_id2, entry.byte_offset2)
        .ok_or(LodeError::SpanNotFound)?;
    if destination_span.is_inline() {
        return Err(LodeError::AddSpanLocationInlineStorage);
    }

    let Some(source_span) = committed_span(db, entry.file_id1, entry.byte_offset1) else {
        // the move may have happened already; look for the blocks in the
        // destination
        let done = destination_span
            .locations()
            .iter()
            .any(|l| location_blocks_match(l, &entry.blocks1));
        return if done {
            Ok(AddSpanLocationResp {})
        } else {
            Err(LodeError::SpanNotFound)
        };
    };
    if source_span.is_inline() {
        return Err(LodeError::SwapSpansInlineStorage);
    }

    if source_span.size != destination_span.size {
        return Err(LodeError::AddSpanLocationMismatchingSize);
    }
    if source_span.crc != destination_span.crc {
        return Err(LodeError::AddSpanLocationMismatchingCrc);
    }

    let state1 = fetch_span_state(
        db,
        time,
        entry.file_id1,
        entry.byte_offset1 + source_span.size as u64,
    );
    if state1 != SpanState::Clean {
        return Err(LodeError::AddSpanLocationNotClean);
    }

    // the donor is transient and must hold exactly one location
    let source_locations = source_span.locations();
    if source_locations.len() != 1 {
        return Err(LodeError::TransientLocationCount);
    }
    let source_location = source_locations[0].clone();

    if destination_span
        .find_location(source_location.location_id)
        .is_some()
    {
        return Err(LodeError::AddSpanLocationExists);
    }

    for block in &source_location.blocks {
        add_block_services_to_files(batch, block.block_service_id, entry.file_id2, 1);
        add_block_services_to_files(batch, block.block_service_id, entry.file_id1, -1);
    }

    source_file.size -= source_span.size as u64;
    put_transient_file(batch, entry.file_id1, &source_file);

    match &mut destination_span.storage {
        SpanStorage::Blocked(locations) => locations.push(source_location),
        SpanStorage::Inline(_) => unreachable!(),
    }
    put_span(batch, entry.file_id2, entry.byte_offset2, &destination_span);
    batch.delete(
        ColumnFamily::Spans,
        span_key(entry.file_id1, entry.byte_offset1),
    );
    Ok(AddSpanLocationResp {})
}

fn location_blocks_match(location: &LocationBlocksBody, block_ids: &[u64]) -> bool {
    location.blocks.len() == block_ids.len()
        && location
            .blocks
            .iter()
            .zip(block_ids)
            .all(|(b, id)| b.block_id == *id)
}

fn remove_span_initiate(
    db: &ShardDb,
    batch: &mut WriteBatch,
    time: LodeTime,
    entry: &RemoveSpanInitiateEntry,
) -> Result<RemoveSpanInitiateResp, LodeError> {
    let mut file = initiate_transient_file_modification(db, batch, time, true, entry.file_id)?;

    // Checking the size (rather than scanning for spans) keeps an empty
    // file cheap.
    if file.size == 0 {
        debug!("exiting early from remove span since file is empty");
        return Err(LodeError::FileEmpty);
    }
    debug!(file_id = %entry.file_id, size = file.size, "deleting last span");

    // fetch the tail span
    let (span_offset, span) = db.store.with_committed(|s| {
        let (key, value) = s
            .seek_for_prev(ColumnFamily::Spans, &span_key(entry.file_id, file.size))
            .expect("non-empty transient file has no spans");
        let (span_file, offset) = parse_span_key(&key);
        assert!(span_file == entry.file_id, "non-empty transient file has no spans");
        let span: SpanBody = schema::decode(&value).expect("corrupt span body");
        (offset, span)
    });

    let mut resp = RemoveSpanInitiateResp {
        byte_offset: span_offset,
        blocks: Vec::new(),
    };

    // a blockless span just disappears
    if span.is_inline() {
        batch.delete(ColumnFamily::Spans, span_key(entry.file_id, span_offset));
        file.size = span_offset;
        put_transient_file(batch, entry.file_id, &file);
        return Ok(resp);
    }

    // Otherwise it gets condemned until the deletions are certified. Dirty
    // spans are removable too: that is how a writer dying mid-add is
    // cleaned up.
    file.last_span_state = SpanState::Condemned;
    put_transient_file(batch, entry.file_id, &file);

    let cache = db.bs_cache.get();
    for location in span.locations() {
        for block in &location.blocks {
            let info = cache.expect(block.block_service_id);
            resp.blocks.push(RemoveSpanInitiateBlockInfo {
                block_service_id: block.block_service_id,
                block_service_addrs: info.addrs.clone(),
                block_service_flags: info.flags,
                block_id: block.block_id,
                certificate: block_erase_certificate(
                    &info.secret_key,
                    block.block_service_id,
                    block.block_id,
                ),
            });
        }
    }
    Ok(resp)
}

fn remove_span_certify(
    db: &ShardDb,
    batch: &mut WriteBatch,
    time: LodeTime,
    entry: &RemoveSpanCertifyEntry,
) -> Result<RemoveSpanCertifyResp, LodeError> {
    let mut file = initiate_transient_file_modification(db, batch, time, true, entry.file_id)?;

    let Some(span) = committed_span(db, entry.file_id, entry.byte_offset) else {
        debug!(
            file_id = %entry.file_id,
            byte_offset = entry.byte_offset,
            "skipping span removal, already done"
        );
        return Ok(RemoveSpanCertifyResp {});
    };
    if span.is_inline() {
        return Err(LodeError::CannotCertifyBlocklessSpan);
    }
    if file.last_span_state != SpanState::Condemned {
        return Err(LodeError::SpanNotFound);
    }

    // every block of every location needs its deletion proof, in order
    let cache = db.bs_cache.get();
    let mut proof_ix = 0;
    for location in span.locations() {
        if entry.proofs.len() - proof_ix < location.blocks.len() {
            return Err(LodeError::BadNumberOfBlocksProofs);
        }
        for block in &location.blocks {
            let proof = &entry.proofs[proof_ix];
            proof_ix += 1;
            if block.block_id != proof.block_id {
                warn!(
                    file_id = %entry.file_id,
                    expected = block.block_id,
                    got = proof.block_id,
                    "bad block proof id"
                );
                return Err(LodeError::BadBlockProof);
            }
            let info = cache.expect(block.block_service_id);
            let expected =
                block_delete_proof(&info.secret_key, block.block_service_id, proof.block_id);
            if expected != proof.proof {
                warn!(
                    file_id = %entry.file_id,
                    block_service = %block.block_service_id,
                    "bad block delete proof"
                );
                return Err(LodeError::BadBlockProof);
            }
            add_block_services_to_files(batch, block.block_service_id, entry.file_id, -1);
        }
    }
    if proof_ix != entry.proofs.len() {
        return Err(LodeError::BadNumberOfBlocksProofs);
    }

    debug!(file_id = %entry.file_id, byte_offset = entry.byte_offset, "deleting span");
    batch.delete(
        ColumnFamily::Spans,
        span_key(entry.file_id, entry.byte_offset),
    );
    file.last_span_state = SpanState::Clean;
    file.size = entry.byte_offset;
    put_transient_file(batch, entry.file_id, &file);
    Ok(RemoveSpanCertifyResp {})
}

fn make_file_transient(
    db: &ShardDb,
    batch: &mut WriteBatch,
    time: LodeTime,
    entry: &MakeFileTransientEntry,
) -> Result<MakeFileTransientResp, LodeError> {
    let file = match committed_file(db, entry.id) {
        Ok(file) => file,
        Err(LodeError::FileNotFound) => {
            // already transient: done
            if committed_transient_file(db, time, true, entry.id).is_ok() {
                return Ok(MakeFileTransientResp {});
            }
            return Err(LodeError::FileNotFound);
        }
        Err(err) => return Err(err),
    };

    batch.delete(ColumnFamily::Files, inode_id_key(entry.id));
    put_transient_file(
        batch,
        entry.id,
        &TransientFileBody {
            version: 0,
            size: file.size,
            mtime: time,
            deadline: entry.deadline_time,
            last_span_state: SpanState::Clean,
            note: entry.note.clone(),
        },
    );
    Ok(MakeFileTransientResp {})
}

fn scrap_transient_file(
    db: &ShardDb,
    batch: &mut WriteBatch,
    time: LodeTime,
    entry: &ScrapTransientFileEntry,
) -> Result<ScrapTransientFileResp, LodeError> {
    let mut file = committed_transient_file(db, time, true, entry.id)?;
    file.deadline = entry.deadline_time;
    put_transient_file(batch, entry.id, &file);
    Ok(ScrapTransientFileResp {})
}

fn swap_blocks(
    db: &ShardDb,
    batch: &mut WriteBatch,
    time: LodeTime,
    entry: &SwapBlocksEntry,
) -> Result<SwapBlocksResp, LodeError> {
    let mut span1 = committed_span(db, entry.file_id1, entry.byte_offset1)
        .ok_or(LodeError::SpanNotFound)?;
    let mut span2 = committed_span(db, entry.file_id2, entry.byte_offset2)
        .ok_or(LodeError::SpanNotFound)?;
    if span1.is_inline() || span2.is_inline() {
        return Err(LodeError::SwapBlocksInlineStorage);
    }

    // certified and uncertified blocks must not mix
    let state1 = fetch_span_state(db, time, entry.file_id1, entry.byte_offset1 + span1.size as u64);
    let state2 = fetch_span_state(db, time, entry.file_id2, entry.byte_offset2 + span2.size as u64);
    if state1 != state2 {
        return Err(LodeError::SwapBlocksMismatchingState);
    }

    let ix1 = span1.find_block(entry.block_id1);
    let ix2 = span2.find_block(entry.block_id2);
    let (Some((loc1, blk1)), Some((loc2, blk2))) = (ix1, ix2) else {
        // both missing might mean the swap already happened
        if ix1.is_none()
            && ix2.is_none()
            && span1.find_block(entry.block_id2).is_some()
            && span2.find_block(entry.block_id1).is_some()
        {
            return Ok(SwapBlocksResp {});
        }
        return Err(LodeError::BlockNotFound);
    };

    let location1 = &span1.locations()[loc1];
    let location2 = &span2.locations()[loc2];
    if location1.block_size() != location2.block_size() {
        return Err(LodeError::SwapBlocksMismatchingSize);
    }
    let block1 = location1.blocks[blk1].clone();
    let block2 = location2.blocks[blk2].clone();
    if block1.crc != block2.crc {
        return Err(LodeError::SwapBlocksMismatchingCrc);
    }
    if location1.location_id != location2.location_id {
        return Err(LodeError::SwapBlocksMismatchingLocation);
    }

    // neither resulting span may hold two blocks on one service or in one
    // failure domain
    let cache = db.bs_cache.get();
    let check_no_duplicates = |location: &LocationBlocksBody,
                               replaced_ix: usize,
                               incoming: &BlockBody|
     -> Result<(), LodeError> {
        let incoming_domain = cache.expect(incoming.block_service_id).failure_domain;
        for (i, block) in location.blocks.iter().enumerate() {
            if i == replaced_ix {
                continue;
            }
            if block.block_service_id == incoming.block_service_id {
                return Err(LodeError::SwapBlocksDuplicateBlockService);
            }
            if cache.expect(block.block_service_id).failure_domain == incoming_domain {
                return Err(LodeError::SwapBlocksDuplicateFailureDomain);
            }
        }
        Ok(())
    };
    check_no_duplicates(location1, blk1, &block2)?;
    check_no_duplicates(location2, blk2, &block1)?;

    add_block_services_to_files(batch, block1.block_service_id, entry.file_id1, -1);
    add_block_services_to_files(batch, block2.block_service_id, entry.file_id1, 1);
    add_block_services_to_files(batch, block1.block_service_id, entry.file_id2, 1);
    add_block_services_to_files(batch, block2.block_service_id, entry.file_id2, -1);

    span1.locations_mut()[loc1].blocks[blk1] = block2;
    span2.locations_mut()[loc2].blocks[blk2] = block1;
    put_span(batch, entry.file_id1, entry.byte_offset1, &span1);
    put_span(batch, entry.file_id2, entry.byte_offset2, &span2);
    Ok(SwapBlocksResp {})
}

fn swap_spans(
    db: &ShardDb,
    batch: &mut WriteBatch,
    time: LodeTime,
    entry: &SwapSpansEntry,
) -> Result<SwapSpansResp, LodeError> {
    let span1 = committed_span(db, entry.file_id1, entry.byte_offset1)
        .ok_or(LodeError::SpanNotFound)?;
    let span2 = committed_span(db, entry.file_id2, entry.byte_offset2)
        .ok_or(LodeError::SpanNotFound)?;
    if span1.is_inline() || span2.is_inline() {
        return Err(LodeError::SwapSpansInlineStorage);
    }
    if span1.size != span2.size {
        return Err(LodeError::SwapSpansMismatchingSize);
    }
    if span1.crc != span2.crc {
        return Err(LodeError::SwapSpansMismatchingCrc);
    }
    let state1 = fetch_span_state(db, time, entry.file_id1, entry.byte_offset1 + span1.size as u64);
    let state2 = fetch_span_state(db, time, entry.file_id2, entry.byte_offset2 + span2.size as u64);
    if state1 != SpanState::Clean || state2 != SpanState::Clean {
        return Err(LodeError::SwapSpansNotClean);
    }
    if span1.blocks_match(&entry.blocks2) && span2.blocks_match(&entry.blocks1) {
        return Ok(SwapSpansResp {}); // already swapped
    }
    if !(span1.blocks_match(&entry.blocks1) && span2.blocks_match(&entry.blocks2)) {
        return Err(LodeError::SwapSpansMismatchingBlocks);
    }

    let adjust = |batch: &mut WriteBatch, span: &SpanBody, add_to: InodeId, sub_from: InodeId| {
        for location in span.locations() {
            for block in &location.blocks {
                add_block_services_to_files(batch, block.block_service_id, add_to, 1);
                add_block_services_to_files(batch, block.block_service_id, sub_from, -1);
            }
        }
    };
    adjust(batch, &span1, entry.file_id2, entry.file_id1);
    adjust(batch, &span2, entry.file_id1, entry.file_id2);

    put_span(batch, entry.file_id1, entry.byte_offset1, &span2);
    put_span(batch, entry.file_id2, entry.byte_offset2, &span1);
    Ok(SwapSpansResp {})
}

fn move_span(
    db: &ShardDb,
    batch: &mut WriteBatch,
    time: LodeTime,
    entry: &MoveSpanEntry,
) -> Result<MoveSpanResp, LodeError> {
    let mut file1 = initiate_transient_file_modification(db, batch, time, true, entry.file_id1)?;
    let mut file2 = initiate_transient_file_modification(db, batch, time, true, entry.file_id2)?;

    debug!(
        span_size = entry.span_size,
        offset1 = entry.byte_offset1,
        offset2 = entry.byte_offset2,
        size1 = file1.size,
        state1 = %file1.last_span_state,
        size2 = file2.size,
        state2 = %file2.last_span_state,
        "move span"
    );
    // already moved?
    if file1.size == entry.byte_offset1
        && file1.last_span_state == SpanState::Clean
        && file2.size == entry.byte_offset2 + entry.span_size as u64
        && file2.last_span_state == SpanState::Dirty
    {
        return Ok(MoveSpanResp {});
    }
    // the donor tail must be dirty and the recipient tail clean, at the
    // stated offsets
    if file1.last_span_state != SpanState::Dirty
        || file1.size != entry.byte_offset1 + entry.span_size as u64
        || file2.last_span_state != SpanState::Clean
        || file2.size != entry.byte_offset2
    {
        debug!("span not found because of offset checks");
        return Err(LodeError::SpanNotFound);
    }

    let span = committed_span(db, entry.file_id1, entry.byte_offset1)
        .ok_or(LodeError::SpanNotFound)?;
    if span.size != entry.span_size {
        debug!("span not found because of differing sizes");
        return Err(LodeError::SpanNotFound);
    }

    batch.delete(
        ColumnFamily::Spans,
        span_key(entry.file_id1, entry.byte_offset1),
    );
    put_span(batch, entry.file_id2, entry.byte_offset2, &span);

    file1.size -= span.size as u64;
    file1.last_span_state = SpanState::Clean;
    put_transient_file(batch, entry.file_id1, &file1);
    file2.size += span.size as u64;
    file2.last_span_state = SpanState::Dirty;
    put_transient_file(batch, entry.file_id2, &file2);

    let locations = span.locations();
    assert!(locations.len() == 1, "dirty span with multiple locations");
    for block in &locations[0].blocks {
        add_block_services_to_files(batch, block.block_service_id, entry.file_id1, -1);
        add_block_services_to_files(batch, block.block_service_id, entry.file_id2, 1);
    }
    Ok(MoveSpanResp {})
}

fn set_time(
    db: &ShardDb,
    batch: &mut WriteBatch,
    entry: &SetTimeEntry,
) -> Result<SetTimeResp, LodeError> {
    let mut file = committed_file(db, entry.id)?;
    // each field applies only when its high bit is set
    const SET_BIT: u64 = 1 << 63;
    if entry.atime & SET_BIT != 0 {
        file.atime = LodeTime(entry.atime & !SET_BIT);
    }
    if entry.mtime & SET_BIT != 0 {
        file.mtime = LodeTime(entry.mtime & !SET_BIT);
    }
    batch.put(
        ColumnFamily::Files,
        inode_id_key(entry.id),
        schema::encode(&file),
    );
    Ok(SetTimeResp {})
}

fn remove_zero_block_service_files(
    db: &ShardDb,
    batch: &mut WriteBatch,
    entry: &RemoveZeroBlockServiceFilesEntry,
) -> Result<RemoveZeroBlockServiceFilesResp, LodeError> {
    // bounded sweep, the caller continues from the returned cursor
    const MAX_ENTRIES: usize = 1_000;

    let mut resp = RemoveZeroBlockServiceFilesResp {
        removed: 0,
        next_block_service: lodefs_proto::ids::BlockServiceId(0),
        next_file: NULL_INODE_ID,
    };
    let begin = block_service_to_file_key(entry.start_block_service, entry.start_file);
    let mut visited = 0usize;
    db.store.with_committed(|s| {
        s.scan_forward(ColumnFamily::BlockServicesToFiles, &begin, None, |key, value| {
            if visited == MAX_ENTRIES {
                let (bs, file) = parse_block_service_to_file_key(key);
                debug!("not done removing zero block service files");
                resp.next_block_service = bs;
                resp.next_file = file;
                return false;
            }
            visited += 1;
            if schema::decode_i64_value(value) == 0 {
                let (bs, file) = parse_block_service_to_file_key(key);
                debug!(%bs, %file, "removing zero block service file entry");
                batch.delete(ColumnFamily::BlockServicesToFiles, key.to_vec());
                resp.removed += 1;
            }
            true
        });
    });
    Ok(resp)
}
