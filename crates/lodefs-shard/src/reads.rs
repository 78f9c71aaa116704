//! The read path: snapshot-consistent handlers with MTU-bounded paging.
//!
//! Every handler runs against one published store snapshot. Responses are
//! pre-costed against the request MTU: when the next element would overflow
//! the datagram, the handler drops it again and emits a continuation cursor
//! instead.

use tracing::debug;

use lodefs_proto::bincode::{Pack, ShortBytes};
use lodefs_proto::hash::name_hash;
use lodefs_proto::ids::{InodeId, InodeType, LodeTime, NULL_INODE_ID};
use lodefs_proto::msgs::*;
use lodefs_proto::LodeError;

use crate::schema::{
    self, block_service_to_file_key, current_edge_key, edge_scan_end, edge_scan_start,
    inode_id_key, parse_block_service_to_file_key, parse_edge_key, parse_inode_id_key,
    parse_span_key, snapshot_edge_key, span_key, CurrentEdgeBody, SnapshotEdgeBody, SpanBody,
    SpanStorage, TransientFileBody,
};
use crate::shard::{get_directory, get_file, get_transient_file, ShardDb};
use crate::store::{ColumnFamily, StoreState};

/// Clamps a request MTU into the supported window; zero means the default.
fn pick_mtu(mtu: u16) -> i64 {
    (mtu as i64).clamp(DEFAULT_UDP_MTU as i64, MAX_UDP_MTU as i64)
}

pub(crate) fn lookup(state: &StoreState, req: &LookupReq) -> Result<LookupResp, LodeError> {
    let dir = get_directory(state, req.dir_id, false)?;
    let hash = name_hash(dir.hash_mode, &req.name);
    let key = current_edge_key(req.dir_id, hash, &req.name);
    let bytes = state
        .get(ColumnFamily::Edges, &key)
        .ok_or(LodeError::NameNotFound)?;
    let edge: CurrentEdgeBody = schema::decode(&bytes).expect("corrupt current edge");
    Ok(LookupResp {
        target_id: edge.target_id.id(),
        creation_time: edge.creation_time,
    })
}

pub(crate) fn stat_file(state: &StoreState, req: &StatFileReq) -> Result<StatFileResp, LodeError> {
    let file = get_file(state, req.id)?;
    Ok(StatFileResp {
        mtime: file.mtime,
        atime: file.atime,
        size: file.size,
    })
}

pub(crate) fn stat_directory(
    state: &StoreState,
    req: &StatDirectoryReq,
) -> Result<StatDirectoryResp, LodeError> {
    // snapshot directories allowed, the caller can tell by the null owner
    let dir = get_directory(state, req.id, true)?;
    Ok(StatDirectoryResp {
        mtime: dir.mtime,
        owner: dir.owner_id,
        info: dir.info,
    })
}

pub(crate) fn stat_transient_file(
    state: &StoreState,
    req: &StatTransientFileReq,
) -> Result<StatTransientFileResp, LodeError> {
    let bytes = state
        .get(ColumnFamily::Transient, &inode_id_key(req.id))
        .ok_or(LodeError::FileNotFound)?;
    let file: TransientFileBody = schema::decode(&bytes).expect("corrupt transient file body");
    Ok(StatTransientFileResp {
        mtime: file.mtime,
        size: file.size,
        note: file.note,
    })
}

pub(crate) fn read_dir(state: &StoreState, req: &ReadDirReq) -> Result<ReadDirResp, LodeError> {
    // snapshot directories are not listable through the plain path
    get_directory(state, req.dir_id, false)?;

    let mut resp = ReadDirResp {
        next_hash: 0,
        results: Vec::new(),
    };
    let mut budget = pick_mtu(req.mtu) - FRAME_HEADER_SIZE as i64 - 10;
    let start = edge_scan_start(req.dir_id, true, req.start_hash);
    let end = edge_scan_end(req.dir_id, true);
    state.scan_forward(ColumnFamily::Edges, &start, Some(&end), |key, value| {
        let key = parse_edge_key(key);
        assert!(key.dir_id == req.dir_id && key.current);
        let edge: CurrentEdgeBody = schema::decode(value).expect("corrupt current edge");
        resp.results.push(CurrentEdge {
            target_id: edge.target_id.id(),
            name_hash: key.name_hash,
            name: ShortBytes::new(key.name).expect("stored name too long"),
            creation_time: edge.creation_time,
        });
        budget -= resp.results.last().unwrap().packed_size() as i64;
        if budget < 0 {
            // drop the overflowing element, and do not let entries of one
            // hash straddle two pages
            resp.next_hash = key.name_hash;
            while resp
                .results
                .last()
                .is_some_and(|e| e.name_hash == key.name_hash)
            {
                resp.results.pop();
            }
            return false;
        }
        true
    });
    Ok(resp)
}

/// Appends one edge to a `FullReadDir` response, maintaining the limit, the
/// MTU budget and the continuation cursor. Returns true when iteration must
/// stop.
fn full_read_dir_add(
    req: &FullReadDirReq,
    resp: &mut FullReadDirResp,
    budget: &mut i64,
    key: &schema::EdgeKey,
    value: &[u8],
) -> bool {
    let edge = if key.current {
        let body: CurrentEdgeBody = schema::decode(value).expect("corrupt current edge");
        Edge {
            current: true,
            target_id: body.target_id,
            name_hash: key.name_hash,
            name: ShortBytes::new(key.name.clone()).expect("stored name too long"),
            creation_time: body.creation_time,
        }
    } else {
        let body: SnapshotEdgeBody = schema::decode(value).expect("corrupt snapshot edge");
        Edge {
            current: false,
            target_id: body.target_id,
            name_hash: key.name_hash,
            name: ShortBytes::new(key.name.clone()).expect("stored name too long"),
            creation_time: key.creation_time,
        }
    };
    resp.results.push(edge);

    // static limit, terminate immediately to avoid additional seeks
    if req.limit > 0 && resp.results.len() >= req.limit as usize {
        resp.next = FullReadDirCursor::finished();
        return true;
    }
    // mtu limit
    *budget -= resp.results.last().unwrap().packed_size() as i64;
    if *budget < 0 {
        let mut prev_cursor_size = FullReadDirCursor::finished().packed_size() as i64;
        while *budget < 0 {
            let last = resp.results.pop().expect("mtu budget cannot fit one edge");
            debug!(name = %last.name, "full read dir: removing last");
            *budget += last.packed_size() as i64;
            resp.next = FullReadDirCursor {
                current: last.current,
                start_name: last.name,
                start_time: if last.current {
                    LodeTime::ZERO
                } else {
                    last.creation_time
                },
            };
            *budget += prev_cursor_size;
            *budget -= resp.next.packed_size() as i64;
            prev_cursor_size = resp.next.packed_size() as i64;
        }
        return true;
    }
    false
}

fn full_read_dir_same_name(
    state: &StoreState,
    req: &FullReadDirReq,
    hash_mode: lodefs_proto::hash::HashMode,
    forwards: bool,
    resp: &mut FullReadDirResp,
) -> Result<(), LodeError> {
    let current = req.flags & FULL_READ_DIR_CURRENT != 0;
    let hash = name_hash(hash_mode, &req.start_name);
    let mut budget =
        pick_mtu(req.mtu) - FRAME_HEADER_SIZE as i64 - full_read_dir_resp_static_size();

    // returns true when iteration must stop
    let mut lookup_current = |resp: &mut FullReadDirResp, budget: &mut i64| -> bool {
        let key = current_edge_key(req.dir_id, hash, &req.start_name);
        match state.get(ColumnFamily::Edges, &key) {
            None => false,
            Some(value) => full_read_dir_add(req, resp, budget, &parse_edge_key(&key), &value),
        }
    };

    // begin with the current edge when asked to
    if current && lookup_current(resp, &mut budget) {
        return Ok(());
    }
    // started at the current edge and moving forward: nowhere to go
    if current && forwards {
        return Ok(());
    }

    // walk the snapshot edges of this name
    let start_time = if !req.start_time.is_zero() {
        req.start_time
    } else if forwards {
        LodeTime::ZERO
    } else {
        LodeTime(u64::MAX)
    };
    let start = snapshot_edge_key(req.dir_id, hash, &req.start_name, start_time);
    let mut stopped = false;
    let visit = |key: &[u8], value: &[u8]| -> bool {
        let key = parse_edge_key(key);
        assert!(key.dir_id == req.dir_id);
        // the bounds only pin the hash; equal hashes may hide other names
        if key.name != *req.start_name {
            return false;
        }
        if full_read_dir_add(req, resp, &mut budget, &key, value) {
            stopped = true;
            return false;
        }
        true
    };
    if forwards {
        let end = edge_scan_start(req.dir_id, false, hash + 1);
        state.scan_forward(ColumnFamily::Edges, &start, Some(&end), visit);
    } else {
        let end = edge_scan_start(req.dir_id, false, hash);
        state.scan_backward(ColumnFamily::Edges, &start, Some(&end), visit);
    }
    if stopped {
        return Ok(());
    }

    // looked at the snapshots moving backwards: nowhere further to go
    if !forwards {
        return Ok(());
    }

    // forward iteration ends at the current edge
    lookup_current(resp, &mut budget);
    Ok(())
}

fn full_read_dir_normal(
    state: &StoreState,
    req: &FullReadDirReq,
    hash_mode: lodefs_proto::hash::HashMode,
    forwards: bool,
    resp: &mut FullReadDirResp,
) -> Result<(), LodeError> {
    let current = req.flags & FULL_READ_DIR_CURRENT != 0;
    let mut budget =
        pick_mtu(req.mtu) - FRAME_HEADER_SIZE as i64 - full_read_dir_resp_static_size();

    // start position inside the section named by the CURRENT flag; forward
    // iteration continues from the current section into the snapshot one
    let start = if req.start_name.is_empty() {
        if forwards {
            edge_scan_start(req.dir_id, current, 0)
        } else {
            // the largest conceivable key of the section
            let max_name = [0xFFu8; 255];
            if current {
                current_edge_key(req.dir_id, u64::MAX, &max_name)
            } else {
                snapshot_edge_key(req.dir_id, u64::MAX, &max_name, LodeTime(u64::MAX))
            }
        }
    } else {
        let hash = name_hash(hash_mode, &req.start_name);
        if current {
            current_edge_key(req.dir_id, hash, &req.start_name)
        } else {
            snapshot_edge_key(req.dir_id, hash, &req.start_name, req.start_time)
        }
    };

    let visit = |key: &[u8], value: &[u8]| -> bool {
        let key = parse_edge_key(key);
        assert!(key.dir_id == req.dir_id);
        !full_read_dir_add(req, resp, &mut budget, &key, value)
    };
    if forwards {
        // up to the end of the whole edge space of this directory
        let end = edge_scan_end(req.dir_id, false);
        state.scan_forward(ColumnFamily::Edges, &start, Some(&end), visit);
    } else {
        // down to the start of the whole edge space of this directory
        let end = edge_scan_start(req.dir_id, true, 0);
        state.scan_backward(ColumnFamily::Edges, &start, Some(&end), visit);
    }
    Ok(())
}

fn full_read_dir_resp_static_size() -> i64 {
    (FullReadDirCursor::finished().packed_size() + 2) as i64
}

pub(crate) fn full_read_dir(
    state: &StoreState,
    req: &FullReadDirReq,
) -> Result<FullReadDirResp, LodeError> {
    let same_name = req.flags & FULL_READ_DIR_SAME_NAME != 0;
    let current = req.flags & FULL_READ_DIR_CURRENT != 0;
    let forwards = req.flags & FULL_READ_DIR_BACKWARDS == 0;

    if same_name && req.start_name.is_empty() {
        return Err(LodeError::BadEncoding);
    }
    if current && !req.start_time.is_zero() {
        return Err(LodeError::BadEncoding);
    }

    // snapshot directories can be walked through the full path
    let dir = get_directory(state, req.dir_id, true)?;

    let mut resp = FullReadDirResp {
        next: FullReadDirCursor::finished(),
        results: Vec::new(),
    };
    if same_name {
        full_read_dir_same_name(state, req, dir.hash_mode, forwards, &mut resp)?;
    } else {
        full_read_dir_normal(state, req, dir.hash_mode, forwards, &mut resp)?;
    }
    Ok(resp)
}

/// Walks the span records of a file from the span containing `byte_offset`,
/// applying the limit. The callback returns false to stop early.
fn scan_file_spans(
    state: &StoreState,
    file_id: InodeId,
    byte_offset: u64,
    limit: u32,
    mut f: impl FnMut(u64, &SpanBody) -> bool,
) {
    let begin = span_key(file_id, byte_offset);
    let Some((first_key, _)) = state.seek_for_prev(ColumnFamily::Spans, &begin) else {
        return;
    };
    if parse_span_key(&first_key).0 != file_id {
        return;
    }
    let end = span_key(InodeId::from_u64(file_id.as_u64() + 1), 0);
    let mut count = 0u32;
    state.scan_forward(ColumnFamily::Spans, &first_key, Some(&end), |key, value| {
        if limit > 0 && count >= limit {
            return false;
        }
        let (file, offset) = parse_span_key(key);
        if file != file_id {
            return false;
        }
        let span: SpanBody = schema::decode(value).expect("corrupt span body");
        if offset + (span.size as u64) < byte_offset {
            // only possible when the first cursor is before the window
            debug!(offset, size = span.size, byte_offset, "span before requested window");
            return false;
        }
        count += 1;
        f(offset, &span)
    });
}

/// Checks the fallbacks when a spans request found nothing: the file might
/// legitimately have no spans, or not exist at all.
fn check_spanless_file(state: &StoreState, file_id: InodeId) -> Result<(), LodeError> {
    match get_file(state, file_id) {
        Ok(_) => Ok(()),
        Err(LodeError::FileNotFound) => {
            match get_transient_file(state, LodeTime::ZERO, true, file_id) {
                Ok(_) => Ok(()),
                Err(_) => Err(LodeError::FileNotFound),
            }
        }
        Err(err) => Err(err),
    }
}

struct BlockServiceTable {
    entries: Vec<BlockServiceEntry>,
}

impl BlockServiceTable {
    /// Index of the service in the response table, adding it (and charging
    /// the budget) on first use. `None` when the budget is exhausted.
    fn index_of(
        &mut self,
        cache: &crate::bs_cache::BlockServicesSnapshot,
        id: lodefs_proto::ids::BlockServiceId,
        budget: &mut i64,
    ) -> Option<u8> {
        if let Some(ix) = self.entries.iter().position(|e| e.id == id) {
            return Some(ix as u8);
        }
        let info = cache.expect(id);
        let entry = BlockServiceEntry {
            id,
            addrs: info.addrs.clone(),
            flags: info.flags,
        };
        *budget -= entry.packed_size() as i64;
        if *budget < 0 {
            return None;
        }
        assert!(self.entries.len() < 256);
        self.entries.push(entry);
        Some((self.entries.len() - 1) as u8)
    }
}

fn fetched_blocks_span(
    location: &schema::LocationBlocksBody,
    table: &mut BlockServiceTable,
    cache: &crate::bs_cache::BlockServicesSnapshot,
    budget: &mut i64,
) -> FetchedBlocksSpan {
    let mut blocks = Vec::with_capacity(location.blocks.len());
    for block in &location.blocks {
        let Some(ix) = table.index_of(cache, block.block_service_id, budget) else {
            // the outer budget check will discard this span anyway
            break;
        };
        blocks.push(FetchedBlock {
            block_service_ix: ix,
            block_id: block.block_id,
            crc: block.crc,
        });
    }
    FetchedBlocksSpan {
        location_id: location.location_id,
        storage_class: location.storage_class,
        parity: location.parity,
        stripes: location.stripes,
        cell_size: location.cell_size,
        blocks,
        stripes_crc: location.stripe_crcs.clone(),
    }
}

pub(crate) fn local_file_spans(
    db: &ShardDb,
    state: &StoreState,
    req: &LocalFileSpansReq,
) -> Result<LocalFileSpansResp, LodeError> {
    if !req.file_id.is_file_or_symlink() {
        return Err(LodeError::BlockIoErrorFile);
    }
    let cache = db.bs_cache.get();
    let mut resp = LocalFileSpansResp {
        next_offset: 0,
        block_services: Vec::new(),
        spans: Vec::new(),
    };
    let mut table = BlockServiceTable { entries: Vec::new() };
    let mut budget = pick_mtu(req.mtu) - FRAME_HEADER_SIZE as i64 - 12;

    scan_file_spans(state, req.file_id, req.byte_offset, req.limit, |offset, span| {
        let body = match &span.storage {
            SpanStorage::Inline(bytes) => FetchedSpanBody::Inline(bytes.clone()),
            SpanStorage::Blocked(locations) => {
                // serve the local location if the span has it, else the first
                let location = span
                    .find_location(db.opts.location_id)
                    .unwrap_or(&locations[0]);
                FetchedSpanBody::Blocks(vec![fetched_blocks_span(
                    location, &mut table, &cache, &mut budget,
                )])
            }
        };
        resp.spans.push(FetchedSpan {
            header: SpanHeader {
                byte_offset: offset,
                size: span.size,
                crc: span.crc,
            },
            body,
        });
        budget -= resp.spans.last().unwrap().packed_size() as i64;
        if budget < 0 {
            resp.next_offset = offset;
            resp.spans.pop();
            return false;
        }
        true
    });
    resp.block_services = table.entries;

    if resp.spans.is_empty() {
        check_spanless_file(state, req.file_id)?;
    }
    Ok(resp)
}

pub(crate) fn file_spans(
    db: &ShardDb,
    state: &StoreState,
    req: &FileSpansReq,
) -> Result<FileSpansResp, LodeError> {
    if req.file_id.inode_type() != Some(InodeType::File) {
        return Err(LodeError::TypeIsDirectory);
    }
    let cache = db.bs_cache.get();
    let mut resp = FileSpansResp {
        next_offset: 0,
        block_services: Vec::new(),
        spans: Vec::new(),
    };
    let mut table = BlockServiceTable { entries: Vec::new() };
    let mut budget = pick_mtu(req.mtu) - FRAME_HEADER_SIZE as i64 - 12;

    scan_file_spans(state, req.file_id, req.byte_offset, req.limit, |offset, span| {
        let body = match &span.storage {
            SpanStorage::Inline(bytes) => FetchedSpanBody::Inline(bytes.clone()),
            SpanStorage::Blocked(locations) => FetchedSpanBody::Blocks(
                locations
                    .iter()
                    .map(|l| fetched_blocks_span(l, &mut table, &cache, &mut budget))
                    .collect(),
            ),
        };
        resp.spans.push(FetchedSpan {
            header: SpanHeader {
                byte_offset: offset,
                size: span.size,
                crc: span.crc,
            },
            body,
        });
        budget -= resp.spans.last().unwrap().packed_size() as i64;
        if budget < 0 {
            resp.next_offset = offset;
            resp.spans.pop();
            return false;
        }
        true
    });
    resp.block_services = table.entries;

    if resp.spans.is_empty() {
        check_spanless_file(state, req.file_id)?;
    }
    Ok(resp)
}

fn visit_inodes(
    state: &StoreState,
    cf: ColumnFamily,
    begin_id: InodeId,
    mtu: u16,
) -> (InodeId, Vec<InodeId>) {
    let budget = pick_mtu(mtu) - FRAME_HEADER_SIZE as i64 - 10;
    let max_ids = (budget / 8 + 1) as usize; // one extra to learn the next id
    let mut ids = Vec::new();
    state.scan_forward(cf, &inode_id_key(begin_id), None, |key, _| {
        if ids.len() >= max_ids {
            return false;
        }
        ids.push(parse_inode_id_key(key));
        true
    });
    let mut next_id = NULL_INODE_ID;
    if ids.len() == max_ids {
        next_id = ids.pop().unwrap();
    }
    (next_id, ids)
}

pub(crate) fn visit_directories(
    state: &StoreState,
    req: &VisitDirectoriesReq,
) -> Result<VisitDirectoriesResp, LodeError> {
    let (next_id, ids) = visit_inodes(state, ColumnFamily::Directories, req.begin_id, req.mtu);
    Ok(VisitDirectoriesResp { next_id, ids })
}

pub(crate) fn visit_files(state: &StoreState, req: &VisitFilesReq) -> Result<VisitFilesResp, LodeError> {
    let (next_id, ids) = visit_inodes(state, ColumnFamily::Files, req.begin_id, req.mtu);
    Ok(VisitFilesResp { next_id, ids })
}

pub(crate) fn visit_transient_files(
    db: &ShardDb,
    state: &StoreState,
    req: &VisitTransientFilesReq,
) -> Result<VisitTransientFilesResp, LodeError> {
    let mut resp = VisitTransientFilesResp {
        next_id: NULL_INODE_ID,
        files: Vec::new(),
    };
    let mut budget = pick_mtu(req.mtu) - FRAME_HEADER_SIZE as i64 - 10;
    state.scan_forward(
        ColumnFamily::Transient,
        &inode_id_key(req.begin_id),
        None,
        |key, value| {
            let id = parse_inode_id_key(key);
            let file: TransientFileBody =
                schema::decode(value).expect("corrupt transient file body");
            resp.files.push(TransientFileEntry {
                id,
                cookie: db.cookie(id),
                deadline_time: file.deadline,
            });
            budget -= resp.files.last().unwrap().packed_size() as i64;
            if budget <= 0 {
                resp.next_id = resp.files.pop().unwrap().id;
                return false;
            }
            true
        },
    );
    Ok(resp)
}

pub(crate) fn block_service_files(
    state: &StoreState,
    req: &BlockServiceFilesReq,
) -> Result<BlockServiceFilesResp, LodeError> {
    let mut resp = BlockServiceFilesResp {
        file_ids: Vec::new(),
    };
    let begin = block_service_to_file_key(req.block_service_id, req.start_from);
    let end = block_service_to_file_key(
        lodefs_proto::ids::BlockServiceId(req.block_service_id.0 + 1),
        NULL_INODE_ID,
    );
    state.scan_forward(
        ColumnFamily::BlockServicesToFiles,
        &begin,
        Some(&end),
        |key, value| {
            let (_, file_id) = parse_block_service_to_file_key(key);
            let blocks = schema::decode_i64_value(value);
            assert!(blocks >= 0, "negative block count for file {}", file_id);
            if blocks == 0 {
                // left behind by migration or span removal, swept separately
                return true;
            }
            resp.file_ids.push(file_id);
            false
        },
    );
    Ok(resp)
}
