//! End-to-end scenarios for the directory and file metadata operations:
//! construct/link, renames and their snapshot edges, the directory mtime
//! guard, owner clearing, and replay idempotence.

mod common;

use common::*;

use lodefs_proto::ids::{InodeId, InodeType, LodeTime, ShardId, NULL_INODE_ID, ROOT_DIR_INODE_ID};
use lodefs_proto::msgs::*;
use lodefs_proto::{LodeError, ShortBytes};
use lodefs_shard::ShardDb;

fn lookup(db: &ShardDb, dir_id: InodeId, name: &[u8]) -> Result<LookupResp, LodeError> {
    let (resp, _) = db.read(&ShardRequest::Lookup(LookupReq {
        dir_id,
        name: ShortBytes::from_static(name),
    }));
    match resp {
        ShardResponse::Lookup(r) => Ok(r),
        ShardResponse::Error(err) => Err(err),
        other => panic!("unexpected response {:?}", other),
    }
}

fn full_read_dir(db: &ShardDb, dir_id: InodeId, flags: u8, start_name: &[u8]) -> FullReadDirResp {
    let (resp, _) = db.read(&ShardRequest::FullReadDir(FullReadDirReq {
        dir_id,
        flags,
        start_name: ShortBytes::from_static(start_name),
        start_time: LodeTime::ZERO,
        limit: 0,
        mtu: 0,
    }));
    match resp {
        ShardResponse::FullReadDir(r) => r,
        other => panic!("full read dir failed: {:?}", other),
    }
}

#[test]
fn test_construct_and_link() {
    let db = bare_shard();

    let (id, cookie) = construct_file(&db, b"x");
    assert_eq!(id.shard(), ShardId(0));
    assert_eq!(id.inode_type(), Some(InodeType::File));

    // the transient file is visible before linking
    let (resp, _) = db.read(&ShardRequest::StatTransientFile(StatTransientFileReq { id }));
    match resp {
        ShardResponse::StatTransientFile(r) => {
            assert_eq!(r.size, 0);
            assert_eq!(r.note, ShortBytes::from_static(b"x"));
        }
        other => panic!("stat transient failed: {:?}", other),
    }

    let creation_time = link_file(&db, id, cookie, ROOT_DIR_INODE_ID, b"a");
    assert!(!creation_time.is_zero());

    // linked: lookup resolves, the transient record is gone
    let found = lookup(&db, ROOT_DIR_INODE_ID, b"a").unwrap();
    assert_eq!(found.target_id, id);
    assert_eq!(found.creation_time, creation_time);
    let (resp, _) = db.read(&ShardRequest::StatTransientFile(StatTransientFileReq { id }));
    assert!(matches!(resp, ShardResponse::Error(LodeError::FileNotFound)));

    // and the committed stat works
    let (resp, _) = db.read(&ShardRequest::StatFile(StatFileReq { id }));
    match resp {
        ShardResponse::StatFile(r) => assert_eq!(r.size, 0),
        other => panic!("stat file failed: {:?}", other),
    }
}

#[test]
fn test_construct_rejects_directory_type() {
    let db = bare_shard();
    let err = expect_error(write(
        &db,
        ShardRequest::ConstructFile(ConstructFileReq {
            file_type: InodeType::Directory as u8,
            note: ShortBytes::default(),
        }),
    ));
    assert_eq!(err, LodeError::TypeIsDirectory);
}

#[test]
fn test_link_file_bad_cookie() {
    let db = bare_shard();
    let (id, cookie) = construct_file(&db, b"");
    let mut bad = cookie;
    bad[0] ^= 1;
    let err = expect_error(write(
        &db,
        ShardRequest::LinkFile(LinkFileReq {
            file_id: id,
            cookie: bad,
            owner_id: ROOT_DIR_INODE_ID,
            name: ShortBytes::from_static(b"a"),
        }),
    ));
    assert_eq!(err, LodeError::BadCookie);
}

#[test]
fn test_link_file_replay_returns_original_creation_time() {
    let db = bare_shard();
    let (id, cookie) = construct_file(&db, b"");
    let req = ShardRequest::LinkFile(LinkFileReq {
        file_id: id,
        cookie,
        owner_id: ROOT_DIR_INODE_ID,
        name: ShortBytes::from_static(b"a"),
    });
    let entry = db.prepare_log_entry(&req).unwrap();
    let first = db.apply_log_entry(db.last_applied_log_entry() + 1, &entry);
    db.flush();
    let creation_time = match first {
        ShardResponse::LinkFile(r) => r.creation_time,
        other => panic!("link failed: {:?}", other),
    };

    // the transient record is gone, but replaying the link succeeds with
    // the original creation time
    let replay = db.apply_log_entry(db.last_applied_log_entry() + 1, &entry);
    match replay {
        ShardResponse::LinkFile(r) => assert_eq!(r.creation_time, creation_time),
        other => panic!("replayed link failed: {:?}", other),
    }
}

#[test]
fn test_rename_overwrites_file_and_leaves_snapshot_edges() {
    let db = bare_shard();

    // file one linked as "a", file two linked as "b"
    let (file1, cookie1) = construct_file(&db, b"");
    let t_a = link_file(&db, file1, cookie1, ROOT_DIR_INODE_ID, b"a");
    let (file2, cookie2) = construct_file(&db, b"");
    let t_b = link_file(&db, file2, cookie2, ROOT_DIR_INODE_ID, b"b");

    // rename "b" over "a"
    let resp = write(
        &db,
        ShardRequest::SameDirectoryRename(SameDirectoryRenameReq {
            target_id: file2,
            dir_id: ROOT_DIR_INODE_ID,
            old_name: ShortBytes::from_static(b"b"),
            old_creation_time: t_b,
            new_name: ShortBytes::from_static(b"a"),
        }),
    );
    let t_rename = match resp {
        ShardResponse::SameDirectoryRename(r) => r.new_creation_time,
        other => panic!("rename failed: {:?}", other),
    };

    // "a" now points at file two
    let found = lookup(&db, ROOT_DIR_INODE_ID, b"a").unwrap();
    assert_eq!(found.target_id, file2);
    assert_eq!(found.creation_time, t_rename);
    // "b" is gone
    assert_eq!(lookup(&db, ROOT_DIR_INODE_ID, b"b"), Err(LodeError::NameNotFound));

    // the old "a" binding survives as an owned snapshot edge
    let snapshots = full_read_dir(&db, ROOT_DIR_INODE_ID, FULL_READ_DIR_SAME_NAME, b"a");
    let old_a = snapshots
        .results
        .iter()
        .find(|e| !e.current && e.creation_time == t_a)
        .expect("old 'a' snapshot edge missing");
    assert_eq!(old_a.target_id.id(), file1);
    assert!(old_a.target_id.extra(), "overridden edge must be owned");

    // "b" carries its binding snapshot plus a deletion marker
    let snapshots = full_read_dir(&db, ROOT_DIR_INODE_ID, FULL_READ_DIR_SAME_NAME, b"b");
    let old_b = snapshots
        .results
        .iter()
        .find(|e| e.creation_time == t_b)
        .expect("old 'b' snapshot edge missing");
    assert_eq!(old_b.target_id.id(), file2);
    assert!(!old_b.target_id.extra(), "renamed-away edge is not owned");
    let deletion = snapshots
        .results
        .iter()
        .find(|e| e.creation_time == t_rename)
        .expect("deletion edge missing");
    assert_eq!(deletion.target_id.id(), NULL_INODE_ID);
    assert!(!deletion.target_id.extra());
}

#[test]
fn test_rename_same_name_rejected() {
    let db = bare_shard();
    let (file1, cookie1) = construct_file(&db, b"");
    let t = link_file(&db, file1, cookie1, ROOT_DIR_INODE_ID, b"a");
    let err = expect_error(write(
        &db,
        ShardRequest::SameDirectoryRename(SameDirectoryRenameReq {
            target_id: file1,
            dir_id: ROOT_DIR_INODE_ID,
            old_name: ShortBytes::from_static(b"a"),
            old_creation_time: t,
            new_name: ShortBytes::from_static(b"a"),
        }),
    ));
    assert_eq!(err, LodeError::SameSourceAndDestination);
}

#[test]
fn test_mtime_guard() {
    let db = bare_shard();

    let req = ShardRequest::SetDirectoryInfo(SetDirectoryInfoReq {
        id: ROOT_DIR_INODE_ID,
        info: default_directory_info(),
    });

    // two entries carrying the same time: the second one fails
    let mut entry = db.prepare_log_entry(&req).unwrap();
    entry.time = LodeTime(5_000);
    let resp = db.apply_log_entry(db.last_applied_log_entry() + 1, &entry);
    assert!(matches!(resp, ShardResponse::SetDirectoryInfo(_)));
    let resp = db.apply_log_entry(db.last_applied_log_entry() + 1, &entry);
    assert_eq!(expect_error(resp), LodeError::MtimeIsTooRecent);

    // one nanosecond later works
    entry.time = LodeTime(5_001);
    let resp = db.apply_log_entry(db.last_applied_log_entry() + 1, &entry);
    assert!(matches!(resp, ShardResponse::SetDirectoryInfo(_)));
}

#[test]
fn test_failed_apply_still_advances_cursor() {
    let db = bare_shard();
    let before = db.last_applied_log_entry();

    // unlinking a name that never existed fails...
    let err = expect_error(write(
        &db,
        ShardRequest::SoftUnlinkFile(SoftUnlinkFileReq {
            owner_id: ROOT_DIR_INODE_ID,
            file_id: InodeId::new(InodeType::File, ShardId(0), 1),
            name: ShortBytes::from_static(b"ghost"),
            creation_time: LodeTime(1),
        }),
    ));
    assert_eq!(err, LodeError::EdgeNotFound);

    // ...but the log cursor still advances, and the directory is untouched:
    // the savepoint rolled the mtime bump back
    assert_eq!(db.last_applied_log_entry(), before + 1);
    let (resp, last_applied) = db.read(&ShardRequest::StatDirectory(StatDirectoryReq {
        id: ROOT_DIR_INODE_ID,
    }));
    assert_eq!(last_applied, before + 1);
    match resp {
        ShardResponse::StatDirectory(r) => assert!(r.mtime.is_zero()),
        other => panic!("stat directory failed: {:?}", other),
    }
}

#[test]
fn test_soft_unlink_keeps_file_reachable_through_owned_edge() {
    let db = bare_shard();
    let (file1, cookie1) = construct_file(&db, b"");
    let t = link_file(&db, file1, cookie1, ROOT_DIR_INODE_ID, b"doc");

    let resp = write(
        &db,
        ShardRequest::SoftUnlinkFile(SoftUnlinkFileReq {
            owner_id: ROOT_DIR_INODE_ID,
            file_id: file1,
            name: ShortBytes::from_static(b"doc"),
            creation_time: t,
        }),
    );
    let delete_time = match resp {
        ShardResponse::SoftUnlinkFile(r) => r.delete_creation_time,
        other => panic!("soft unlink failed: {:?}", other),
    };
    assert!(delete_time > t);

    // no current edge anymore, but the file itself is still committed
    assert_eq!(lookup(&db, ROOT_DIR_INODE_ID, b"doc"), Err(LodeError::NameNotFound));
    let (resp, _) = db.read(&ShardRequest::StatFile(StatFileReq { id: file1 }));
    assert!(matches!(resp, ShardResponse::StatFile(_)));

    // the owned snapshot edge records the old binding
    let snapshots = full_read_dir(&db, ROOT_DIR_INODE_ID, FULL_READ_DIR_SAME_NAME, b"doc");
    let owned = snapshots
        .results
        .iter()
        .find(|e| e.creation_time == t)
        .expect("owned snapshot edge missing");
    assert!(owned.target_id.extra());
}

fn make_directory(db: &ShardDb, counter: u64, owner: InodeId) -> InodeId {
    let id = InodeId::new(InodeType::Directory, ShardId(0), counter);
    let resp = write(
        db,
        ShardRequest::CreateDirectoryInode(CreateDirectoryInodeReq {
            id,
            owner_id: owner,
            info: default_directory_info(),
        }),
    );
    assert!(
        matches!(resp, ShardResponse::CreateDirectoryInode(_)),
        "create directory failed: {:?}",
        resp
    );
    id
}

#[test]
fn test_owner_clearing_blocked_by_current_edges() {
    let db = bare_shard();
    let dir = make_directory(&db, 1, ROOT_DIR_INODE_ID);

    let (file1, cookie1) = construct_file(&db, b"");
    let t = link_file(&db, file1, cookie1, dir, b"c");

    // a current edge blocks owner removal
    let err = expect_error(write(
        &db,
        ShardRequest::RemoveDirectoryOwner(RemoveDirectoryOwnerReq {
            dir_id: dir,
            info: default_directory_info(),
        }),
    ));
    assert_eq!(err, LodeError::DirectoryNotEmpty);

    // after a soft unlink only snapshot and deletion edges remain
    let resp = write(
        &db,
        ShardRequest::SoftUnlinkFile(SoftUnlinkFileReq {
            owner_id: dir,
            file_id: file1,
            name: ShortBytes::from_static(b"c"),
            creation_time: t,
        }),
    );
    assert!(matches!(resp, ShardResponse::SoftUnlinkFile(_)));

    let resp = write(
        &db,
        ShardRequest::RemoveDirectoryOwner(RemoveDirectoryOwnerReq {
            dir_id: dir,
            info: default_directory_info(),
        }),
    );
    assert!(matches!(resp, ShardResponse::RemoveDirectoryOwner(_)));

    // the directory is now a snapshot directory
    let (resp, _) = db.read(&ShardRequest::StatDirectory(StatDirectoryReq { id: dir }));
    match resp {
        ShardResponse::StatDirectory(r) => assert_eq!(r.owner, NULL_INODE_ID),
        other => panic!("stat directory failed: {:?}", other),
    }
    // and the plain listing refuses it
    let (resp, _) = db.read(&ShardRequest::ReadDir(ReadDirReq {
        dir_id: dir,
        start_hash: 0,
        mtu: 0,
    }));
    assert!(matches!(
        resp,
        ShardResponse::Error(LodeError::DirectoryNotFound)
    ));
}

#[test]
fn test_remove_directory_owner_is_idempotent() {
    let db = bare_shard();
    let dir = make_directory(&db, 2, ROOT_DIR_INODE_ID);
    for _ in 0..2 {
        let resp = write(
            &db,
            ShardRequest::RemoveDirectoryOwner(RemoveDirectoryOwnerReq {
                dir_id: dir,
                info: default_directory_info(),
            }),
        );
        assert!(matches!(resp, ShardResponse::RemoveDirectoryOwner(_)));
    }
}

#[test]
fn test_create_directory_inode_replay_and_owner_mismatch() {
    let db = bare_shard();
    let dir = make_directory(&db, 3, ROOT_DIR_INODE_ID);

    // same id, same owner: fine
    let resp = write(
        &db,
        ShardRequest::CreateDirectoryInode(CreateDirectoryInodeReq {
            id: dir,
            owner_id: ROOT_DIR_INODE_ID,
            info: DirectoryInfo::empty(),
        }),
    );
    assert!(matches!(resp, ShardResponse::CreateDirectoryInode(_)));

    // same id, different owner: conflict
    let other_owner = InodeId::new(InodeType::Directory, ShardId(0), 99);
    let err = expect_error(write(
        &db,
        ShardRequest::CreateDirectoryInode(CreateDirectoryInodeReq {
            id: dir,
            owner_id: other_owner,
            info: DirectoryInfo::empty(),
        }),
    ));
    assert_eq!(err, LodeError::MismatchingOwner);
}

#[test]
fn test_remove_inode_directory_lifecycle() {
    let db = bare_shard();
    let dir = make_directory(&db, 4, ROOT_DIR_INODE_ID);

    // still owned: not removable
    let err = expect_error(write(&db, ShardRequest::RemoveInode(RemoveInodeReq { id: dir })));
    assert_eq!(err, LodeError::DirectoryHasOwner);

    let resp = write(
        &db,
        ShardRequest::RemoveDirectoryOwner(RemoveDirectoryOwnerReq {
            dir_id: dir,
            info: DirectoryInfo::empty(),
        }),
    );
    assert!(matches!(resp, ShardResponse::RemoveDirectoryOwner(_)));

    let resp = write(&db, ShardRequest::RemoveInode(RemoveInodeReq { id: dir }));
    assert!(matches!(resp, ShardResponse::RemoveInode(_)));

    // gone, and removing again is still fine
    let (resp, _) = db.read(&ShardRequest::StatDirectory(StatDirectoryReq { id: dir }));
    assert!(matches!(
        resp,
        ShardResponse::Error(LodeError::DirectoryNotFound)
    ));
    let resp = write(&db, ShardRequest::RemoveInode(RemoveInodeReq { id: dir }));
    assert!(matches!(resp, ShardResponse::RemoveInode(_)));
}

#[test]
fn test_remove_root_directory_rejected() {
    let db = bare_shard();
    let err = expect_error(write(
        &db,
        ShardRequest::RemoveInode(RemoveInodeReq {
            id: ROOT_DIR_INODE_ID,
        }),
    ));
    assert_eq!(err, LodeError::CannotRemoveRootDirectory);
}

#[test]
fn test_locked_edge_protocol() {
    let db = bare_shard();
    let dir = make_directory(&db, 5, ROOT_DIR_INODE_ID);
    let target = InodeId::new(InodeType::File, ShardId(0), 77);

    // create a locked edge (as the cross-directory coordinator would)
    let resp = write(
        &db,
        ShardRequest::CreateLockedCurrentEdge(CreateLockedCurrentEdgeReq {
            dir_id: dir,
            name: ShortBytes::from_static(b"moving"),
            target_id: target,
            old_creation_time: LodeTime::ZERO,
        }),
    );
    let t = match resp {
        ShardResponse::CreateLockedCurrentEdge(r) => r.creation_time,
        other => panic!("create locked edge failed: {:?}", other),
    };

    // a locked name cannot be unlinked
    let err = expect_error(write(
        &db,
        ShardRequest::SoftUnlinkFile(SoftUnlinkFileReq {
            owner_id: dir,
            file_id: target,
            name: ShortBytes::from_static(b"moving"),
            creation_time: t,
        }),
    ));
    assert_eq!(err, LodeError::EdgeIsLocked);

    // replaying the locked creation with the same target and time succeeds
    // and keeps the creation time
    let resp = write(
        &db,
        ShardRequest::CreateLockedCurrentEdge(CreateLockedCurrentEdgeReq {
            dir_id: dir,
            name: ShortBytes::from_static(b"moving"),
            target_id: target,
            old_creation_time: t,
        }),
    );
    match resp {
        ShardResponse::CreateLockedCurrentEdge(r) => assert_eq!(r.creation_time, t),
        other => panic!("locked edge replay failed: {:?}", other),
    }

    // unlock with was_moved retires the edge entirely
    let resp = write(
        &db,
        ShardRequest::UnlockCurrentEdge(UnlockCurrentEdgeReq {
            dir_id: dir,
            name: ShortBytes::from_static(b"moving"),
            target_id: target,
            creation_time: t,
            was_moved: true,
        }),
    );
    assert!(matches!(resp, ShardResponse::UnlockCurrentEdge(_)));
    assert_eq!(lookup(&db, dir, b"moving"), Err(LodeError::NameNotFound));
}

#[test]
fn test_remove_non_owned_edge_gc() {
    let db = bare_shard();
    let (file1, cookie1) = construct_file(&db, b"");
    let t = link_file(&db, file1, cookie1, ROOT_DIR_INODE_ID, b"tmp");
    let resp = write(
        &db,
        ShardRequest::SoftUnlinkFile(SoftUnlinkFileReq {
            owner_id: ROOT_DIR_INODE_ID,
            file_id: file1,
            name: ShortBytes::from_static(b"tmp"),
            creation_time: t,
        }),
    );
    let delete_time = match resp {
        ShardResponse::SoftUnlinkFile(r) => r.delete_creation_time,
        other => panic!("soft unlink failed: {:?}", other),
    };

    // the deletion marker is non-owned and can be swept
    let resp = write(
        &db,
        ShardRequest::RemoveNonOwnedEdge(RemoveNonOwnedEdgeReq {
            dir_id: ROOT_DIR_INODE_ID,
            name: ShortBytes::from_static(b"tmp"),
            creation_time: delete_time,
        }),
    );
    assert!(matches!(resp, ShardResponse::RemoveNonOwnedEdge(_)));
    // sweeping it again is a no-op
    let resp = write(
        &db,
        ShardRequest::RemoveNonOwnedEdge(RemoveNonOwnedEdgeReq {
            dir_id: ROOT_DIR_INODE_ID,
            name: ShortBytes::from_static(b"tmp"),
            creation_time: delete_time,
        }),
    );
    assert!(matches!(resp, ShardResponse::RemoveNonOwnedEdge(_)));

    // the owned binding edge is protected from the non-owned sweep
    let err = expect_error(write(
        &db,
        ShardRequest::RemoveNonOwnedEdge(RemoveNonOwnedEdgeReq {
            dir_id: ROOT_DIR_INODE_ID,
            name: ShortBytes::from_static(b"tmp"),
            creation_time: t,
        }),
    ));
    assert_eq!(err, LodeError::EdgeNotFound);
}

#[test]
fn test_hard_unlink_makes_file_transient() {
    let db = bare_shard();
    let (file1, cookie1) = construct_file(&db, b"");
    let t = link_file(&db, file1, cookie1, ROOT_DIR_INODE_ID, b"victim");
    let resp = write(
        &db,
        ShardRequest::SoftUnlinkFile(SoftUnlinkFileReq {
            owner_id: ROOT_DIR_INODE_ID,
            file_id: file1,
            name: ShortBytes::from_static(b"victim"),
            creation_time: t,
        }),
    );
    assert!(matches!(resp, ShardResponse::SoftUnlinkFile(_)));

    let resp = write(
        &db,
        ShardRequest::SameShardHardFileUnlink(SameShardHardFileUnlinkReq {
            owner_id: ROOT_DIR_INODE_ID,
            target_id: file1,
            name: ShortBytes::from_static(b"victim"),
            creation_time: t,
        }),
    );
    assert!(matches!(resp, ShardResponse::SameShardHardFileUnlink(_)));

    // the file is transient again, with the old name as its note
    let (resp, _) = db.read(&ShardRequest::StatFile(StatFileReq { id: file1 }));
    assert!(matches!(resp, ShardResponse::Error(LodeError::FileNotFound)));
    let (resp, _) = db.read(&ShardRequest::StatTransientFile(StatTransientFileReq {
        id: file1,
    }));
    match resp {
        ShardResponse::StatTransientFile(r) => {
            assert_eq!(r.note, ShortBytes::from_static(b"victim"))
        }
        other => panic!("stat transient failed: {:?}", other),
    }

    // replaying the hard unlink is a no-op success
    let resp = write(
        &db,
        ShardRequest::SameShardHardFileUnlink(SameShardHardFileUnlinkReq {
            owner_id: ROOT_DIR_INODE_ID,
            target_id: file1,
            name: ShortBytes::from_static(b"victim"),
            creation_time: t,
        }),
    );
    assert!(matches!(resp, ShardResponse::SameShardHardFileUnlink(_)));
}

#[test]
fn test_set_time_high_bit_flags() {
    let db = bare_shard();
    let (file1, cookie1) = construct_file(&db, b"");
    link_file(&db, file1, cookie1, ROOT_DIR_INODE_ID, b"timed");

    // without the high bit nothing changes
    let (before, _) = db.read(&ShardRequest::StatFile(StatFileReq { id: file1 }));
    let before = match before {
        ShardResponse::StatFile(r) => r,
        other => panic!("stat failed: {:?}", other),
    };
    let resp = write(
        &db,
        ShardRequest::SetTime(SetTimeReq {
            id: file1,
            atime: 1234,
            mtime: 0,
        }),
    );
    assert!(matches!(resp, ShardResponse::SetTime(_)));
    let (after, _) = db.read(&ShardRequest::StatFile(StatFileReq { id: file1 }));
    match after {
        ShardResponse::StatFile(r) => {
            assert_eq!(r.atime, before.atime);
            assert_eq!(r.mtime, before.mtime);
        }
        other => panic!("stat failed: {:?}", other),
    }

    // with the high bit the low 63 bits become the new time
    let resp = write(
        &db,
        ShardRequest::SetTime(SetTimeReq {
            id: file1,
            atime: (1 << 63) | 1234,
            mtime: (1 << 63) | 5678,
        }),
    );
    assert!(matches!(resp, ShardResponse::SetTime(_)));
    let (after, _) = db.read(&ShardRequest::StatFile(StatFileReq { id: file1 }));
    match after {
        ShardResponse::StatFile(r) => {
            assert_eq!(r.atime, LodeTime(1234));
            assert_eq!(r.mtime, LodeTime(5678));
        }
        other => panic!("stat failed: {:?}", other),
    }
}

#[test]
fn test_read_dir_pages_without_straddling_hashes() {
    let db = bare_shard();
    let mut expected = Vec::new();
    for i in 0..200 {
        let name = format!("file-with-a-rather-long-name-{:03}", i);
        let (id, cookie) = construct_file(&db, b"");
        link_file(&db, id, cookie, ROOT_DIR_INODE_ID, name.as_bytes());
        expected.push(name);
    }

    // walk all pages
    let mut seen = Vec::new();
    let mut start_hash = 0u64;
    let mut pages = 0;
    loop {
        let (resp, _) = db.read(&ShardRequest::ReadDir(ReadDirReq {
            dir_id: ROOT_DIR_INODE_ID,
            start_hash,
            mtu: 0,
        }));
        let resp = match resp {
            ShardResponse::ReadDir(r) => r,
            other => panic!("read dir failed: {:?}", other),
        };
        for edge in &resp.results {
            seen.push(String::from_utf8(edge.name.as_bytes().to_vec()).unwrap());
        }
        pages += 1;
        assert!(pages < 100, "read dir does not terminate");
        if resp.next_hash == 0 {
            break;
        }
        start_hash = resp.next_hash;
    }
    assert!(pages > 1, "expected the listing to need several pages");

    let mut expected_sorted = expected.clone();
    expected_sorted.sort();
    let mut seen_sorted = seen.clone();
    seen_sorted.sort();
    assert_eq!(seen_sorted, expected_sorted);
    // no duplicates: hash groups never straddle pages
    assert_eq!(seen.len(), expected.len());
}

#[test]
fn test_visit_files_pagination() {
    let db = bare_shard();
    let mut ids = Vec::new();
    for i in 0..10 {
        let (id, cookie) = construct_file(&db, b"");
        link_file(&db, id, cookie, ROOT_DIR_INODE_ID, format!("f{}", i).as_bytes());
        ids.push(id);
    }
    let (resp, _) = db.read(&ShardRequest::VisitFiles(VisitFilesReq {
        begin_id: NULL_INODE_ID,
        mtu: 0,
    }));
    match resp {
        ShardResponse::VisitFiles(r) => {
            assert_eq!(r.next_id, NULL_INODE_ID);
            assert_eq!(r.ids.len(), 10);
        }
        other => panic!("visit files failed: {:?}", other),
    }
}

#[test]
fn test_visit_transient_files_returns_cookies() {
    let db = bare_shard();
    let (id, cookie) = construct_file(&db, b"");
    let (resp, _) = db.read(&ShardRequest::VisitTransientFiles(VisitTransientFilesReq {
        begin_id: NULL_INODE_ID,
        mtu: 0,
    }));
    match resp {
        ShardResponse::VisitTransientFiles(r) => {
            assert_eq!(r.files.len(), 1);
            assert_eq!(r.files[0].id, id);
            assert_eq!(r.files[0].cookie, cookie);
        }
        other => panic!("visit transient files failed: {:?}", other),
    }
}

#[test]
fn test_wrong_shard_rejected() {
    let db = bare_shard();
    let foreign = InodeId::new(InodeType::File, ShardId(9), 1);
    let err = expect_error(write(
        &db,
        ShardRequest::MakeFileTransient(MakeFileTransientReq {
            id: foreign,
            note: ShortBytes::default(),
        }),
    ));
    assert_eq!(err, LodeError::BadShard);
}
