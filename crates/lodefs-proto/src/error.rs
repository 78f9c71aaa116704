//! The shard error taxonomy.
//!
//! Every prepare/apply/read failure is one of these values, transported on
//! the wire as a `u16`. The numeric mapping is part of the protocol and must
//! stay stable.

use thiserror::Error;

/// Errors returned by shard request handlers.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Error)]
#[repr(u16)]
pub enum LodeError {
    // structural
    #[error("request routed to the wrong shard")]
    BadShard = 1,
    #[error("inode is a directory")]
    TypeIsDirectory = 2,
    #[error("inode is not a directory")]
    TypeIsNotDirectory = 3,
    #[error("invalid name")]
    BadName = 4,
    #[error("malformed encoding")]
    BadEncoding = 5,
    #[error("bad cookie")]
    BadCookie = 6,
    #[error("cannot remove the root directory")]
    CannotRemoveRootDirectory = 7,

    // not found
    #[error("file not found")]
    FileNotFound = 10,
    #[error("directory not found")]
    DirectoryNotFound = 11,
    #[error("name not found")]
    NameNotFound = 12,
    #[error("edge not found")]
    EdgeNotFound = 13,
    #[error("span not found")]
    SpanNotFound = 14,
    #[error("block not found")]
    BlockNotFound = 15,

    // conflict / ordering
    #[error("mismatching target")]
    MismatchingTarget = 20,
    #[error("mismatching owner")]
    MismatchingOwner = 21,
    #[error("mismatching creation time")]
    MismatchingCreationTime = 22,
    #[error("a more recent current edge exists")]
    MoreRecentCurrentEdge = 23,
    #[error("a more recent snapshot edge exists")]
    MoreRecentSnapshotEdge = 24,
    #[error("mtime is too recent")]
    MtimeIsTooRecent = 25,
    #[error("source and destination are the same")]
    SameSourceAndDestination = 26,
    #[error("name is locked")]
    NameIsLocked = 27,
    #[error("edge is locked")]
    EdgeIsLocked = 28,
    #[error("edge is not owned")]
    EdgeNotOwned = 29,
    #[error("directory not empty")]
    DirectoryNotEmpty = 30,
    #[error("directory has an owner")]
    DirectoryHasOwner = 31,
    #[error("cannot override name")]
    CannotOverrideName = 32,
    #[error("file is not transient")]
    FileIsNotTransient = 33,
    #[error("file not empty")]
    FileNotEmpty = 34,
    #[error("file empty")]
    FileEmpty = 35,
    #[error("deadline not passed")]
    DeadlineNotPassed = 36,
    #[error("last span state is not clean")]
    LastSpanStateNotClean = 37,

    // integrity
    #[error("bad span body")]
    BadSpanBody = 40,
    #[error("bad block proof")]
    BadBlockProof = 41,
    #[error("bad number of block proofs")]
    BadNumberOfBlocksProofs = 42,
    #[error("cannot certify a blockless span")]
    CannotCertifyBlocklessSpan = 43,

    // resource
    #[error("could not pick block services")]
    CouldNotPickBlockServices = 50,

    // location / multi-location
    #[error("span location already exists")]
    AddSpanLocationExists = 60,
    #[error("span location has mismatching size")]
    AddSpanLocationMismatchingSize = 61,
    #[error("span location has mismatching crc")]
    AddSpanLocationMismatchingCrc = 62,
    #[error("span location source is not clean")]
    AddSpanLocationNotClean = 63,
    #[error("span location cannot use inline storage")]
    AddSpanLocationInlineStorage = 64,
    #[error("transient span must have exactly one location")]
    TransientLocationCount = 65,
    #[error("swap blocks: mismatching size")]
    SwapBlocksMismatchingSize = 66,
    #[error("swap blocks: mismatching crc")]
    SwapBlocksMismatchingCrc = 67,
    #[error("swap blocks: mismatching location")]
    SwapBlocksMismatchingLocation = 68,
    #[error("swap blocks: mismatching span state")]
    SwapBlocksMismatchingState = 69,
    #[error("swap blocks: duplicate block service")]
    SwapBlocksDuplicateBlockService = 70,
    #[error("swap blocks: duplicate failure domain")]
    SwapBlocksDuplicateFailureDomain = 71,
    #[error("swap blocks: inline storage")]
    SwapBlocksInlineStorage = 72,
    #[error("swap spans: mismatching size")]
    SwapSpansMismatchingSize = 73,
    #[error("swap spans: mismatching crc")]
    SwapSpansMismatchingCrc = 74,
    #[error("swap spans: mismatching blocks")]
    SwapSpansMismatchingBlocks = 75,
    #[error("swap spans: span is not clean")]
    SwapSpansNotClean = 76,
    #[error("swap spans: inline storage")]
    SwapSpansInlineStorage = 77,

    // io
    #[error("block io error file")]
    BlockIoErrorFile = 80,
}

impl LodeError {
    /// The stable wire code.
    pub fn code(self) -> u16 {
        self as u16
    }

    /// Decodes a wire code. Unknown codes are a framing error.
    pub fn from_code(code: u16) -> Result<LodeError, LodeError> {
        use LodeError::*;
        let err = match code {
            1 => BadShard,
            2 => TypeIsDirectory,
            3 => TypeIsNotDirectory,
            4 => BadName,
            5 => BadEncoding,
            6 => BadCookie,
            7 => CannotRemoveRootDirectory,
            10 => FileNotFound,
            11 => DirectoryNotFound,
            12 => NameNotFound,
            13 => EdgeNotFound,
            14 => SpanNotFound,
            15 => BlockNotFound,
            20 => MismatchingTarget,
            21 => MismatchingOwner,
            22 => MismatchingCreationTime,
            23 => MoreRecentCurrentEdge,
            24 => MoreRecentSnapshotEdge,
            25 => MtimeIsTooRecent,
            26 => SameSourceAndDestination,
            27 => NameIsLocked,
            28 => EdgeIsLocked,
            29 => EdgeNotOwned,
            30 => DirectoryNotEmpty,
            31 => DirectoryHasOwner,
            32 => CannotOverrideName,
            33 => FileIsNotTransient,
            34 => FileNotEmpty,
            35 => FileEmpty,
            36 => DeadlineNotPassed,
            37 => LastSpanStateNotClean,
            40 => BadSpanBody,
            41 => BadBlockProof,
            42 => BadNumberOfBlocksProofs,
            43 => CannotCertifyBlocklessSpan,
            50 => CouldNotPickBlockServices,
            60 => AddSpanLocationExists,
            61 => AddSpanLocationMismatchingSize,
            62 => AddSpanLocationMismatchingCrc,
            63 => AddSpanLocationNotClean,
            64 => AddSpanLocationInlineStorage,
            65 => TransientLocationCount,
            66 => SwapBlocksMismatchingSize,
            67 => SwapBlocksMismatchingCrc,
            68 => SwapBlocksMismatchingLocation,
            69 => SwapBlocksMismatchingState,
            70 => SwapBlocksDuplicateBlockService,
            71 => SwapBlocksDuplicateFailureDomain,
            72 => SwapBlocksInlineStorage,
            73 => SwapSpansMismatchingSize,
            74 => SwapSpansMismatchingCrc,
            75 => SwapSpansMismatchingBlocks,
            76 => SwapSpansNotClean,
            77 => SwapSpansInlineStorage,
            80 => BlockIoErrorFile,
            _ => return Err(LodeError::BadEncoding),
        };
        Ok(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_roundtrip() {
        for code in 0..=100u16 {
            if let Ok(err) = LodeError::from_code(code) {
                assert_eq!(err.code(), code);
            }
        }
    }

    #[test]
    fn test_unknown_code_rejected() {
        assert_eq!(LodeError::from_code(0), Err(LodeError::BadEncoding));
        assert_eq!(LodeError::from_code(9999), Err(LodeError::BadEncoding));
    }

    #[test]
    fn test_display() {
        assert_eq!(LodeError::BadCookie.to_string(), "bad cookie");
        assert_eq!(
            LodeError::SwapBlocksDuplicateFailureDomain.to_string(),
            "swap blocks: duplicate failure domain"
        );
    }
}
