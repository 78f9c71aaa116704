//! Integrity primitives: an AES-128 expanded key and the 8-byte CBC-MAC
//! built on it.
//!
//! Two families of MACs exist:
//!
//! - **cookies** bind a transient inode id to the owning shard's secret; a
//!   client must echo the cookie on every request touching the file
//! - **certificates and proofs** authorize and attest per-block operations:
//!   the shard issues write/erase certificates under a block service's
//!   secret, the client returns add/delete proofs computed by that block
//!   service, and the shard verifies them before committing span
//!   transitions

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes128;

use crate::bincode::Packer;
use crate::ids::{BlockServiceId, InodeId};

/// MAC length in bytes.
pub const MAC_SIZE: usize = 8;

/// Certificates and proofs are MACed over this many zero-padded bytes.
const CERTIFICATE_BUF_SIZE: usize = 32;

/// An AES-128 key with its round keys precomputed.
#[derive(Clone)]
pub struct ExpandedKey {
    cipher: Aes128,
}

impl ExpandedKey {
    /// Expands a 16-byte secret into round keys.
    pub fn expand(secret: &[u8; 16]) -> ExpandedKey {
        ExpandedKey {
            cipher: Aes128::new(GenericArray::from_slice(secret)),
        }
    }

    /// CBC-MAC over the zero-padded input, truncated to 8 bytes.
    pub fn cbcmac(&self, data: &[u8]) -> [u8; MAC_SIZE] {
        let mut block = [0u8; 16];
        let mut chunks = data.chunks(16).peekable();
        if chunks.peek().is_none() {
            // empty input still runs one block
            self.encrypt(&mut block);
        }
        for chunk in chunks {
            for (b, x) in block.iter_mut().zip(chunk) {
                *b ^= x;
            }
            self.encrypt(&mut block);
        }
        let mut mac = [0u8; MAC_SIZE];
        mac.copy_from_slice(&block[..MAC_SIZE]);
        mac
    }

    fn encrypt(&self, block: &mut [u8; 16]) {
        let ga = GenericArray::from_mut_slice(block);
        self.cipher.encrypt_block(ga);
    }
}

/// The cookie handed out for a transient inode: a MAC of the id under the
/// shard secret.
pub fn inode_cookie(key: &ExpandedKey, id: InodeId) -> [u8; MAC_SIZE] {
    key.cbcmac(&id.as_u64().to_le_bytes())
}

fn certificate_mac(key: &ExpandedKey, fill: impl FnOnce(&mut Packer)) -> [u8; MAC_SIZE] {
    let mut p = Packer::with_capacity(CERTIFICATE_BUF_SIZE);
    fill(&mut p);
    let mut buf = [0u8; CERTIFICATE_BUF_SIZE];
    let bytes = p.bytes();
    debug_assert!(bytes.len() <= CERTIFICATE_BUF_SIZE);
    buf[..bytes.len()].copy_from_slice(bytes);
    key.cbcmac(&buf)
}

/// Shard-issued certificate authorizing a block write.
pub fn block_write_certificate(
    key: &ExpandedKey,
    block_service: BlockServiceId,
    block_id: u64,
    crc: u32,
    block_size: u32,
) -> [u8; MAC_SIZE] {
    certificate_mac(key, |p| {
        p.pack_u64(block_service.0);
        p.pack_u8(b'w');
        p.pack_u64(block_id);
        p.pack_u32(crc);
        p.pack_u32(block_size);
    })
}

/// Block-service-issued proof that a block was written.
pub fn block_add_proof(
    key: &ExpandedKey,
    block_service: BlockServiceId,
    block_id: u64,
) -> [u8; MAC_SIZE] {
    certificate_mac(key, |p| {
        p.pack_u64(block_service.0);
        p.pack_u8(b'W');
        p.pack_u64(block_id);
    })
}

/// Shard-issued certificate authorizing a block erase.
pub fn block_erase_certificate(
    key: &ExpandedKey,
    block_service: BlockServiceId,
    block_id: u64,
) -> [u8; MAC_SIZE] {
    certificate_mac(key, |p| {
        p.pack_u64(block_service.0);
        p.pack_u8(b'e');
        p.pack_u64(block_id);
    })
}

/// Block-service-issued proof that a block was deleted.
pub fn block_delete_proof(
    key: &ExpandedKey,
    block_service: BlockServiceId,
    block_id: u64,
) -> [u8; MAC_SIZE] {
    certificate_mac(key, |p| {
        p.pack_u64(block_service.0);
        p.pack_u8(b'E');
        p.pack_u64(block_id);
    })
}
