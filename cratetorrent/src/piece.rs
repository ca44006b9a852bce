//! The piece/block model (§3, §4.3): a piece is split into fixed-size
//! blocks and carries the mutable status the scheduler and peer sessions
//! observe and transition.

use crate::{block_count, block_len, BlockInfo, PieceIndex, Sha1Hash};

/// The status of a piece's download, transitioning
/// `Default -> Requested -> Downloaded`, with `Failed` reachable from
/// `Requested` on any recoverable error (§3).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PieceStatus {
    /// No peer is currently downloading this piece.
    Default,
    /// A peer session has been handed this piece and is downloading it.
    Requested,
    /// The piece has been verified against its hash and persisted to every
    /// file it overlaps.
    Downloaded,
    /// The most recent download attempt failed; eligible for retry.
    Failed,
}

impl Default for PieceStatus {
    fn default() -> Self {
        Self::Default
    }
}

/// A single piece of the torrent: its expected hash, length, constituent
/// blocks, and current download status.
#[derive(Debug)]
pub(crate) struct Piece {
    pub index: PieceIndex,
    pub hash: Sha1Hash,
    pub len: u32,
    pub blocks: Vec<BlockInfo>,
    pub status: PieceStatus,
}

impl Piece {
    /// Constructs a piece and materializes its block list, per §4.3's
    /// `generate_blocks`: `ceil(len / BLOCK_LEN)` blocks, all but the last
    /// exactly `BLOCK_LEN` long, the last possibly shorter.
    pub fn new(index: PieceIndex, len: u32, hash: Sha1Hash) -> Self {
        let blocks = generate_blocks(index, len);
        Self {
            index,
            hash,
            len,
            blocks,
            status: PieceStatus::Default,
        }
    }

    /// True if this piece has neither been claimed by a peer nor already
    /// downloaded, i.e. it's eligible for the scheduler to assign.
    pub fn is_pending(&self) -> bool {
        matches!(self.status, PieceStatus::Default | PieceStatus::Failed)
    }

    /// Verifies assembled piece bytes against the expected hash (§8 round
    /// trip law: `status = Downloaded` only after this succeeds and the
    /// bytes are persisted).
    pub fn verify(&self, data: &[u8]) -> bool {
        use sha1::{Digest, Sha1};
        debug_assert_eq!(data.len(), self.len as usize);
        let digest = Sha1::digest(data);
        digest.as_slice() == self.hash
    }
}

/// Produces the ordered, contiguous, non-overlapping block list for a piece
/// of the given length, per §3/§4.3's block length policy
/// (`BLOCK = 2^14`, final block possibly shorter).
pub(crate) fn generate_blocks(
    piece_index: PieceIndex,
    piece_len: u32,
) -> Vec<BlockInfo> {
    let count = block_count(piece_len);
    (0..count)
        .map(|i| BlockInfo {
            piece_index,
            offset: i as u32 * crate::BLOCK_LEN,
            len: block_len(piece_len, i),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_three_blocks_for_uneven_piece() {
        // 40000 bytes: two full 16384 byte blocks and a 7232 byte remainder,
        // matching spec §8 scenario 3.
        let blocks = generate_blocks(0, 40000);
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[0].offset, 0);
        assert_eq!(blocks[0].len, 16384);
        assert_eq!(blocks[1].offset, 16384);
        assert_eq!(blocks[1].len, 16384);
        assert_eq!(blocks[2].offset, 32768);
        assert_eq!(blocks[2].len, 7232);
        let total: u32 = blocks.iter().map(|b| b.len).sum();
        assert_eq!(total, 40000);
    }

    #[test]
    fn generates_single_block_for_exact_multiple() {
        let blocks = generate_blocks(0, crate::BLOCK_LEN);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].len, crate::BLOCK_LEN);
    }

    #[test]
    fn blocks_are_contiguous_and_strictly_increasing() {
        let blocks = generate_blocks(0, 5 * crate::BLOCK_LEN + 1);
        let mut expected_offset = 0u32;
        for block in &blocks {
            assert_eq!(block.offset, expected_offset);
            expected_offset += block.len;
        }
    }

    #[test]
    fn new_piece_starts_pending() {
        let piece = Piece::new(0, 16384, [0u8; 20]);
        assert!(piece.is_pending());
        assert_eq!(piece.status, PieceStatus::Default);
    }

    #[test]
    fn verify_detects_hash_match_and_mismatch() {
        use sha1::{Digest, Sha1};
        let data = vec![7u8; 100];
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&Sha1::digest(&data));
        let piece = Piece::new(0, 100, hash);
        assert!(piece.verify(&data));

        let mut bad_hash = hash;
        bad_hash[0] ^= 0xff;
        let piece = Piece::new(0, 100, bad_hash);
        assert!(!piece.verify(&data));
    }
}
