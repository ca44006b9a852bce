//! A small helper for tracking download progress, used by the progress
//! observer to render the "Downloaded X%  Pieces d/N" line (§6).

/// Tracks how many of a torrent's pieces have been downloaded out of the
/// total, and renders the result as a human readable progress line.
#[derive(Clone, Copy, Debug, Default)]
pub struct PieceCounter {
    downloaded: usize,
    total: usize,
}

impl PieceCounter {
    pub(crate) fn new(total: usize) -> Self {
        Self {
            downloaded: 0,
            total,
        }
    }

    /// Builds a counter directly from an already-known downloaded count,
    /// as reported by a scheduler's progress handle, rather than by
    /// incrementing from zero.
    pub fn from_counts(downloaded: usize, total: usize) -> Self {
        Self { downloaded, total }
    }

    /// Records that one more piece has finished downloading.
    ///
    /// # Panics
    ///
    /// Panics if called more than `total` times.
    pub(crate) fn increment(&mut self) {
        debug_assert!(self.downloaded < self.total);
        self.downloaded += 1;
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.downloaded >= self.total
    }

    /// Returns the completion percentage, rounded down, in `[0, 100]`.
    pub(crate) fn percent(&self) -> u32 {
        if self.total == 0 {
            return 100;
        }
        (self.downloaded as u64 * 100 / self.total as u64) as u32
    }
}

impl std::fmt::Display for PieceCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Downloaded {}%  Pieces {}/{}",
            self.percent(),
            self.downloaded,
            self.total
        )
    }
}
