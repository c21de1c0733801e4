/// Row index allocation and the position <-> row indirection.
///
/// Row indices are stable for the lifetime of a row. Deleted indices go to a
/// free list and the lowest one is handed out first by the next allocation.
/// Positions (0..len) enumerate the live rows in ascending row-index order,
/// so removing a row never changes the index of another row; only the
/// positions after it shift down by one.
///
/// Live rows are kept in a tiered vector: sorted blocks of roughly √N
/// indices with cumulative start offsets. That gives:
/// - O(log N) `row_at` and `position_of` (binary search on block boundaries)
/// - O(√N) insert and remove

use crate::error::{Error, Result};
use std::collections::BTreeSet;

/// Sorted set of row indices, addressable by position.
#[derive(Debug, Clone, Default)]
struct TieredRows {
    blocks: Vec<Vec<usize>>,
    block_starts: Vec<usize>, // block_starts[i] = position of the first row in block i
    size: usize,
}

impl TieredRows {
    const MIN_BLOCK_SIZE: usize = 16;
    const MAX_BLOCK_SIZE: usize = 4096;

    fn len(&self) -> usize {
        self.size
    }

    fn ideal_block_size(&self) -> usize {
        let sqrt = (self.size as f64).sqrt() as usize;
        sqrt.clamp(Self::MIN_BLOCK_SIZE, Self::MAX_BLOCK_SIZE)
    }

    /// Index of the first block whose last row is >= `row`.
    fn block_for(&self, row: usize) -> usize {
        self.blocks
            .partition_point(|block| block.last().map_or(true, |&last| last < row))
    }

    fn get(&self, position: usize) -> Option<usize> {
        if position >= self.size {
            return None;
        }
        let block_idx = match self.block_starts.binary_search(&position) {
            Ok(i) => i,
            Err(i) => i.saturating_sub(1),
        };
        self.blocks[block_idx]
            .get(position - self.block_starts[block_idx])
            .copied()
    }

    fn position_of(&self, row: usize) -> Option<usize> {
        let block_idx = self.block_for(row);
        let block = self.blocks.get(block_idx)?;
        block
            .binary_search(&row)
            .ok()
            .map(|offset| self.block_starts[block_idx] + offset)
    }

    fn contains(&self, row: usize) -> bool {
        self.position_of(row).is_some()
    }

    /// Insert a row, returning false if it was already present.
    fn insert(&mut self, row: usize) -> bool {
        if self.blocks.is_empty() {
            self.blocks.push(vec![row]);
            self.block_starts.push(0);
            self.size = 1;
            return true;
        }

        // Past the end: goes into the last block
        let block_idx = self.block_for(row).min(self.blocks.len() - 1);
        let offset = match self.blocks[block_idx].binary_search(&row) {
            Ok(_) => return false,
            Err(offset) => offset,
        };
        self.blocks[block_idx].insert(offset, row);
        self.size += 1;
        self.shift_starts_after(block_idx, 1);
        self.maybe_split_block(block_idx);
        true
    }

    /// Remove a row, returning its former position.
    fn remove(&mut self, row: usize) -> Option<usize> {
        let block_idx = self.block_for(row);
        let offset = self.blocks.get(block_idx)?.binary_search(&row).ok()?;
        let position = self.block_starts[block_idx] + offset;

        self.blocks[block_idx].remove(offset);
        self.size -= 1;
        self.shift_starts_after(block_idx, -1);

        if self.blocks[block_idx].is_empty() {
            self.blocks.remove(block_idx);
            self.block_starts.remove(block_idx);
        } else {
            self.maybe_merge_block(block_idx);
        }
        Some(position)
    }

    fn shift_starts_after(&mut self, block_idx: usize, delta: isize) {
        for start in self.block_starts.iter_mut().skip(block_idx + 1) {
            *start = (*start as isize + delta) as usize;
        }
    }

    fn maybe_split_block(&mut self, block_idx: usize) {
        if self.blocks[block_idx].len() <= 2 * self.ideal_block_size() {
            return;
        }
        let mid = self.blocks[block_idx].len() / 2;
        let tail = self.blocks[block_idx].split_off(mid);
        let tail_start = self.block_starts[block_idx] + mid;
        self.blocks.insert(block_idx + 1, tail);
        self.block_starts.insert(block_idx + 1, tail_start);
    }

    /// Fold a block smaller than a quarter of the ideal size into a neighbour.
    fn maybe_merge_block(&mut self, block_idx: usize) {
        let ideal = self.ideal_block_size();
        if self.blocks.len() <= 1 || self.blocks[block_idx].len() >= ideal / 4 {
            return;
        }

        if block_idx + 1 < self.blocks.len()
            && self.blocks[block_idx].len() + self.blocks[block_idx + 1].len() <= 2 * ideal
        {
            let next = self.blocks.remove(block_idx + 1);
            self.block_starts.remove(block_idx + 1);
            self.blocks[block_idx].extend(next);
        } else if block_idx > 0
            && self.blocks[block_idx - 1].len() + self.blocks[block_idx].len() <= 2 * ideal
        {
            let current = self.blocks.remove(block_idx);
            self.block_starts.remove(block_idx);
            self.blocks[block_idx - 1].extend(current);
        }
    }

    fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.blocks.iter().flat_map(|block| block.iter().copied())
    }
}

/// Allocates row indices and maps positions to live rows.
#[derive(Debug, Clone, Default)]
pub struct RowManager {
    live: TieredRows,
    free: BTreeSet<usize>,
    next: usize,
}

impl RowManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.len() == 0
    }

    pub fn contains(&self, row: usize) -> bool {
        self.live.contains(row)
    }

    /// Allocate the lowest recycled index, or a fresh one.
    pub fn allocate(&mut self) -> usize {
        let row = self.free.pop_first().unwrap_or_else(|| {
            self.next += 1;
            self.next - 1
        });
        self.live.insert(row);
        row
    }

    /// Make a specific row index live.
    ///
    /// Indices skipped over by a claim past the high-water mark become free.
    pub fn claim(&mut self, row: usize) -> Result<()> {
        if self.live.contains(row) {
            return Err(Error::RowExists(row));
        }
        if row >= self.next {
            self.free.extend(self.next..row);
            self.next = row + 1;
        } else {
            self.free.remove(&row);
        }
        self.live.insert(row);
        Ok(())
    }

    /// Retire a row index, returning the position it occupied.
    pub fn release(&mut self, row: usize) -> Result<usize> {
        let position = self.live.remove(row).ok_or(Error::RowNotFound(row))?;
        self.free.insert(row);
        Ok(position)
    }

    pub fn row_at(&self, position: usize) -> Option<usize> {
        self.live.get(position)
    }

    pub fn position_of(&self, row: usize) -> Option<usize> {
        self.live.position_of(row)
    }

    /// Live rows in position order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.live.iter()
    }
}
