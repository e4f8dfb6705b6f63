use std::any::Any;

use sketches_protos::sketches::Store as ProtoStore;
use tracing::trace;

use super::memory::PagePool;
use super::{checked_index, decode_bins, Store};
use crate::encoding::{
    self, Flag, FlagType, SubFlag, BIN_ENCODING_CONTIGUOUS_COUNTS, BIN_ENCODING_INDEX_DELTAS,
};
use crate::error::DecodeError;

const PAGE_LEN_LOG2: u32 = 5;
const PAGE_LEN: usize = 1 << PAGE_LEN_LOG2;
const PAGE_LEN_MASK: i32 = PAGE_LEN as i32 - 1;

const INITIAL_BUFFER_CAPACITY: usize = 4;
const MIN_PAGES_CAPACITY: usize = 8;

fn page_index(index: i32) -> i32 {
    index >> PAGE_LEN_LOG2
}

fn line_index(index: i32) -> usize {
    (index & PAGE_LEN_MASK) as usize
}

fn store_index(page_index: i32, line_index: usize) -> i32 {
    (page_index << PAGE_LEN_LOG2) + line_index as i32
}

/// Rounds a page-slice length up so that capacity grows in multiples of 64 bytes.
fn slice_cap(len: usize) -> usize {
    (len + 7) & !7
}

/// A store that allocates counts in aligned fixed-size pages, with a buffer for raw indexes.
///
/// A page encodes the counts for a contiguous range of indexes, and two pages that are
/// contiguous in the page slice encode ranges that are contiguous. Indexes that are added with
/// a count of 1 and for which no page exists yet are appended to an unsorted buffer instead.
///
/// The store favors the buffer and only creates a page when the page's memory size is no
/// greater than the buffer space needed to keep the indexes that the page could encode. Some
/// indexes may therefore stay in the buffer indefinitely if promoting them would create an
/// almost-empty page. The process that transfers indexes from the buffer to pages is called
/// compaction.
///
/// This store never collapses or merges bins, so it does not introduce any error by itself:
/// `min_index`, `max_index`, `bins` and `key_at_rank` all return exact results. There is no
/// upper bound on its memory size, but thanks to the buffer and the on-demand pages it is
/// much more space-efficient than a dense store when few indexes are added, when the input has
/// outliers, or when the input distribution is multimodal.
#[derive(Clone, Debug)]
pub struct BufferedPaginatedStore {
    /// Indexes added with a count of 1 that no page covers yet, unsorted.
    buffer: Vec<i32>,

    /// Compaction happens only once the buffer reaches this length.
    buffer_compaction_trigger_len: usize,

    /// The pages, contiguous over page numbers starting at `min_page_index`.
    pages: Vec<Option<Vec<f64>>>,

    /// The page number of `pages[0]`; `i32::MAX` iff `pages` is unused.
    min_page_index: i32,

    /// Recycles page allocations across clears.
    memory: PagePool,
}

impl BufferedPaginatedStore {
    /// Creates an empty `BufferedPaginatedStore`.
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(INITIAL_BUFFER_CAPACITY),
            buffer_compaction_trigger_len: 2 * PAGE_LEN,
            pages: Vec::new(),
            min_page_index: i32::MAX,
            memory: PagePool::new(PAGE_LEN),
        }
    }

    fn page_slot(&self, page_index: i32) -> Option<usize> {
        if self.min_page_index == i32::MAX {
            return None;
        }
        let offset = page_index as i64 - self.min_page_index as i64;
        if offset < 0 || offset >= self.pages.len() as i64 {
            return None;
        }
        Some(offset as usize)
    }

    fn existing_page_mut(&mut self, page_index: i32) -> Option<&mut Vec<f64>> {
        match self.page_slot(page_index) {
            Some(slot) => self.pages[slot].as_mut(),
            None => None,
        }
    }

    /// Returns the page for the provided page number, materializing it (and extending the page
    /// slice) if needed.
    fn ensured_page_mut(&mut self, page_index: i32) -> &mut Vec<f64> {
        if self.page_slot(page_index).is_none() {
            self.extend_pages_to(page_index);
        }
        let slot = match self.page_slot(page_index) {
            Some(slot) => slot,
            None => unreachable!("the page slice was just extended"),
        };
        if self.pages[slot].is_none() {
            self.pages[slot] = Some(self.memory.acquire());
        }
        match self.pages[slot].as_mut() {
            Some(page) => page,
            None => unreachable!("the page was just materialized"),
        }
    }

    /// Extends the page slice so that it has a slot for the given page number. Extending left
    /// shifts the existing slots right; extending right grows the tail.
    fn extend_pages_to(&mut self, page_index: i32) {
        let mut new_pages_len = self.pages.len();
        let mut shift = 0usize;
        if self.min_page_index == i32::MAX {
            new_pages_len = 1;
        } else if page_index < self.min_page_index {
            shift = (self.min_page_index - page_index) as usize;
            new_pages_len = shift + self.pages.len();
        } else if page_index >= self.min_page_index + self.pages.len() as i32 {
            new_pages_len = (page_index - self.min_page_index + 1) as usize;
        }

        if new_pages_len > self.pages.capacity() {
            self.pages.reserve_exact(slice_cap(new_pages_len) - self.pages.len());
        }
        self.pages.resize_with(new_pages_len, || None);
        if shift > 0 {
            self.pages.rotate_right(shift);
        }

        if self.min_page_index == i32::MAX {
            self.min_page_index = page_index;
        } else {
            self.min_page_index -= shift as i32;
        }
    }

    /// Transfers indexes from the buffer to the pages. A new page is created only if it frees
    /// at least as much buffer space as the page takes.
    fn compact(&mut self) {
        let mut buffer = std::mem::take(&mut self.buffer);
        buffer.sort_unstable();

        let mut run_start = 0;
        while run_start < buffer.len() {
            let run_page_index = page_index(buffer[run_start]);
            let mut run_end = run_start + 1;
            while run_end < buffer.len() && page_index(buffer[run_end]) == run_page_index {
                run_end += 1;
            }

            let create_page =
                (run_end - run_start) * std::mem::size_of::<i32>() >= PAGE_LEN * std::mem::size_of::<f64>();
            if create_page || self.page_slot(run_page_index).map_or(false, |slot| self.pages[slot].is_some()) {
                let page = self.ensured_page_mut(run_page_index);
                for &index in &buffer[run_start..run_end] {
                    page[line_index(index)] += 1.0;
                }
                buffer.drain(run_start..run_end);
            } else {
                run_start = run_end;
            }
        }

        self.buffer_compaction_trigger_len = buffer.len() + PAGE_LEN;
        trace!(
            remaining = buffer.len(),
            trigger = self.buffer_compaction_trigger_len,
            "compacted buffer"
        );
        self.buffer = buffer;
    }

    fn sorted_buffer(&self) -> Vec<i32> {
        let mut buffer = self.buffer.clone();
        buffer.sort_unstable();
        buffer
    }

    /// Walks the pages and the sorted buffer simultaneously, in ascending index order,
    /// stopping early when `f` returns `true`. Returns whether the walk was stopped.
    fn for_each_ascending<F: FnMut(i32, f64) -> bool>(&self, buffer: &[i32], mut f: F) -> bool {
        let mut pos = 0usize;
        for (page_offset, page) in self.pages.iter().enumerate() {
            let Some(page) = page else { continue };
            for (line, &count) in page.iter().enumerate() {
                if count == 0.0 {
                    continue;
                }
                let index = store_index(self.min_page_index + page_offset as i32, line);

                // Emit the buffered runs that sort before this page line; a run equal to the
                // line's index contributes to the same bin.
                let mut run_start;
                loop {
                    run_start = pos;
                    if run_start >= buffer.len() || buffer[run_start] > index {
                        break;
                    }
                    pos += 1;
                    while pos < buffer.len() && buffer[pos] == buffer[run_start] {
                        pos += 1;
                    }
                    if buffer[run_start] == index {
                        break;
                    }
                    if f(buffer[run_start], (pos - run_start) as f64) {
                        return true;
                    }
                }
                if f(index, count + (pos - run_start) as f64) {
                    return true;
                }
            }
        }

        while pos < buffer.len() {
            let run_start = pos;
            pos += 1;
            while pos < buffer.len() && buffer[pos] == buffer[run_start] {
                pos += 1;
            }
            if f(buffer[run_start], (pos - run_start) as f64) {
                return true;
            }
        }
        false
    }

    /// The descending counterpart of [`Self::for_each_ascending`].
    fn for_each_descending<F: FnMut(i32, f64) -> bool>(&self, buffer: &[i32], mut f: F) -> bool {
        let mut pos = buffer.len();
        for (page_offset, page) in self.pages.iter().enumerate().rev() {
            let Some(page) = page else { continue };
            for (line, &count) in page.iter().enumerate().rev() {
                if count == 0.0 {
                    continue;
                }
                let index = store_index(self.min_page_index + page_offset as i32, line);

                let mut run_end;
                loop {
                    run_end = pos;
                    if run_end == 0 || buffer[run_end - 1] < index {
                        break;
                    }
                    pos -= 1;
                    while pos > 0 && buffer[pos - 1] == buffer[run_end - 1] {
                        pos -= 1;
                    }
                    if buffer[run_end - 1] == index {
                        break;
                    }
                    if f(buffer[run_end - 1], (run_end - pos) as f64) {
                        return true;
                    }
                }
                if f(index, count + (run_end - pos) as f64) {
                    return true;
                }
            }
        }

        while pos > 0 {
            let run_end = pos;
            pos -= 1;
            while pos > 0 && buffer[pos - 1] == buffer[run_end - 1] {
                pos -= 1;
            }
            if f(buffer[run_end - 1], (run_end - pos) as f64) {
                return true;
            }
        }
        false
    }

    #[cfg(test)]
    fn buffer_len(&self) -> usize {
        self.buffer.len()
    }

    #[cfg(test)]
    fn allocated_page_count(&self) -> usize {
        self.pages.iter().filter(|page| page.is_some()).count()
    }
}

impl Store for BufferedPaginatedStore {
    fn add(&mut self, index: i32) {
        // First, check if the index can be recorded in an existing page.
        if let Some(page) = self.existing_page_mut(page_index(index)) {
            page[line_index(index)] += 1.0;
            return;
        }

        // The page does not exist, use the buffer.
        if self.buffer.len() == self.buffer.capacity() && self.buffer.len() >= self.buffer_compaction_trigger_len
        {
            self.compact();
        }
        self.buffer.push(index);
    }

    fn add_with_count(&mut self, index: i32, count: f64) {
        if count == 0.0 {
            return;
        }
        if count == 1.0 {
            self.add(index);
            return;
        }
        self.ensured_page_mut(page_index(index))[line_index(index)] += count;
    }

    fn is_empty(&self) -> bool {
        if !self.buffer.is_empty() {
            return false;
        }
        self.pages
            .iter()
            .flatten()
            .all(|page| page.iter().all(|&count| count == 0.0))
    }

    fn total_count(&self) -> f64 {
        let mut total = self.buffer.len() as f64;
        for page in self.pages.iter().flatten() {
            total += page.iter().sum::<f64>();
        }
        total
    }

    fn min_index(&self) -> Option<i32> {
        let buffer = self.sorted_buffer();
        let mut min_index = None;
        self.for_each_ascending(&buffer, |index, _| {
            min_index = Some(index);
            true
        });
        min_index
    }

    fn max_index(&self) -> Option<i32> {
        let buffer = self.sorted_buffer();
        let mut max_index = None;
        self.for_each_descending(&buffer, |index, _| {
            max_index = Some(index);
            true
        });
        max_index
    }

    fn key_at_rank(&self, rank: f64) -> Option<i32> {
        let rank = rank.max(0.0);
        let buffer = self.sorted_buffer();

        // If the cumulative count never exceeds the rank, the walk runs to the end and leaves
        // the maximum index in `key`.
        let mut key = None;
        let mut cumulative = 0.0;
        self.for_each_ascending(&buffer, |index, count| {
            key = Some(index);
            cumulative += count;
            cumulative > rank
        });
        key
    }

    fn for_each<F: FnMut(i32, f64) -> bool>(&self, f: F) {
        let buffer = self.sorted_buffer();
        self.for_each_ascending(&buffer, f);
    }

    fn merge_with<O: Store>(&mut self, other: &O) {
        if let Some(o) = (other as &dyn Any).downcast_ref::<BufferedPaginatedStore>() {
            if o.pages.is_empty() {
                // Optimized merging when the other store only has buffered data: bulk-append
                // with interleaved compaction.
                let mut offset = 0usize;
                loop {
                    let overhead = self
                        .buffer
                        .capacity()
                        .max(self.buffer_compaction_trigger_len)
                        .saturating_sub(self.buffer.len());
                    if overhead >= o.buffer.len() - offset {
                        self.buffer.extend_from_slice(&o.buffer[offset..]);
                        return;
                    }
                    self.buffer.extend_from_slice(&o.buffer[offset..offset + overhead]);
                    offset += overhead;
                    self.compact();
                }
            }
        }

        // Fallback merging.
        other.for_each(|index, count| {
            self.add_with_count(index, count);
            false
        });
    }

    fn clear(&mut self) {
        self.buffer.clear();
        for slot in self.pages.iter_mut() {
            if let Some(page) = slot.take() {
                self.memory.release(page);
            }
        }
        self.pages.clear();
        self.pages.shrink_to(MIN_PAGES_CAPACITY);
        self.min_page_index = i32::MAX;
    }

    fn reweight(&mut self, w: f64) {
        if w == 1.0 {
            return;
        }
        let buffer = std::mem::take(&mut self.buffer);
        for page in self.pages.iter_mut().flatten() {
            for count in page.iter_mut() {
                *count *= w;
            }
        }
        for index in buffer {
            self.add_with_count(index, w);
        }
    }

    fn encode(&self, out: &mut Vec<u8>, flag_type: FlagType) {
        if !self.buffer.is_empty() {
            encoding::encode_flag(out, Flag::new(flag_type, BIN_ENCODING_INDEX_DELTAS));
            encoding::encode_uvarint64(out, self.buffer.len() as u64);
            let mut previous_index = 0i64;
            for &index in &self.buffer {
                encoding::encode_varint64(out, index as i64 - previous_index);
                previous_index = index as i64;
            }
        }

        for (page_offset, page) in self.pages.iter().enumerate() {
            let Some(page) = page else { continue };
            encoding::encode_flag(out, Flag::new(flag_type, BIN_ENCODING_CONTIGUOUS_COUNTS));
            encoding::encode_uvarint64(out, page.len() as u64);
            encoding::encode_varint64(
                out,
                store_index(self.min_page_index + page_offset as i32, 0) as i64,
            );
            encoding::encode_varint64(out, 1);
            for &count in page.iter() {
                encoding::encode_varfloat64(out, count);
            }
        }
    }

    fn decode_and_merge_with(&mut self, input: &mut &[u8], sub_flag: SubFlag) -> Result<(), DecodeError> {
        match sub_flag {
            BIN_ENCODING_INDEX_DELTAS => {
                let num_bins = encoding::decode_uvarint64(input)?;
                let mut remaining = num_bins as usize;
                let mut index = 0i64;
                // Process indexes in batches to avoid checking after each insertion whether
                // compaction should happen.
                loop {
                    let batch = remaining.min(
                        self.buffer
                            .capacity()
                            .max(self.buffer_compaction_trigger_len)
                            .saturating_sub(self.buffer.len()),
                    );
                    for _ in 0..batch {
                        index += encoding::decode_varint64(input)?;
                        self.buffer.push(checked_index(index)?);
                    }
                    remaining -= batch;
                    if remaining == 0 {
                        return Ok(());
                    }
                    self.compact();
                }
            }
            BIN_ENCODING_CONTIGUOUS_COUNTS => {
                let num_bins = encoding::decode_uvarint64(input)?;
                let mut index = encoding::decode_varint64(input)?;
                let index_delta = encoding::decode_varint64(input)?;

                // Counts go straight into pages, without per-bin dispatch.
                let mut decoded = 0u64;
                while decoded < num_bins {
                    let narrowed = checked_index(index)?;
                    let page = self.ensured_page_mut(page_index(narrowed));
                    let mut line = line_index(narrowed) as i64;
                    while (0..PAGE_LEN as i64).contains(&line) && decoded < num_bins {
                        page[line as usize] += encoding::decode_varfloat64(input)?;
                        line += index_delta;
                        index += index_delta;
                        decoded += 1;
                    }
                }
                Ok(())
            }
            _ => decode_bins(self, input, sub_flag),
        }
    }

    fn to_proto(&self) -> ProtoStore {
        let mut proto = ProtoStore::new();
        self.for_each(|index, count| {
            proto.binCounts.insert(index, count);
            false
        });
        proto
    }
}

impl Default for BufferedPaginatedStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Bin;

    #[test]
    fn test_add_and_iterate() {
        let mut store = BufferedPaginatedStore::new();
        store.add(2);
        store.add(2);
        store.add(-7432);
        store.add(977);

        assert_eq!(4.0, store.total_count());
        assert_eq!(Some(-7432), store.min_index());
        assert_eq!(Some(977), store.max_index());
        assert_eq!(
            vec![Bin::new(-7432, 1.0), Bin::new(2, 2.0), Bin::new(977, 1.0)],
            store.bins()
        );
    }

    #[test]
    fn test_add_with_count_materializes_page() {
        let mut store = BufferedPaginatedStore::new();
        store.add_with_count(5, 2.5);

        assert_eq!(1, store.allocated_page_count());
        assert_eq!(0, store.buffer_len());
        assert_eq!(vec![Bin::new(5, 2.5)], store.bins());
    }

    #[test]
    fn test_buffered_index_equal_to_page_line_merges() {
        let mut store = BufferedPaginatedStore::new();
        store.add_with_count(5, 2.0);
        store.add(5);

        assert_eq!(vec![Bin::new(5, 3.0)], store.bins());
    }

    #[test]
    fn test_compaction_density() {
        // Adding every other index keeps each candidate page too sparse to be worth creating.
        let mut store = BufferedPaginatedStore::new();
        let mut index = 0;
        while index < 4 * PAGE_LEN as i32 {
            store.add(index);
            index += 2;
        }
        store.compact();
        assert_eq!(0, store.allocated_page_count());

        // With enough duplicates per index, the same page range is worth materializing.
        let mut store = BufferedPaginatedStore::new();
        let mut index = 0;
        while index < 4 * PAGE_LEN as i32 {
            for _ in 0..8 {
                store.add(index);
            }
            index += 2;
        }
        store.compact();
        assert_eq!(0, store.buffer_len());
    }

    #[test]
    fn test_compaction_few() {
        let mut store = BufferedPaginatedStore::new();
        store.add(2);
        store.add(-7432);
        store.add(977);
        store.compact();
        assert_eq!(0, store.allocated_page_count());
    }

    #[test]
    fn test_compaction_outliers() {
        // A dense page worth of duplicated indexes gets compacted away; the outliers stay
        // buffered.
        let mut store = BufferedPaginatedStore::new();
        for index in 0..PAGE_LEN as i32 {
            store.add(index);
            store.add(index);
        }
        for _ in 0..4 {
            store.add(6377);
        }
        assert_eq!(4, store.buffer_len());
    }

    #[test]
    fn test_key_at_rank() {
        let mut store = BufferedPaginatedStore::new();
        store.add_with_count(-5, 2.0);
        store.add(10);
        store.add(10);
        store.add(10_000);

        assert_eq!(Some(-5), store.key_at_rank(-3.0));
        assert_eq!(Some(-5), store.key_at_rank(0.0));
        assert_eq!(Some(-5), store.key_at_rank(1.5));
        assert_eq!(Some(10), store.key_at_rank(2.0));
        assert_eq!(Some(10), store.key_at_rank(3.5));
        assert_eq!(Some(10_000), store.key_at_rank(4.0));
        assert_eq!(Some(10_000), store.key_at_rank(1e9));
        assert_eq!(None, BufferedPaginatedStore::new().key_at_rank(0.0));
    }

    #[test]
    fn test_exactness_over_many_adds() {
        // The buffered-paginated store never collapses, so the multiset of inputs survives.
        let mut store = BufferedPaginatedStore::new();
        let mut expected = std::collections::BTreeMap::new();
        let mut state = 0x9E3779B97F4A7C15u64;
        for _ in 0..10_000 {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let index = ((state >> 33) as i32 % 2000) - 1000;
            store.add(index);
            *expected.entry(index).or_insert(0.0) += 1.0;
        }

        assert_eq!(10_000.0, store.total_count());
        let bins: Vec<Bin> = expected.iter().map(|(&i, &c)| Bin::new(i, c)).collect();
        assert_eq!(bins, store.bins());
    }

    #[test]
    fn test_merge_buffered_fast_path() {
        let mut store1 = BufferedPaginatedStore::new();
        for index in 0..100 {
            store1.add(index % 10);
        }

        // Few enough adds that store2 stays fully buffered.
        let mut store2 = BufferedPaginatedStore::new();
        for index in 0..50 {
            store2.add(index % 7);
        }
        assert!(store2.pages.is_empty());

        let total_before = store1.total_count() + store2.total_count();
        store1.merge_with(&store2);
        assert_eq!(total_before, store1.total_count());
    }

    #[test]
    fn test_merge_cross_type() {
        use crate::store::CollapsingLowestDenseStore;

        let mut collapsing = CollapsingLowestDenseStore::new(16);
        for index in 0..20 {
            collapsing.add(index);
        }

        let mut store = BufferedPaginatedStore::new();
        store.add(-5);
        store.merge_with(&collapsing);

        assert_eq!(21.0, store.total_count());
        assert_eq!(Some(-5), store.min_index());
        assert_eq!(Some(19), store.max_index());
    }

    #[test]
    fn test_clear_reuses_pages() {
        let mut store = BufferedPaginatedStore::new();
        store.add_with_count(3, 5.0);
        store.add(1000);
        assert!(store.allocated_page_count() > 0);

        store.clear();

        assert!(store.is_empty());
        assert_eq!(0.0, store.total_count());
        assert_eq!(None, store.min_index());
        assert_eq!(None, store.max_index());

        // Pages come back from the pool zeroed.
        store.add_with_count(3, 2.0);
        assert_eq!(vec![Bin::new(3, 2.0)], store.bins());
    }

    #[test]
    fn test_reweight() {
        let mut store = BufferedPaginatedStore::new();
        store.add(4);
        store.add(4);
        store.add_with_count(90, 3.0);

        store.reweight(2.0);

        assert_eq!(10.0, store.total_count());
        assert_eq!(vec![Bin::new(4, 4.0), Bin::new(90, 6.0)], store.bins());
    }

    #[test]
    fn test_binary_roundtrip() {
        let mut store = BufferedPaginatedStore::new();
        for index in 0..PAGE_LEN as i32 {
            store.add_with_count(index, 2.0);
        }
        store.add(-500);
        store.add(12_345);

        let mut out = Vec::new();
        store.encode(&mut out, FlagType::PositiveStore);

        let mut decoded = BufferedPaginatedStore::new();
        let mut input = &out[..];
        while !input.is_empty() {
            let flag = encoding::decode_flag(&mut input).unwrap();
            assert_eq!(FlagType::PositiveStore, flag.flag_type().unwrap());
            decoded.decode_and_merge_with(&mut input, flag.sub_flag()).unwrap();
        }

        assert_eq!(store.bins(), decoded.bins());
    }

    #[test]
    fn test_binary_roundtrip_into_collapsing(){
        use crate::store::CollapsingLowestDenseStore;

        let mut store = BufferedPaginatedStore::new();
        for index in 0..10 {
            store.add(index);
        }

        let mut out = Vec::new();
        store.encode(&mut out, FlagType::NegativeStore);

        let mut decoded = CollapsingLowestDenseStore::new(1024);
        let mut input = &out[..];
        while !input.is_empty() {
            let flag = encoding::decode_flag(&mut input).unwrap();
            decoded.decode_and_merge_with(&mut input, flag.sub_flag()).unwrap();
        }

        assert_eq!(store.bins(), decoded.bins());
    }

    #[test]
    fn test_proto_roundtrip() {
        let mut store = BufferedPaginatedStore::new();
        store.add(42);
        store.add_with_count(-3, 1.5);

        let proto = store.to_proto();
        let mut decoded = BufferedPaginatedStore::new();
        decoded.merge_from_proto(&proto).unwrap();

        assert_eq!(store.bins(), decoded.bins());
    }

    #[test]
    fn test_negative_indexes_page_arithmetic() {
        for index in [-1, -31, -32, -33, -1000, i32::MIN / 2] {
            let page = page_index(index);
            let line = line_index(index);
            assert_eq!(index, store_index(page, line));
        }
    }
}
