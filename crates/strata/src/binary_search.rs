//! Hamming-distance search over packed binary embeddings.
//!
//! Vectors are stored back to back in one flat buffer. A search XORs every
//! stored vector against the query, counts differing bits with an 8-bit
//! popcount table, and keeps the `top_k` closest with a partial selection
//! (`select_nth_unstable`) before sorting only the selected prefix. Ties are
//! broken by ascending id.

use rayon::prelude::*;

use crate::error::{Error, Result};

/// Vectors above this count are scanned in parallel.
const PARALLEL_THRESHOLD: usize = 4_096;

/// Set-bit count for every byte value.
// i < 256, so both casts are lossless
#[allow(clippy::cast_possible_truncation)]
const POPCOUNT: [u8; 256] = {
    let mut table = [0u8; 256];
    let mut i = 0;
    while i < 256 {
        table[i] = (i as u8).count_ones() as u8;
        i += 1;
    }
    table
};

/// Number of differing bits between two equal-length byte slices.
#[must_use]
pub fn hamming_distance(a: &[u8], b: &[u8]) -> u32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| u32::from(POPCOUNT[usize::from(x ^ y)]))
        .sum()
}

/// Pack the signs of an embedding into bits, most significant bit first.
///
/// Component `i` sets bit `7 - i % 8` of byte `i / 8` when it is positive.
#[must_use]
pub fn pack_bits(values: &[f32]) -> Vec<u8> {
    let mut packed = vec![0u8; values.len().div_ceil(8)];
    for (i, value) in values.iter().enumerate() {
        if *value > 0.0 {
            packed[i / 8] |= 0x80 >> (i % 8);
        }
    }
    packed
}

/// In-memory index of fixed-width packed binary vectors.
#[derive(Debug, Clone)]
pub struct BinarySearcher {
    bytes_per_vector: usize,
    ids: Vec<i64>,
    data: Vec<u8>,
}

impl BinarySearcher {
    /// Create an empty searcher for vectors of `bytes_per_vector` bytes.
    #[must_use]
    pub fn new(bytes_per_vector: usize) -> Self {
        Self {
            bytes_per_vector,
            ids: Vec::new(),
            data: Vec::new(),
        }
    }

    /// Build a searcher from `(id, vector)` pairs.
    ///
    /// The width is taken from the first vector; returns `None` when the
    /// input is empty.
    pub fn from_vectors(vectors: impl IntoIterator<Item = (i64, Vec<u8>)>) -> Result<Option<Self>> {
        let mut searcher: Option<Self> = None;
        for (id, vector) in vectors {
            let s = searcher.get_or_insert_with(|| Self::new(vector.len()));
            s.add(id, &vector)?;
        }
        Ok(searcher)
    }

    /// Append one vector.
    pub fn add(&mut self, id: i64, vector: &[u8]) -> Result<()> {
        if vector.len() != self.bytes_per_vector || vector.is_empty() {
            return Err(Error::InvalidInput(format!(
                "binary vector {id} has {} bytes, expected {}",
                vector.len(),
                self.bytes_per_vector
            )));
        }
        self.ids.push(id);
        self.data.extend_from_slice(vector);
        Ok(())
    }

    /// Width of every stored vector in bytes.
    #[must_use]
    pub fn bytes_per_vector(&self) -> usize {
        self.bytes_per_vector
    }

    /// Number of stored vectors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Whether no vectors are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// The `top_k` vectors closest to `query`.
    ///
    /// Returns ids and distances, closest first, ties by ascending id.
    pub fn search(&self, query: &[u8], top_k: usize) -> Result<(Vec<i64>, Vec<u32>)> {
        if query.len() != self.bytes_per_vector {
            return Err(Error::InvalidInput(format!(
                "query has {} bytes, expected {}",
                query.len(),
                self.bytes_per_vector
            )));
        }
        if top_k == 0 || self.is_empty() {
            return Ok((Vec::new(), Vec::new()));
        }

        let mut scored = self.distances(query);
        let by_distance_then_id =
            |a: &(u32, i64), b: &(u32, i64)| a.0.cmp(&b.0).then(a.1.cmp(&b.1));
        if top_k < scored.len() {
            scored.select_nth_unstable_by(top_k - 1, by_distance_then_id);
            scored.truncate(top_k);
        }
        scored.sort_unstable_by(by_distance_then_id);

        Ok(scored.into_iter().map(|(d, id)| (id, d)).unzip())
    }

    fn distances(&self, query: &[u8]) -> Vec<(u32, i64)> {
        let width = self.bytes_per_vector;
        if self.len() >= PARALLEL_THRESHOLD {
            self.data
                .par_chunks_exact(width)
                .zip(self.ids.par_iter())
                .map(|(vector, &id)| (hamming_distance(vector, query), id))
                .collect()
        } else {
            self.data
                .chunks_exact(width)
                .zip(&self.ids)
                .map(|(vector, &id)| (hamming_distance(vector, query), id))
                .collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn popcount_table_matches_count_ones() {
        for b in 0..=255u8 {
            assert_eq!(u32::from(POPCOUNT[usize::from(b)]), b.count_ones());
        }
    }

    #[test]
    fn pack_bits_is_msb_first() {
        assert_eq!(pack_bits(&[1.0, -1.0, 0.0, 2.0]), vec![0b1001_0000]);
        assert_eq!(pack_bits(&[1.0; 9]), vec![0xFF, 0x80]);
        assert!(pack_bits(&[]).is_empty());
    }

    #[test]
    fn search_orders_by_distance_then_id() {
        let mut searcher = BinarySearcher::new(1);
        searcher.add(3, &[0b0000_0001]).expect("add");
        searcher.add(1, &[0b0000_0011]).expect("add");
        searcher.add(2, &[0b0000_0001]).expect("add");
        searcher.add(4, &[0b1111_1111]).expect("add");

        let (ids, distances) = searcher.search(&[0b0000_0000], 3).expect("search");
        assert_eq!(ids, vec![2, 3, 1]);
        assert_eq!(distances, vec![1, 1, 2]);
    }

    #[test]
    fn top_k_larger_than_len_returns_everything() {
        let searcher =
            BinarySearcher::from_vectors(vec![(1, vec![0xF0]), (2, vec![0x0F])])
                .expect("build")
                .expect("non-empty");
        let (ids, _) = searcher.search(&[0xF0], 10).expect("search");
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn width_mismatch_is_rejected() {
        let mut searcher = BinarySearcher::new(2);
        assert!(matches!(searcher.add(1, &[0]), Err(Error::InvalidInput(_))));
        assert!(matches!(searcher.search(&[0], 1), Err(Error::InvalidInput(_))));
        assert!(BinarySearcher::from_vectors(vec![(1, vec![0, 0]), (2, vec![0])]).is_err());
    }

    #[test]
    fn empty_input_builds_nothing() {
        let built = BinarySearcher::from_vectors(Vec::new()).expect("build");
        assert!(built.is_none());
    }

    #[test]
    fn parallel_scan_matches_sequential_distances() {
        let mut searcher = BinarySearcher::new(4);
        for id in 0..(PARALLEL_THRESHOLD as i64 + 10) {
            let bytes = (id as u32).wrapping_mul(2_654_435_761).to_le_bytes();
            searcher.add(id, &bytes).expect("add");
        }
        let query = [0xAA, 0x55, 0xAA, 0x55];
        let (ids, distances) = searcher.search(&query, 5).expect("search");

        let mut naive: Vec<(u32, i64)> = (0..searcher.len())
            .map(|i| {
                let v = &searcher.data[i * 4..(i + 1) * 4];
                (hamming_distance(v, &query), searcher.ids[i])
            })
            .collect();
        naive.sort_unstable();
        assert_eq!(distances, naive[..5].iter().map(|p| p.0).collect::<Vec<_>>());
        assert_eq!(ids, naive[..5].iter().map(|p| p.1).collect::<Vec<_>>());
    }
}
