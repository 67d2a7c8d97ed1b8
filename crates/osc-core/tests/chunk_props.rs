use osc_core::{ChunkIterator, ColumnValues, KeyRange, MigrationError, Value};
use proptest::prelude::*;
use std::collections::BTreeSet;
use std::ops::Bound;

/// Keys of a table, answering bounds queries the way the database would
struct KeySource {
    keys: BTreeSet<i64>,
}

impl KeySource {
    fn global(&self) -> Option<KeyRange> {
        let min = *self.keys.iter().next()?;
        let max = *self.keys.iter().next_back()?;
        Some(KeyRange::new(ColumnValues::int(min), ColumnValues::int(max)))
    }

    fn next_chunk(&self, after: Option<&ColumnValues>, upper: &ColumnValues, size: u64) -> Option<KeyRange> {
        let lower = match after.map(|a| &a.values()[0]) {
            Some(Value::Int(a)) => Bound::Excluded(*a),
            _ => Bound::Unbounded,
        };
        let Value::Int(upper) = upper.values()[0] else {
            return None;
        };
        let take = usize::try_from(size).unwrap();
        let keys: Vec<i64> = self
            .keys
            .range((lower, Bound::Included(upper)))
            .take(take)
            .copied()
            .collect();
        Some(KeyRange::new(
            ColumnValues::int(*keys.first()?),
            ColumnValues::int(*keys.last()?),
        ))
    }

    fn chunks(&self, size: u64) -> Result<Vec<KeyRange>, MigrationError> {
        let mut it = ChunkIterator::new(self.global());
        let mut out = Vec::new();
        while let Some(req) = it.pending() {
            let bounds = self.next_chunk(req.after.as_ref(), &req.upper, size);
            match it.advance(bounds)? {
                Some(chunk) => out.push(chunk),
                None => break,
            }
        }
        Ok(out)
    }
}

fn int(v: &ColumnValues) -> i64 {
    v.values()[0].as_int().unwrap()
}

#[test]
fn test_dense_range_example() {
    let source = KeySource {
        keys: (1..=2500).collect(),
    };
    let chunks = source.chunks(1000).unwrap();
    let bounds: Vec<(i64, i64)> = chunks.iter().map(|c| (int(&c.min), int(&c.max))).collect();
    assert_eq!(bounds, vec![(1, 1000), (1001, 2000), (2001, 2500)]);
}

#[test]
fn test_empty_table_has_no_chunks() {
    let source = KeySource {
        keys: BTreeSet::new(),
    };
    assert!(source.chunks(1000).unwrap().is_empty());
}

#[test]
fn test_single_row_table() {
    let source = KeySource {
        keys: BTreeSet::from([42]),
    };
    let chunks = source.chunks(1000).unwrap();
    assert_eq!(chunks.len(), 1);
    assert_eq!(int(&chunks[0].min), 42);
    assert_eq!(int(&chunks[0].max), 42);
}

proptest! {
    #[test]
    fn prop_chunks_cover_every_key_exactly_once(
        keys in proptest::collection::btree_set(-10_000i64..10_000, 0..600),
        size in 1u64..200,
    ) {
        let source = KeySource { keys: keys.clone() };
        let chunks = source.chunks(size).unwrap();

        let mut covered = BTreeSet::new();
        let mut previous_max: Option<i64> = None;
        for chunk in &chunks {
            let (lo, hi) = (int(&chunk.min), int(&chunk.max));
            prop_assert!(lo <= hi);
            if let Some(p) = previous_max {
                prop_assert!(lo > p, "chunk [{}, {}] does not advance past {}", lo, hi, p);
                // contiguous: no key between the previous chunk and this one
                prop_assert_eq!(keys.range(p + 1..lo).count(), 0);
            }
            let in_chunk: Vec<i64> = keys.range(lo..=hi).copied().collect();
            prop_assert!(in_chunk.len() as u64 <= size);
            covered.extend(in_chunk);
            previous_max = Some(hi);
        }

        prop_assert_eq!(covered, keys.clone());
        if let (Some(first), Some(last)) = (chunks.first(), chunks.last()) {
            prop_assert_eq!(Some(&int(&first.min)), keys.iter().next());
            prop_assert_eq!(Some(&int(&last.max)), keys.iter().next_back());
        }
    }

    #[test]
    fn prop_chunk_count_matches_density(
        keys in proptest::collection::btree_set(0i64..50_000, 1..500),
        size in 1u64..100,
    ) {
        let source = KeySource { keys: keys.clone() };
        let chunks = source.chunks(size).unwrap();
        let expected = (keys.len() as u64).div_ceil(size);
        prop_assert_eq!(chunks.len() as u64, expected);
    }
}
