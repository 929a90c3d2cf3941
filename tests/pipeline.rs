use kmer_code_index::*;
use std::collections::{BTreeMap, BTreeSet};

fn scenario(cfg: IndexConfig) -> CodeIndex {
    build_code_index(&CodeList::new(vec![5, 1, 5, 3, 1, 1]), cfg).unwrap()
}

/// Small deterministic generator so the fixtures do not depend on a RNG crate.
fn lcg(state: &mut u64) -> u64 {
    *state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
    *state >> 33
}

fn random_sequences(seed: u64, count: usize) -> Vec<Vec<u8>> {
    let mut s = seed;
    (0..count)
        .map(|_| {
            let len = 2 + (lcg(&mut s) % 60) as usize;
            (0..len)
                .map(|_| match lcg(&mut s) % 41 {
                    40 => b'N',
                    r => b"ACGT"[(r % 4) as usize],
                })
                .collect()
        })
        .collect()
}

/// Positions every bucket must receive, keyed by code.
fn reference(source: &impl CodeSource) -> BTreeMap<u64, BTreeSet<u64>> {
    let mut buckets: BTreeMap<u64, BTreeSet<u64>> = BTreeMap::new();
    source.for_each_first_code(|code, pos| {
        buckets.entry(code).or_default().insert(pos);
    });
    source.for_each_inner_code(|code, pos| {
        if let Some(b) = buckets.get_mut(&code) {
            b.insert(pos);
        }
    });
    buckets
}

fn check_insert(source: &SequenceCollection, cfg: IndexConfig) -> CodeIndex {
    let mut idx = build_code_index(source, cfg).unwrap();
    let expected = reference(source);
    assert_eq!(idx.differentcodes(), expected.len());
    assert_eq!(
        idx.total_suffixes(),
        expected.values().map(|b| b.len() as u64).sum::<u64>()
    );

    let table = idx.insert_all(source).unwrap();
    assert_eq!(table.len() as u64, idx.total_suffixes());
    let mut start = 0usize;
    for (i, (code, positions)) in expected.iter().enumerate() {
        assert_eq!(idx.code(i), *code);
        let end = start + idx.count(i) as usize;
        let got: BTreeSet<u64> = table[start..end].iter().copied().collect();
        assert_eq!(&got, positions, "bucket {i} (code {code})");
        // every claim of the bucket was used
        assert_eq!(idx.leftborder(i), start as u64);
        start = end;
    }
    idx
}

#[test]
fn scenario_borders_and_claims() {
    let mut idx = scenario(IndexConfig::default());
    assert_eq!(idx.differentcodes(), 3);
    assert_eq!((0..3).map(|i| idx.code(i)).collect::<Vec<_>>(), vec![1, 3, 5]);
    assert_eq!((0..3).map(|i| idx.count(i)).collect::<Vec<_>>(), vec![3, 1, 2]);
    assert_eq!(
        (0..=3).map(|i| idx.leftborder(i)).collect::<Vec<_>>(),
        vec![3, 4, 6, 6]
    );

    let mut target = vec![0u64; 6];
    idx.for_each_part(&mut target, 1, |_, part| {
        assert_eq!(part.claim(0), 2);
        assert_eq!(part.claim(0), 1);
        assert_eq!(part.claim(0), 0);
        assert_eq!(part.claim(1), 3);
        assert_eq!(part.claim(2), 5);
        assert_eq!(part.claim(2), 4);
        Ok(())
    })
    .unwrap();
}

#[test]
#[should_panic(expected = "exhausted")]
fn claim_past_count_panics() {
    let mut idx = scenario(IndexConfig::default());
    let mut target = vec![0u64; 6];
    // buckets 0..1, 1..2 and 2..3 end up in separate parts
    let _ = idx.for_each_part(&mut target, 3, |_, part| {
        if part.buckets() == (1..2) {
            part.claim(1);
            part.claim(1);
        }
        Ok(())
    });
}

#[test]
#[cfg(debug_assertions)]
#[should_panic(expected = "bucket 1 exhausted")]
fn over_claim_of_middle_bucket_panics() {
    let mut idx = scenario(IndexConfig::default());
    let mut target = vec![0u64; 6];
    // one part: bucket 1 sits between buckets 0 and 2 of the same part
    let _ = idx.for_each_part(&mut target, 1, |_, part| {
        part.claim(1);
        part.claim(1);
        Ok(())
    });
}

#[test]
fn parallel_insert_matches_reference() {
    let seqs = random_sequences(7, 300);
    let source = SequenceCollection::from_sequences(3, &seqs);
    let idx = check_insert(&source, IndexConfig::default().threads(4).radix_buffer_log(1));
    assert!(idx.first_code_hits() > 0);
}

#[test]
fn single_thread_insert_matches_reference() {
    let seqs = random_sequences(11, 120);
    let source = SequenceCollection::from_sequences(4, &seqs);
    check_insert(&source, IndexConfig::default().bscache_depth(2));
}

#[test]
fn spilled_insert_matches_reference() {
    let seqs = random_sequences(23, 200);
    let source = SequenceCollection::from_sequences(3, &seqs);
    let idx = check_insert(&source, IndexConfig::default().threads(2).force_spill(true));
    let path = idx.spill_path().expect("leftborder spilled");
    assert!(path.exists());
    drop(idx);
    assert!(!path.exists());
}

#[test]
fn sixty_four_bit_counters() {
    let seqs = random_sequences(5, 80);
    let source = SequenceCollection::from_sequences(2, &seqs);
    check_insert(
        &source,
        IndexConfig::default().counter_width(CounterWidth::U64).threads(3),
    );
}

#[test]
fn overflowing_borders_match_reference() {
    let seqs = random_sequences(31, 150);
    let source = SequenceCollection::from_sequences(3, &seqs);
    let idx = check_insert(
        &source,
        IndexConfig::default()
            .counter_width(CounterWidth::U64)
            .threads(3)
            .force_overflow(true),
    );
    assert!(idx.total_suffixes() > 255);
    let first_high = idx.partial_sums().borders().overflow_index().expect("overflow table in use");
    assert!(first_high < idx.differentcodes());
    // claims moved the border down to the bucket start
    assert!(idx.leftborder(first_high) + idx.count(first_high) > 255);
}

#[test]
fn spilled_overflowing_borders_match_reference() {
    let seqs = random_sequences(37, 150);
    let source = SequenceCollection::from_sequences(3, &seqs);
    let idx = check_insert(
        &source,
        IndexConfig::default().threads(2).force_spill(true).force_overflow(true),
    );
    assert!(idx.partial_sums().borders().is_mapped());
    assert!(idx.partial_sums().borders().overflow_index().is_some());
}

#[test]
fn budget_splits_insert_into_sequential_parts() {
    let seqs = random_sequences(41, 300);
    let source = SequenceCollection::from_sequences(3, &seqs);
    let cfg = IndexConfig::default().threads(2).force_spill(true);
    let expected = reference(&source);

    // space left over by an unlimited build; a third of the suffix table fits next to it
    let mut idx = build_code_index(&source, cfg.clone()).unwrap();
    let used = idx.spacelog().total();
    let room = idx.total_suffixes() as usize * 8 / 3;
    assert!(idx.num_first_codes() * 8 < room);
    let mut idx_limited = build_code_index(&source, cfg.memory_limit(used + room)).unwrap();
    assert_eq!(idx_limited.spacelog().total(), used);

    let mut table = Vec::new();
    let mut emitted = Vec::new();
    let parts = idx_limited
        .insert_suffixes(&source, |slots, positions| {
            assert_eq!(slots.start, table.len() as u64);
            assert_eq!(positions.len() as u64, slots.end - slots.start);
            assert!(positions.len() * 8 <= room);
            emitted.push(slots);
            table.extend_from_slice(positions);
            Ok(())
        })
        .unwrap();
    assert!(parts.len() >= 3, "{} parts", parts.len());
    assert_eq!(emitted.len(), parts.len());
    assert_eq!(table.len() as u64, idx_limited.total_suffixes());
    assert_eq!(idx_limited.spacelog().get("suffixtable"), None);
    assert_eq!(idx_limited.spacelog().total(), used);

    // same buckets as a single-part insert
    assert_eq!(idx.insert_all(&source).unwrap().len(), table.len());
    let mut start = 0usize;
    for (i, positions) in expected.values().enumerate() {
        let end = start + idx_limited.count(i) as usize;
        let got: BTreeSet<u64> = table[start..end].iter().copied().collect();
        assert_eq!(&got, positions, "bucket {i}");
        start = end;
    }
}

#[test]
fn impossible_budget_is_reported() {
    let codes: Vec<u64> = (0..1000).collect();
    let Err(err) = build_code_index(&CodeList::new(codes), IndexConfig::default().memory_limit(1000)) else {
        panic!("a 1000 byte budget cannot hold 1000 codes");
    };
    match err {
        IndexError::MemoryBudget { required, limit, shortfall, .. } => {
            assert_eq!(limit, 1000);
            assert_eq!(shortfall, required - limit);
            assert!(shortfall > 0);
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[test]
fn empty_source() {
    let source = SequenceCollection::from_sequences(5, [&b"ACG"[..]]);
    let mut idx = build_code_index(&source, IndexConfig::default()).unwrap();
    assert_eq!(idx.differentcodes(), 0);
    assert_eq!(idx.total_suffixes(), 0);
    assert!(idx.insert_all(&source).unwrap().is_empty());
    let parts = idx.insert_suffixes(&source, |_, _| panic!("nothing to emit")).unwrap();
    assert!(parts.is_empty());
}
