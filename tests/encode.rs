use kmer_code_index::encode::*;

#[test]
fn test_encode_lsb_aligned() {
    let code = encode_kmer(b"AC").unwrap();
    assert_eq!(code, 0b0001);
    assert_eq!(encode_kmer(b"acgu"), encode_kmer(b"ACGT"));
    assert_eq!(encode_kmer(b"ACGT").unwrap(), 0b00011011);
}

#[test]
fn test_encode_rejects() {
    assert_eq!(encode_kmer(b""), None);
    assert_eq!(encode_kmer(b"ANG"), None);
    assert_eq!(encode_kmer(&[b'A'; 33]), None);
    assert_eq!(encode_kmer(&[b'T'; 32]), Some(u64::MAX));
}

#[test]
fn test_map_base_and_mask() {
    assert_eq!(map_base(b'G'), Some(2));
    assert_eq!(map_base(b'N'), None);
    assert_eq!(kmer_mask(1), 0b11);
    assert_eq!(kmer_mask(4), 0xFF);
    assert_eq!(kmer_mask(32), u64::MAX);
}

#[test]
fn test_collection_positions_are_global() {
    let c = SequenceCollection::from_sequences(3, [&b"AAAC"[..], b"GG", b"CCCA"]);
    assert_eq!(c.num_sequences(), 3);
    assert_eq!(c.sequence_range(1), 4..6);
    assert_eq!(c.num_first_codes(), 2);

    let mut first = Vec::new();
    c.for_each_first_code(|code, pos| first.push((code, pos)));
    assert_eq!(
        first,
        vec![(encode_kmer(b"AAA").unwrap(), 0), (encode_kmer(b"CCC").unwrap(), 6)]
    );

    let mut inner = Vec::new();
    c.for_each_inner_code(|code, pos| inner.push((code, pos)));
    assert_eq!(
        inner,
        vec![(encode_kmer(b"AAC").unwrap(), 1), (encode_kmer(b"CCA").unwrap(), 7)]
    );
}
