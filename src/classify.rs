//! Counting and scatter routines used by the in-memory radix passes.
//!
//! All routines index buckets by `(key - offset) >> shift` and never move records, only
//! [`KeyRef`]s pointing to them.

use crate::key::{Key, KeyRef, Keyed};

/// Buckets up to this length are finished with an insertion sort.
const INSERTION_SORT_THRESHOLD: usize = 16;

/// Appends a key reference for every record of `block` to `out` and counts records per bucket.
pub fn classify_block<'a, T: Keyed>(
    block: &'a [T],
    out: &mut Vec<KeyRef<'a, T>>,
    counts: &mut [usize],
    offset: T::Key,
    shift: u32,
) {
    for record in block {
        let key_ref = KeyRef::new(record);
        counts[key_ref.key.bucket_index(offset, shift)] += 1;
        out.push(key_ref);
    }
}

/// Counts key references per bucket.
pub fn count<T: Keyed>(refs: &[KeyRef<'_, T>], counts: &mut [usize], offset: T::Key, shift: u32) {
    for key_ref in refs {
        counts[key_ref.key.bucket_index(offset, shift)] += 1;
    }
}

/// Turns per-bucket counts into bucket start offsets. Returns the total count.
pub fn exclusive_prefix_sum(counts: &mut [usize]) -> usize {
    let mut sum = 0;
    for count in counts.iter_mut() {
        let n = *count;
        *count = sum;
        sum += n;
    }
    return sum;
}

/// Stably scatters `src` into `dst` by bucket using `cursors` as bucket write positions.
/// On return every cursor holds the end offset of its bucket.
pub fn classify<'a, T: Keyed>(
    src: &[KeyRef<'a, T>],
    dst: &mut [KeyRef<'a, T>],
    cursors: &mut [usize],
    offset: T::Key,
    shift: u32,
) {
    debug_assert_eq!(src.len(), dst.len());

    for key_ref in src {
        let bucket = key_ref.key.bucket_index(offset, shift);
        dst[cursors[bucket]] = *key_ref;
        cursors[bucket] += 1;
    }
}

/// Sorts `src` into `dst` by key, preserving the order of equal keys.
///
/// References are distributed into `2^log_k` buckets over the bit window starting at `shift`,
/// then every bucket is sorted on its own.
///
/// # Arguments
/// * `src` - Key references to be sorted
/// * `dst` - Output buffer of the same length as `src`
/// * `log_k` - Logarithm of the number of buckets
/// * `offset` - Smallest key that may occur in `src`
/// * `shift` - Number of low key bits ignored by the bucket index
pub fn local_sort<'a, T: Keyed>(
    src: &[KeyRef<'a, T>],
    dst: &mut [KeyRef<'a, T>],
    log_k: u32,
    offset: T::Key,
    shift: u32,
) {
    let mut counts = vec![0usize; 1 << log_k];

    count(src, &mut counts, offset, shift);
    exclusive_prefix_sum(&mut counts);
    classify(src, dst, &mut counts, offset, shift);

    let mut start = 0;
    for &end in counts.iter() {
        sort_bucket(&mut dst[start..end]);
        start = end;
    }
}

fn sort_bucket<T: Keyed>(refs: &mut [KeyRef<'_, T>]) {
    if refs.len() <= INSERTION_SORT_THRESHOLD {
        insertion_sort(refs);
    } else {
        refs.sort_by_key(|key_ref| key_ref.key);
    }
}

fn insertion_sort<T: Keyed>(refs: &mut [KeyRef<'_, T>]) {
    for i in 1..refs.len() {
        let current = refs[i];
        let mut j = i;
        while j > 0 && refs[j - 1].key > current.key {
            refs[j] = refs[j - 1];
            j -= 1;
        }
        refs[j] = current;
    }
}

/// Returns `floor(log2(n))`, `n` must be positive.
#[inline]
pub fn floor_log2(n: usize) -> u32 {
    debug_assert!(n > 0);
    usize::BITS - 1 - n.leading_zeros()
}

/// Returns `ceil(log2(n))`, `0` for `n <= 1`.
#[inline]
pub fn ceil_log2(n: usize) -> u32 {
    if n <= 1 {
        0
    } else {
        usize::BITS - (n - 1).leading_zeros()
    }
}

/// Logarithm of the first-level fan-out for a bucket of `n` records:
/// the smallest power of two splitting the bucket references into cache-sized parts.
pub fn first_level_log_fan_out(n: usize, ref_size: usize, cache_size: usize, max_bits: u32) -> u32 {
    let bytes = n.saturating_mul(ref_size);
    let parts = (bytes + cache_size.max(1) - 1) / cache_size.max(1);
    ceil_log2(parts).min(max_bits)
}

/// Logarithm of the adaptive second-level fan-out for a sub-bucket of `n` records:
/// `floor(log2(n)) - 1`, saturating at zero.
pub fn second_level_log_fan_out(n: usize, max_bits: u32) -> u32 {
    if n < 2 {
        return 0;
    }
    floor_log2(n).saturating_sub(1).min(max_bits)
}

#[cfg(test)]
mod test {
    use rstest::*;

    use super::*;
    use crate::key::KeyRef;

    fn keys<T: Keyed>(refs: &[KeyRef<'_, T>]) -> Vec<T::Key> {
        refs.iter().map(|key_ref| key_ref.key).collect()
    }

    #[test]
    fn test_classify_block() {
        let block: Vec<u32> = vec![0x1000_0000, 0xF000_0000, 0x1000_0001, 0x7000_0000];
        let mut refs = Vec::new();
        let mut counts = vec![0usize; 4];

        classify_block(&block, &mut refs, &mut counts, 0, 30);

        assert_eq!(counts, vec![2, 1, 0, 1]);
        assert_eq!(keys(&refs), block);
        assert!(refs.iter().zip(block.iter()).all(|(r, b)| std::ptr::eq(r.record, b)));
    }

    #[test]
    fn test_classify_block_appends() {
        let first: Vec<u8> = vec![1, 2];
        let second: Vec<u8> = vec![3];
        let mut refs = Vec::new();
        let mut counts = vec![0usize; 1];

        classify_block(&first, &mut refs, &mut counts, 0, 8);
        classify_block(&second, &mut refs, &mut counts, 0, 8);

        assert_eq!(counts, vec![3]);
        assert_eq!(keys(&refs), vec![1, 2, 3]);
    }

    #[rstest]
    #[case(vec![], vec![], 0)]
    #[case(vec![3], vec![0], 3)]
    #[case(vec![2, 0, 3, 1], vec![0, 2, 2, 5], 6)]
    fn test_exclusive_prefix_sum(#[case] mut counts: Vec<usize>, #[case] expected: Vec<usize>, #[case] total: usize) {
        assert_eq!(exclusive_prefix_sum(&mut counts), total);
        assert_eq!(counts, expected);
    }

    #[test]
    fn test_classify_is_stable() {
        let records: Vec<(u8, usize)> = vec![(0x30, 0), (0x10, 1), (0x31, 2), (0x12, 3), (0x11, 4), (0x30, 5)];
        let refs: Vec<KeyRef<_>> = records.iter().map(KeyRef::new).collect();
        let mut out = refs.clone();
        let mut counts = vec![0usize; 4];

        count(&refs, &mut counts, 0, 4);
        exclusive_prefix_sum(&mut counts);
        classify(&refs, &mut out, &mut counts, 0, 4);

        let order: Vec<usize> = out.iter().map(|r| r.record.1).collect();
        assert_eq!(order, vec![1, 3, 4, 0, 2, 5]);
        assert_eq!(counts, vec![0, 3, 3, 6]);
    }

    #[rstest]
    #[case(0)]
    #[case(1)]
    #[case(3)]
    fn test_local_sort(#[case] log_k: u32) {
        let records: Vec<(u16, usize)> = (0..200).map(|i| (((i * 7919) % 61) as u16, i)).collect();
        let src: Vec<KeyRef<_>> = records.iter().map(KeyRef::new).collect();
        let mut dst = src.clone();

        local_sort(&src, &mut dst, log_k, 0, 6 - log_k);

        let mut expected = records.clone();
        expected.sort_by_key(|r| r.0);
        let actual: Vec<(u16, usize)> = dst.iter().map(|r| *r.record).collect();
        assert_eq!(actual, expected);
    }

    #[test]
    fn test_local_sort_with_offset() {
        let records: Vec<u32> = vec![0x0500_0003, 0x0500_0001, 0x0500_0002, 0x0500_0001];
        let src: Vec<KeyRef<_>> = records.iter().map(KeyRef::new).collect();
        let mut dst = src.clone();

        local_sort(&src, &mut dst, 1, 0x0500_0000, 1);

        assert_eq!(keys(&dst), vec![0x0500_0001, 0x0500_0001, 0x0500_0002, 0x0500_0003]);
        assert!(std::ptr::eq(dst[0].record, &records[1]));
        assert!(std::ptr::eq(dst[1].record, &records[3]));
    }

    #[rstest]
    #[case(1, 0)]
    #[case(2, 1)]
    #[case(3, 1)]
    #[case(4, 2)]
    #[case(1023, 9)]
    #[case(1024, 10)]
    #[case(1025, 10)]
    fn test_floor_log2(#[case] n: usize, #[case] expected: u32) {
        assert_eq!(floor_log2(n), expected);
    }

    #[rstest]
    #[case(0, 0)]
    #[case(1, 0)]
    #[case(2, 1)]
    #[case(3, 2)]
    #[case(4, 2)]
    #[case(1024, 10)]
    #[case(1025, 11)]
    fn test_ceil_log2(#[case] n: usize, #[case] expected: u32) {
        assert_eq!(ceil_log2(n), expected);
    }

    #[rstest]
    #[case(0, 0)]
    #[case(64, 0)]
    #[case(65, 1)]
    #[case(128, 1)]
    #[case(129, 2)]
    #[case(256, 2)]
    #[case(257, 3)]
    fn test_first_level_log_fan_out(#[case] n: usize, #[case] expected: u32) {
        // 16 byte references, 1 KiB cache: 64 references per cache
        assert_eq!(first_level_log_fan_out(n, 16, 1024, 32), expected);
    }

    #[test]
    fn test_first_level_log_fan_out_is_bounded() {
        assert_eq!(first_level_log_fan_out(1 << 20, 16, 1, 5), 5);
        assert_eq!(first_level_log_fan_out(1 << 20, 16, 0, 64), 24);
    }

    #[rstest]
    #[case(0, 0)]
    #[case(1, 0)]
    #[case(2, 0)]
    #[case(3, 0)]
    #[case(4, 1)]
    #[case(7, 1)]
    #[case(8, 2)]
    #[case(1 << 20, 19)]
    fn test_second_level_log_fan_out(#[case] n: usize, #[case] expected: u32) {
        assert_eq!(second_level_log_fan_out(n, 32), expected);
    }

    #[test]
    fn test_second_level_log_fan_out_is_bounded() {
        assert_eq!(second_level_log_fan_out(1 << 20, 3), 3);
    }
}
