pub fn round_size_up_to_alignment_u32(
    size: u32,
    required_alignment: u32,
) -> u32 {
    assert!(required_alignment > 0);
    ((size + required_alignment - 1) / required_alignment) * required_alignment
}

pub fn round_size_up_to_alignment_u64(
    size: u64,
    required_alignment: u64,
) -> u64 {
    assert!(required_alignment > 0);
    ((size + required_alignment - 1) / required_alignment) * required_alignment
}

pub fn greatest_common_divisor_u64(
    mut a: u64,
    mut b: u64,
) -> u64 {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

/// Smallest value that is a multiple of both alignments. Used to merge a caller's alignment with the
/// device's non-coherent atom size, which may be a non-power-of-two multiple (e.g. 12 for RGB16 texels)
pub fn least_common_multiple_u64(
    a: u64,
    b: u64,
) -> u64 {
    assert!(a > 0 && b > 0);
    a / greatest_common_divisor_u64(a, b) * b
}

pub fn slice_size_in_bytes<T>(slice: &[T]) -> usize {
    let range = slice.as_ptr_range();
    (range.end as *const u8 as usize) - (range.start as *const u8 as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_up() {
        assert_eq!(round_size_up_to_alignment_u64(100, 16), 112);
        assert_eq!(round_size_up_to_alignment_u64(112, 16), 112);
        assert_eq!(round_size_up_to_alignment_u64(0, 16), 0);
        assert_eq!(round_size_up_to_alignment_u32(5, 4), 8);
        assert_eq!(round_size_up_to_alignment_u32(7, 1), 7);
    }

    #[test]
    #[should_panic]
    fn test_round_up_zero_alignment() {
        round_size_up_to_alignment_u64(5, 0);
    }

    #[test]
    fn test_least_common_multiple() {
        assert_eq!(least_common_multiple_u64(16, 64), 64);
        assert_eq!(least_common_multiple_u64(64, 16), 64);
        assert_eq!(least_common_multiple_u64(12, 64), 192);
        assert_eq!(least_common_multiple_u64(6, 4), 12);
        assert_eq!(least_common_multiple_u64(1, 1), 1);
    }

    #[test]
    fn test_slice_size_in_bytes() {
        let data = [0u32; 5];
        assert_eq!(slice_size_in_bytes(&data), 20);
        let empty: [u64; 0] = [];
        assert_eq!(slice_size_in_bytes(&empty), 0);
    }
}
