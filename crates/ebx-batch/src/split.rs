//! Byte-range splitting of an archive into upload parts

use ebx_core::{EbxError, EbxResult};
use ebx_crypto::BLOCK_SIZE;

/// One contiguous byte range of the archive, 1-based ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartRange {
    pub ordinal: u32,
    pub offset: u64,
    pub len: u64,
}

impl PartRange {
    pub fn end(&self) -> u64 {
        self.offset + self.len
    }
}

/// Split `archive_size` bytes into `parts` ranges that cover it exactly.
///
/// Sizes differ by at most one byte; the larger ranges come first, so the
/// final range is never longer than the others. No range is empty.
pub fn split_ranges(archive_size: u64, parts: usize) -> EbxResult<Vec<PartRange>> {
    let invalid = || EbxError::InvalidPartCount {
        requested: parts,
        archive_size,
    };
    if parts == 0 || parts as u64 > archive_size || u32::try_from(parts).is_err() {
        return Err(invalid());
    }

    let n = parts as u64;
    let base = archive_size / n;
    let extra = archive_size % n;

    let mut ranges = Vec::with_capacity(parts);
    let mut offset = 0u64;
    for i in 0..n {
        let len = base + u64::from(i < extra);
        ranges.push(PartRange {
            ordinal: i as u32 + 1,
            offset,
            len,
        });
        offset += len;
    }
    Ok(ranges)
}

/// Smallest part count whose encrypted parts all fit in `max_part_size`.
///
/// Accounts for the PKCS#7 padding block each part gains on encryption.
pub fn parts_for_size(archive_size: u64, max_part_size: u64) -> EbxResult<usize> {
    let usable = max_part_size.saturating_sub(BLOCK_SIZE as u64);
    if usable == 0 {
        return Err(EbxError::Config(format!(
            "max_part_size {max_part_size} leaves no room for a padded block"
        )));
    }
    let parts = archive_size.div_ceil(usable).max(1);
    usize::try_from(parts).map_err(|_| EbxError::InvalidPartCount {
        requested: usize::MAX,
        archive_size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ebx_crypto::padded_len;
    use proptest::prelude::*;

    #[test]
    fn single_part_covers_everything() {
        let ranges = split_ranges(10, 1).unwrap();
        assert_eq!(
            ranges,
            vec![PartRange {
                ordinal: 1,
                offset: 0,
                len: 10
            }]
        );
    }

    #[test]
    fn remainder_goes_to_leading_parts() {
        let lens: Vec<u64> = split_ranges(10, 3).unwrap().iter().map(|r| r.len).collect();
        assert_eq!(lens, vec![4, 3, 3]);
    }

    #[test]
    fn one_byte_parts_are_allowed() {
        let ranges = split_ranges(7, 7).unwrap();
        assert!(ranges.iter().all(|r| r.len == 1));
    }

    #[test]
    fn more_parts_than_bytes_is_rejected() {
        let err = split_ranges(5, 6).unwrap_err();
        assert!(matches!(
            err,
            EbxError::InvalidPartCount {
                requested: 6,
                archive_size: 5
            }
        ));
    }

    #[test]
    fn zero_parts_is_rejected() {
        assert!(matches!(
            split_ranges(5, 0),
            Err(EbxError::InvalidPartCount { .. })
        ));
    }

    #[test]
    fn parts_for_size_respects_padding() {
        // 32 bytes fit in one 48-byte part (32 + 16 padding)
        assert_eq!(parts_for_size(32, 48).unwrap(), 1);
        // 33 bytes would pad to 48 but 33 > usable 32: two parts
        assert_eq!(parts_for_size(33, 48).unwrap(), 2);
        assert_eq!(parts_for_size(0, 48).unwrap(), 1);
        assert!(matches!(parts_for_size(10, 16), Err(EbxError::Config(_))));
    }

    proptest! {
        #[test]
        fn ranges_tile_the_archive(size in 1u64..100_000, parts in 1usize..64) {
            prop_assume!(parts as u64 <= size);
            let ranges = split_ranges(size, parts).unwrap();

            prop_assert_eq!(ranges.len(), parts);
            let mut expected_offset = 0;
            for (i, r) in ranges.iter().enumerate() {
                prop_assert_eq!(r.ordinal as usize, i + 1);
                prop_assert_eq!(r.offset, expected_offset);
                prop_assert!(r.len > 0);
                prop_assert!(r.len <= ranges[0].len);
                expected_offset = r.end();
            }
            prop_assert_eq!(expected_offset, size);
        }

        #[test]
        fn computed_part_count_fits_limit(size in 1u64..10_000_000, max in 17u64..2_000_000) {
            let parts = parts_for_size(size, max).unwrap();
            prop_assume!(parts as u64 <= size);
            let ranges = split_ranges(size, parts).unwrap();
            prop_assert!(ranges.iter().all(|r| padded_len(r.len) <= max));
        }
    }
}
