//! CRC32 helpers shared by the page codec and the container header.

/// CRC32 of `data`.
#[inline]
pub fn compute_checksum(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

#[inline]
pub fn verify_checksum(data: &[u8], expected: u32) -> bool {
    compute_checksum(data) == expected
}

/// CRC32 over a record whose trailing 4 bytes hold the checksum itself.
///
/// Returns `None` when the record is too short to carry a checksum.
pub fn trailing_checksum(record: &[u8]) -> Option<u32> {
    let body = record.len().checked_sub(4)?;
    Some(compute_checksum(&record[..body]))
}
