//! Utility functions

/// Object name of the dataset write lock
pub const LOCK_FILE: &str = "dataset.lock";

/// Prefix under which block data lives
pub const DATA_PREFIX: &str = "data";

/// Calculate checksum (CRC32) for data
pub fn calculate_checksum(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// Verify checksum
pub fn verify_checksum(data: &[u8], expected: u32) -> bool {
    calculate_checksum(data) == expected
}

/// Format byte size in human-readable form
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];

    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.2} {}", size, UNITS[unit_idx])
    }
}

/// Zero-padded hex name for `index` out of `count`, split into two-digit
/// directories ahead of the last four digits: `002a`, `01/a2b3`.
pub fn hex_path(index: u64, count: u64) -> String {
    let bits = 64 - count.saturating_sub(1).leading_zeros() as usize;
    let mut digits = ((bits + 3) / 4).max(4);
    if digits % 2 == 1 {
        digits += 1;
    }
    let hex = format!("{:0width$x}", index, width = digits);
    let split = hex.len() - 4;
    let mut ret = String::with_capacity(hex.len() + split / 2);
    for pair in hex[..split].as_bytes().chunks(2) {
        ret.push_str(std::str::from_utf8(pair).unwrap_or_default());
        ret.push('/');
    }
    ret.push_str(&hex[split..]);
    ret
}

/// Object holding a single block
pub fn block_path(field: &str, timestep: u32, block: u64, total_blocks: u64) -> String {
    format!(
        "{}/{}/{}/{}.bin",
        DATA_PREFIX,
        field,
        timestep,
        hex_path(block, total_blocks)
    )
}

/// Container object holding a run of blocks
pub fn packed_path(field: &str, timestep: u32, file_index: u64, total_files: u64) -> String {
    format!(
        "{}/{}/{}/{}.idx",
        DATA_PREFIX,
        field,
        timestep,
        hex_path(file_index, total_files)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum() {
        let data = b"Hello, world!";
        let checksum = calculate_checksum(data);
        assert!(verify_checksum(data, checksum));
        assert!(!verify_checksum(data, checksum.wrapping_add(1)));
        // standard CRC-32 check value
        assert_eq!(calculate_checksum(b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(1048576), "1.00 MB");
        assert_eq!(format_bytes(1073741824), "1.00 GB");
    }

    #[test]
    fn test_hex_path() {
        assert_eq!(hex_path(0, 1), "0000");
        assert_eq!(hex_path(42, 64), "002a");
        assert_eq!(hex_path(0xffff, 1 << 16), "ffff");
        assert_eq!(hex_path(0x1a2b3, 1 << 20), "01/a2b3");
        assert_eq!(hex_path(0x123456789, 1 << 40), "01/23/45/6789");
    }

    #[test]
    fn test_block_paths() {
        assert_eq!(block_path("temp", 0, 42, 64), "data/temp/0/002a.bin");
        assert_eq!(block_path("temp", 3, 0x1a2b3, 1 << 20), "data/temp/3/01/a2b3.bin");
        assert_eq!(packed_path("temp", 1, 2, 8), "data/temp/1/0002.idx");
    }
}
