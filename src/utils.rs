//! Utility functions

use flate2::Crc;

/// CRC32 of a stored payload, recorded in the durable index
pub fn calculate_checksum(data: &[u8]) -> u32 {
    let mut crc = Crc::new();
    crc.update(data);
    crc.sum()
}

pub fn verify_checksum(data: &[u8], expected: u32) -> bool {
    calculate_checksum(data) == expected
}

/// Human-readable binary size, e.g. `1.50 KiB`
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 6] = ["KiB", "MiB", "GiB", "TiB", "PiB", "EiB"];
    if bytes < 1024 {
        return format!("{} B", bytes);
    }
    let mut size = bytes as f64 / 1024.0;
    let mut unit = 0;
    while size >= 1024.0 && unit + 1 < UNITS.len() {
        size /= 1024.0;
        unit += 1;
    }
    format!("{:.2} {}", size, UNITS[unit])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum() {
        let data = b"123456789";
        assert_eq!(calculate_checksum(data), 0xCBF43926);
        assert!(verify_checksum(data, 0xCBF43926));
        assert!(!verify_checksum(data, 0xCBF43927));
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.50 KiB");
        assert_eq!(format_bytes(1 << 30), "1.00 GiB");
        assert_eq!(format_bytes(u64::MAX), "16.00 EiB");
    }
}
