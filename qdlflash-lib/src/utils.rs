use crc::{CRC_32_ISO_HDLC, Crc};
use std::num::ParseIntError;

/// CRC used by protocol frames and on-device partition tables.
pub const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

pub struct Utils;
impl Utils {
    /// Parses sizes such as `4096`, `0x1000`, `16M` or `4G` (binary multiples).
    pub fn str_to_u64(s: &str) -> Result<u64, ParseIntError> {
        let s = s.trim();

        let (num_str, multiplier) = match s.chars().last() {
            Some('k') | Some('K') => (&s[..s.len() - 1], 1u64 << 10),
            Some('m') | Some('M') => (&s[..s.len() - 1], 1u64 << 20),
            Some('g') | Some('G') => (&s[..s.len() - 1], 1u64 << 30),
            _ => (s, 1),
        };

        let unsigned: u64 = if let Some(hex) = num_str.strip_prefix("0x") {
            u64::from_str_radix(hex, 16)?
        } else if let Some(bin) = num_str.strip_prefix("0b") {
            u64::from_str_radix(bin, 2)?
        } else {
            num_str.parse()?
        };

        Ok(unsigned.saturating_mul(multiplier))
    }

    pub fn crc32(data: &[u8]) -> u32 {
        CRC32.checksum(data)
    }

    /// True when an I/O error means the disk (or quota) is full.
    pub fn is_storage_full(err: &std::io::Error) -> bool {
        if err.kind() == std::io::ErrorKind::StorageFull {
            return true;
        }
        // ENOSPC / EDQUOT on unix, ERROR_DISK_FULL / ERROR_HANDLE_DISK_FULL on windows
        #[cfg(unix)]
        let codes: &[i32] = &[28, 122];
        #[cfg(not(unix))]
        let codes: &[i32] = &[39, 112];
        err.raw_os_error().is_some_and(|code| codes.contains(&code))
    }

    pub fn format_bytes(bytes: u64) -> String {
        const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
        let mut value = bytes as f64;
        let mut unit = 0;
        while value >= 1024.0 && unit < UNITS.len() - 1 {
            value /= 1024.0;
            unit += 1;
        }
        if unit == 0 {
            format!("{} {}", bytes, UNITS[0])
        } else {
            format!("{:.1} {}", value, UNITS[unit])
        }
    }
}
