//! Shared hard limits to prevent unbounded allocations at startup.

use crate::error::OctError;

/// Maximum allowed bytes for a single pool slot (default: 64MB).
pub const MAX_SLOT_BYTES: usize = 64 * 1024 * 1024;
/// Maximum supported sector image side length in pixels.
pub const MAX_SECTOR_DIMENSION: u32 = 4096;
/// Maximum number of slots in either pool.
pub const MAX_POOL_SLOTS: usize = 256;

/// Validated frame sizing information.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSize {
    /// Pixels in the sector image.
    pub pixels: usize,
    /// Bytes for all of a frame's image buffers.
    pub bytes: usize,
}

/// Validate sector dimensions and calculate pixel/byte sizes safely.
pub fn validate_sector_size(side: u32, bytes_per_pixel: usize) -> Result<FrameSize, OctError> {
    if side == 0 || side > MAX_SECTOR_DIMENSION {
        return Err(OctError::Configuration(format!(
            "sector size {side} outside 1..={MAX_SECTOR_DIMENSION}"
        )));
    }

    let pixels = (side as usize)
        .checked_mul(side as usize)
        .ok_or_else(|| OctError::BufferAllocation("sector pixel count overflow".into()))?;

    let bytes = pixels
        .checked_mul(bytes_per_pixel)
        .ok_or_else(|| OctError::BufferAllocation("sector byte size overflow".into()))?;

    check_slot_bytes("sector", bytes)?;
    Ok(FrameSize { pixels, bytes })
}

/// Validate the size of a raw acquisition buffer of `lines` records.
pub fn validate_raw_buffer(lines: usize, samples_per_line: usize) -> Result<usize, OctError> {
    let samples = lines
        .checked_mul(samples_per_line)
        .ok_or_else(|| OctError::BufferAllocation("raw buffer sample count overflow".into()))?;
    let bytes = samples
        .checked_mul(std::mem::size_of::<u16>())
        .ok_or_else(|| OctError::BufferAllocation("raw buffer byte size overflow".into()))?;
    check_slot_bytes("raw buffer", bytes)?;
    Ok(samples)
}

/// Validate a pool slot count.
pub fn validate_pool_slots(label: &str, slots: usize) -> Result<(), OctError> {
    if slots == 0 || slots > MAX_POOL_SLOTS {
        return Err(OctError::Configuration(format!(
            "{label} pool slots {slots} outside 1..={MAX_POOL_SLOTS}"
        )));
    }
    Ok(())
}

fn check_slot_bytes(context: &str, bytes: usize) -> Result<(), OctError> {
    if bytes > MAX_SLOT_BYTES {
        return Err(OctError::BufferAllocation(format!(
            "{context} needs {bytes} bytes, limit is {MAX_SLOT_BYTES}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sector_size() {
        let size = validate_sector_size(512, 1).unwrap();
        assert_eq!(size.pixels, 512 * 512);
        assert_eq!(size.bytes, 512 * 512);
    }

    #[test]
    fn test_sector_too_large() {
        assert!(validate_sector_size(MAX_SECTOR_DIMENSION + 1, 1).is_err());
        assert!(validate_sector_size(0, 1).is_err());
    }

    #[test]
    fn test_raw_buffer_limit() {
        assert_eq!(validate_raw_buffer(512, 2048).unwrap(), 512 * 2048);
        assert!(validate_raw_buffer(1 << 20, 1 << 20).is_err());
    }

    #[test]
    fn test_pool_slots() {
        assert!(validate_pool_slots("raw", 32).is_ok());
        assert!(validate_pool_slots("raw", 0).is_err());
        assert!(validate_pool_slots("frame", MAX_POOL_SLOTS + 1).is_err());
    }
}
