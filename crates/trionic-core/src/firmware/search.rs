//! Byte pattern helpers shared by the firmware loaders

/// First offset at or after `from` where `pattern` occurs
pub(crate) fn find(data: &[u8], pattern: &[u8], from: usize) -> Option<usize> {
    if pattern.is_empty() || from >= data.len() {
        return None;
    }
    data[from..]
        .windows(pattern.len())
        .position(|w| w == pattern)
        .map(|p| p + from)
}

/// Like [`find`], but only bytes whose mask entry is set have to match
pub(crate) fn find_masked(data: &[u8], pattern: &[u8], mask: &[bool], from: usize) -> Option<usize> {
    debug_assert_eq!(pattern.len(), mask.len());
    if pattern.is_empty() || from >= data.len() {
        return None;
    }
    data[from..]
        .windows(pattern.len())
        .position(|w| {
            w.iter()
                .zip(pattern)
                .zip(mask)
                .all(|((b, p), m)| !m || b == p)
        })
        .map(|p| p + from)
}

pub(crate) fn be32(data: &[u8], offset: usize) -> Option<u32> {
    let b = data.get(offset..offset.checked_add(4)?)?;
    Some(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
}

pub(crate) fn be16(data: &[u8], offset: usize) -> Option<u16> {
    let b = data.get(offset..offset.checked_add(2)?)?;
    Some(u16::from_be_bytes([b[0], b[1]]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_respects_start() {
        let data = [1, 2, 3, 1, 2, 3];
        assert_eq!(find(&data, &[1, 2], 0), Some(0));
        assert_eq!(find(&data, &[1, 2], 1), Some(3));
        assert_eq!(find(&data, &[4], 0), None);
        assert_eq!(find(&data, &[1], 10), None);
    }

    #[test]
    fn test_find_masked_wildcards() {
        let data = [0x00, 0x48, 0x99, 0x7C, 0x48, 0x11, 0x7D];
        let pattern = [0x48, 0x00, 0x7D];
        let mask = [true, false, true];
        assert_eq!(find_masked(&data, &pattern, &mask, 0), Some(4));
    }

    #[test]
    fn test_reads_stay_in_bounds() {
        let data = [0x12, 0x34, 0x56, 0x78];
        assert_eq!(be32(&data, 0), Some(0x1234_5678));
        assert_eq!(be32(&data, 1), None);
        assert_eq!(be16(&data, 2), Some(0x5678));
        assert_eq!(be16(&data, usize::MAX), None);
    }
}
