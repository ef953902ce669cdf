//! 块位图与 inode 位图，第 `i` 位为1表示组内第 `i` 个对象已被占用

/// 在前 `len` 位中自第 `from` 位起找到首个空位并置位，返回其索引。
/// 若位图的空间用尽，则返回空。
pub fn alloc(bits: &mut [u8], from: usize, len: usize) -> Option<usize> {
    let len = len.min(bits.len() * 8);
    let mut index = from;

    while index < len {
        let byte = index / 8;
        // 把 `from` 之前的位视为已占用
        let occupied = bits[byte] | ((1u8 << (index % 8)) - 1);
        if occupied == u8::MAX {
            index = (byte + 1) * 8;
            continue;
        }

        let found = byte * 8 + occupied.trailing_ones() as usize;
        if found >= len {
            return None;
        }
        bits[byte] |= 1 << (found % 8);
        return Some(found);
    }

    None
}

/// 清除第 `index` 位，返回它原先是否被置位
pub fn free(bits: &mut [u8], index: usize) -> bool {
    let mask = 1 << (index % 8);
    let was_set = bits[index / 8] & mask != 0;
    bits[index / 8] &= !mask;
    was_set
}

/// 置位 `range` 内的所有位
pub fn set_range(bits: &mut [u8], range: core::ops::Range<usize>) {
    for index in range {
        bits[index / 8] |= 1 << (index % 8);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_fit() {
        let mut bits = [0b0000_0111, 0];
        assert_eq!(Some(3), alloc(&mut bits, 0, 16));
        assert_eq!(Some(9), alloc(&mut bits, 9, 16));
        assert_eq!([0b0000_1111, 0b0000_0010], bits);

        assert!(free(&mut bits, 1));
        assert!(!free(&mut bits, 1));
        assert_eq!(Some(1), alloc(&mut bits, 0, 16));
    }

    #[test]
    fn respects_length() {
        let mut bits = [0xFF, 0b0000_0001];
        assert_eq!(None, alloc(&mut bits, 0, 9));
        assert_eq!(Some(9), alloc(&mut bits, 0, 10));

        let mut padded = [0u8; 2];
        set_range(&mut padded, 12..16);
        assert_eq!([0, 0xF0], padded);
    }
}
