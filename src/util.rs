//! Small free-standing helpers shared by the rest of the crate.

use std::time::{SystemTime, UNIX_EPOCH};

/// Returns the current time as a 32-bit Unix timestamp, truncating like the on-disk inode and
/// superblock timestamp fields do.
pub fn get_timestamp() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the Unix epoch")
        .as_secs() as u32
}

/// Divides `a` by `b`, rounding up.
pub fn ceil_division(a: u32, b: u32) -> u32 {
    a.div_ceil(b)
}

/// Rounds `n` up to the next multiple of 4, the alignment directory records are padded to.
pub fn align4(n: u16) -> u16 {
    (n + 3) & !3
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ceil_division_rounds_up() {
        assert_eq!(ceil_division(10, 3), 4);
        assert_eq!(ceil_division(9, 3), 3);
        assert_eq!(ceil_division(0, 3), 0);
    }

    #[test]
    fn align4_rounds_to_multiple_of_four() {
        assert_eq!(align4(9), 12);
        assert_eq!(align4(8), 8);
        assert_eq!(align4(1), 4);
    }
}
