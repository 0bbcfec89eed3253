/// Round up `n` to the nearest multiple of `to`
pub fn round_up(n: usize, to: usize) -> usize {
    to * n.div_ceil(to)
}

/// `total / count`, or 0 when nothing was counted
pub fn checked_average(total: u64, count: u64) -> u64 {
    total.checked_div(count).unwrap_or(0)
}
