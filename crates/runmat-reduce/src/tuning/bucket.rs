pub const MIN_BUCKET: u32 = 8;

/// Round a dimension up to its cost-table key: `2^ceil(log2 x)`, never below 8.
pub fn bucket(x: u64) -> u32 {
    x.max(MIN_BUCKET as u64)
        .checked_next_power_of_two()
        .and_then(|rounded| u32::try_from(rounded).ok())
        .unwrap_or(1 << 31)
}

/// Geometric scan points `start, 2*start, ...` up to and including `max`.
pub fn geometric(start: u32, max: u32) -> impl Iterator<Item = u32> {
    let first = bucket(start as u64);
    std::iter::successors(Some(first), |&p| p.checked_mul(2)).take_while(move |&p| p <= max)
}
