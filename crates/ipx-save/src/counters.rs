/// Decode a `[packets:bytes]` token.
///
/// Returns `None` for anything else, including digit runs that overflow
/// `u64`; callers treat that as "not a counter" and keep the token as a value.
pub fn parse_counters(token: &str) -> Option<(u64, u64)> {
    let inner = token.strip_prefix('[')?.strip_suffix(']')?;
    let (packets, bytes) = inner.split_once(':')?;
    if !is_digits(packets) || !is_digits(bytes) {
        return None;
    }
    Some((packets.parse().ok()?, bytes.parse().ok()?))
}

fn is_digits(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}
