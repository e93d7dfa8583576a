//! Geohash tag handling
//!
//! The core treats geohashes as opaque base32 tag values; it only knows the
//! alphabet and how to widen a precise hash into its coarser ancestors for
//! area-scoped subscriptions.

/// Geohash base32 alphabet excludes `a`, `i`, `l`, `o`.
fn is_geohash_char(c: char) -> bool {
    matches!(c, '0'..='9' | 'b'..='h' | 'j' | 'k' | 'm' | 'n' | 'p'..='z')
}

/// Whether `s` is a well-formed geohash (1 to 12 chars of the alphabet).
pub fn is_valid(s: &str) -> bool {
    (1..=12).contains(&s.len()) && s.chars().all(is_geohash_char)
}

/// Build `g` tags for a geohash and its ancestors down to `min_len`
/// characters, most precise first.
///
/// `build_geohash_tags("dr5regw7", 4)` yields tags for `dr5regw7`,
/// `dr5regw`, `dr5reg`, `dr5re`, `dr5r`.
pub fn build_geohash_tags(primary: &str, min_len: usize) -> Vec<Vec<String>> {
    if !is_valid(primary) {
        return Vec::new();
    }
    let min_len = min_len.max(1);
    let mut tags = Vec::new();
    let mut prefix = primary;
    loop {
        tags.push(vec!["g".to_string(), prefix.to_string()]);
        if prefix.len() <= min_len {
            break;
        }
        prefix = &prefix[..prefix.len() - 1];
    }
    tags
}
