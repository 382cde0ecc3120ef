/// Maps a raw listing address to its cache key: uppercased, then trimmed.
///
/// Every place that turns an address into a key goes through here. The
/// reporting layer joins cached coordinates back onto listings with the same
/// rule, so changing it orphans every existing `locations_cache` row.
pub fn normalize_address(raw: &str) -> String {
    raw.to_uppercase().trim().to_string()
}
