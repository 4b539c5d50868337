pub mod admin;
pub mod normalize;

pub use admin::{BucketStats, CacheAdmin, CacheStats};
pub use normalize::NormalizationCache;

/// Restrict asset ids to filesystem-safe characters so they can prefix
/// derived artifact names and be matched back during a purge.
pub fn sanitize_asset_id(asset_id: &str) -> String {
    asset_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::sanitize_asset_id;

    #[test]
    fn passes_safe_ids_through() {
        assert_eq!(sanitize_asset_id("clip_01.v2-final"), "clip_01.v2-final");
    }

    #[test]
    fn replaces_path_separators_and_spaces() {
        assert_eq!(sanitize_asset_id("../etc/passwd"), ".._etc_passwd");
        assert_eq!(sanitize_asset_id("my clip"), "my_clip");
        assert_eq!(sanitize_asset_id("a/b\\c"), "a_b_c");
    }
}
