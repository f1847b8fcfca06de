//! Build identity reported by `--version`, the bootstrap log event and the
//! `segmenter_build_info` metric.

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const GIT_COMMIT_HASH: &str = env!("SEGMENTER_GIT_COMMIT_HASH");
pub const VERSION_WITH_COMMIT: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    "+",
    env!("SEGMENTER_GIT_COMMIT_HASH")
);

/// Short git hash for log context and metric labels, or `"unknown"`.
pub fn short_commit_hash() -> &'static str {
    if GIT_COMMIT_HASH == "unknown" {
        return GIT_COMMIT_HASH;
    }

    &GIT_COMMIT_HASH[..GIT_COMMIT_HASH.len().min(12)]
}

#[cfg(test)]
mod tests {
    use super::{short_commit_hash, VERSION, VERSION_WITH_COMMIT};

    #[test]
    fn version_with_commit_starts_with_semver_and_separator() {
        assert!(VERSION_WITH_COMMIT.starts_with(VERSION));
        assert!(VERSION_WITH_COMMIT.contains('+'));
    }

    #[test]
    fn short_commit_hash_is_bounded() {
        let short = short_commit_hash();
        assert!(!short.is_empty());
        assert!(short.len() <= 12 || short == "unknown");
    }
}
