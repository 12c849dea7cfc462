/// Build identity reported by `--version`, startup logs, alerts and `/metrics`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const GIT_COMMIT_HASH: &str = env!("ATLAS_CRAWLER_GIT_COMMIT_HASH");
pub const VERSION_WITH_COMMIT: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    "+",
    env!("ATLAS_CRAWLER_GIT_COMMIT_HASH")
);

const SHORT_HASH_LEN: usize = 8;

/// First eight characters of the commit, or `"unknown"` when git was unavailable.
pub fn short_commit_hash() -> &'static str {
    match GIT_COMMIT_HASH.get(..SHORT_HASH_LEN) {
        Some(short) if GIT_COMMIT_HASH != "unknown" => short,
        _ => GIT_COMMIT_HASH,
    }
}
