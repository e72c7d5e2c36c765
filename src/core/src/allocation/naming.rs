use chrono::{DateTime, Utc};

/// `<prefix>-<owner>-<unix seconds>`.
pub fn base_name(prefix: &str, owner_id: u64, at: DateTime<Utc>) -> String {
    format!("{}-{}-{}", prefix, owner_id, at.timestamp())
}

/// The `n`-th candidate derived from `base`; the first is `base` itself.
pub fn candidate(base: &str, n: u32) -> String {
    if n == 0 {
        base.to_string()
    } else {
        format!("{}-{}", base, n)
    }
}
