//! Environment variable names and small read helpers shared across the
//! harness. The coordinator injects the allocator/worker variables into every
//! worker process; the rest are operator-supplied test configuration.

/// Account selection mode: `byIndex`, `sequential` or `random`.
pub const ACCOUNT_MODE_ENV: &str = "ACCOUNT_MODE";
/// Fixed index for `byIndex` mode.
pub const ACCOUNT_INDEX_ENV: &str = "ACCOUNT_INDEX";
/// First index of the `sequential`/`random` window.
pub const ACCOUNT_INDEX_START_ENV: &str = "ACCOUNT_INDEX_START";
/// Size of the `sequential`/`random` window.
pub const ACCOUNT_INDEX_COUNT_ENV: &str = "ACCOUNT_INDEX_COUNT";
/// Optional seed making `random` mode reproducible.
pub const ACCOUNT_RANDOM_SEED_ENV: &str = "ACCOUNT_RANDOM_SEED";
/// Base URL of the per-run index allocator service.
pub const INDEX_ALLOCATOR_URL_ENV: &str = "INDEX_ALLOCATOR_URL";
/// Timeout for allocator requests, in milliseconds.
pub const INDEX_ALLOCATOR_TIMEOUT_MS_ENV: &str = "INDEX_ALLOCATOR_TIMEOUT_MS";
/// 1-based worker ordinal assigned by the parallel run coordinator.
pub const WORKER_INDEX_ENV: &str = "LOADSTORM_WORKER_INDEX";
/// Seed phrase accounts are derived from.
pub const TEST_MNEMONIC_ENV: &str = "TEST_MNEMONIC";
/// Key source file for the wallet pool.
pub const PRIVATE_KEYS_FILE_ENV: &str = "PRIVATE_KEYS_FILE";
/// Optional cap on the number of wallets loaded into the pool.
pub const WALLET_POOL_SIZE_ENV: &str = "WALLET_POOL_SIZE";
/// Opt-in flag allowing derived secrets to appear in debug logs.
pub const LOG_SENSITIVE_ENV: &str = "LOG_SENSITIVE";

/// Reads an environment variable, trimming whitespace and mapping empty
/// values to `None`.
pub fn trimmed_env(key: &str) -> Option<String> {
    match std::env::var(key) {
        Ok(raw) => {
            let v = raw.trim();
            (!v.is_empty()).then(|| v.to_string())
        }
        Err(_) => None,
    }
}

/// Reads a boolean flag. Only `1`, `true` and `yes` (case-insensitive) count
/// as set; anything else, including absence, is `false`.
pub fn bool_env(key: &str) -> bool {
    trimmed_env(key).is_some_and(|v| {
        let v = v.to_ascii_lowercase();
        v == "1" || v == "true" || v == "yes"
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bool_env_accepts_the_usual_spellings() {
        std::env::set_var("LOADSTORM_TEST_FLAG_A", "yes");
        std::env::set_var("LOADSTORM_TEST_FLAG_B", "TRUE");
        std::env::set_var("LOADSTORM_TEST_FLAG_C", "0");
        assert!(bool_env("LOADSTORM_TEST_FLAG_A"));
        assert!(bool_env("LOADSTORM_TEST_FLAG_B"));
        assert!(!bool_env("LOADSTORM_TEST_FLAG_C"));
        assert!(!bool_env("LOADSTORM_TEST_FLAG_MISSING"));
    }

    #[test]
    fn trimmed_env_drops_blank_values() {
        std::env::set_var("LOADSTORM_TEST_BLANK", "   ");
        assert_eq!(trimmed_env("LOADSTORM_TEST_BLANK"), None);
        std::env::set_var("LOADSTORM_TEST_PADDED", "  x  ");
        assert_eq!(trimmed_env("LOADSTORM_TEST_PADDED").as_deref(), Some("x"));
    }
}
