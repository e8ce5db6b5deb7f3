//! Round-robin wallet pool over a static key source.
//!
//! The alternative identity source for runs that supply raw private keys
//! instead of a seed phrase. Each distinct `(network, key source)` pair gets
//! its own pool and cursor: distinct sources or networks never share either.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use alloy::network::EthereumWallet;
use alloy::primitives::Address;
use alloy::signers::local::{LocalSignerError, PrivateKeySigner};
use thiserror::Error;

use crate::env::{self, PRIVATE_KEYS_FILE_ENV, WALLET_POOL_SIZE_ENV};
use crate::keysource::{ensure_0x_prefix, load_private_keys};

/// Default key source path, relative to the working directory.
pub const DEFAULT_KEYS_PATH: &str = "data/private_keys.csv";

/// Errors from wallet pool construction and draws.
#[derive(Debug, Error)]
pub enum PoolError {
    /// A configuration value is missing or malformed.
    #[error("missing or invalid {name}: {reason}")]
    InvalidConfig {
        /// The offending variable or parameter.
        name: &'static str,
        /// What was wrong with it.
        reason: String,
    },
    /// The key source could not be read.
    #[error("failed to read key source {path}: {source}")]
    Io {
        /// The key source path.
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// The key source has an unusable shape.
    #[error("invalid key source {path}: {reason}")]
    InvalidKeySource {
        /// The key source path.
        path: PathBuf,
        /// What was wrong with it.
        reason: String,
    },
    /// The key source yielded zero usable keys.
    #[error("no private keys found in {path}")]
    NoKeysFound {
        /// The key source path.
        path: PathBuf,
    },
    /// A key in the source is not a valid private key.
    #[error("invalid private key in {path}: {source}")]
    InvalidKey {
        /// The key source path.
        path: PathBuf,
        #[source]
        source: LocalSignerError,
    },
    /// A draw was attempted against an empty pool.
    #[error("wallet pool for {network} is empty (source: {path})")]
    PoolExhausted {
        /// The network identity the pool is keyed by.
        network: String,
        /// The key source path.
        path: PathBuf,
    },
}

/// Wallet pool configuration.
#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// Path to the key source file.
    pub source_path: PathBuf,
    /// Optional cap applied to the key list before wallet construction.
    pub size_cap: Option<NonZeroUsize>,
}

impl PoolConfig {
    /// Reads the pool configuration from `PRIVATE_KEYS_FILE` and
    /// `WALLET_POOL_SIZE`, with the documented default source path.
    ///
    /// # Errors
    /// [`PoolError::InvalidConfig`] if the size cap is present but not a
    /// positive integer.
    pub fn from_env() -> Result<Self, PoolError> {
        Ok(Self {
            source_path: env::trimmed_env(PRIVATE_KEYS_FILE_ENV)
                .map_or_else(|| PathBuf::from(DEFAULT_KEYS_PATH), PathBuf::from),
            size_cap: parse_size_cap(env::trimmed_env(WALLET_POOL_SIZE_ENV))?,
        })
    }
}

fn parse_size_cap(raw: Option<String>) -> Result<Option<NonZeroUsize>, PoolError> {
    raw.map(|v| {
        v.parse::<NonZeroUsize>()
            .map_err(|_| PoolError::InvalidConfig {
                name: WALLET_POOL_SIZE_ENV,
                reason: format!("{v} (expected positive integer)"),
            })
    })
    .transpose()
}

/// A wallet drawn from the pool, usable for signing and as a wire identity.
#[derive(Clone)]
pub struct PooledWallet {
    signer: PrivateKeySigner,
}

impl PooledWallet {
    /// The wallet's address.
    pub fn address(&self) -> Address {
        self.signer.address()
    }

    /// The signer backing this wallet.
    pub fn signer(&self) -> &PrivateKeySigner {
        &self.signer
    }

    /// The wallet wrapped for the transport layer.
    pub fn wallet(&self) -> EthereumWallet {
        EthereumWallet::from(self.signer.clone())
    }
}

impl std::fmt::Debug for PooledWallet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledWallet")
            .field("address", &self.address())
            .finish()
    }
}

/// An immutable set of pre-built wallets plus a round-robin cursor.
pub struct WalletPool {
    network: String,
    source_path: PathBuf,
    wallets: Vec<PooledWallet>,
    cursor: AtomicUsize,
}

impl WalletPool {
    fn load(network: &str, config: &PoolConfig) -> Result<Self, PoolError> {
        let keys = load_private_keys(&config.source_path)?;
        let selected: Vec<&String> = match config.size_cap {
            Some(cap) => keys.iter().take(cap.get()).collect(),
            None => keys.iter().collect(),
        };

        let mut wallets = Vec::with_capacity(selected.len());
        for key in selected {
            let normalized = ensure_0x_prefix(key, None)?;
            let signer =
                normalized
                    .parse::<PrivateKeySigner>()
                    .map_err(|source| PoolError::InvalidKey {
                        path: config.source_path.clone(),
                        source,
                    })?;
            wallets.push(PooledWallet { signer });
        }

        tracing::debug!(
            network,
            source = %config.source_path.display(),
            size = wallets.len(),
            "loaded wallet pool"
        );

        Ok(Self {
            network: network.to_string(),
            source_path: config.source_path.clone(),
            wallets,
            cursor: AtomicUsize::new(0),
        })
    }

    /// Number of wallets in the pool.
    pub fn len(&self) -> usize {
        self.wallets.len()
    }

    /// Whether the pool is empty. Unreachable for pools built through
    /// [`WalletPools`], which reject empty sources at load time.
    pub fn is_empty(&self) -> bool {
        self.wallets.is_empty()
    }

    /// The key source this pool was loaded from.
    pub fn source_path(&self) -> &Path {
        &self.source_path
    }

    /// Draws the next wallet, advancing the shared cursor by one and
    /// wrapping at the pool size.
    ///
    /// # Errors
    /// [`PoolError::PoolExhausted`] if the pool is empty.
    pub fn next(&self) -> Result<PooledWallet, PoolError> {
        if self.wallets.is_empty() {
            return Err(PoolError::PoolExhausted {
                network: self.network.clone(),
                path: self.source_path.clone(),
            });
        }
        let idx = self.cursor.fetch_add(1, Ordering::SeqCst) % self.wallets.len();
        Ok(self.wallets[idx].clone())
    }
}

/// Registry of wallet pools, keyed by `(network identity, key source path)`.
///
/// Each distinct key loads its source exactly once; subsequent lookups return
/// the cached pool. Pools live for the registry's lifetime.
#[derive(Default)]
pub struct WalletPools {
    pools: Mutex<HashMap<(String, PathBuf), Arc<WalletPool>>>,
}

impl WalletPools {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the pool for `(network, config.source_path)`, loading it on
    /// first use.
    ///
    /// # Errors
    /// Any [`PoolError`] from loading/parsing the source or building signers;
    /// a failed load is not cached, so a corrected source can be retried.
    pub fn get_or_load(
        &self,
        network: &str,
        config: &PoolConfig,
    ) -> Result<Arc<WalletPool>, PoolError> {
        let key = (network.to_string(), config.source_path.clone());
        let mut pools = self.pools.lock().expect("wallet pool registry poisoned");
        if let Some(pool) = pools.get(&key) {
            return Ok(Arc::clone(pool));
        }
        let pool = Arc::new(WalletPool::load(network, config)?);
        pools.insert(key, Arc::clone(&pool));
        Ok(pool)
    }

    /// Draws the next wallet from the pool for `network`, loading the pool on
    /// first use.
    ///
    /// # Errors
    /// Load-time errors on first use, [`PoolError::PoolExhausted`] on an
    /// empty pool afterwards.
    pub fn next_wallet(
        &self,
        network: &str,
        config: &PoolConfig,
    ) -> Result<PooledWallet, PoolError> {
        self.get_or_load(network, config)?.next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    // First three well-known development keys and their addresses.
    const KEYS: [&str; 3] = [
        "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80",
        "0x59c6995e998f97a5a0044966f0945389dc9e86dae88c7a8412f4603b6b78690d",
        "0x5de4111afa1a4b94908f83103eb1f1706367c2e68ca870fc3fb9a804cdab365a",
    ];
    const ADDRESSES: [&str; 3] = [
        "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266",
        "0x70997970C51812dc3A010C7d01b50e0d17dc79C8",
        "0x3C44CdDdB6a900fa2b585dd299e03d12FA4293BC",
    ];

    fn keys_file() -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".csv").tempfile().unwrap();
        writeln!(file, "privateKey").unwrap();
        for key in KEYS {
            writeln!(file, "{key}").unwrap();
        }
        file
    }

    fn config(file: &tempfile::NamedTempFile, cap: Option<usize>) -> PoolConfig {
        PoolConfig {
            source_path: file.path().to_path_buf(),
            size_cap: cap.map(|n| NonZeroUsize::new(n).unwrap()),
        }
    }

    fn address(raw: &str) -> Address {
        raw.parse().unwrap()
    }

    #[test]
    fn draws_round_robin_with_wraparound() {
        let file = keys_file();
        let pools = WalletPools::new();
        let pool = pools.get_or_load("local", &config(&file, None)).unwrap();
        assert_eq!(pool.len(), 3);

        let drawn: Vec<Address> = (0..7).map(|_| pool.next().unwrap().address()).collect();
        let expected: Vec<Address> = [0, 1, 2, 0, 1, 2, 0]
            .iter()
            .map(|&i| address(ADDRESSES[i]))
            .collect();
        assert_eq!(drawn, expected);
    }

    #[test]
    fn pools_are_cached_per_network_and_source() {
        let file = keys_file();
        let pools = WalletPools::new();
        let cfg = config(&file, None);

        let a = pools.get_or_load("local", &cfg).unwrap();
        let b = pools.get_or_load("local", &cfg).unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        // A different network identity gets its own pool and cursor.
        let other = pools.get_or_load("testnet", &cfg).unwrap();
        assert!(!Arc::ptr_eq(&a, &other));
        a.next().unwrap();
        assert_eq!(other.next().unwrap().address(), address(ADDRESSES[0]));
    }

    #[test]
    fn cursor_is_shared_through_the_registry() {
        let file = keys_file();
        let pools = WalletPools::new();
        let cfg = config(&file, None);
        let first = pools.next_wallet("local", &cfg).unwrap();
        let second = pools.next_wallet("local", &cfg).unwrap();
        assert_eq!(first.address(), address(ADDRESSES[0]));
        assert_eq!(second.address(), address(ADDRESSES[1]));
    }

    #[test]
    fn size_cap_truncates_the_key_list() {
        let file = keys_file();
        let pools = WalletPools::new();
        let pool = pools.get_or_load("local", &config(&file, Some(2))).unwrap();
        assert_eq!(pool.len(), 2);

        let drawn: Vec<Address> = (0..3).map(|_| pool.next().unwrap().address()).collect();
        assert_eq!(
            drawn,
            vec![
                address(ADDRESSES[0]),
                address(ADDRESSES[1]),
                address(ADDRESSES[0])
            ]
        );
    }

    #[test]
    fn size_cap_must_be_a_positive_integer() {
        assert!(matches!(
            parse_size_cap(Some("0".to_string())),
            Err(PoolError::InvalidConfig { name: "WALLET_POOL_SIZE", .. })
        ));
        assert!(matches!(
            parse_size_cap(Some("lots".to_string())),
            Err(PoolError::InvalidConfig { .. })
        ));
        assert_eq!(
            parse_size_cap(Some("4".to_string())).unwrap(),
            NonZeroUsize::new(4)
        );
        assert_eq!(parse_size_cap(None).unwrap(), None);
    }

    #[test]
    fn unparseable_keys_fail_pool_construction() {
        let mut file = tempfile::Builder::new().suffix(".csv").tempfile().unwrap();
        writeln!(file, "0xnot-a-key").unwrap();
        let pools = WalletPools::new();
        assert!(matches!(
            pools.get_or_load("local", &config(&file, None)),
            Err(PoolError::InvalidKey { .. })
        ));
    }

    #[test]
    fn keys_without_prefix_are_normalized() {
        let mut file = tempfile::Builder::new().suffix(".csv").tempfile().unwrap();
        writeln!(file, "{}", KEYS[0].trim_start_matches("0x")).unwrap();
        let pools = WalletPools::new();
        let pool = pools.get_or_load("local", &config(&file, None)).unwrap();
        assert_eq!(pool.next().unwrap().address(), address(ADDRESSES[0]));
    }
}
