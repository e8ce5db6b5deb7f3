//! Deterministic hierarchical-deterministic account derivation.
//!
//! One `(mnemonic, index)` pair maps to exactly one account: the derivation
//! path is a pure function of the index, and the seed phrase is the only
//! other determinism input. Distinct indices yield distinct accounts.

use std::fmt;

use alloy::network::EthereumWallet;
use alloy::primitives::{Address, B256};
use alloy::signers::local::{
    coins_bip39::English, LocalSignerError, MnemonicBuilder, PrivateKeySigner,
};
use thiserror::Error;

/// Fixed purpose/coin-type/account/change prefix for all derived accounts.
/// Only the final index component varies.
pub const DERIVATION_PATH_PREFIX: &str = "m/44'/60'/0'/0/";

/// Errors from account derivation.
#[derive(Debug, Error)]
pub enum DeriveError {
    /// The supplied seed phrase was missing or blank.
    #[error("missing or invalid mnemonic (expected a non-empty seed phrase)")]
    EmptyMnemonic,
    /// The underlying BIP-32/BIP-39 derivation rejected the inputs.
    #[error("derivation failed for path {path}: {source}")]
    Derivation {
        /// Path the derivation was attempted with.
        path: String,
        #[source]
        source: LocalSignerError,
    },
    /// The derived signer exposes no exportable key material.
    #[error("derived account has no private key available")]
    PrivateKeyUnavailable,
}

/// Where in the HD tree an account came from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DerivationInfo {
    /// The index used as the final path component.
    pub index: u32,
    /// The full derivation path string.
    pub path: String,
}

/// A derived account: a signer plus its provenance.
///
/// The private key is exported only for flows that sign locally; it is
/// excluded from `Debug` output and must never be logged unless the
/// operator opts in explicitly.
#[derive(Clone)]
pub struct DerivedAccount {
    signer: PrivateKeySigner,
    /// Index and path this account was derived from.
    pub derivation: DerivationInfo,
    private_key: Option<B256>,
}

impl DerivedAccount {
    /// The account's address.
    pub fn address(&self) -> Address {
        self.signer.address()
    }

    /// The signer backing this account.
    pub fn signer(&self) -> &PrivateKeySigner {
        &self.signer
    }

    /// The account wrapped as a wallet usable by the transport layer.
    pub fn wallet(&self) -> EthereumWallet {
        EthereumWallet::from(self.signer.clone())
    }

    /// The exported private key, if any.
    pub fn private_key(&self) -> Option<&B256> {
        self.private_key.as_ref()
    }

    /// The exported private key, or [`DeriveError::PrivateKeyUnavailable`]
    /// for flows that cannot proceed without local signing.
    pub fn require_private_key(&self) -> Result<&B256, DeriveError> {
        self.private_key
            .as_ref()
            .ok_or(DeriveError::PrivateKeyUnavailable)
    }
}

impl fmt::Debug for DerivedAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DerivedAccount")
            .field("address", &self.address())
            .field("derivation", &self.derivation)
            .field("private_key", &self.private_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Builds the derivation path for `index`.
///
/// Identical indices always yield identical path strings.
pub fn derivation_path(index: u32) -> String {
    format!("{DERIVATION_PATH_PREFIX}{index}")
}

/// Derives the account at `index` from `mnemonic`.
///
/// Pure computation over the supplied seed: no I/O, no state. Calling this
/// twice with the same inputs yields the same address, path and key.
///
/// # Errors
/// - [`DeriveError::EmptyMnemonic`] if the seed phrase is blank.
/// - [`DeriveError::Derivation`] if the phrase or path is rejected by the
///   derivation library.
pub fn derive_account(mnemonic: &str, index: u32) -> Result<DerivedAccount, DeriveError> {
    let mnemonic = mnemonic.trim();
    if mnemonic.is_empty() {
        return Err(DeriveError::EmptyMnemonic);
    }

    let path = derivation_path(index);
    let signer = MnemonicBuilder::<English>::default()
        .phrase(mnemonic)
        .derivation_path(&path)
        .and_then(|builder| builder.build())
        .map_err(|source| DeriveError::Derivation {
            path: path.clone(),
            source,
        })?;

    let bytes = signer.to_bytes();
    let private_key = (!bytes.is_zero()).then_some(bytes);

    Ok(DerivedAccount {
        signer,
        derivation: DerivationInfo { index, path },
        private_key,
    })
}
