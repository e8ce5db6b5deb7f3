//! The composed per-VU derive step.
//!
//! This is the operation the load engine invokes once per VU before any
//! authenticated request: pick an index, derive the account, stash the
//! identity in the VU context. Failures are scoped to the calling VU's
//! iteration; they never affect other VUs, workers or the allocator.

use thiserror::Error;

use crate::context::VuContext;
use crate::derive::{derive_account, DeriveError, DerivedAccount};
use crate::env::{self, LOG_SENSITIVE_ENV, TEST_MNEMONIC_ENV};
use crate::selector::{AccountIndexSelection, AccountSelector, SelectError};

/// Errors from the composed derive step.
#[derive(Debug, Error)]
pub enum StepError {
    /// A required configuration value is missing or malformed.
    #[error("missing or invalid {name}: {reason}")]
    InvalidConfig {
        /// The offending variable or parameter.
        name: &'static str,
        /// What was wrong with it.
        reason: String,
    },
    /// Index selection failed.
    #[error(transparent)]
    Select(#[from] SelectError),
    /// Account derivation failed.
    #[error(transparent)]
    Derive(#[from] DeriveError),
}

/// Reads the seed phrase from `TEST_MNEMONIC`.
///
/// # Errors
/// [`StepError::InvalidConfig`] if the variable is missing or blank.
pub fn mnemonic_from_env() -> Result<String, StepError> {
    env::trimmed_env(TEST_MNEMONIC_ENV).ok_or(StepError::InvalidConfig {
        name: TEST_MNEMONIC_ENV,
        reason: "not set".to_string(),
    })
}

/// Selects this VU's index and derives its account, caching both into `ctx`.
///
/// The selection is cached so later steps within the same VU reuse the same
/// identity; the derived address, path and private key land in the context
/// for the authentication and request-issuing steps. Flows that sign locally
/// need the exportable key, so its absence fails the step here rather than
/// somewhere deeper in the pipeline.
///
/// # Errors
/// Any [`SelectError`] or [`DeriveError`] from the underlying operations,
/// reported to the caller as this step's typed failure.
pub async fn derive_vu_account(
    selector: &AccountSelector,
    mnemonic: &str,
    ctx: &mut VuContext,
) -> Result<(AccountIndexSelection, DerivedAccount), StepError> {
    let selection = selector.select(ctx).await?;
    let derived = derive_account(mnemonic, selection.index)?;
    let private_key = *derived.require_private_key()?;

    ctx.record_identity(
        derived.address(),
        derived.derivation.path.clone(),
        private_key,
    );

    if env::bool_env(LOG_SENSITIVE_ENV) {
        tracing::debug!(
            index = selection.index,
            path = %derived.derivation.path,
            address = %derived.address(),
            source = %selection.source,
            private_key = %private_key,
            "derived account"
        );
    } else {
        tracing::debug!(
            index = selection.index,
            path = %derived.derivation.path,
            address = %derived.address(),
            source = %selection.source,
            "derived account"
        );
    }

    Ok((selection, derived))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selector::{AccountMode, SelectorConfig};

    const MNEMONIC: &str = "test test test test test test test test test test test junk";

    fn by_index_selector(index: u32) -> AccountSelector {
        AccountSelector::new(SelectorConfig {
            mode: Some(AccountMode::ByIndex),
            fixed_index: Some(index),
            ..SelectorConfig::default()
        })
    }

    #[tokio::test]
    async fn derives_and_records_the_identity() {
        let selector = by_index_selector(1);
        let mut ctx = VuContext::new();
        let (selection, derived) = derive_vu_account(&selector, MNEMONIC, &mut ctx)
            .await
            .unwrap();

        assert_eq!(selection.index, 1);
        assert_eq!(ctx.cached_index(), Some(1));
        assert_eq!(ctx.address(), Some(derived.address()));
        assert_eq!(ctx.derivation_path(), Some("m/44'/60'/0'/0/1"));
        assert_eq!(ctx.private_key(), derived.private_key());
    }

    #[tokio::test]
    async fn repeat_steps_reuse_the_cached_identity() {
        let selector = by_index_selector(2);
        let mut ctx = VuContext::new();
        let (first, _) = derive_vu_account(&selector, MNEMONIC, &mut ctx)
            .await
            .unwrap();
        let (second, _) = derive_vu_account(&selector, MNEMONIC, &mut ctx)
            .await
            .unwrap();
        assert_eq!(second.index, first.index);
        assert!(second.source.starts_with("cached ("));
    }

    #[tokio::test]
    async fn a_bad_mnemonic_fails_the_step() {
        let selector = by_index_selector(0);
        let mut ctx = VuContext::new();
        let err = derive_vu_account(&selector, "  ", &mut ctx).await.unwrap_err();
        assert!(matches!(err, StepError::Derive(DeriveError::EmptyMnemonic)));
    }
}
