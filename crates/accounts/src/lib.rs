//! Identity assignment for loadstorm virtual users.
//!
//! Every virtual user (VU) in a load test authenticates against the storage
//! network as a distinct blockchain account. This crate owns the mapping from
//! "one VU" to "one account":
//!
//! - [`derive`] turns a `(mnemonic, index)` pair into a deterministic
//!   hierarchical-deterministic account;
//! - [`selector`] decides which index a VU gets, honoring the configured
//!   selection mode, the per-worker offset and the per-run index allocator;
//! - [`allocator`] is the thin HTTP client for the allocator service;
//! - [`pool`] is the round-robin wallet pool used when raw private keys are
//!   supplied instead of a mnemonic;
//! - [`step`] composes selection and derivation into the single operation the
//!   load engine invokes once per VU.
//!
//! Selection state is cached per VU in a [`VuContext`] so an index, once
//! assigned, stays stable for the VU's lifetime.

pub mod allocator;
pub mod context;
pub mod derive;
pub mod env;
pub mod keysource;
pub mod pool;
pub mod selector;
pub mod step;

pub use allocator::AllocatorClient;
pub use context::VuContext;
pub use derive::{derivation_path, derive_account, DerivationInfo, DeriveError, DerivedAccount};
pub use pool::{PoolConfig, PoolError, PooledWallet, WalletPool, WalletPools};
pub use selector::{
    AccountIndexSelection, AccountMode, AccountSelector, SelectError, SelectorConfig,
};
pub use step::{derive_vu_account, StepError};
