//! Per-VU state carried through the step pipeline.

use std::fmt;

use alloy::primitives::{Address, B256};

use crate::selector::AccountIndexSelection;

/// Mutable state scoped to one virtual user.
///
/// The load engine creates one context per VU and passes it by reference into
/// every step. Selection is computed once and cached here; subsequent steps
/// within the same VU reuse the cached index instead of recomputing it.
#[derive(Clone, Default)]
pub struct VuContext {
    /// Request-payload-level index override for `byIndex` mode.
    pub payload_index: Option<u32>,
    cached_index: Option<u32>,
    cached_mode: Option<String>,
    cached_source: Option<String>,
    address: Option<Address>,
    derivation_path: Option<String>,
    private_key: Option<B256>,
}

impl VuContext {
    /// A fresh context with nothing cached.
    pub fn new() -> Self {
        Self::default()
    }

    /// The cached index, if a selection has been made for this VU.
    pub fn cached_index(&self) -> Option<u32> {
        self.cached_index
    }

    /// The cached mode string as it was stored.
    pub fn cached_mode(&self) -> Option<&str> {
        self.cached_mode.as_deref()
    }

    /// The cached provenance string as it was stored.
    pub fn cached_source(&self) -> Option<&str> {
        self.cached_source.as_deref()
    }

    /// Persists a selection so later calls within this VU short-circuit to it.
    pub fn cache_selection(&mut self, selection: &AccountIndexSelection) {
        self.cached_index = Some(selection.index);
        self.cached_mode = Some(selection.mode.as_str().to_string());
        self.cached_source = Some(selection.source.clone());
    }

    #[cfg(test)]
    pub(crate) fn cache_raw(&mut self, index: u32, mode: &str, source: &str) {
        self.cached_index = Some(index);
        self.cached_mode = Some(mode.to_string());
        self.cached_source = Some(source.to_string());
    }

    /// Records the derived identity for the VU's lifetime.
    pub fn record_identity(&mut self, address: Address, path: String, private_key: B256) {
        self.address = Some(address);
        self.derivation_path = Some(path);
        self.private_key = Some(private_key);
    }

    /// The derived address, once a derive step has run.
    pub fn address(&self) -> Option<Address> {
        self.address
    }

    /// The derivation path, once a derive step has run.
    pub fn derivation_path(&self) -> Option<&str> {
        self.derivation_path.as_deref()
    }

    /// The derived private key, once a derive step has run.
    pub fn private_key(&self) -> Option<&B256> {
        self.private_key.as_ref()
    }
}

impl fmt::Debug for VuContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VuContext")
            .field("payload_index", &self.payload_index)
            .field("cached_index", &self.cached_index)
            .field("cached_mode", &self.cached_mode)
            .field("cached_source", &self.cached_source)
            .field("address", &self.address)
            .field("derivation_path", &self.derivation_path)
            .field("private_key", &self.private_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}
