//! Per-VU account index selection.
//!
//! Each VU gets exactly one index for its lifetime. The first call computes
//! it according to the configured mode (or the per-run allocator, which takes
//! precedence when enabled); every later call within the same VU returns the
//! cached value.
//!
//! Sequential mode only guarantees coverage *within* one worker process: the
//! local counter is not shared across processes, so two workers whose
//! counters grow at different rates can collide even with distinct worker
//! offsets. The allocator service is the only mechanism with a cross-process
//! uniqueness guarantee; prefer it for any run that needs strict uniqueness.

use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use url::Url;

use crate::allocator::AllocatorClient;
use crate::context::VuContext;
use crate::env::{
    self, ACCOUNT_INDEX_COUNT_ENV, ACCOUNT_INDEX_ENV, ACCOUNT_INDEX_START_ENV, ACCOUNT_MODE_ENV,
    ACCOUNT_RANDOM_SEED_ENV, INDEX_ALLOCATOR_TIMEOUT_MS_ENV, INDEX_ALLOCATOR_URL_ENV,
    WORKER_INDEX_ENV,
};

/// Default timeout for allocator requests.
pub const DEFAULT_ALLOCATOR_TIMEOUT: Duration = Duration::from_millis(2000);

/// Errors from index selection.
#[derive(Debug, Error)]
pub enum SelectError {
    /// A required configuration value is missing or malformed.
    #[error("missing or invalid {name}: {reason}")]
    InvalidConfig {
        /// The offending variable or parameter.
        name: &'static str,
        /// What was wrong with it.
        reason: String,
    },
    /// The allocator could not be reached or did not answer in time.
    #[error("index allocator unavailable: {0}")]
    AllocatorUnavailable(#[source] reqwest::Error),
    /// The allocator answered with something other than a usable index.
    #[error("index allocator protocol error: {reason}")]
    AllocatorProtocolError {
        /// What was wrong with the response.
        reason: String,
    },
}

impl SelectError {
    pub(crate) fn invalid(name: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            name,
            reason: reason.into(),
        }
    }
}

/// How a VU's index is chosen.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccountMode {
    /// A single explicitly configured index (or per-call override).
    ByIndex,
    /// Walk a `[start, start + count)` window with a local counter.
    Sequential,
    /// Pick uniformly from a `[start, start + count)` window.
    Random,
}

impl AccountMode {
    /// The canonical configuration spelling of this mode.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ByIndex => "byIndex",
            Self::Sequential => "sequential",
            Self::Random => "random",
        }
    }
}

impl FromStr for AccountMode {
    type Err = SelectError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "byIndex" => Ok(Self::ByIndex),
            "sequential" => Ok(Self::Sequential),
            "random" => Ok(Self::Random),
            other => Err(SelectError::invalid(
                ACCOUNT_MODE_ENV,
                format!("{other} (expected 'byIndex', 'sequential', or 'random')"),
            )),
        }
    }
}

/// The outcome of a selection: which index, under which mode, and a
/// human-readable note on how it was chosen (for diagnostics only, never for
/// protocol use).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccountIndexSelection {
    /// The mode the selection was made under.
    pub mode: AccountMode,
    /// The selected index.
    pub index: u32,
    /// Provenance, e.g. `allocator:/next` or `sequential(local=2, workerOffset=1)`.
    pub source: String,
}

/// Selector configuration, usually read from the environment.
#[derive(Clone, Debug)]
pub struct SelectorConfig {
    /// Selection mode; required unless the allocator is enabled.
    pub mode: Option<AccountMode>,
    /// Fixed index for [`AccountMode::ByIndex`].
    pub fixed_index: Option<u32>,
    /// Window start for sequential/random modes.
    pub start: Option<u32>,
    /// Window size for sequential/random modes.
    pub count: Option<u32>,
    /// Seed for reproducible random mode.
    pub random_seed: Option<i64>,
    /// Allocator base URL; enables the allocator override when set.
    pub allocator_url: Option<Url>,
    /// Timeout for allocator requests.
    pub allocator_timeout: Duration,
    /// 0-based worker offset (1-based ordinal minus one).
    pub worker_offset: u32,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            mode: None,
            fixed_index: None,
            start: None,
            count: None,
            random_seed: None,
            allocator_url: None,
            allocator_timeout: DEFAULT_ALLOCATOR_TIMEOUT,
            worker_offset: 0,
        }
    }
}

impl SelectorConfig {
    /// Reads the selector configuration from the documented environment
    /// variables.
    ///
    /// # Errors
    /// [`SelectError::InvalidConfig`] naming the offending variable if any
    /// value fails to parse. Absent optional values are not errors; whether a
    /// given mode's requirements are satisfied is checked at selection time.
    pub fn from_env() -> Result<Self, SelectError> {
        let mode = match env::trimmed_env(ACCOUNT_MODE_ENV) {
            Some(raw) => Some(raw.parse()?),
            None => None,
        };

        let allocator_url = match env::trimmed_env(INDEX_ALLOCATOR_URL_ENV) {
            Some(raw) => Some(Url::parse(&raw).map_err(|e| {
                SelectError::invalid(INDEX_ALLOCATOR_URL_ENV, format!("{raw} ({e})"))
            })?),
            None => None,
        };

        Ok(Self {
            mode,
            fixed_index: parse_index(ACCOUNT_INDEX_ENV, env::trimmed_env(ACCOUNT_INDEX_ENV))?,
            start: parse_index(
                ACCOUNT_INDEX_START_ENV,
                env::trimmed_env(ACCOUNT_INDEX_START_ENV),
            )?,
            count: parse_count(env::trimmed_env(ACCOUNT_INDEX_COUNT_ENV))?,
            random_seed: parse_seed(env::trimmed_env(ACCOUNT_RANDOM_SEED_ENV))?,
            allocator_url,
            allocator_timeout: parse_timeout(env::trimmed_env(INDEX_ALLOCATOR_TIMEOUT_MS_ENV)),
            worker_offset: parse_worker_offset(env::trimmed_env(WORKER_INDEX_ENV)),
        })
    }
}

fn parse_index(name: &'static str, raw: Option<String>) -> Result<Option<u32>, SelectError> {
    raw.map(|v| {
        v.parse::<u32>()
            .map_err(|_| SelectError::invalid(name, format!("{v} (expected integer >= 0)")))
    })
    .transpose()
}

fn parse_count(raw: Option<String>) -> Result<Option<u32>, SelectError> {
    let Some(v) = raw else { return Ok(None) };
    let count = v.parse::<u32>().map_err(|_| {
        SelectError::invalid(
            ACCOUNT_INDEX_COUNT_ENV,
            format!("{v} (expected integer > 0)"),
        )
    })?;
    if count == 0 {
        return Err(SelectError::invalid(
            ACCOUNT_INDEX_COUNT_ENV,
            "must be > 0",
        ));
    }
    Ok(Some(count))
}

fn parse_seed(raw: Option<String>) -> Result<Option<i64>, SelectError> {
    raw.map(|v| {
        v.parse::<i64>()
            .map_err(|_| SelectError::invalid(ACCOUNT_RANDOM_SEED_ENV, format!("{v} (expected integer)")))
    })
    .transpose()
}

// An unusable timeout falls back to the default rather than failing the run.
fn parse_timeout(raw: Option<String>) -> Duration {
    raw.and_then(|v| v.parse::<u64>().ok())
        .filter(|ms| *ms > 0)
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_ALLOCATOR_TIMEOUT)
}

// 1-based ordinal from the coordinator; absent, zero or garbage all mean
// "first worker" (offset 0).
fn parse_worker_offset(raw: Option<String>) -> u32 {
    raw.and_then(|v| v.parse::<i64>().ok())
        .filter(|n| *n > 0)
        .map(|n| (n - 1) as u32)
        .unwrap_or(0)
}

/// Deterministic linear-congruential generator (Numerical Recipes constants),
/// producing values in `[0, 1)`. Not cryptographically secure; fine for
/// load-test user selection.
struct Lcg {
    state: u32,
}

impl Lcg {
    fn new(seed: u32) -> Self {
        Self { state: seed }
    }

    fn next_unit(&mut self) -> f64 {
        self.state = self.state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
        f64::from(self.state) / 4_294_967_296.0
    }
}

/// Decides which account index a VU uses and caches the decision for the
/// VU's lifetime.
///
/// Owns the in-process sequential counter; construct one selector per worker
/// process and share it across that worker's VUs.
pub struct AccountSelector {
    config: SelectorConfig,
    sequential_counter: AtomicU64,
    allocator: Option<AllocatorClient>,
}

impl AccountSelector {
    /// Builds a selector from an explicit configuration.
    pub fn new(config: SelectorConfig) -> Self {
        let allocator = config
            .allocator_url
            .clone()
            .map(|url| AllocatorClient::new(url, config.allocator_timeout));
        Self {
            config,
            sequential_counter: AtomicU64::new(0),
            allocator,
        }
    }

    /// Builds a selector from the environment.
    ///
    /// # Errors
    /// [`SelectError::InvalidConfig`] if any configured value fails to parse.
    pub fn from_env() -> Result<Self, SelectError> {
        Ok(Self::new(SelectorConfig::from_env()?))
    }

    /// The allocator client, when the allocator is enabled.
    pub fn allocator(&self) -> Option<&AllocatorClient> {
        self.allocator.as_ref()
    }

    /// Selects the index for the VU behind `ctx`.
    ///
    /// Idempotent per VU: once a selection is cached in the context, later
    /// calls return the same `(mode, index)` pair with a `cached (...)`
    /// source. When the allocator is enabled it is the source of truth for
    /// uncached VUs, regardless of the configured mode — isolated VU
    /// sandboxes cannot share in-process counters, so the allocator is the
    /// only sound cross-sandbox uniqueness mechanism.
    ///
    /// The winning selection is cached into `ctx` before returning.
    ///
    /// # Errors
    /// - [`SelectError::InvalidConfig`] if the configured mode's requirements
    ///   are not met.
    /// - [`SelectError::AllocatorUnavailable`] /
    ///   [`SelectError::AllocatorProtocolError`] if the allocator is enabled
    ///   but unusable; the failure is scoped to this VU's step.
    pub async fn select(&self, ctx: &mut VuContext) -> Result<AccountIndexSelection, SelectError> {
        // Keep the index stable for the duration of the VU.
        if let Some(index) = ctx.cached_index() {
            let mode = ctx
                .cached_mode()
                .and_then(|raw| raw.parse::<AccountMode>().ok())
                .unwrap_or(AccountMode::ByIndex);
            let source = format!("cached ({})", ctx.cached_source().unwrap_or("cached"));
            return Ok(AccountIndexSelection { mode, index, source });
        }

        let selection = match &self.allocator {
            Some(client) => {
                let index = client.next_index().await?;
                AccountIndexSelection {
                    mode: AccountMode::ByIndex,
                    index,
                    source: "allocator:/next".to_string(),
                }
            }
            None => self.select_local(ctx)?,
        };

        ctx.cache_selection(&selection);
        Ok(selection)
    }

    fn select_local(&self, ctx: &VuContext) -> Result<AccountIndexSelection, SelectError> {
        let mode = self
            .config
            .mode
            .ok_or_else(|| SelectError::invalid(ACCOUNT_MODE_ENV, "not set"))?;

        match mode {
            AccountMode::ByIndex => {
                // Payload override is allowed.
                if let Some(index) = ctx.payload_index {
                    return Ok(AccountIndexSelection {
                        mode,
                        index,
                        source: "payload:accountIndex".to_string(),
                    });
                }
                let index = self
                    .config
                    .fixed_index
                    .ok_or_else(|| SelectError::invalid(ACCOUNT_INDEX_ENV, "not set"))?;
                Ok(AccountIndexSelection {
                    mode,
                    index,
                    source: format!("variables:{ACCOUNT_INDEX_ENV}"),
                })
            }
            AccountMode::Sequential => {
                let (start, count) = self.window()?;
                let offset = self.config.worker_offset;
                let local = self.sequential_counter.fetch_add(1, Ordering::SeqCst);
                let pick = (local.wrapping_add(u64::from(offset))) % u64::from(count);
                let index = checked_index(start, pick)?;
                Ok(AccountIndexSelection {
                    mode,
                    index,
                    source: format!("sequential(local={local}, workerOffset={offset})"),
                })
            }
            AccountMode::Random => {
                let (start, count) = self.window()?;
                let offset = self.config.worker_offset;
                let (pick, source) = match self.config.random_seed {
                    Some(seed) => {
                        let state = seed.wrapping_add(i64::from(offset)) as u32;
                        let mut rng = Lcg::new(state);
                        let pick = (rng.next_unit() * f64::from(count)) as u64;
                        (pick, format!("random(seed={seed}, workerOffset={offset})"))
                    }
                    None => {
                        let pick = rand::thread_rng().gen_range(0..count);
                        (
                            u64::from(pick),
                            format!("random(unseeded, workerOffset={offset})"),
                        )
                    }
                };
                let index = checked_index(start, pick)?;
                Ok(AccountIndexSelection { mode, index, source })
            }
        }
    }

    fn window(&self) -> Result<(u32, u32), SelectError> {
        let start = self
            .config
            .start
            .ok_or_else(|| SelectError::invalid(ACCOUNT_INDEX_START_ENV, "not set"))?;
        let count = self
            .config
            .count
            .ok_or_else(|| SelectError::invalid(ACCOUNT_INDEX_COUNT_ENV, "not set"))?;
        if count == 0 {
            return Err(SelectError::invalid(ACCOUNT_INDEX_COUNT_ENV, "must be > 0"));
        }
        Ok((start, count))
    }
}

fn checked_index(start: u32, pick: u64) -> Result<u32, SelectError> {
    u64::from(start)
        .checked_add(pick)
        .and_then(|idx| u32::try_from(idx).ok())
        .ok_or_else(|| {
            SelectError::invalid(
                ACCOUNT_INDEX_START_ENV,
                "derived index exceeds the derivation index range",
            )
        })
}
