//! Credential rotation and resolution degradation for rate-limited
//! generation services.
//!
//! Two failure classes are recovered here and nowhere else: a spent quota
//! moves on to the next credential, a transient worker failure (usually
//! out of memory) retries the whole rotation at a smaller resolution.
//! Anything else surfaces on the first occurrence.

use std::future::Future;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::types::Dimensions;

pub const DEFAULT_RESOLUTION_CAPS: [u32; 3] = [1024, 768, 512];

/// Markers are whole lowercase words, matched against the message's own
/// words, so `oom` never fires inside `zoom` or `room`.
const QUOTA_MARKERS: [&str; 7] = [
    "quota",
    "exceeded your gpu",
    "rate limit",
    "rate limited",
    "too many requests",
    "http 429",
    "status 429",
];
const TRANSIENT_MARKERS: [&str; 7] = [
    "out of memory",
    "outofmemoryerror",
    "oom",
    "cuda error",
    "runtimeerror",
    "resource exhausted",
    "worker crashed",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureClass {
    QuotaExhausted,
    TransientResource,
    Other,
}

/// Classifies a service failure from its message. Quota markers win over
/// transient ones when both appear.
pub fn classify_failure(message: &str) -> FailureClass {
    let words = word_sequence(message);
    let has = |marker: &&str| words.contains(&format!(" {marker} "));
    if QUOTA_MARKERS.iter().any(has) {
        FailureClass::QuotaExhausted
    } else if TRANSIENT_MARKERS.iter().any(has) {
        FailureClass::TransientResource
    } else {
        FailureClass::Other
    }
}

/// Lowercase alphanumeric runs joined and padded by single spaces.
fn word_sequence(message: &str) -> String {
    let mut words = String::with_capacity(message.len() + 2);
    words.push(' ');
    for word in message
        .split(|ch: char| !ch.is_ascii_alphanumeric())
        .filter(|word| !word.is_empty())
    {
        words.push_str(&word.to_ascii_lowercase());
        words.push(' ');
    }
    words
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ServiceError {
    pub message: String,
    pub class: FailureClass,
}

impl ServiceError {
    /// Builds an error and classifies it from the message.
    pub fn new(message: impl Into<String>) -> Self {
        let message = message.into();
        let class = classify_failure(&message);
        Self { message, class }
    }

    pub fn with_class(message: impl Into<String>, class: FailureClass) -> Self {
        Self {
            message: message.into(),
            class,
        }
    }

    /// HTTP 429 always means the credential is throttled, whatever the body says.
    pub fn from_http(status: u16, body: &str) -> Self {
        let message = format!("HTTP {status}: {}", body.trim());
        if status == 429 {
            Self::with_class(message, FailureClass::QuotaExhausted)
        } else {
            Self::new(message)
        }
    }

    pub fn is_quota(&self) -> bool {
        self.class == FailureClass::QuotaExhausted
    }

    pub fn is_transient(&self) -> bool {
        self.class == FailureClass::TransientResource
    }
}

#[derive(Debug, Error)]
pub enum RotationError {
    #[error("no credentials configured for the generation service")]
    NoCredentials,
    #[error("no resolution levels configured")]
    NoResolutionLevels,
    #[error("transient resource failure with credential #{slot}: {source}")]
    TransientResource { slot: usize, source: ServiceError },
    #[error("generation failed with credential #{slot}: {source}")]
    Fatal { slot: usize, source: ServiceError },
    #[error("all {attempts} credentials failed; last error: {last}")]
    AllCredentialsFailed { attempts: usize, last: ServiceError },
}

impl RotationError {
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::NoCredentials | Self::NoResolutionLevels)
    }
}

/// Establishes a per-credential connection to the service.
#[async_trait]
pub trait Connector: Send + Sync {
    type Handle: Send + Sync;

    async fn connect(&self, credential: &str) -> Result<Self::Handle, ServiceError>;
}

struct CredentialSlot<H> {
    credential: String,
    handle: Mutex<Option<Arc<H>>>,
}

/// Owns the credential pool and the round-robin cursor. Build one per
/// process and share it.
pub struct CredentialRotator<C: Connector> {
    connector: C,
    slots: Vec<CredentialSlot<C::Handle>>,
    cursor: Mutex<usize>,
}

impl<C: Connector> CredentialRotator<C> {
    pub fn new(connector: C, credentials: Vec<String>) -> Self {
        let slots = credentials
            .into_iter()
            .map(|credential| CredentialSlot {
                credential,
                handle: Mutex::new(None),
            })
            .collect();
        Self {
            connector,
            slots,
            cursor: Mutex::new(0),
        }
    }

    pub fn pool_size(&self) -> usize {
        self.slots.len()
    }

    pub fn cursor(&self) -> usize {
        *self.cursor.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_connected(&self, slot: usize) -> bool {
        self.slots.get(slot).is_some_and(|slot| {
            slot.handle
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .is_some()
        })
    }

    /// Hands out the slot under the cursor and moves the cursor on.
    fn take_slot(&self) -> usize {
        let mut cursor = self.cursor.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let slot = *cursor % self.slots.len();
        *cursor = (slot + 1) % self.slots.len();
        slot
    }

    async fn connect(&self, slot: usize) -> Result<Arc<C::Handle>, ServiceError> {
        let entry = &self.slots[slot];
        let cached = entry
            .handle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .map(Arc::clone);
        if let Some(handle) = cached {
            return Ok(handle);
        }

        debug!(slot, "Connecting credential");
        let handle = Arc::new(self.connector.connect(&entry.credential).await?);
        *entry
            .handle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(Arc::clone(&handle));
        Ok(handle)
    }

    fn evict(&self, slot: usize) {
        if let Some(entry) = self.slots.get(slot) {
            entry
                .handle
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .take();
        }
    }

    /// Runs `op` with at most one attempt per credential, starting at the
    /// cursor. Quota failures rotate; transient failures are handed back
    /// as [`RotationError::TransientResource`]; anything else stops.
    pub async fn execute<T, F, Fut>(&self, op: F) -> Result<T, RotationError>
    where
        F: Fn(Arc<C::Handle>, usize) -> Fut,
        Fut: Future<Output = Result<T, ServiceError>>,
    {
        if self.slots.is_empty() {
            return Err(RotationError::NoCredentials);
        }

        let mut last = None;
        for _ in 0..self.slots.len() {
            let slot = self.take_slot();
            let result = match self.connect(slot).await {
                Ok(handle) => op(handle, slot).await,
                Err(error) => Err(error),
            };

            let error = match result {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };
            self.evict(slot);

            match error.class {
                FailureClass::QuotaExhausted => {
                    warn!(slot, "Credential quota exhausted; rotating");
                    last = Some(error);
                }
                FailureClass::TransientResource => {
                    return Err(RotationError::TransientResource {
                        slot,
                        source: error,
                    });
                }
                FailureClass::Other => {
                    return Err(RotationError::Fatal {
                        slot,
                        source: error,
                    });
                }
            }
        }

        match last {
            Some(last) => Err(RotationError::AllCredentialsFailed {
                attempts: self.slots.len(),
                last,
            }),
            None => Err(RotationError::NoCredentials),
        }
    }

    /// Wraps [`execute`](Self::execute) in a descending resolution ladder.
    /// Only a transient failure moves to the next cap. A cap that clamps to
    /// the size just tried is skipped.
    pub async fn execute_degraded<T, F, Fut>(
        &self,
        source: Dimensions,
        caps: &[u32],
        op: F,
    ) -> Result<T, RotationError>
    where
        F: Fn(Arc<C::Handle>, Dimensions) -> Fut,
        Fut: Future<Output = Result<T, ServiceError>>,
    {
        let mut last = None;
        let mut previous = None;
        for &cap in caps {
            let size = clamp_to_cap(source, cap);
            if previous == Some(size) {
                debug!(cap, "Resolution cap leaves the request unchanged; skipping");
                continue;
            }
            previous = Some(size);
            match self.execute(|handle, _slot| op(handle, size)).await {
                Ok(value) => return Ok(value),
                Err(error @ RotationError::TransientResource { .. }) => {
                    info!(cap, width = size.width, height = size.height, "Degrading resolution");
                    last = Some(error);
                }
                Err(error) => return Err(error),
            }
        }

        Err(last.unwrap_or(RotationError::NoResolutionLevels))
    }
}

/// Scales `source` down so its longer side fits `cap`, keeping the aspect
/// ratio. Both sides come out even, at most `cap`, and at least 2.
pub fn clamp_to_cap(source: Dimensions, cap: u32) -> Dimensions {
    let longest = source.longest_side();
    let scale = if longest > cap && longest > 0 {
        f64::from(cap) / f64::from(longest)
    } else {
        1.0
    };
    let ceiling = (cap & !1).max(2);

    let side = |value: u32| -> u32 {
        let scaled = (f64::from(value) * scale).round() as u32;
        let even = ((scaled as f64 / 2.0).round() as u32) * 2;
        even.clamp(2, ceiling)
    };

    Dimensions::new(side(source.width), side(source.height))
}
