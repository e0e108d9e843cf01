use std::{
    collections::HashSet,
    fmt,
    sync::{Mutex, PoisonError},
};

use rand::Rng;
use thiserror::Error;

pub const LABEL_LENGTH: usize = 8;
const LABEL_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz";
const MAX_LABEL_LENGTH: usize = 63;

/// Correlation key stamped on every resource of one sandbox.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AppLabel(String);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AppLabelError {
    #[error("app label is empty")]
    Empty,
    #[error("app label exceeds {MAX_LABEL_LENGTH} characters")]
    TooLong,
    #[error("app label contains invalid character {0:?}")]
    InvalidCharacter(char),
}

impl AppLabel {
    /// Draws a fresh label from the lowercase alphabet.
    pub fn random() -> Self {
        let mut rng = rand::rng();
        let label = (0..LABEL_LENGTH)
            .map(|_| char::from(LABEL_CHARSET[rng.random_range(0..LABEL_CHARSET.len())]))
            .collect();
        Self(label)
    }

    /// Accepts labels supplied by observers for deletion. Anything usable as a
    /// cluster label value made of `[a-z0-9-]` is allowed, so sandboxes created
    /// by older deployments can still be removed.
    pub fn parse(raw: &str) -> Result<Self, AppLabelError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(AppLabelError::Empty);
        }
        if raw.len() > MAX_LABEL_LENGTH {
            return Err(AppLabelError::TooLong);
        }
        if let Some(invalid) = raw
            .chars()
            .find(|ch| !(ch.is_ascii_lowercase() || ch.is_ascii_digit() || *ch == '-'))
        {
            return Err(AppLabelError::InvalidCharacter(invalid));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    /// Label selector matching every resource of this sandbox.
    pub fn selector(&self) -> String {
        format!("app={}", self.0)
    }
}

impl fmt::Display for AppLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0.as_str())
    }
}

/// Hands out labels that are unique among sandboxes this process still
/// tracks. A label is held from issue until its sandbox is torn down or its
/// create fails before any resource exists.
#[derive(Debug, Default)]
pub struct AppLabelIssuer {
    live: Mutex<HashSet<AppLabel>>,
}

impl AppLabelIssuer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn issue(&self) -> AppLabel {
        let mut live = self.live.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            let candidate = AppLabel::random();
            if live.insert(candidate.clone()) {
                return candidate;
            }
            tracing::debug!(app_label = %candidate, "app label collision, redrawing");
        }
    }

    /// Frees `label` for reuse. Returns whether it was held.
    pub fn release(&self, label: &AppLabel) -> bool {
        self.live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(label)
    }

    pub fn live_count(&self) -> usize {
        self.live.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}
