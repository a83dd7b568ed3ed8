use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{AnalysisError, AnalysisResult};

/// Monotonic request counter. The issuing side is the only writer; any number of
/// in-flight tickets compare against it.
#[derive(Debug, Clone, Default)]
pub struct TokenCounter {
    current: Arc<AtomicU64>,
}

impl TokenCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Invalidates every outstanding ticket and returns a fresh one.
    pub fn issue(&self) -> Ticket {
        let token = self.current.fetch_add(1, Ordering::AcqRel) + 1;
        Ticket { token, current: self.current.clone() }
    }

    pub fn current(&self) -> u64 {
        self.current.load(Ordering::Acquire)
    }

    pub fn is_current(&self, token: u64) -> bool {
        self.current() == token
    }
}

/// Token captured by one request, checked at each suspension point.
#[derive(Debug, Clone)]
pub struct Ticket {
    token: u64,
    current: Arc<AtomicU64>,
}

impl Ticket {
    pub fn token(&self) -> u64 {
        self.token
    }

    pub fn is_current(&self) -> bool {
        self.current.load(Ordering::Acquire) == self.token
    }

    pub fn ensure_current(&self) -> AnalysisResult<()> {
        if self.is_current() { Ok(()) } else { Err(AnalysisError::Cancelled) }
    }
}
