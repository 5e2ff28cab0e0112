mod lww;
mod merge;

pub use lww::LwwResolver;
pub use merge::MergeResolver;

use std::str::FromStr;
use std::sync::Arc;

use serde_json::Value;

use crate::error::{config_error, EntglError};
use crate::model::Document;

/// Outcome of resolving a replicated write against the stored document.
#[derive(Clone, Debug, PartialEq)]
pub enum Resolution {
    /// The stored document stays; the incoming oplog entry is still applied
    /// for hash continuity.
    KeepStored,
    /// The incoming document becomes effective.
    AcceptIncoming,
    /// Both sides diverged structurally; the carried content supersedes both
    /// and is republished as a local write so peers learn the merge.
    Merged(Value),
}

/// Convergent conflict resolution, selected per node by configuration.
pub trait ConflictResolver: Send + Sync {
    fn name(&self) -> &'static str;

    fn resolve(&self, stored: &Document, incoming: &Document) -> Resolution;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ResolverKind {
    #[default]
    Lww,
    Merge,
}

impl ResolverKind {
    pub fn build(self) -> Arc<dyn ConflictResolver> {
        match self {
            ResolverKind::Lww => Arc::new(LwwResolver),
            ResolverKind::Merge => Arc::new(MergeResolver),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ResolverKind::Lww => "lww",
            ResolverKind::Merge => "merge",
        }
    }
}

impl FromStr for ResolverKind {
    type Err = EntglError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "lww" => Ok(ResolverKind::Lww),
            "merge" => Ok(ResolverKind::Merge),
            other => Err(config_error(format!("unknown resolver `{other}`"))),
        }
    }
}

/// Runtime-switchable resolver selection. Delegates to whichever resolver the
/// node is currently configured with, so a switch applies to the next
/// replicated batch without rebuilding the engine.
pub struct ResolverSlot {
    kind: std::sync::Mutex<ResolverKind>,
    current: std::sync::Mutex<Arc<dyn ConflictResolver>>,
}

impl ResolverSlot {
    pub fn new(kind: ResolverKind) -> Self {
        Self {
            kind: std::sync::Mutex::new(kind),
            current: std::sync::Mutex::new(kind.build()),
        }
    }

    pub fn kind(&self) -> ResolverKind {
        *self.kind.lock().unwrap()
    }

    pub fn switch(&self, kind: ResolverKind) {
        *self.kind.lock().unwrap() = kind;
        *self.current.lock().unwrap() = kind.build();
    }
}

impl ConflictResolver for ResolverSlot {
    fn name(&self) -> &'static str {
        self.kind().as_str()
    }

    fn resolve(&self, stored: &Document, incoming: &Document) -> Resolution {
        let resolver = Arc::clone(&self.current.lock().unwrap());
        resolver.resolve(stored, incoming)
    }
}
