mod engine;
mod server;
mod session;

pub use engine::{SyncConfig, SyncEngine};
pub use server::SyncServer;
pub use session::{PeerSession, DEFAULT_CONNECT_TIMEOUT};

use std::sync::Arc;

use crate::cache::DocumentCache;
use crate::protocol::HandshakeConfig;
use crate::resolver::ConflictResolver;
use crate::store::PeerStore;
use crate::telemetry::TelemetrySink;

/// Everything the pull loops, the tail path, and the serving side share.
#[derive(Clone)]
pub struct SyncContext {
    pub store: Arc<dyn PeerStore>,
    pub resolver: Arc<dyn ConflictResolver>,
    pub cache: Arc<DocumentCache>,
    pub telemetry: TelemetrySink,
    pub handshake: HandshakeConfig,
}
