use crate::model::Document;
use crate::resolver::{ConflictResolver, Resolution};

/// Last-write-wins: the side with the greater hybrid timestamp keeps the
/// whole document. Exact ties are impossible because node ids break them.
pub struct LwwResolver;

impl ConflictResolver for LwwResolver {
    fn name(&self) -> &'static str {
        "lww"
    }

    fn resolve(&self, stored: &Document, incoming: &Document) -> Resolution {
        if incoming.updated_at > stored.updated_at {
            Resolution::AcceptIncoming
        } else {
            Resolution::KeepStored
        }
    }
}
