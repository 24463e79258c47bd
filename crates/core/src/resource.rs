//! Resource resolver collaborator.
//!
//! Messages may carry `ContentPart::Resource` references to blobs stored
//! elsewhere. The context manager asks a resolver to expand them into inline
//! parts when it formats a view for the model.

use async_trait::async_trait;

use crate::message::ContentPart;

#[async_trait]
pub trait ResourceResolver: Send + Sync {
    /// Inline parts for `uri`, or `None` when the reference cannot be resolved.
    async fn resolve(&self, uri: &str, mime_type: Option<&str>) -> Option<Vec<ContentPart>>;
}
