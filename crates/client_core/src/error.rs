use thiserror::Error;

/// Failures of the reliable send path. The composed content is never
/// consumed by a failed send; callers keep it and may retry.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("message must contain text or an attachment")]
    EmptyMessage,
    #[error("no active conversation selected")]
    NoActiveConversation,
    #[error("send request failed: {0}")]
    Request(String),
}
