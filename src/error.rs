use std::fmt;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, TraceError>;

/// Classified tracing error — tells the caller *what* failed so it can pick
/// the right policy: fail construction, retry, drop, or surface as HTTP 404.
#[derive(Debug)]
pub enum TraceError {
    /// Invalid configuration. Fatal at construction time.
    Config(String),
    /// A pipeline stage failed. The event is dropped (or stored uncompressed
    /// when only compression failed).
    Pipeline { stage: &'static str, message: String },
    /// Store busy/locked. Retried with backoff.
    StoreTransient(String),
    /// Store corruption, permission failure, or exhausted retries.
    StoreFatal(String),
    /// A stored blob carries codec tags this build does not understand.
    Decode(String),
    /// Read for an unknown run or step.
    NotFound(String),
}

impl TraceError {
    pub fn config(msg: impl Into<String>) -> Self {
        TraceError::Config(msg.into())
    }

    pub fn pipeline(stage: &'static str, msg: impl fmt::Display) -> Self {
        TraceError::Pipeline {
            stage,
            message: msg.to_string(),
        }
    }

    /// True when a retry of the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, TraceError::StoreTransient(_))
    }
}

impl fmt::Display for TraceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TraceError::Config(msg) => write!(f, "invalid configuration: {msg}"),
            TraceError::Pipeline { stage, message } => {
                write!(f, "pipeline {stage} failed: {message}")
            }
            TraceError::StoreTransient(msg) => write!(f, "store busy: {msg}"),
            TraceError::StoreFatal(msg) => write!(f, "store error: {msg}"),
            TraceError::Decode(msg) => write!(f, "decode error: {msg}"),
            TraceError::NotFound(what) => write!(f, "{what} not found"),
        }
    }
}

impl std::error::Error for TraceError {}

impl From<sqlx::Error> for TraceError {
    fn from(e: sqlx::Error) -> Self {
        // SQLITE_BUSY / SQLITE_LOCKED surface as database errors whose code
        // or message names the lock; everything else is fatal for the batch.
        if let sqlx::Error::Database(db) = &e {
            let code = db.code().map(|c| c.to_string()).unwrap_or_default();
            let msg = db.message().to_lowercase();
            if code == "5" || code == "6" || msg.contains("locked") || msg.contains("busy") {
                return TraceError::StoreTransient(db.message().to_string());
            }
        }
        TraceError::StoreFatal(e.to_string())
    }
}

impl From<serde_json::Error> for TraceError {
    fn from(e: serde_json::Error) -> Self {
        TraceError::pipeline("serialization", e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(TraceError::StoreTransient("locked".into()).is_transient());
        assert!(!TraceError::StoreFatal("corrupt".into()).is_transient());
        assert!(!TraceError::Config("bad".into()).is_transient());
    }

    #[test]
    fn display_includes_stage() {
        let e = TraceError::pipeline("encryption", "bad key length");
        assert_eq!(e.to_string(), "pipeline encryption failed: bad key length");
    }
}
