use thiserror::Error;

/// Boxed error raised by a substrate cursor. The index never inspects it, only wraps it.
pub type SubstrateError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Custom error type for index search and maintenance operations.
#[derive(Error, Debug)]
pub enum IndexError {
    /// A direct lookup (series key, TSID) found nothing. Predicates that match nothing
    /// return an empty result instead.
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization Error: {0}")]
    Serialization(String),

    #[error("Lock acquisition failed: {0}")]
    LockError(String),

    /// A row or key is structurally broken (missing separator, truncated TSID list,
    /// non-incrementable skip-ahead byte, bad snapshot checksum).
    #[error("Corruption detected: {details}")]
    Corruption {
        details: String,
        /// Offending key rendered as hex, when one is available.
        key: Option<String>,
    },

    /// The substrate cursor failed; `prefix` is the search prefix (hex) being scanned.
    #[error("Substrate error when searching for prefix {prefix}: {source}")]
    Substrate {
        prefix: String,
        #[source]
        source: SubstrateError,
    },

    #[error("Invalid expression: {0}")]
    InvalidExpr(String),

    #[error("Invalid regular expression {pattern:?}: {source}")]
    InvalidRegex {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("Configuration Error: {0}")]
    ConfigError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl IndexError {
    pub(crate) fn corruption(details: impl Into<String>, key: &[u8]) -> Self {
        IndexError::Corruption {
            details: details.into(),
            key: Some(hex(key)),
        }
    }

    pub(crate) fn substrate(prefix: &[u8], source: SubstrateError) -> Self {
        IndexError::Substrate {
            prefix: hex(prefix),
            source,
        }
    }

    /// True for [`IndexError::NotFound`], so callers can branch on "nothing there" vs "failed".
    pub fn is_not_found(&self) -> bool {
        matches!(self, IndexError::NotFound(_))
    }
}

// Implement conversion from lock poison errors for convenience
impl<T> From<std::sync::PoisonError<T>> for IndexError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        IndexError::LockError(format!("Mutex/RwLock poisoned: {}", err))
    }
}

/// Lowercase hex rendering used in diagnostics.
pub(crate) fn hex(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push_str(&format!("{:02x}", b));
    }
    s
}
