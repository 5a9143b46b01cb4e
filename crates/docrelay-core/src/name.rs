//! Document naming

use crate::error::{Error, Result};

/// Name assigned to connections whose request path carries no document name.
pub const DEFAULT_DOC: &str = "default";

/// Document name - opaque UTF-8 string, max 512 bytes
///
/// Derived from the connection's request path; two clients that connect with
/// the same name share one replica, connection set, and presence table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocName(String);

impl DocName {
    /// Create a document name, validating the format
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();

        if name.is_empty() {
            return Err(Error::InvalidDocName("Document name cannot be empty".into()));
        }

        if name.len() > 512 {
            return Err(Error::InvalidDocName(
                "Document name exceeds 512 bytes".into(),
            ));
        }

        if name.chars().any(|c| c.is_control()) {
            return Err(Error::InvalidDocName(
                "Document name contains control characters".into(),
            ));
        }

        Ok(Self(name))
    }

    /// Derive a document name from a request path.
    ///
    /// The leading slash is stripped; an empty remainder maps to the fixed
    /// default name. The name is otherwise opaque - no percent-decoding.
    pub fn from_path(path: &str) -> Result<Self> {
        let name = path.strip_prefix('/').unwrap_or(path);
        if name.is_empty() {
            Ok(Self(DEFAULT_DOC.to_string()))
        } else {
            Self::new(name)
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DocName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
