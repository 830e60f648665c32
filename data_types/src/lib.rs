//! Shared data types used across the tracedb workspace.

#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    clippy::clone_on_ref_ptr,
    clippy::dbg_macro,
    clippy::explicit_iter_loop,
    clippy::use_self,
    missing_debug_implementations,
    missing_docs,
    unreachable_pub
)]

mod block;
mod search;
mod span;

pub use block::*;
pub use search::*;
pub use span::*;

use std::{fmt, str::FromStr, sync::Arc};

use serde::Deserialize;
use thiserror::Error;

/// Length of a trace identifier in bytes.
pub const TRACE_ID_LEN: usize = 16;

/// Errors raised when validating a [`TenantId`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TenantIdError {
    /// Tenant names may not be empty.
    #[error("tenant name may not be empty")]
    Empty,

    /// Tenant names become object-store path segments and must stay out of
    /// the path separator / metacharacter space.
    #[error("tenant name contains invalid character: {0:?}")]
    BadChar(char),

    /// Tenant names are bounded to keep object paths sane.
    #[error("tenant name exceeds {max} bytes", max = TenantId::MAX_LEN)]
    TooLong,
}

/// A validated tenant name.
///
/// Tenants namespace every key in the system: WAL directories, block object
/// paths and ring hash inputs are all tenant-scoped.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TenantId(Arc<str>);

impl TenantId {
    /// Maximum length of a tenant name in bytes.
    pub const MAX_LEN: usize = 128;

    /// Validate `name` and construct a [`TenantId`] from it.
    pub fn new(name: impl AsRef<str>) -> Result<Self, TenantIdError> {
        let name = name.as_ref();
        if name.is_empty() {
            return Err(TenantIdError::Empty);
        }
        if name.len() > Self::MAX_LEN {
            return Err(TenantIdError::TooLong);
        }
        if let Some(c) = name
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
        {
            return Err(TenantIdError::BadChar(c));
        }
        Ok(Self(Arc::from(name)))
    }

    /// The tenant name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TenantId {
    type Err = TenantIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl serde::Serialize for TenantId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for TenantId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::new(s).map_err(serde::de::Error::custom)
    }
}

/// A 16 byte trace identifier.
///
/// Trace ids order the records inside a block and key every lookup; they are
/// compared as big-endian byte strings.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TraceId([u8; TRACE_ID_LEN]);

impl TraceId {
    /// The smallest possible trace id.
    pub const ZERO: Self = Self([0; TRACE_ID_LEN]);

    /// The largest possible trace id.
    pub const MAX: Self = Self([0xff; TRACE_ID_LEN]);

    /// Construct from raw bytes.
    pub const fn from_bytes(bytes: [u8; TRACE_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// The raw bytes of this id.
    pub const fn as_bytes(&self) -> &[u8; TRACE_ID_LEN] {
        &self.0
    }

    /// Interpret the id as a big-endian 128 bit integer.
    pub const fn as_u128(&self) -> u128 {
        u128::from_be_bytes(self.0)
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TraceId({self})")
    }
}

/// Error returned when parsing a [`TraceId`] from hex.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("trace id must be 32 hex characters")]
pub struct TraceIdParseError;

impl FromStr for TraceId {
    type Err = TraceIdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != TRACE_ID_LEN * 2 {
            return Err(TraceIdParseError);
        }
        let mut bytes = [0u8; TRACE_ID_LEN];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let hex = std::str::from_utf8(chunk).map_err(|_| TraceIdParseError)?;
            bytes[i] = u8::from_str_radix(hex, 16).map_err(|_| TraceIdParseError)?;
        }
        Ok(Self(bytes))
    }
}

/// The encoding tag callers supply with span payloads.
///
/// The value is opaque to the core: it travels with the bytes through the
/// WAL, blocks and query responses so that whichever receiver shim wrote the
/// spans can decode them again. By convention it names a protocol and an
/// optional compression, e.g. `otlp_proto` or `otlp_proto/snappy`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DataEncoding(Arc<str>);

impl DataEncoding {
    /// Construct from a tag string.
    pub fn new(tag: impl AsRef<str>) -> Self {
        Self(Arc::from(tag.as_ref()))
    }

    /// The tag as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for DataEncoding {
    fn default() -> Self {
        Self::new("otlp_proto")
    }
}

impl fmt::Display for DataEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl serde::Serialize for DataEncoding {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for DataEncoding {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Self::new(s))
    }
}

/// Coarse classification of failures, used to decide retry behaviour at the
/// component boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDomain {
    /// The caller's fault; retrying the identical request cannot succeed.
    Validation,
    /// A transient fault; safe to retry at a higher layer.
    Transient,
    /// A resource limit was hit; retry after backoff.
    Capacity,
    /// Stored bytes failed an integrity check.
    Corruption,
    /// The local instance can no longer serve; operator attention required.
    Fatal,
}

impl FailureDomain {
    /// Whether a caller may retry the failed operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient | Self::Capacity)
    }
}

/// Implemented by component error types so callers can apply a uniform retry
/// policy without matching on concrete variants.
pub trait ClassifiedError: std::error::Error {
    /// Which [`FailureDomain`] this error belongs to.
    fn domain(&self) -> FailureDomain;

    /// Convenience passthrough to [`FailureDomain::is_retryable`].
    fn is_retryable(&self) -> bool {
        self.domain().is_retryable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tenant_validation() {
        TenantId::new("single-tenant_0.a").unwrap();
        assert_eq!(TenantId::new(""), Err(TenantIdError::Empty));
        assert_eq!(TenantId::new("a/b"), Err(TenantIdError::BadChar('/')));
        assert_eq!(
            TenantId::new("x".repeat(TenantId::MAX_LEN + 1)),
            Err(TenantIdError::TooLong)
        );
    }

    #[test]
    fn trace_id_hex_round_trip() {
        let id: TraceId = "0123456789abcdef0123456789abcdef".parse().unwrap();
        assert_eq!(id.to_string(), "0123456789abcdef0123456789abcdef");
        assert!("123".parse::<TraceId>().is_err());
        assert!("zz23456789abcdef0123456789abcdef".parse::<TraceId>().is_err());
    }

    #[test]
    fn trace_id_orders_as_bytes() {
        let lo = TraceId::from_bytes([0; 16]);
        let mut hi_bytes = [0; 16];
        hi_bytes[0] = 1;
        let hi = TraceId::from_bytes(hi_bytes);
        assert!(lo < hi);
        assert!(lo.as_u128() < hi.as_u128());
    }
}
