use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Wall-clock timestamp at 100ns resolution, counted from the Unix epoch.
///
/// The original engine this design is modeled on used Windows `FILETIME`
/// (100ns ticks since 1601-01-01); ticks-since-Unix-epoch keeps the same
/// resolution and ordering properties without pulling in a Windows-epoch
/// dependency. Only relative ordering and the 5-second fresh-timestamp
/// bump (`sync` module) depend on the resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(i64);

const TICKS_PER_SECOND: i64 = 10_000_000;

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp(0);

    pub fn from_ticks(ticks: i64) -> Self {
        Timestamp(ticks)
    }

    pub fn ticks(&self) -> i64 {
        self.0
    }

    pub fn from_chrono(dt: chrono::DateTime<chrono::Utc>) -> Self {
        Timestamp(dt.timestamp() * TICKS_PER_SECOND + i64::from(dt.timestamp_subsec_nanos() / 100))
    }

    pub fn to_chrono(&self) -> chrono::DateTime<chrono::Utc> {
        let secs = self.0.div_euclid(TICKS_PER_SECOND);
        let subsec_ticks = self.0.rem_euclid(TICKS_PER_SECOND);
        chrono::DateTime::from_timestamp(secs, (subsec_ticks * 100) as u32)
            .unwrap_or_else(chrono::Utc::now)
    }

    /// The 5-second bump applied when a transferred value would otherwise
    /// fall behind the destination's current head (see `sync::fresh_timestamp`).
    pub fn plus_seconds(&self, seconds: i64) -> Self {
        Timestamp(self.0 + seconds * TICKS_PER_SECOND)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_chrono().to_rfc3339())
    }
}

/// Immutable identity of one database file; used as the `by` field on
/// every value and to break `when` ties deterministically (stable
/// bytewise compare, inherited from `Uuid`'s own `Ord` impl).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EndpointGuid(Uuid);

impl EndpointGuid {
    pub fn new() -> Self {
        EndpointGuid(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for EndpointGuid {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EndpointGuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The `(Name, Version, PublicKey)` triple a product is known by across
/// databases. `AppId` (database-local, not portable) is assigned by the
/// product registry once a `ProductKey` is first seen.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProductKey {
    pub name: String,
    pub version: String,
    pub public_key: String,
}

/// `PublicKey` value reserved for legacy products (owned by the legacy
/// adapter, never created through the generic `register` API).
pub const LEGACY_PUBLIC_KEY: &str = "0000000000000000";

/// Name of the well-known self-product under which the engine stores
/// its own per-endpoint metadata (remembered remotes, legacy manifests).
pub const SELF_PRODUCT_NAME: &str = "CfgSync.SelfProduct";

impl ProductKey {
    pub fn is_legacy(&self) -> bool {
        self.public_key == LEGACY_PUBLIC_KEY
    }

    pub fn self_product() -> Self {
        ProductKey {
            name: SELF_PRODUCT_NAME.to_string(),
            version: "1.0.0.0".to_string(),
            public_key: LEGACY_PUBLIC_KEY.to_string(),
        }
    }

    /// Validates and normalizes a candidate key per §4.3: name non-empty,
    /// version is four dotted unsigned integers, public key is exactly
    /// 16 hex characters (case-normalized to lowercase by the caller).
    pub fn validate(
        name: &str,
        version: &str,
        public_key: &str,
    ) -> crate::core::Result<ProductKey> {
        use crate::core::SettingsError;

        if name.is_empty() {
            return Err(SettingsError::InvalidFormat(
                "product name must not be empty".into(),
            ));
        }

        let parts: Vec<&str> = version.split('.').collect();
        if parts.len() != 4 || !parts.iter().all(|p| !p.is_empty() && p.parse::<u32>().is_ok()) {
            return Err(SettingsError::InvalidFormat(format!(
                "version '{version}' is not four dotted unsigned integers"
            )));
        }

        let lower = public_key.to_ascii_lowercase();
        if lower.len() != 16 || !lower.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(SettingsError::InvalidFormat(format!(
                "public key '{public_key}' must be exactly 16 hex characters"
            )));
        }

        Ok(ProductKey {
            name: name.to_string(),
            version: version.to_string(),
            public_key: lower,
        })
    }
}
