//! Control-plane surface the container-volume adapter depends on.

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

use crate::model::Labels;
use crate::provider::BackendFuture;

const BINARY_SUFFIXES: [(&str, u32); 5] = [("Ki", 1), ("Mi", 2), ("Gi", 3), ("Ti", 4), ("Pi", 5)];
const DECIMAL_SUFFIXES: [(&str, u32); 5] = [("k", 1), ("M", 2), ("G", 3), ("T", 4), ("P", 5)];

/// Reads an integral storage quantity such as `10Gi`, `500M` or `1024` as
/// bytes.
///
/// Fractional and exponent forms are not produced for storage requests and
/// are rejected.
#[must_use]
pub fn quantity_bytes(quantity: &Quantity) -> Option<u64> {
    let value = quantity.0.trim();
    for (suffix, power) in BINARY_SUFFIXES {
        if let Some(number) = value.strip_suffix(suffix) {
            return number.parse::<u64>().ok()?.checked_mul(1024_u64.checked_pow(power)?);
        }
    }
    for (suffix, power) in DECIMAL_SUFFIXES {
        if let Some(number) = value.strip_suffix(suffix) {
            return number.parse::<u64>().ok()?.checked_mul(1000_u64.checked_pow(power)?);
        }
    }
    value.parse().ok()
}

/// Renders whole gigabytes as a binary quantity.
#[must_use]
pub fn gigabytes(size_gb: u64) -> Quantity {
    Quantity(format!("{size_gb}Gi"))
}

/// Persistent volume claim as reported by the API server.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Claim {
    /// Claim name, unique per namespace.
    pub name: String,
    /// Server-assigned UID.
    pub uid: String,
    /// `Pending`, `Bound` or `Lost`.
    pub phase: String,
    /// Provisioned capacity in bytes, once bound.
    pub capacity_bytes: Option<u64>,
}

/// Parameters for creating a claim.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct NewClaim {
    /// Claim name.
    pub name: String,
    /// Requested size in gigabytes.
    pub size_gb: u64,
    /// Storage class; the cluster default when unset.
    pub storage_class: Option<String>,
    /// Labels, already sanitised.
    pub labels: Labels,
    /// Volume snapshot to populate the claim from.
    pub source_snapshot: Option<String>,
}

/// Parameters for creating a volume snapshot.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct NewClaimSnapshot {
    /// Snapshot name.
    pub name: String,
    /// Claim to snapshot.
    pub claim: String,
    /// Volume snapshot class; the cluster default when unset.
    pub class: Option<String>,
    /// Labels, already sanitised.
    pub labels: Labels,
}

/// Volume snapshot as reported by the API server.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ClaimSnapshot {
    /// Snapshot name.
    pub name: String,
    /// Server-assigned UID.
    pub uid: String,
    /// Whether the snapshot can be restored from.
    pub ready: bool,
    /// Error reported by the snapshot controller.
    pub error: Option<String>,
    /// Minimum size of a claim restored from the snapshot.
    pub restore_bytes: Option<u64>,
}

/// API server calls used by the adapter, scoped to one namespace.
pub trait ClaimApi: Send + Sync {
    /// Reads a claim; `None` when it does not exist.
    fn get_claim<'a>(&'a self, name: &'a str) -> BackendFuture<'a, Option<Claim>>;

    /// Creates a claim.
    fn create_claim<'a>(&'a self, claim: &'a NewClaim) -> BackendFuture<'a, Claim>;

    /// Deletes a claim.
    fn delete_claim<'a>(&'a self, name: &'a str) -> BackendFuture<'a, ()>;

    /// Raises the storage request of a claim.
    fn resize_claim<'a>(&'a self, name: &'a str, size_gb: u64) -> BackendFuture<'a, ()>;

    /// Creates a volume snapshot of a claim.
    fn create_snapshot<'a>(&'a self, snapshot: &'a NewClaimSnapshot) -> BackendFuture<'a, ()>;

    /// Reads a volume snapshot; `None` when it does not exist.
    fn get_snapshot<'a>(&'a self, name: &'a str) -> BackendFuture<'a, Option<ClaimSnapshot>>;

    /// Deletes a volume snapshot.
    fn delete_snapshot<'a>(&'a self, name: &'a str) -> BackendFuture<'a, ()>;
}
