//! Cache key for remote resource list lookups.

use std::fmt;

/// Identifies one remote resource list lookup.
///
/// `ids` and `fields` are pre-joined by the caller; the key does not
/// normalize them, so differently ordered inputs map to different entries.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RemoteResourceListCacheKey {
    pub tenant: String,
    pub system: String,
    pub resource_type: String,
    pub ids: String,
    pub fields: String,
}

impl RemoteResourceListCacheKey {
    pub fn new(
        tenant: impl Into<String>,
        system: impl Into<String>,
        resource_type: impl Into<String>,
        ids: impl Into<String>,
        fields: impl Into<String>,
    ) -> Self {
        Self {
            tenant: tenant.into(),
            system: system.into(),
            resource_type: resource_type.into(),
            ids: ids.into(),
            fields: fields.into(),
        }
    }

    /// Lowercase hex MD5 of `tenant:system:type:ids:fields`.
    pub fn key(&self) -> String {
        format!("{:x}", md5::compute(self.to_string()))
    }
}

impl fmt::Display for RemoteResourceListCacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}:{}",
            self.tenant, self.system, self.resource_type, self.ids, self.fields
        )
    }
}
