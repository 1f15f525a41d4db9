//! Tenant identity: ids, schema names, organization references and the
//! per-unit-of-work resolved context.

pub mod directory;
pub mod resolver;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};

use crate::error::TenancyError;

pub use directory::{MemoryDirectory, OrganizationDirectory, PgDirectory};
pub use resolver::{Caller, ResolverPolicy, SessionState, TenantContextResolver};

/// Leaves room for the schema prefix inside Postgres' 63 byte identifier limit.
const MAX_TENANT_ID_LEN: usize = 59;

/// Opaque organization identifier. Validated so it can always be turned into a
/// schema name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    pub fn parse(raw: impl Into<String>) -> Result<Self, TenancyError> {
        let raw = raw.into();
        if Self::is_valid(&raw) {
            Ok(Self(raw))
        } else {
            Err(TenancyError::InvalidTenantId(raw))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn is_valid(raw: &str) -> bool {
        !raw.is_empty()
            && raw.len() <= MAX_TENANT_ID_LEN
            && raw.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for TenantId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        TenantId::parse(raw).map_err(serde::de::Error::custom)
    }
}

/// Name of the namespace holding one tenant's tables.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SchemaName(String);

impl SchemaName {
    pub fn for_tenant(prefix: &str, tenant: &TenantId) -> Self {
        Self(format!("{}{}", prefix, tenant.as_str()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Double-quoted identifier, safe to interpolate into SQL
    pub fn quoted(&self) -> String {
        format!("\"{}\"", self.0.replace('"', "\"\""))
    }
}

impl fmt::Display for SchemaName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Organization record as owned by the business layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Organization {
    #[serde(alias = "objectId")]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub members: Vec<String>,
    #[serde(default, alias = "createdAt")]
    pub created_at: Option<DateTime<Utc>>,
}

impl Organization {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            members: Vec::new(),
            created_at: Some(Utc::now()),
        }
    }

    pub fn with_members<I, S>(mut self, members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.members = members.into_iter().map(Into::into).collect();
        self
    }

    pub fn has_member(&self, user_id: &str) -> bool {
        self.members.iter().any(|m| m == user_id)
    }

    pub fn tenant_id(&self) -> Result<TenantId, TenancyError> {
        TenantId::parse(self.id.clone())
    }
}

/// A session's link to its organization: either just an id that still has to
/// be fetched, or the materialized record.
///
/// Deserializes from a bare id string, a pointer object
/// (`{"__type":"Pointer","className":"Organization","objectId":..}`) or a full
/// organization record.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "WireOrganizationRef")]
pub enum OrganizationRef {
    Unresolved(String),
    Resolved(Organization),
}

impl OrganizationRef {
    pub fn id(&self) -> &str {
        match self {
            OrganizationRef::Unresolved(id) => id,
            OrganizationRef::Resolved(org) => &org.id,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WireOrganizationRef {
    Id(String),
    Pointer {
        #[serde(rename = "__type")]
        kind: String,
        #[serde(rename = "className")]
        class_name: String,
        #[serde(rename = "objectId")]
        object_id: String,
    },
    Record(Organization),
}

impl TryFrom<WireOrganizationRef> for OrganizationRef {
    type Error = String;

    fn try_from(wire: WireOrganizationRef) -> Result<Self, Self::Error> {
        match wire {
            WireOrganizationRef::Id(id) => Ok(OrganizationRef::Unresolved(id)),
            WireOrganizationRef::Pointer { kind, class_name, object_id } => {
                if class_name != "Organization" {
                    return Err(format!("reference to '{}' is not an organization", class_name));
                }
                if kind != "Pointer" && kind != "Object" {
                    return Err(format!("unsupported reference type '{}'", kind));
                }
                Ok(OrganizationRef::Unresolved(object_id))
            }
            WireOrganizationRef::Record(org) => Ok(OrganizationRef::Resolved(org)),
        }
    }
}

impl Serialize for OrganizationRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            OrganizationRef::Unresolved(id) => serializer.serialize_str(id),
            OrganizationRef::Resolved(org) => org.serialize(serializer),
        }
    }
}

/// How a unit of work's tenant was determined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionMethod {
    /// Named in the parameters of a privileged call
    ExplicitParameter,
    /// Validated tenant id already attached to the session
    Session,
    /// Organization reference attached to the session
    Reference,
    /// Reverse lookup of the caller's memberships
    Membership,
    /// Development-only "any tenant" fallback
    Fallback,
}

/// Outcome of tenant resolution for one unit of work. Immutable once built;
/// only this crate can construct one, so storage calls cannot be pointed at a
/// tenant that did not pass through resolution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedContext {
    tenant_id: TenantId,
    method: ResolutionMethod,
    #[serde(skip_serializing_if = "Option::is_none")]
    organization: Option<Organization>,
}

impl ResolvedContext {
    pub(crate) fn new(tenant_id: TenantId, method: ResolutionMethod, organization: Option<Organization>) -> Self {
        Self { tenant_id, method, organization }
    }

    pub fn tenant_id(&self) -> &TenantId {
        &self.tenant_id
    }

    pub fn method(&self) -> ResolutionMethod {
        self.method
    }

    pub fn organization(&self) -> Option<&Organization> {
        self.organization.as_ref()
    }
}

/// What the organization middleware hands to a unit of work.
#[derive(Debug, Clone, PartialEq)]
pub enum TenantScope {
    /// Tenant-agnostic or privileged call without a target tenant
    Unscoped,
    Scoped(ResolvedContext),
}

impl TenantScope {
    pub fn context(&self) -> Option<&ResolvedContext> {
        match self {
            TenantScope::Unscoped => None,
            TenantScope::Scoped(ctx) => Some(ctx),
        }
    }
}
