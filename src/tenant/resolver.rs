//! Tenant resolution: turns a caller into a [`ResolvedContext`] through a fixed
//! fallback chain.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::directory::OrganizationDirectory;
use super::{Organization, OrganizationRef, ResolutionMethod, ResolvedContext, TenantId};
use crate::config::{AppConfig, TenancyConfig};
use crate::error::TenancyError;

/// Tenant state attached to an authenticated session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    /// Tenant id validated when the session was established
    #[serde(default)]
    pub tenant_id: Option<TenantId>,
    #[serde(default)]
    pub organization: Option<OrganizationRef>,
}

/// Authenticated identity behind a unit of work.
#[derive(Debug, Clone, PartialEq)]
pub struct Caller {
    pub user_id: String,
    pub session: SessionState,
    /// Administrative/bootstrap credentials
    pub privileged: bool,
}

impl Caller {
    pub fn user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            session: SessionState::default(),
            privileged: false,
        }
    }

    pub fn privileged(user_id: impl Into<String>) -> Self {
        Self { privileged: true, ..Self::user(user_id) }
    }

    pub fn with_session_tenant(mut self, tenant: TenantId) -> Self {
        self.session.tenant_id = Some(tenant);
        self
    }

    pub fn with_organization(mut self, organization: OrganizationRef) -> Self {
        self.session.organization = Some(organization);
        self
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ResolverPolicy {
    /// Permit the last-resort "any tenant" step. Development only.
    pub allow_any_tenant_fallback: bool,
    /// Fetch the organization record when only an id was resolved
    pub materialize_organization: bool,
}

impl ResolverPolicy {
    pub fn from_config(config: &AppConfig) -> Self {
        Self::from_tenancy(&config.tenancy, config.is_production())
    }

    fn from_tenancy(tenancy: &TenancyConfig, production: bool) -> Self {
        Self {
            allow_any_tenant_fallback: tenancy.allow_any_tenant_fallback && !production,
            materialize_organization: tenancy.materialize_organization,
        }
    }
}

pub struct TenantContextResolver {
    directory: Arc<dyn OrganizationDirectory>,
    policy: ResolverPolicy,
}

impl TenantContextResolver {
    pub fn new(directory: Arc<dyn OrganizationDirectory>, policy: ResolverPolicy) -> Self {
        Self { directory, policy }
    }

    pub fn policy(&self) -> ResolverPolicy {
        self.policy
    }

    pub fn directory(&self) -> &Arc<dyn OrganizationDirectory> {
        &self.directory
    }

    /// Resolve the caller's tenant. `asserted` is a tenant the caller named in
    /// its request parameters; it never selects a tenant on its own, it only
    /// has to agree with what resolution finds.
    pub async fn resolve(
        &self,
        caller: &Caller,
        asserted: Option<&TenantId>,
    ) -> Result<ResolvedContext, TenancyError> {
        let resolved = self.resolve_unchecked(caller, asserted).await?;

        if let Some(asserted) = asserted {
            if asserted != resolved.tenant_id() {
                warn!(
                    user = %caller.user_id,
                    asserted = %asserted,
                    resolved = %resolved.tenant_id(),
                    "Tenant mismatch between request and session"
                );
                return Err(TenancyError::TenantMismatch {
                    asserted: asserted.clone(),
                    resolved: resolved.tenant_id().clone(),
                });
            }
        }

        debug!(
            user = %caller.user_id,
            tenant = %resolved.tenant_id(),
            method = ?resolved.method(),
            "Resolved tenant"
        );
        Ok(resolved)
    }

    async fn resolve_unchecked(
        &self,
        caller: &Caller,
        asserted: Option<&TenantId>,
    ) -> Result<ResolvedContext, TenancyError> {
        if let Some(tenant) = &caller.session.tenant_id {
            let organization = if self.policy.materialize_organization {
                self.directory.fetch(tenant.as_str()).await?
            } else {
                None
            };
            return Ok(ResolvedContext::new(tenant.clone(), ResolutionMethod::Session, organization));
        }

        if let Some(reference) = &caller.session.organization {
            if let Some(ctx) = self.resolve_reference(reference).await? {
                return Ok(ctx);
            }
        }

        if let Some(ctx) = self.resolve_membership(&caller.user_id, asserted).await? {
            return Ok(ctx);
        }

        if self.policy.allow_any_tenant_fallback {
            if let Some(org) = self.directory.any().await? {
                warn!(
                    user = %caller.user_id,
                    tenant = %org.id,
                    "Using any-tenant fallback; disable outside development"
                );
                return Self::context_for(org, ResolutionMethod::Fallback);
            }
        }

        Err(TenancyError::TenantNotFound(caller.user_id.clone()))
    }

    /// Normalizes either reference form. A dangling reference yields `None`
    /// so the chain can continue.
    async fn resolve_reference(
        &self,
        reference: &OrganizationRef,
    ) -> Result<Option<ResolvedContext>, TenancyError> {
        match reference {
            OrganizationRef::Resolved(org) => {
                Self::context_for(org.clone(), ResolutionMethod::Reference).map(Some)
            }
            OrganizationRef::Unresolved(id) => match self.directory.fetch(id).await? {
                Some(org) => Self::context_for(org, ResolutionMethod::Reference).map(Some),
                None => {
                    debug!("Organization reference '{}' not found, continuing", id);
                    Ok(None)
                }
            },
        }
    }

    async fn resolve_membership(
        &self,
        user_id: &str,
        asserted: Option<&TenantId>,
    ) -> Result<Option<ResolvedContext>, TenancyError> {
        let mut memberships = self.directory.find_by_member(user_id).await?;
        if memberships.is_empty() {
            return Ok(None);
        }
        memberships.sort_by(|a, b| a.id.cmp(&b.id));

        let chosen = asserted
            .and_then(|t| memberships.iter().position(|o| o.id == t.as_str()))
            .unwrap_or(0);
        let org = memberships.swap_remove(chosen);
        Self::context_for(org, ResolutionMethod::Membership).map(Some)
    }

    fn context_for(org: Organization, method: ResolutionMethod) -> Result<ResolvedContext, TenancyError> {
        let tenant = org.tenant_id()?;
        Ok(ResolvedContext::new(tenant, method, Some(org)))
    }
}
