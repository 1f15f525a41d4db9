use axum::http::HeaderMap;
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::error::TenancyError;
use crate::tenant::{Caller, OrganizationRef, SessionState, TenantId};

/// Session claims carried by a bearer token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    /// User id
    pub sub: String,
    /// Tenant id validated when the session was established
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub org: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization: Option<OrganizationRef>,
    #[serde(default)]
    pub master: bool,
    pub exp: i64,
    pub iat: i64,
}

impl Claims {
    pub fn new(user_id: impl Into<String>, expiry_hours: u64) -> Self {
        let now = Utc::now();
        let exp = (now + Duration::hours(expiry_hours as i64)).timestamp();

        Self {
            sub: user_id.into(),
            org: None,
            organization: None,
            master: false,
            exp,
            iat: now.timestamp(),
        }
    }

    pub fn with_tenant(mut self, tenant: &TenantId) -> Self {
        self.org = Some(tenant.to_string());
        self
    }

    pub fn with_organization(mut self, organization: OrganizationRef) -> Self {
        self.organization = Some(organization);
        self
    }

    pub fn master(mut self) -> Self {
        self.master = true;
        self
    }

    pub fn into_caller(self) -> Result<Caller, TenancyError> {
        let tenant_id = self
            .org
            .map(TenantId::parse)
            .transpose()
            .map_err(|_| TenancyError::Unauthenticated("token carries an invalid organization id".to_string()))?;

        Ok(Caller {
            user_id: self.sub,
            session: SessionState {
                tenant_id,
                organization: self.organization,
            },
            privileged: self.master,
        })
    }
}

pub fn issue_token(claims: &Claims, secret: &str) -> Result<String, TenancyError> {
    if secret.is_empty() {
        return Err(TenancyError::Unauthenticated("JWT secret not configured".to_string()));
    }

    let encoding_key = EncodingKey::from_secret(secret.as_bytes());
    encode(&Header::default(), claims, &encoding_key)
        .map_err(|e| TenancyError::Unauthenticated(format!("JWT generation error: {}", e)))
}

/// Validate a token and extract its claims
pub fn validate_token(token: &str, secret: &str) -> Result<Claims, TenancyError> {
    if secret.is_empty() {
        return Err(TenancyError::Unauthenticated("JWT secret not configured".to_string()));
    }

    let decoding_key = DecodingKey::from_secret(secret.as_bytes());
    let token_data = decode::<Claims>(token, &decoding_key, &Validation::default())
        .map_err(|e| TenancyError::Unauthenticated(format!("Invalid JWT token: {}", e)))?;

    Ok(token_data.claims)
}

/// Caller behind the request's bearer token. No Authorization header means
/// an anonymous request; a malformed or invalid one is an error.
pub fn caller_from_headers(headers: &HeaderMap, secret: &str) -> Result<Option<Caller>, TenancyError> {
    let Some(auth_header) = headers.get(axum::http::header::AUTHORIZATION) else {
        return Ok(None);
    };

    let auth_str = auth_header
        .to_str()
        .map_err(|_| TenancyError::Unauthenticated("Invalid Authorization header format".to_string()))?;

    let token = auth_str
        .strip_prefix("Bearer ")
        .ok_or_else(|| TenancyError::Unauthenticated("Authorization header must use Bearer token format".to_string()))?
        .trim();
    if token.is_empty() {
        return Err(TenancyError::Unauthenticated("Empty JWT token".to_string()));
    }

    validate_token(token, secret)?.into_caller().map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    const SECRET: &str = "test-secret";

    fn bearer(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_str(&format!("Bearer {}", token)).unwrap());
        headers
    }

    #[test]
    fn token_round_trips_into_caller() {
        let tenant = TenantId::parse("acme").unwrap();
        let token = issue_token(&Claims::new("alice", 1).with_tenant(&tenant), SECRET).unwrap();
        let caller = caller_from_headers(&bearer(&token), SECRET).unwrap().unwrap();
        assert_eq!(caller.user_id, "alice");
        assert_eq!(caller.session.tenant_id, Some(tenant));
        assert!(!caller.privileged);
    }

    #[test]
    fn missing_header_is_anonymous_but_bad_token_is_rejected() {
        assert_eq!(caller_from_headers(&HeaderMap::new(), SECRET).unwrap(), None);

        let err = caller_from_headers(&bearer("not-a-jwt"), SECRET).unwrap_err();
        assert!(matches!(err, TenancyError::Unauthenticated(_)));

        let token = issue_token(&Claims::new("alice", 1), "other-secret").unwrap();
        assert!(caller_from_headers(&bearer(&token), SECRET).is_err());
    }

    #[test]
    fn master_claim_marks_caller_privileged() {
        let token = issue_token(&Claims::new("root", 1).master(), SECRET).unwrap();
        let caller = caller_from_headers(&bearer(&token), SECRET).unwrap().unwrap();
        assert!(caller.privileged);
    }
}
