pub mod auth;
pub mod layer;
pub mod organization;
pub mod response;

pub use auth::{caller_from_headers, issue_token, validate_token, Claims};
pub use layer::{operation_name, organization_context, ContextLayerState, TENANT_HEADER};
pub use organization::{OrganizationContextMiddleware, UnitOfWork, TENANT_PARAM};
pub use response::{ApiResponse, ApiResult};
