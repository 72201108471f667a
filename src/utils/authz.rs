#![forbid(unsafe_code)]

use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use poem::Request;
use serde::{Deserialize, Serialize};

use log::error;

use crate::utils::config::RuntimeCtx;
use crate::utils::db;
use crate::utils::errors::EngineError;
use crate::utils::sbs_utils::timestamp_utc;

// ***************************************************************************
//                          Constants and Types
// ***************************************************************************
// Tenant-scoped request headers.
pub const X_TENANT_ID: &str = "x-tenant-id";
pub const X_TENANT_SECRET: &str = "x-tenant-secret";
pub const ORIGIN_HEADER: &str = "origin";
pub const AUTHORIZATION_HEADER: &str = "authorization";
pub const X_EXTERNAL_USER_ID: &str = "x-external-user-id";
pub const X_EXTERNAL_USER_EMAIL: &str = "x-external-user-email";
pub const X_EXTERNAL_USER_NAME: &str = "x-external-user-name";

const BEARER_PREFIX: &str = "Bearer ";
const USER_TOKEN_TYPE: &str = "user";
const EXTERNAL_ID_PREFIX: &str = "ext:";

// ---------------------------------------------------------------------------
// RequestCtx:
// ---------------------------------------------------------------------------
/// The two facts every engine operation depends on: which tenant and which
/// user.  Populated by `authenticate` before any engine call.
#[derive(Debug, Clone)]
pub struct RequestCtx {
    pub tenant: TenantCtx,
    pub user: UserCtx,
}

#[derive(Debug, Clone)]
pub struct TenantCtx {
    pub tenant_id: String,
    pub domain: String,
}

#[derive(Debug, Clone)]
pub struct UserCtx {
    pub user_id: String,
    pub email: Option<String>,
    pub name: Option<String>,
}

// ---------------------------------------------------------------------------
// ExternalUserFields:
// ---------------------------------------------------------------------------
/// External user identity declared in a request body; same treatment as the
/// x-external-user-* headers.
#[derive(Debug, Default, Clone)]
pub struct ExternalUserFields {
    pub external_user_id: Option<String>,
    pub external_user_email: Option<String>,
    pub external_user_name: Option<String>,
}

// ---------------------------------------------------------------------------
// Claims:
// ---------------------------------------------------------------------------
/// User bearer token payload (HS256, signed with the user-token secret).
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    #[serde(rename = "type")]
    pub token_type: String,
    pub exp: usize,
}

// ***************************************************************************
//                          Public Functions
// ***************************************************************************
// ---------------------------------------------------------------------------
// authenticate:
// ---------------------------------------------------------------------------
/** Establish the tenant and the user for a request, in that order.  Tenant
 * authentication must succeed before any external-user identity is
 * accepted, since external ids are namespaced under the tenant.
 */
pub async fn authenticate(
    ctx: &RuntimeCtx,
    http_req: &Request,
    body_user: Option<&ExternalUserFields>,
) -> Result<RequestCtx, EngineError> {
    let tenant = authenticate_tenant(ctx, http_req).await?;
    let user = authenticate_user(ctx, http_req, &tenant, body_user).await?;
    Ok(RequestCtx { tenant, user })
}

// ---------------------------------------------------------------------------
// authenticate_tenant:
// ---------------------------------------------------------------------------
/** Validate the tenant credential headers and the request origin against
 * the tenant record.
 */
pub async fn authenticate_tenant(
    ctx: &RuntimeCtx,
    http_req: &Request,
) -> Result<TenantCtx, EngineError> {
    let hdr_tenant_id = get_required_header(http_req, X_TENANT_ID)?;
    let hdr_secret = get_required_header(http_req, X_TENANT_SECRET)?;

    // Look up the tenant record.
    let tenant = db::get_tenant(&ctx.db, &hdr_tenant_id)
        .await?
        .ok_or_else(|| {
            error!("Unknown tenant id '{}' presented.", hdr_tenant_id);
            EngineError::Authentication("invalid tenant credentials".to_string())
        })?;

    if tenant.enabled == 0 {
        error!("Disabled tenant '{}' attempted access.", hdr_tenant_id);
        return Err(EngineError::Authorization("tenant is disabled".to_string()));
    }

    // Compare the header secret against the stored bcrypt hash.  bcrypt's
    // verification is constant-time over the hash comparison.
    if !verify_tenant_secret(&hdr_secret, &tenant.secret_hash)? {
        error!("Invalid secret given for tenant '{}'.", hdr_tenant_id);
        return Err(EngineError::Authentication("invalid tenant credentials".to_string()));
    }

    // Origin policy: a tenant with restrictions requires a matching origin;
    // a tenant without restrictions falls back to the configured default.
    let origin = http_req.header(ORIGIN_HEADER).map(|s| s.to_string());
    let mut patterns = tenant.origin_patterns();
    if patterns.is_empty() {
        patterns = ctx.parms.config.allowed_origins_default.clone();
    }
    check_origin(&patterns, origin.as_deref(), &hdr_tenant_id)?;

    Ok(TenantCtx { tenant_id: tenant.tenant_id, domain: tenant.domain })
}

// ---------------------------------------------------------------------------
// authenticate_user:
// ---------------------------------------------------------------------------
/** Resolve the user identity.  Three modes, tried in order: a Bearer token
 * signed with the user-token secret; external-user headers; external-user
 * fields declared in the request body.
 *
 * A present-but-invalid Authorization header is rejected outright rather
 * than silently falling through to the external-user path.
 */
pub async fn authenticate_user(
    ctx: &RuntimeCtx,
    http_req: &Request,
    tenant: &TenantCtx,
    body_user: Option<&ExternalUserFields>,
) -> Result<UserCtx, EngineError> {
    if let Some(auth_value) = http_req.header(AUTHORIZATION_HEADER) {
        return authenticate_bearer(ctx, auth_value).await;
    }

    // Header-declared external user.
    if let Some(external_id) = http_req.header(X_EXTERNAL_USER_ID) {
        if external_id.is_empty() {
            return Err(EngineError::Validation("empty x-external-user-id header".to_string()));
        }
        return Ok(UserCtx {
            user_id: external_user_id(&tenant.tenant_id, external_id),
            email: http_req.header(X_EXTERNAL_USER_EMAIL).map(|s| s.to_string()),
            name: http_req.header(X_EXTERNAL_USER_NAME).map(|s| s.to_string()),
        });
    }

    // Body-declared external user.
    if let Some(fields) = body_user {
        if let Some(external_id) = fields.external_user_id.as_deref() {
            if !external_id.is_empty() {
                return Ok(UserCtx {
                    user_id: external_user_id(&tenant.tenant_id, external_id),
                    email: fields.external_user_email.clone(),
                    name: fields.external_user_name.clone(),
                });
            }
        }
    }

    Err(EngineError::Authentication("no user identity provided".to_string()))
}

// ---------------------------------------------------------------------------
// issue_user_token:
// ---------------------------------------------------------------------------
/** Mint a user bearer token.  Exposed for the identity collaborator and the
 * test suites; the engine itself only validates.
 */
#[allow(dead_code)]
pub fn issue_user_token(
    secret: &str,
    user_id: &str,
    ttl_seconds: i64,
) -> Result<String, EngineError> {
    let claims = Claims {
        sub: user_id.to_string(),
        token_type: USER_TOKEN_TYPE.to_string(),
        exp: (timestamp_utc().timestamp() + ttl_seconds) as usize,
    };
    encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_bytes()))
        .map_err(|e| EngineError::Authentication(format!("unable to sign user token: {}", e)))
}

// ---------------------------------------------------------------------------
// external_user_id:
// ---------------------------------------------------------------------------
/** Synthesize the stable namespaced id for an external user.  Bare external
 * ids are never persisted: without the tenant prefix two tenants' user "42"
 * would collide in the shared identity pool.
 */
pub fn external_user_id(tenant_id: &str, external_id: &str) -> String {
    format!("{}{}:{}", EXTERNAL_ID_PREFIX, tenant_id, external_id)
}

// ---------------------------------------------------------------------------
// hash_tenant_secret / verify_tenant_secret:
// ---------------------------------------------------------------------------
pub fn hash_tenant_secret(secret: &str, cost: u32) -> Result<String, EngineError> {
    bcrypt::hash(secret, cost)
        .map_err(|e| EngineError::StoreUnavailable(format!("secret hashing: {}", e)))
}

pub fn verify_tenant_secret(secret: &str, stored_hash: &str) -> Result<bool, EngineError> {
    bcrypt::verify(secret, stored_hash)
        .map_err(|e| EngineError::StoreUnavailable(format!("secret verification: {}", e)))
}

// ***************************************************************************
//                          Private Functions
// ***************************************************************************
// ---------------------------------------------------------------------------
// authenticate_bearer:
// ---------------------------------------------------------------------------
async fn authenticate_bearer(ctx: &RuntimeCtx, auth_value: &str) -> Result<UserCtx, EngineError> {
    let token = auth_value
        .strip_prefix(BEARER_PREFIX)
        .ok_or_else(|| {
            EngineError::Authentication("malformed authorization header".to_string())
        })?;

    let secret = &ctx.parms.config.user_token_secret;
    let token_data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|e| {
        error!("User token rejected: {}", e);
        EngineError::Authentication("invalid or expired user token".to_string())
    })?;

    if token_data.claims.token_type != USER_TOKEN_TYPE {
        return Err(EngineError::Authentication("wrong token type".to_string()));
    }

    // The referenced user must exist and be active.
    let user = db::get_user(&ctx.db, &token_data.claims.sub)
        .await?
        .ok_or_else(|| EngineError::Authentication("unknown user".to_string()))?;
    if user.enabled == 0 {
        return Err(EngineError::Authentication("user is disabled".to_string()));
    }

    Ok(UserCtx { user_id: user.user_id, email: Some(user.email), name: Some(user.name) })
}

// ---------------------------------------------------------------------------
// check_origin:
// ---------------------------------------------------------------------------
fn check_origin(
    patterns: &[String],
    origin: Option<&str>,
    tenant_id: &str,
) -> Result<(), EngineError> {
    // Wildcard tenants accept anything, including a missing origin.
    if patterns.iter().any(|p| p == "*") {
        return Ok(());
    }

    let origin = match origin {
        Some(o) => o,
        None => {
            error!("Missing origin for origin-restricted tenant '{}'.", tenant_id);
            return Err(EngineError::Authorization("origin required".to_string()));
        }
    };

    let host = match origin_host(origin) {
        Some(h) => h,
        None => {
            error!("Unparseable origin '{}' for tenant '{}'.", origin, tenant_id);
            return Err(EngineError::Authorization("origin not permitted".to_string()));
        }
    };

    if origin_matches(patterns, &host) {
        Ok(())
    } else {
        error!("Origin '{}' not permitted for tenant '{}'.", origin, tenant_id);
        Err(EngineError::Authorization("origin not permitted".to_string()))
    }
}

// ---------------------------------------------------------------------------
// origin_host:
// ---------------------------------------------------------------------------
/** The host component of an Origin header value: scheme://host[:port]. */
fn origin_host(origin: &str) -> Option<String> {
    let rest = match origin.find("://") {
        Some(idx) => &origin[idx + 3..],
        None => origin,
    };
    let host_port = rest.split('/').next()?;
    let host = host_port.split(':').next()?;
    if host.is_empty() {
        None
    } else {
        Some(host.to_ascii_lowercase())
    }
}

// ---------------------------------------------------------------------------
// origin_matches:
// ---------------------------------------------------------------------------
/** Exact host match, or dot-suffix match so "example.com" admits
 * "shop.example.com" but not "badexample.com".
 */
fn origin_matches(patterns: &[String], host: &str) -> bool {
    patterns.iter().any(|pattern| {
        if pattern == "*" {
            return true;
        }
        let p = pattern.trim_start_matches('.').to_ascii_lowercase();
        host == p || host.ends_with(&format!(".{}", p))
    })
}

// ---------------------------------------------------------------------------
// get_required_header:
// ---------------------------------------------------------------------------
fn get_required_header(http_req: &Request, name: &str) -> Result<String, EngineError> {
    match http_req.header(name) {
        Some(v) if !v.is_empty() => Ok(v.to_string()),
        _ => Err(EngineError::Authentication(format!("missing {} header", name))),
    }
}

// ***************************************************************************
//                                  Tests
// ***************************************************************************
#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::test_support::test_ctx;

    const TEST_SECRET: &str = "token-secret";

    #[test]
    fn origin_host_extraction() {
        assert_eq!(origin_host("https://shop.example.com"), Some("shop.example.com".into()));
        assert_eq!(origin_host("http://shop.example.com:8080"), Some("shop.example.com".into()));
        assert_eq!(origin_host("shop.example.com"), Some("shop.example.com".into()));
        assert_eq!(origin_host("https://"), None);
    }

    #[test]
    fn origin_matching_rules() {
        let patterns = vec!["example.com".to_string(), "tickets.acme.io".to_string()];
        assert!(origin_matches(&patterns, "example.com"));
        assert!(origin_matches(&patterns, "shop.example.com"));
        assert!(origin_matches(&patterns, "tickets.acme.io"));
        assert!(!origin_matches(&patterns, "badexample.com"));
        assert!(!origin_matches(&patterns, "acme.io"));
        assert!(origin_matches(&["*".to_string()], "anything.at.all"));
    }

    #[test]
    fn external_ids_are_namespaced() {
        assert_eq!(external_user_id("acme", "42"), "ext:acme:42");
    }

    #[test]
    fn tenant_secret_roundtrip() {
        // Minimum bcrypt cost keeps the test fast.
        let hash = hash_tenant_secret("s3cr3t", 4).unwrap();
        assert!(verify_tenant_secret("s3cr3t", &hash).unwrap());
        assert!(!verify_tenant_secret("wrong", &hash).unwrap());
    }

    #[tokio::test]
    async fn bearer_token_roundtrip() {
        let ctx = test_ctx().await;
        let token = issue_user_token(&ctx.parms.config.user_token_secret, "user-1", 3600).unwrap();
        let user = authenticate_bearer(&ctx, &format!("Bearer {}", token)).await.unwrap();
        assert_eq!(user.user_id, "user-1");
    }

    #[tokio::test]
    async fn expired_token_is_rejected() {
        let ctx = test_ctx().await;
        let token = issue_user_token(&ctx.parms.config.user_token_secret, "user-1", -120).unwrap();
        let err = authenticate_bearer(&ctx, &format!("Bearer {}", token)).await.unwrap_err();
        assert!(matches!(err, EngineError::Authentication(_)));
    }

    #[tokio::test]
    async fn malformed_authorization_header_is_rejected_outright() {
        let ctx = test_ctx().await;
        // Strict mode: no silent fallthrough to the external-user path.
        let err = authenticate_bearer(&ctx, "Token abc123").await.unwrap_err();
        assert!(matches!(err, EngineError::Authentication(_)));
    }

    #[tokio::test]
    async fn wrong_signing_key_is_rejected() {
        let ctx = test_ctx().await;
        let token = issue_user_token(TEST_SECRET, "user-1", 3600).unwrap();
        let err = authenticate_bearer(&ctx, &format!("Bearer {}", token)).await.unwrap_err();
        assert!(matches!(err, EngineError::Authentication(_)));
    }

    #[tokio::test]
    async fn full_gate_with_tenant_headers_and_external_user() {
        let ctx = test_ctx().await;
        let http_req = poem::Request::builder()
            .header(X_TENANT_ID, "acme")
            .header(X_TENANT_SECRET, "acme-secret")
            .header(X_EXTERNAL_USER_ID, "frontend-77")
            .finish();
        let rqctx = authenticate(&ctx, &http_req, None).await.unwrap();
        assert_eq!(rqctx.tenant.tenant_id, "acme");
        assert_eq!(rqctx.user.user_id, "ext:acme:frontend-77");
    }

    #[tokio::test]
    async fn bad_tenant_secret_fails_authentication() {
        let ctx = test_ctx().await;
        let http_req = poem::Request::builder()
            .header(X_TENANT_ID, "acme")
            .header(X_TENANT_SECRET, "nope")
            .header(X_EXTERNAL_USER_ID, "frontend-77")
            .finish();
        let err = authenticate(&ctx, &http_req, None).await.unwrap_err();
        assert!(matches!(err, EngineError::Authentication(_)));
    }

    #[tokio::test]
    async fn disabled_tenant_is_refused() {
        let ctx = test_ctx().await;
        let http_req = poem::Request::builder()
            .header(X_TENANT_ID, "sleepy")
            .header(X_TENANT_SECRET, "sleepy-secret")
            .header(X_EXTERNAL_USER_ID, "frontend-77")
            .finish();
        let err = authenticate(&ctx, &http_req, None).await.unwrap_err();
        assert!(matches!(err, EngineError::Authorization(_)));
    }

    #[tokio::test]
    async fn restricted_tenant_enforces_origins() {
        let ctx = test_ctx().await;
        // Tenant "strict" allows only example.com.
        let ok_req = poem::Request::builder()
            .header(X_TENANT_ID, "strict")
            .header(X_TENANT_SECRET, "strict-secret")
            .header(ORIGIN_HEADER, "https://shop.example.com")
            .header(X_EXTERNAL_USER_ID, "u1")
            .finish();
        assert!(authenticate(&ctx, &ok_req, None).await.is_ok());

        let bad_req = poem::Request::builder()
            .header(X_TENANT_ID, "strict")
            .header(X_TENANT_SECRET, "strict-secret")
            .header(ORIGIN_HEADER, "https://evil.invalid")
            .header(X_EXTERNAL_USER_ID, "u1")
            .finish();
        let err = authenticate(&ctx, &bad_req, None).await.unwrap_err();
        assert!(matches!(err, EngineError::Authorization(_)));
    }

    #[tokio::test]
    async fn body_declared_external_user_is_accepted() {
        let ctx = test_ctx().await;
        let http_req = poem::Request::builder()
            .header(X_TENANT_ID, "acme")
            .header(X_TENANT_SECRET, "acme-secret")
            .finish();
        let fields = ExternalUserFields {
            external_user_id: Some("body-9".to_string()),
            external_user_email: Some("b9@example.com".to_string()),
            external_user_name: None,
        };
        let rqctx = authenticate(&ctx, &http_req, Some(&fields)).await.unwrap();
        assert_eq!(rqctx.user.user_id, "ext:acme:body-9");
        assert_eq!(rqctx.user.email.as_deref(), Some("b9@example.com"));
    }
}
