use axum::http;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::UserRef;

/// Name of the cookie carrying the bearer token for browser clients
pub const AUTH_COOKIE: &str = "auth_token";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing credential: {0}")]
    MissingCredential(String),
    #[error("invalid token: {0}")]
    InvalidToken(String),
    #[error("user '{0}' has not joined this collaboration session")]
    NotInRoster(String),
    #[error("access denied: {0}")]
    Forbidden(String),
}

/// Claims we read from a bearer token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: usize,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
}

/// Authenticated caller, inserted into request extensions by the auth middleware
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user: UserRef,
    pub prpls: Vec<String>,
}

impl Identity {
    pub fn user_id(&self) -> &str {
        &self.user.user_id
    }
}

// Get the auth token from a request
pub fn get_auth_token<B>(req: &http::Request<B>) -> Result<String, AuthError> {
    // 1. Try to get token from Authorization header
    if let Some(auth_header) = req.headers().get(http::header::AUTHORIZATION) {
        let auth_str = auth_header
            .to_str()
            .map_err(|_| AuthError::MissingCredential("Invalid Authorization header".to_string()))?;
        return Ok(auth_str.strip_prefix("Bearer ").unwrap_or(auth_str).to_string());
    }

    // 2. Browser websocket clients cannot set headers, so accept ?token=
    if let Some(token) = req.uri().query().and_then(token_from_query) {
        return Ok(token);
    }

    // 3. Try to get token from cookies
    let cookie_header = req
        .headers()
        .get(http::header::COOKIE)
        .ok_or_else(|| AuthError::MissingCredential("Missing Authorization header, token or cookie".to_string()))?
        .to_str()
        .map_err(|_| AuthError::MissingCredential("Invalid Cookie header".to_string()))?;

    for c in cookie::Cookie::split_parse(cookie_header).flatten() {
        if c.name() == AUTH_COOKIE {
            return Ok(c.value().to_string());
        }
    }
    Err(AuthError::MissingCredential(format!("{} cookie not found", AUTH_COOKIE)))
}

fn token_from_query(query: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key == "token" && !value.is_empty()).then(|| value.to_string())
    })
}

// Validate a JWT token and return the caller's identity
pub fn validate_jwt(token: &str, secret: &str) -> Result<Identity, AuthError> {
    let validation = Validation::new(Algorithm::HS256);
    let decoding_key = DecodingKey::from_secret(secret.as_bytes());
    let data = decode::<Claims>(token, &decoding_key, &validation)
        .map_err(|e| AuthError::InvalidToken(e.to_string()))?;
    let claims = data.claims;
    if claims.sub.is_empty() {
        return Err(AuthError::InvalidToken("JWT token does not contain 'sub' claim".to_string()));
    }
    Ok(identity_from_claims(claims))
}

/// Map token roles onto principals.
///
/// Resource grants (`tm/<threat_model_id>/<role>`) are kept verbatim, every
/// other role becomes `r/<role>`, and the user itself is `u/<sub>`.
pub fn identity_from_claims(claims: Claims) -> Identity {
    let mut prpls = vec![format!("u/{}", claims.sub)];
    for role in &claims.roles {
        let prpl = if role.starts_with("tm/") { role.clone() } else { format!("r/{}", role) };
        if !prpls.contains(&prpl) {
            prpls.push(prpl);
        }
    }
    Identity {
        user: UserRef {
            user_id: claims.sub,
            email: claims.email,
            display_name: claims.name,
        },
        prpls,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    const SECRET: &str = "test-secret";

    fn token_for(sub: &str, roles: &[&str]) -> String {
        let claims = Claims {
            sub: sub.to_string(),
            exp: (chrono::Utc::now().timestamp() + 3600) as usize,
            email: Some(format!("{}@example.com", sub)),
            name: None,
            roles: roles.iter().map(|r| r.to_string()).collect(),
        };
        encode(&Header::default(), &claims, &EncodingKey::from_secret(SECRET.as_bytes())).unwrap()
    }

    #[test]
    fn validates_token_and_builds_principals() {
        let token = token_for("alice", &["tm/0000/writer", "Tmi-Admin"]);
        let identity = validate_jwt(&token, SECRET).unwrap();
        assert_eq!(identity.user_id(), "alice");
        assert_eq!(identity.user.email.as_deref(), Some("alice@example.com"));
        assert_eq!(identity.prpls, vec!["u/alice", "tm/0000/writer", "r/Tmi-Admin"]);
    }

    #[test]
    fn rejects_token_signed_with_other_secret() {
        let token = token_for("alice", &[]);
        assert!(matches!(validate_jwt(&token, "other"), Err(AuthError::InvalidToken(_))));
    }

    #[test]
    fn token_is_read_from_header_query_then_cookie() {
        let req = http::Request::builder()
            .uri("/ws?token=from-query")
            .header(http::header::AUTHORIZATION, "Bearer from-header")
            .body(())
            .unwrap();
        assert_eq!(get_auth_token(&req).unwrap(), "from-header");

        let req = http::Request::builder().uri("/ws?foo=1&token=from-query").body(()).unwrap();
        assert_eq!(get_auth_token(&req).unwrap(), "from-query");

        let req = http::Request::builder()
            .uri("/ws")
            .header(http::header::COOKIE, "theme=dark; auth_token=from-cookie")
            .body(())
            .unwrap();
        assert_eq!(get_auth_token(&req).unwrap(), "from-cookie");

        let req = http::Request::builder().uri("/ws").body(()).unwrap();
        assert!(matches!(get_auth_token(&req), Err(AuthError::MissingCredential(_))));
    }
}
