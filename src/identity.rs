use http::{header::AUTHORIZATION, HeaderMap};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use std::{fmt, net::IpAddr, str::FromStr, sync::Arc};
use tracing::debug;

use crate::{
    config::AuthConfig,
    error::{GovernanceError, Result},
};

/// Identity a request is rate limited under: `user:<sub>` or `ip:<address>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientId(String);

impl ClientId {
    pub fn user(subject: &str) -> Self {
        Self(format!("user:{}", subject))
    }

    pub fn ip(addr: IpAddr) -> Self {
        Self(format!("ip:{}", addr))
    }

    pub fn unknown() -> Self {
        Self("ip:unknown".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_user(&self) -> bool {
        self.0.starts_with("user:")
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Turns a bearer credential into a subject id.
pub trait CredentialVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Result<String>;
}

#[derive(Debug, Deserialize)]
struct Claims {
    sub: Option<String>,
}

/// Verifies signed JWTs with a shared secret. `exp` is required.
pub struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(secret: &str, algorithm: Algorithm) -> Self {
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(algorithm),
        }
    }

    pub fn from_config(config: &AuthConfig) -> Result<Self> {
        let algorithm = Algorithm::from_str(&config.algorithm).map_err(|_| {
            GovernanceError::Config(format!("unsupported JWT algorithm '{}'", config.algorithm))
        })?;
        Ok(Self::new(&config.secret_key, algorithm))
    }
}

impl CredentialVerifier for JwtVerifier {
    fn verify(&self, token: &str) -> Result<String> {
        let data = decode::<Claims>(token, &self.key, &self.validation)
            .map_err(|e| GovernanceError::InvalidClientIdentity(e.to_string()))?;
        match data.claims.sub {
            Some(sub) if !sub.is_empty() => Ok(sub),
            _ => Err(GovernanceError::InvalidClientIdentity(
                "token has no subject".to_string(),
            )),
        }
    }
}

/// Derives the [`ClientId`] of a request. Never rejects: any credential
/// problem falls back to the remote address.
#[derive(Clone)]
pub struct ClientIdentifier {
    verifier: Arc<dyn CredentialVerifier>,
}

impl ClientIdentifier {
    pub fn new(verifier: Arc<dyn CredentialVerifier>) -> Self {
        Self { verifier }
    }

    pub fn identify(&self, headers: &HeaderMap, remote: Option<IpAddr>) -> ClientId {
        match self.subject(headers) {
            Ok(Some(sub)) => return ClientId::user(&sub),
            Ok(None) => {}
            Err(e) => debug!(error = %e, "Credential rejected, identifying by address"),
        }
        remote.map(ClientId::ip).unwrap_or_else(ClientId::unknown)
    }

    fn subject(&self, headers: &HeaderMap) -> Result<Option<String>> {
        let Some(value) = headers.get(AUTHORIZATION) else {
            return Ok(None);
        };
        let value = value.to_str().map_err(|_| {
            GovernanceError::InvalidClientIdentity("authorization header is not ASCII".to_string())
        })?;
        let token = value
            .strip_prefix("Bearer ")
            .or_else(|| value.strip_prefix("bearer "))
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                GovernanceError::InvalidClientIdentity("expected a Bearer credential".to_string())
            })?;
        self.verifier.verify(token).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use http::HeaderValue;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde::Serialize;

    const SECRET: &str = "test-secret";

    #[derive(Serialize)]
    struct TestClaims<'a> {
        #[serde(skip_serializing_if = "Option::is_none")]
        sub: Option<&'a str>,
        exp: i64,
    }

    fn token(sub: Option<&str>, exp_offset: i64, secret: &str) -> String {
        let claims = TestClaims {
            sub,
            exp: Utc::now().timestamp() + exp_offset,
        };
        encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_bytes())).unwrap()
    }

    fn identifier() -> ClientIdentifier {
        ClientIdentifier::new(Arc::new(JwtVerifier::new(SECRET, Algorithm::HS256)))
    }

    fn bearer(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", token)).unwrap(),
        );
        headers
    }

    fn remote() -> Option<IpAddr> {
        Some("203.0.113.9".parse().unwrap())
    }

    #[test]
    fn test_valid_token_identifies_user() {
        let id = identifier().identify(&bearer(&token(Some("42"), 600, SECRET)), remote());
        assert_eq!(id.as_str(), "user:42");
        assert!(id.is_user());
    }

    #[test]
    fn test_no_credential_uses_address() {
        let id = identifier().identify(&HeaderMap::new(), remote());
        assert_eq!(id.as_str(), "ip:203.0.113.9");
    }

    #[test]
    fn test_bad_credentials_fall_back_to_address() {
        let identifier = identifier();
        let cases = [
            bearer(&token(Some("42"), -600, SECRET)),
            bearer(&token(Some("42"), 600, "other-secret")),
            bearer(&token(None, 600, SECRET)),
            bearer("not-a-jwt"),
        ];
        for headers in cases {
            assert_eq!(identifier.identify(&headers, remote()).as_str(), "ip:203.0.113.9");
        }

        let mut basic = HeaderMap::new();
        basic.insert(AUTHORIZATION, HeaderValue::from_static("Basic dXNlcjpwYXNz"));
        assert_eq!(identifier.identify(&basic, remote()).as_str(), "ip:203.0.113.9");
    }

    #[test]
    fn test_unknown_address() {
        let id = identifier().identify(&bearer("garbage"), None);
        assert_eq!(id, ClientId::unknown());
        assert_eq!(id.to_string(), "ip:unknown");
    }

    #[test]
    fn test_ipv6_address() {
        let addr: IpAddr = "2001:db8::1".parse().unwrap();
        assert_eq!(identifier().identify(&HeaderMap::new(), Some(addr)).as_str(), "ip:2001:db8::1");
    }

    #[test]
    fn test_verifier_from_config() {
        let config = AuthConfig {
            secret_key: SECRET.to_string(),
            algorithm: "HS256".to_string(),
        };
        let verifier = JwtVerifier::from_config(&config).unwrap();
        assert_eq!(verifier.verify(&token(Some("7"), 60, SECRET)).unwrap(), "7");

        let bad = AuthConfig {
            algorithm: "ROT13".to_string(),
            ..config
        };
        assert!(JwtVerifier::from_config(&bad).is_err());
    }
}
