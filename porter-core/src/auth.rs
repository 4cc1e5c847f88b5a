//! Per-RPC identity verification.
//!
//! The gateway passes identity through; it does not authorize beyond it.
//! `Verifier` is the seam for richer providers: implementations return
//! the verified principal or an `Unauthenticated`/`PermissionDenied`
//! error that the service maps onto the wire status.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tonic::metadata::MetadataMap;

use crate::config::AuthSection;
use crate::error::PorterError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub name: String,
}

pub trait Verifier: Send + Sync {
    fn verify(&self, metadata: &MetadataMap) -> Result<Principal, PorterError>;
}

/// Accepts everything as the anonymous principal.
pub struct NoAuth;

impl Verifier for NoAuth {
    fn verify(&self, _metadata: &MetadataMap) -> Result<Principal, PorterError> {
        Ok(Principal {
            name: "anonymous".to_string(),
        })
    }
}

/// Basic credentials and/or a static bearer token from configuration.
pub struct StaticVerifier {
    username: Option<String>,
    password: Option<String>,
    token: Option<String>,
}

impl StaticVerifier {
    pub fn from_config(auth: &AuthSection) -> Self {
        Self {
            username: auth.username.clone(),
            password: auth.password.clone(),
            token: auth.token.clone(),
        }
    }

    fn verify_basic(&self, encoded: &str) -> Result<Principal, PorterError> {
        let decoded = BASE64
            .decode(encoded.trim())
            .map_err(|_| PorterError::Unauthenticated("malformed basic credentials".into()))?;
        let text = String::from_utf8(decoded)
            .map_err(|_| PorterError::Unauthenticated("malformed basic credentials".into()))?;
        let (user, pass) = text
            .split_once(':')
            .ok_or_else(|| PorterError::Unauthenticated("malformed basic credentials".into()))?;
        match (&self.username, &self.password) {
            (Some(expected_user), Some(expected_pass))
                if user == expected_user && pass == expected_pass =>
            {
                Ok(Principal {
                    name: user.to_string(),
                })
            }
            (Some(_), Some(_)) => Err(PorterError::PermissionDenied(
                "credentials rejected".to_string(),
            )),
            _ => Err(PorterError::Unauthenticated(
                "basic authentication is not configured".to_string(),
            )),
        }
    }

    fn verify_bearer(&self, presented: &str) -> Result<Principal, PorterError> {
        match &self.token {
            Some(expected) if presented.trim() == expected => Ok(Principal {
                name: "token".to_string(),
            }),
            Some(_) => Err(PorterError::PermissionDenied("token rejected".to_string())),
            None => Err(PorterError::Unauthenticated(
                "bearer authentication is not configured".to_string(),
            )),
        }
    }
}

impl Verifier for StaticVerifier {
    fn verify(&self, metadata: &MetadataMap) -> Result<Principal, PorterError> {
        let header = metadata
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                PorterError::Unauthenticated("missing authorization header".to_string())
            })?;
        if let Some(encoded) = header.strip_prefix("Basic ") {
            self.verify_basic(encoded)
        } else if let Some(token) = header.strip_prefix("Bearer ") {
            self.verify_bearer(token)
        } else {
            Err(PorterError::Unauthenticated(
                "unsupported authorization scheme".to_string(),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata_with(value: &str) -> MetadataMap {
        let mut map = MetadataMap::new();
        map.insert("authorization", value.parse().expect("metadata value"));
        map
    }

    fn verifier() -> StaticVerifier {
        StaticVerifier {
            username: Some("svc".to_string()),
            password: Some("secret".to_string()),
            token: Some("tok-123".to_string()),
        }
    }

    #[test]
    fn basic_credentials_verify() -> anyhow::Result<()> {
        let encoded = BASE64.encode("svc:secret");
        let principal = verifier().verify(&metadata_with(&format!("Basic {encoded}")))?;
        assert_eq!(principal.name, "svc");
        Ok(())
    }

    #[test]
    fn wrong_password_is_permission_denied() {
        let encoded = BASE64.encode("svc:wrong");
        let err = verifier()
            .verify(&metadata_with(&format!("Basic {encoded}")))
            .unwrap_err();
        assert!(matches!(err, PorterError::PermissionDenied(_)));
    }

    #[test]
    fn bearer_token_verifies() -> anyhow::Result<()> {
        let principal = verifier().verify(&metadata_with("Bearer tok-123"))?;
        assert_eq!(principal.name, "token");
        Ok(())
    }

    #[test]
    fn missing_header_is_unauthenticated() {
        let err = verifier().verify(&MetadataMap::new()).unwrap_err();
        assert!(matches!(err, PorterError::Unauthenticated(_)));
    }

    #[test]
    fn no_auth_always_passes() -> anyhow::Result<()> {
        let principal = NoAuth.verify(&MetadataMap::new())?;
        assert_eq!(principal.name, "anonymous");
        Ok(())
    }
}
