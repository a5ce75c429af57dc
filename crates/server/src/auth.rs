//! Reader-side authentication. Ingestion always uses API keys; the list,
//! detail, tag, and key endpoints use one of three modes. The RS256+JWKS
//! verification behind `iap-google` is an external collaborator injected
//! through [`AssertionVerifier`].

use std::sync::Arc;

use axum::http::HeaderMap;

use crate::errors::{ApiError, Result};

pub const DEFAULT_AUTH_HEADER: &str = "X-Forwarded-User";
pub const IAP_ASSERTION_HEADER: &str = "X-Goog-Iap-Jwt-Assertion";

/// Claims extracted from a verified IAP assertion.
#[derive(Debug, Clone, Default)]
pub struct IapClaims {
    pub email: String,
    pub sub: String,
}

/// Verifies a signed IAP assertion against the configured audience, issuer,
/// and key set. Implementations live outside this crate.
pub trait AssertionVerifier: Send + Sync {
    fn verify(&self, assertion: &str, config: &IapConfig) -> std::result::Result<IapClaims, String>;
}

#[derive(Debug, Clone)]
pub struct IapConfig {
    pub audience: String,
    pub issuer: String,
    pub jwks_url: String,
}

#[derive(Clone)]
pub enum Authenticator {
    Off,
    Header { header: String },
    Iap {
        config: IapConfig,
        verifier: Arc<dyn AssertionVerifier>,
    },
}

impl Authenticator {
    pub fn off() -> Self {
        Authenticator::Off
    }

    pub fn header(header: impl Into<String>) -> Self {
        let header = header.into();
        let header = if header.trim().is_empty() {
            DEFAULT_AUTH_HEADER.to_string()
        } else {
            header.trim().to_string()
        };
        Authenticator::Header { header }
    }

    pub fn iap(config: IapConfig, verifier: Arc<dyn AssertionVerifier>) -> Self {
        Authenticator::Iap { config, verifier }
    }

    /// Resolve the authenticated user id. `Off` yields an empty user.
    pub fn authenticate(&self, headers: &HeaderMap) -> Result<String> {
        match self {
            Authenticator::Off => Ok(String::new()),
            Authenticator::Header { header } => {
                let value = headers
                    .get(header.as_str())
                    .and_then(|value| value.to_str().ok())
                    .map(str::trim)
                    .unwrap_or_default();
                if value.is_empty() {
                    return Err(ApiError::Forbidden);
                }
                Ok(value.to_string())
            }
            Authenticator::Iap { config, verifier } => {
                let assertion = headers
                    .get(IAP_ASSERTION_HEADER)
                    .and_then(|value| value.to_str().ok())
                    .map(str::trim)
                    .unwrap_or_default();
                if assertion.is_empty() {
                    return Err(ApiError::Forbidden);
                }
                let claims = verifier
                    .verify(assertion, config)
                    .map_err(|_| ApiError::Forbidden)?;
                let user = if claims.email.trim().is_empty() {
                    claims.sub.trim().to_string()
                } else {
                    claims.email.trim().to_string()
                };
                if user.is_empty() {
                    return Err(ApiError::Forbidden);
                }
                Ok(user)
            }
        }
    }
}

/// Build the authenticator from `AUTH_MODE` and its companion variables.
/// `iap-google` needs a linked verifier; without one, startup fails.
pub fn from_env(
    mode: &str,
    header_user: &str,
    audience: &str,
    issuer: &str,
    jwks_url: &str,
    verifier: Option<Arc<dyn AssertionVerifier>>,
) -> std::result::Result<Authenticator, String> {
    match mode.trim().to_lowercase().as_str() {
        "" | "off" => Ok(Authenticator::off()),
        "header" => Ok(Authenticator::header(header_user)),
        "iap-google" => {
            if audience.trim().is_empty() {
                return Err("IAP_AUDIENCE is required for iap-google auth".to_string());
            }
            let issuer = if issuer.trim().is_empty() {
                "https://cloud.google.com/iap".to_string()
            } else {
                issuer.trim().to_string()
            };
            let jwks_url = if jwks_url.trim().is_empty() {
                "https://www.gstatic.com/iap/verify/public_key-jwk".to_string()
            } else {
                jwks_url.trim().to_string()
            };
            let verifier = verifier
                .ok_or_else(|| "iap-google requires an assertion verifier".to_string())?;
            Ok(Authenticator::iap(
                IapConfig {
                    audience: audience.trim().to_string(),
                    issuer,
                    jwks_url,
                },
                verifier,
            ))
        }
        other => Err(format!("unsupported AUTH_MODE: {}", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    struct FakeVerifier {
        claims: std::result::Result<IapClaims, String>,
    }

    impl AssertionVerifier for FakeVerifier {
        fn verify(
            &self,
            _assertion: &str,
            _config: &IapConfig,
        ) -> std::result::Result<IapClaims, String> {
            self.claims.clone()
        }
    }

    fn iap_with(claims: std::result::Result<IapClaims, String>) -> Authenticator {
        Authenticator::iap(
            IapConfig {
                audience: "projects/1/global/backendServices/2".to_string(),
                issuer: "https://cloud.google.com/iap".to_string(),
                jwks_url: "https://www.gstatic.com/iap/verify/public_key-jwk".to_string(),
            },
            Arc::new(FakeVerifier { claims }),
        )
    }

    #[test]
    fn off_mode_yields_empty_user() {
        let auth = Authenticator::off();
        assert_eq!(auth.authenticate(&HeaderMap::new()).expect("auth"), "");
    }

    #[test]
    fn header_mode_requires_the_header() {
        let auth = Authenticator::header("X-User");
        assert!(matches!(
            auth.authenticate(&HeaderMap::new()),
            Err(ApiError::Forbidden)
        ));

        let mut headers = HeaderMap::new();
        headers.insert("X-User", HeaderValue::from_static("alex"));
        assert_eq!(auth.authenticate(&headers).expect("auth"), "alex");
    }

    #[test]
    fn header_mode_defaults_to_forwarded_user() {
        let auth = Authenticator::header("");
        let mut headers = HeaderMap::new();
        headers.insert(DEFAULT_AUTH_HEADER, HeaderValue::from_static("sam"));
        assert_eq!(auth.authenticate(&headers).expect("auth"), "sam");
    }

    #[test]
    fn iap_mode_prefers_email_then_sub() {
        let auth = iap_with(Ok(IapClaims {
            email: "dev@example.com".to_string(),
            sub: "accounts/123".to_string(),
        }));
        let mut headers = HeaderMap::new();
        headers.insert(IAP_ASSERTION_HEADER, HeaderValue::from_static("jwt"));
        assert_eq!(auth.authenticate(&headers).expect("auth"), "dev@example.com");

        let auth = iap_with(Ok(IapClaims {
            email: String::new(),
            sub: "accounts/123".to_string(),
        }));
        assert_eq!(auth.authenticate(&headers).expect("auth"), "accounts/123");
    }

    #[test]
    fn iap_mode_rejects_missing_or_bad_assertions() {
        let auth = iap_with(Ok(IapClaims::default()));
        assert!(matches!(
            auth.authenticate(&HeaderMap::new()),
            Err(ApiError::Forbidden)
        ));

        let auth = iap_with(Err("bad signature".to_string()));
        let mut headers = HeaderMap::new();
        headers.insert(IAP_ASSERTION_HEADER, HeaderValue::from_static("jwt"));
        assert!(matches!(
            auth.authenticate(&headers),
            Err(ApiError::Forbidden)
        ));
    }

    #[test]
    fn from_env_validates_modes() {
        assert!(matches!(
            from_env("off", "", "", "", "", None).expect("off"),
            Authenticator::Off
        ));
        assert!(matches!(
            from_env("header", "X-User", "", "", "", None).expect("header"),
            Authenticator::Header { .. }
        ));
        assert!(from_env("iap-google", "", "", "", "", None).is_err());
        assert!(from_env("kerberos", "", "", "", "", None).is_err());
    }
}
