use std::time::Duration;

use jsonwebtoken::{encode, EncodingKey, Header};
use serde::{Deserialize, Serialize};

use crate::config::{CallbackAuthConfig, CallbackAuthType};

use super::SinkError;

const DEFAULT_API_KEY_HEADER: &str = "X-Api-Key";
const DEFAULT_JWT_HEADER: &str = "Authorization";

/// Claims of the token sent to the callback API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackClaims {
    /// Issued at (Unix timestamp)
    pub iat: i64,
    /// Expiration time (Unix timestamp)
    pub exp: i64,
}

/// Produces the credential header attached to every callback request.
#[derive(Clone)]
pub enum AuthHelper {
    None,
    ApiKey {
        header: String,
        key: String,
    },
    Jwt {
        header: String,
        key: EncodingKey,
        expiration: Duration,
    },
}

impl AuthHelper {
    pub fn from_config(config: &CallbackAuthConfig) -> Result<Self, SinkError> {
        let secret = || {
            config
                .secret
                .clone()
                .filter(|s| !s.is_empty())
                .ok_or_else(|| SinkError::Auth("callback auth secret is not configured".to_string()))
        };

        Ok(match config.auth_type {
            CallbackAuthType::None => AuthHelper::None,
            CallbackAuthType::ApiKey => AuthHelper::ApiKey {
                header: config
                    .header
                    .clone()
                    .unwrap_or_else(|| DEFAULT_API_KEY_HEADER.to_string()),
                key: secret()?,
            },
            CallbackAuthType::Jwt => AuthHelper::Jwt {
                header: config
                    .header
                    .clone()
                    .unwrap_or_else(|| DEFAULT_JWT_HEADER.to_string()),
                key: EncodingKey::from_secret(secret()?.as_bytes()),
                expiration: Duration::from_millis(config.expiration_ms),
            },
        })
    }

    /// Header name and value to send, if any
    pub fn header(&self) -> Result<Option<(String, String)>, SinkError> {
        match self {
            AuthHelper::None => Ok(None),
            AuthHelper::ApiKey { header, key } => Ok(Some((header.clone(), key.clone()))),
            AuthHelper::Jwt {
                header,
                key,
                expiration,
            } => {
                let now = chrono::Utc::now().timestamp();
                let claims = CallbackClaims {
                    iat: now,
                    exp: now + expiration.as_secs().max(1) as i64,
                };
                let token = encode(&Header::default(), &claims, key)
                    .map_err(|e| SinkError::Auth(format!("Failed to sign token: {}", e)))?;
                Ok(Some((header.clone(), format!("Bearer {}", token))))
            }
        }
    }
}

impl std::fmt::Debug for AuthHelper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthHelper::None => f.write_str("AuthHelper::None"),
            AuthHelper::ApiKey { header, .. } => {
                f.debug_struct("AuthHelper::ApiKey").field("header", header).finish()
            }
            AuthHelper::Jwt {
                header, expiration, ..
            } => f
                .debug_struct("AuthHelper::Jwt")
                .field("header", header)
                .field("expiration", expiration)
                .finish(),
        }
    }
}
