use chrono::Utc;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};

use crate::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Driver,
    Customer,
    Supervisor,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Driver => "driver",
            Role::Customer => "customer",
            Role::Supervisor => "supervisor",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    Access,
    Refresh,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: i64,
    pub role: Role,
    pub typ: TokenKind,
    pub iat: i64,
    pub exp: i64,
}

/// Authenticated identity of a connection. Supervisors are read-only
/// observers and never reach the dispatch handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Principal {
    Driver(i64),
    Customer(i64),
    Supervisor(i64),
}

impl Principal {
    pub fn role(&self) -> Role {
        match self {
            Principal::Driver(_) => Role::Driver,
            Principal::Customer(_) => Role::Customer,
            Principal::Supervisor(_) => Role::Supervisor,
        }
    }

    pub fn user_id(&self) -> i64 {
        match self {
            Principal::Driver(id) | Principal::Customer(id) | Principal::Supervisor(id) => *id,
        }
    }

    fn from_claims(claims: &Claims) -> Self {
        match claims.role {
            Role::Driver => Principal::Driver(claims.sub),
            Role::Customer => Principal::Customer(claims.sub),
            Role::Supervisor => Principal::Supervisor(claims.sub),
        }
    }
}

/// Outcome of a successful handshake. `refreshed_access` is set when the
/// presented access token had expired and a valid refresh token minted a
/// replacement; the new token is pushed back to the client right after the
/// welcome event.
#[derive(Debug, Clone)]
pub struct Handshake {
    pub principal: Principal,
    pub refreshed_access: Option<String>,
}

enum DecodeError {
    Expired,
    Invalid,
}

pub struct AuthKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
    access_ttl_secs: i64,
    refresh_ttl_secs: i64,
}

impl AuthKeys {
    pub fn new(secret: &str, access_ttl_secs: i64, refresh_ttl_secs: i64) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            access_ttl_secs,
            refresh_ttl_secs,
        }
    }

    pub fn issue_access(&self, sub: i64, role: Role) -> Result<String, AppError> {
        self.issue(sub, role, TokenKind::Access, self.access_ttl_secs)
    }

    pub fn issue_refresh(&self, sub: i64, role: Role) -> Result<String, AppError> {
        self.issue(sub, role, TokenKind::Refresh, self.refresh_ttl_secs)
    }

    fn issue(&self, sub: i64, role: Role, typ: TokenKind, ttl_secs: i64) -> Result<String, AppError> {
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub,
            role,
            typ,
            iat: now,
            exp: now + ttl_secs,
        };
        encode(&Header::default(), &claims, &self.encoding)
            .map_err(|err| AppError::Internal(format!("token encoding failed: {err}")))
    }

    fn decode_token(&self, token: &str) -> Result<Claims, DecodeError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        match decode::<Claims>(token, &self.decoding, &validation) {
            Ok(data) => Ok(data.claims),
            Err(err) if matches!(err.kind(), ErrorKind::ExpiredSignature) => {
                Err(DecodeError::Expired)
            }
            Err(_) => Err(DecodeError::Invalid),
        }
    }

    /// Handshake-time authentication. An expired access token is recovered
    /// transparently when a valid refresh token for the same identity is
    /// supplied; every other failure rejects the connection.
    pub fn authenticate(&self, access: &str, refresh: Option<&str>) -> Result<Handshake, AppError> {
        match self.decode_token(access) {
            Ok(claims) => {
                if claims.typ != TokenKind::Access {
                    return Err(AppError::Auth("access token required".to_string()));
                }
                Ok(Handshake {
                    principal: Principal::from_claims(&claims),
                    refreshed_access: None,
                })
            }
            Err(DecodeError::Expired) => {
                let refresh = refresh
                    .ok_or_else(|| AppError::Auth("access token expired".to_string()))?;
                let claims = self
                    .decode_token(refresh)
                    .map_err(|_| AppError::Auth("invalid refresh token".to_string()))?;
                if claims.typ != TokenKind::Refresh {
                    return Err(AppError::Auth("refresh token required".to_string()));
                }
                let new_access = self.issue_access(claims.sub, claims.role)?;
                Ok(Handshake {
                    principal: Principal::from_claims(&claims),
                    refreshed_access: Some(new_access),
                })
            }
            Err(DecodeError::Invalid) => Err(AppError::Auth("invalid token".to_string())),
        }
    }
}
