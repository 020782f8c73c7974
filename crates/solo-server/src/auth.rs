//! Credential verification and access tokens.
//!
//! The session core only needs a verified user id. [`Authenticator`] is the
//! seam to whatever directory backs it; [`StaticAuthenticator`] serves the
//! account list from settings. Access tokens are HS256 JWTs whose `sid` claim
//! ties a logout request to the connection it opened.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use solo_core::{TokenId, UserId};
use solo_settings::{AccountSettings, AuthSettings};
use thiserror::Error;

/// Authentication failures.
#[derive(Debug, Error)]
pub enum AuthError {
    /// Unknown user or wrong password.
    #[error("Incorrect username or password")]
    InvalidCredentials,
    /// No token was presented.
    #[error("missing access token")]
    TokenMissing,
    /// The token failed verification.
    #[error("invalid access token: {0}")]
    TokenInvalid(#[from] jsonwebtoken::errors::Error),
}

/// Login form.
#[derive(Clone, Debug, Deserialize)]
pub struct Credentials {
    /// Login name.
    pub username: String,
    /// Password.
    pub password: String,
}

/// An authenticated user.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Principal {
    /// Login name, also the user id.
    pub username: UserId,
    /// Display name.
    pub name: String,
    /// Administrative flag.
    pub is_admin: bool,
}

impl From<&AccountSettings> for Principal {
    fn from(account: &AccountSettings) -> Self {
        Self {
            username: UserId::from(account.username.as_str()),
            name: account.name.clone(),
            is_admin: account.is_admin,
        }
    }
}

/// Verifies credentials against a user directory.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Check credentials and return the user they belong to.
    async fn authenticate(&self, credentials: &Credentials) -> Result<Principal, AuthError>;

    /// Every known user, ordered by username.
    fn principals(&self) -> Vec<Principal>;
}

/// Authenticator over the account list in settings.
pub struct StaticAuthenticator {
    accounts: HashMap<String, AccountSettings>,
}

impl StaticAuthenticator {
    /// Build from account settings. Later duplicates win.
    pub fn new(accounts: &[AccountSettings]) -> Self {
        Self {
            accounts: accounts
                .iter()
                .map(|a| (a.username.clone(), a.clone()))
                .collect(),
        }
    }
}

#[async_trait]
impl Authenticator for StaticAuthenticator {
    async fn authenticate(&self, credentials: &Credentials) -> Result<Principal, AuthError> {
        match self.accounts.get(&credentials.username) {
            Some(account) if account.password == credentials.password => Ok(account.into()),
            _ => Err(AuthError::InvalidCredentials),
        }
    }

    fn principals(&self) -> Vec<Principal> {
        let mut principals: Vec<Principal> = self.accounts.values().map(Principal::from).collect();
        principals.sort_by(|a, b| a.username.cmp(&b.username));
        principals
    }
}

/// JWT claims.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// User id.
    pub sub: String,
    /// Token id, bound to the connection opened with this token.
    pub sid: String,
    /// Issued at (unix seconds).
    pub iat: i64,
    /// Expiry (unix seconds).
    pub exp: i64,
}

impl Claims {
    /// Subject as a user id.
    pub fn user_id(&self) -> UserId {
        UserId::from(self.sub.as_str())
    }

    /// Token id.
    pub fn token_id(&self) -> TokenId {
        TokenId::from(self.sid.as_str())
    }
}

/// A freshly issued token.
#[derive(Clone, Debug)]
pub struct IssuedToken {
    /// Encoded JWT.
    pub access_token: String,
    /// Its `sid`.
    pub token_id: TokenId,
    /// Lifetime in seconds.
    pub expires_in: u64,
}

/// Issues and verifies HS256 access tokens.
pub struct TokenIssuer {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    ttl_secs: u64,
}

impl TokenIssuer {
    /// Create an issuer from a shared secret.
    pub fn new(secret: &str, ttl_secs: u64) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation,
            ttl_secs,
        }
    }

    /// Create an issuer from auth settings.
    pub fn from_settings(settings: &AuthSettings) -> Self {
        Self::new(&settings.jwt_secret, settings.token_ttl_secs)
    }

    /// Issue a token for `principal`.
    pub fn issue(&self, principal: &Principal) -> Result<IssuedToken, AuthError> {
        let token_id = TokenId::new();
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: principal.username.to_string(),
            sid: token_id.to_string(),
            iat: now,
            exp: now + self.ttl_secs as i64,
        };
        let access_token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)?;
        Ok(IssuedToken {
            access_token,
            token_id,
            expires_in: self.ttl_secs,
        })
    }

    /// Verify signature and expiry.
    pub fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        if token.is_empty() {
            return Err(AuthError::TokenMissing);
        }
        Ok(decode::<Claims>(token, &self.decoding, &self.validation)?.claims)
    }
}
