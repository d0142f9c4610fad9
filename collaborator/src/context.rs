//! Session token context and short-lived credential issuance.
//!
//! Every collaborative session carries the token of the peer that opened
//! the document. The token scopes blob access (its `workspace`) and is the
//! identity used when the system of record is notified of changes.
//!
//! Credentials are HS256 JWTs signed with the shared server secret.

use std::time::{Duration, SystemTime};

use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

/// Decoded token claims relevant to the collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    /// Account email of the token holder
    pub email: String,
    /// Workspace (tenant) the token is scoped to
    pub workspace: String,
}

impl Token {
    pub fn new(email: impl Into<String>, workspace: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            workspace: workspace.into(),
        }
    }
}

/// Per-session context, fixed when the session is established.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContext {
    pub token: Token,
    /// Document to seed from when the session's own document has no blob yet
    pub initial_content_id: Option<String>,
}

impl SessionContext {
    pub fn new(token: Token) -> Self {
        Self {
            token,
            initial_content_id: None,
        }
    }

    pub fn with_initial_content(mut self, id: impl Into<String>) -> Self {
        self.initial_content_id = Some(id.into());
        self
    }

    /// Initial content reference, only when present and non-empty.
    pub fn initial_content(&self) -> Option<&str> {
        self.initial_content_id
            .as_deref()
            .filter(|id| !id.is_empty())
    }
}

/// Token errors.
#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("Failed to sign credential: {0}")]
    Sign(#[source] jsonwebtoken::errors::Error),
    #[error("Invalid token: {0}")]
    Invalid(#[source] jsonwebtoken::errors::Error),
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    email: String,
    workspace: String,
    iat: u64,
    exp: u64,
}

/// Signs and verifies session tokens.
pub struct TokenIssuer {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl: Duration,
}

impl TokenIssuer {
    /// Default lifetime of generated credentials.
    pub const DEFAULT_TTL: Duration = Duration::from_secs(60);

    pub fn new(secret: &str, ttl: Duration) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            ttl,
        }
    }

    /// Generate a short-lived credential for `(email, workspace)`.
    pub fn generate(&self, email: &str, workspace: &str) -> Result<String, TokenError> {
        let iat = unix_secs();
        let claims = Claims {
            email: email.to_string(),
            workspace: workspace.to_string(),
            iat,
            exp: iat + self.ttl.as_secs().max(1),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding).map_err(TokenError::Sign)
    }

    /// Verify a token and extract its claims.
    pub fn verify(&self, token: &str) -> Result<Token, TokenError> {
        let validation = Validation::new(Algorithm::HS256);
        let data = decode::<Claims>(token, &self.decoding, &validation).map_err(TokenError::Invalid)?;
        Ok(Token {
            email: data.claims.email,
            workspace: data.claims.workspace,
        })
    }
}

fn unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
