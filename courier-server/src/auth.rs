//! Bearer-credential verification.
//!
//! Identity issuance is out of scope; the server only asks an
//! [`IdentityVerifier`] to turn a credential into an [`Identity`].
//! [`TokenTable`] is a static verifier loaded from configuration.

use std::collections::HashMap;

use courier_proto::message::Identity;
use futures_util::future::BoxFuture;

/// Why a credential was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    /// No credential was presented.
    #[error("missing credential")]
    MissingCredential,
    /// The credential did not resolve to an identity.
    #[error("invalid credential")]
    InvalidCredential,
}

/// Resolves bearer credentials to identities.
pub trait IdentityVerifier: Send + Sync {
    /// Verifies `credential`, returning the identity it belongs to.
    fn verify<'a>(&'a self, credential: &'a str) -> BoxFuture<'a, Result<Identity, AuthError>>;
}

/// Static token-to-identity map.
#[derive(Debug, Clone, Default)]
pub struct TokenTable {
    tokens: HashMap<String, Identity>,
}

impl TokenTable {
    /// Creates an empty table that rejects every credential.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a token for `identity`.
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>, identity: impl Into<Identity>) -> Self {
        self.insert(token, identity);
        self
    }

    /// Adds a token for `identity`.
    pub fn insert(&mut self, token: impl Into<String>, identity: impl Into<Identity>) {
        self.tokens.insert(token.into(), identity.into());
    }

    /// Number of configured tokens.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Returns `true` if no tokens are configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl<S: Into<String>> FromIterator<(S, Identity)> for TokenTable {
    fn from_iter<I: IntoIterator<Item = (S, Identity)>>(iter: I) -> Self {
        Self {
            tokens: iter.into_iter().map(|(t, i)| (t.into(), i)).collect(),
        }
    }
}

impl IdentityVerifier for TokenTable {
    fn verify<'a>(&'a self, credential: &'a str) -> BoxFuture<'a, Result<Identity, AuthError>> {
        let result = if credential.is_empty() {
            Err(AuthError::MissingCredential)
        } else {
            self.tokens
                .get(credential)
                .cloned()
                .ok_or(AuthError::InvalidCredential)
        };
        Box::pin(std::future::ready(result))
    }
}

/// Extracts the token from an `Authorization: Bearer <token>` header value.
#[must_use]
pub fn bearer_token(header: &str) -> Option<&str> {
    let (scheme, token) = header.trim().split_once(' ')?;
    if scheme.eq_ignore_ascii_case("bearer") {
        let token = token.trim();
        (!token.is_empty()).then_some(token)
    } else {
        None
    }
}
