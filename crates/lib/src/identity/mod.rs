//! Identity store: user accounts, platform identity links and signed tokens.
//!
//! One user record can be linked to at most one external id per platform (e.g. a Telegram
//! user id), and an external id belongs to at most one user. Channels resolve senders
//! through the store so that one person gets the same session key everywhere.

mod store;
mod token;

pub use store::{IdentityStore, UserRecord};
pub use token::{TokenClaims, TokenSigner};

/// Errors from identity store calls.
#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("invalid input: {0}")]
    Validation(String),
    /// Wrong username or password. Deliberately does not say which.
    #[error("invalid username or password")]
    Auth,
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("user not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Token(#[from] TokenError),
    #[error("identity store error: {0}")]
    Storage(String),
}

/// Token verification and issuing failures. Any of these means "not authenticated".
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenError {
    #[error("malformed token")]
    Malformed,
    #[error("token signature mismatch")]
    BadSignature,
    #[error("token expired")]
    Expired,
    #[error("token subject no longer exists")]
    UnknownSubject,
    #[error("token secret not configured")]
    SecretMissing,
    #[error("token lifetime out of range")]
    LifetimeOutOfRange,
}

const USERNAME_MIN: usize = 3;
const USERNAME_MAX: usize = 32;
const PASSWORD_MIN: usize = 6;

/// Username: 3–32 chars of ASCII letters, digits, `_` or `-`.
pub fn validate_username(username: &str) -> Result<(), IdentityError> {
    let len = username.chars().count();
    if !(USERNAME_MIN..=USERNAME_MAX).contains(&len) {
        return Err(IdentityError::Validation(format!(
            "username must be {}-{} characters",
            USERNAME_MIN, USERNAME_MAX
        )));
    }
    if !username
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(IdentityError::Validation(
            "username may only contain letters, digits, '_' and '-'".to_string(),
        ));
    }
    Ok(())
}

/// Password: at least 6 characters.
pub fn validate_password(password: &str) -> Result<(), IdentityError> {
    if password.chars().count() < PASSWORD_MIN {
        return Err(IdentityError::Validation(format!(
            "password must be at least {} characters",
            PASSWORD_MIN
        )));
    }
    Ok(())
}
