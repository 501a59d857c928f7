//! Identity-provider error mapping and local registration checks.
//!
//! Authentication itself is external. Provider error codes are translated
//! here so that raw codes never reach a learner.

use serde::{Deserialize, Serialize};

/// Minimum accepted password length, in characters.
pub const MIN_PASSWORD_CHARS: usize = 6;

/// Failure categories reported by the identity provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthFailure {
    /// `auth/email-already-in-use`
    EmailAlreadyInUse,
    /// `auth/invalid-email`
    InvalidEmail,
    /// `auth/weak-password`
    WeakPassword,
    /// `auth/user-not-found`
    UserNotFound,
    /// `auth/wrong-password`
    WrongPassword,
    /// `auth/too-many-requests`
    TooManyRequests,
    /// Anything else.
    Unknown,
}

impl AuthFailure {
    /// Classifies a provider error code.
    #[must_use]
    pub fn from_code(code: &str) -> Self {
        match code.trim() {
            "auth/email-already-in-use" => Self::EmailAlreadyInUse,
            "auth/invalid-email" => Self::InvalidEmail,
            "auth/weak-password" => Self::WeakPassword,
            "auth/user-not-found" => Self::UserNotFound,
            "auth/wrong-password" => Self::WrongPassword,
            "auth/too-many-requests" => Self::TooManyRequests,
            _ => Self::Unknown,
        }
    }

    /// Text safe to show a learner.
    #[must_use]
    pub const fn user_message(self) -> &'static str {
        match self {
            Self::EmailAlreadyInUse => "This email is already registered. Please log in instead.",
            Self::InvalidEmail => "Please enter a valid email address.",
            Self::WeakPassword => "Password should be at least 6 characters.",
            Self::UserNotFound => "No account found with this email. Please register first.",
            Self::WrongPassword => "Incorrect password. Please try again.",
            Self::TooManyRequests => "Too many failed attempts. Please try again later.",
            Self::Unknown => "An error occurred. Please try again.",
        }
    }
}

/// Maps a provider error code straight to learner-facing text.
#[must_use]
pub fn auth_error_message(code: &str) -> &'static str {
    AuthFailure::from_code(code).user_message()
}

/// Why a registration form was rejected before reaching the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RegistrationError {
    /// Password and confirmation differ.
    #[error("Passwords do not match.")]
    PasswordMismatch,
    /// Password is shorter than [`MIN_PASSWORD_CHARS`].
    #[error("Password must be at least 6 characters.")]
    PasswordTooShort,
}

/// Checks a registration form.
///
/// # Errors
///
/// Returns the first failed check, mismatch before length.
pub fn validate_registration(
    password: &str,
    confirm_password: &str,
) -> Result<(), RegistrationError> {
    if password != confirm_password {
        return Err(RegistrationError::PasswordMismatch);
    }
    if password.chars().count() < MIN_PASSWORD_CHARS {
        return Err(RegistrationError::PasswordTooShort);
    }
    Ok(())
}
