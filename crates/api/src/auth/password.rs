//! Password hashing with Argon2

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};

/// Hash a password using Argon2id
pub fn hash_password(password: &str) -> Result<String, PasswordError> {
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();

    argon2
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| PasswordError::Hashing(e.to_string()))
}

/// Verify a password against a hash
pub fn verify_password(password: &str, hash: &str) -> Result<bool, PasswordError> {
    let parsed_hash =
        PasswordHash::new(hash).map_err(|e| PasswordError::InvalidHash(e.to_string()))?;

    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .is_ok())
}

/// Validate password strength
pub fn validate_password_strength(password: &str) -> Result<(), PasswordValidationError> {
    let length = password.chars().count();
    if length < 8 {
        return Err(PasswordValidationError::TooShort);
    }
    if length > 128 {
        return Err(PasswordValidationError::TooLong);
    }

    if !password.chars().any(char::is_alphabetic) {
        return Err(PasswordValidationError::MissingLetter);
    }
    if !password.chars().any(|c| c.is_ascii_digit()) {
        return Err(PasswordValidationError::MissingDigit);
    }

    if is_common_password(password) {
        return Err(PasswordValidationError::TooCommon);
    }

    Ok(())
}

/// Case-insensitive check against passwords that already satisfy the
/// letter and digit rules but appear on every breach list
fn is_common_password(password: &str) -> bool {
    const COMMON_PASSWORDS: &[&str] = &[
        "password1",
        "password12",
        "password123",
        "password1234",
        "passw0rd",
        "p@ssw0rd",
        "abc12345",
        "abcd1234",
        "qwerty123",
        "qwerty12345",
        "1q2w3e4r",
        "1qaz2wsx",
        "zaq12wsx",
        "welcome1",
        "welcome123",
        "admin123",
        "admin1234",
        "letmein1",
        "letmein123",
        "iloveyou1",
        "sunshine1",
        "monkey123",
        "dragon123",
        "master123",
        "football1",
        "baseball1",
        "trustno1",
        "senha123",
        "senha1234",
        "mudar123",
        "studio123",
        "music123",
    ];

    let lowered = password.to_lowercase();
    COMMON_PASSWORDS.contains(&lowered.as_str())
}

#[derive(Debug, thiserror::Error)]
pub enum PasswordError {
    #[error("Failed to hash password: {0}")]
    Hashing(String),
    #[error("Invalid password hash: {0}")]
    InvalidHash(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PasswordValidationError {
    #[error("Password must be at least 8 characters long")]
    TooShort,
    #[error("Password must be at most 128 characters long")]
    TooLong,
    #[error("Password must contain at least one letter")]
    MissingLetter,
    #[error("Password must contain at least one number")]
    MissingDigit,
    #[error("This password is too common, please choose another")]
    TooCommon,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_and_verify() {
        let hash = hash_password("correct horse 9").unwrap();
        assert!(hash.starts_with("$argon2id$"));
        assert!(verify_password("correct horse 9", &hash).unwrap());
        assert!(!verify_password("wrong horse 9", &hash).unwrap());
    }

    #[test]
    fn test_verify_rejects_garbage_hash() {
        assert!(matches!(
            verify_password("anything1", "not-a-hash"),
            Err(PasswordError::InvalidHash(_))
        ));
    }

    #[test]
    fn test_strength_rules() {
        assert_eq!(
            validate_password_strength("ab1"),
            Err(PasswordValidationError::TooShort)
        );
        assert_eq!(
            validate_password_strength(&"a1".repeat(65)),
            Err(PasswordValidationError::TooLong)
        );
        assert_eq!(
            validate_password_strength("12345678"),
            Err(PasswordValidationError::MissingLetter)
        );
        assert_eq!(
            validate_password_strength("abcdefgh"),
            Err(PasswordValidationError::MissingDigit)
        );
        assert_eq!(
            validate_password_strength("Password123"),
            Err(PasswordValidationError::TooCommon)
        );
        assert!(validate_password_strength("mixdown42").is_ok());
        assert!(validate_password_strength("ação2024som").is_ok());
    }
}
