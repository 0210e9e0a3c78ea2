use crate::errors::GateError;
use crate::settings::PasswordPolicy;
use argon2::password_hash::{rand_core::OsRng, SaltString};
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use std::sync::OnceLock;

/// Argon2id with a fresh random salt, in PHC string form.
pub fn hash_password(password: &str) -> Result<String, GateError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| GateError::PasswordHash(format!("Password hashing failed: {e}")))
}

/// Re-derive with the stored salt and parameters; argon2 compares in constant time.
pub fn verify_password(password: &str, stored: &str) -> Result<bool, GateError> {
    let parsed = PasswordHash::new(stored)
        .map_err(|e| GateError::PasswordHash(format!("Invalid password hash: {e}")))?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok())
}

/// Burn the same work as a real verification so unknown accounts are not distinguishable
/// by response time.
pub fn verify_dummy(password: &str) {
    static DUMMY: OnceLock<Option<String>> = OnceLock::new();
    let dummy = DUMMY.get_or_init(|| hash_password("nightgate-dummy-password").ok());
    if let Some(hash) = dummy {
        let _ = verify_password(password, hash);
    }
}

/// Every rule the password breaks, in a stable order. Empty means acceptable.
pub fn policy_violations(password: &str, policy: &PasswordPolicy) -> Vec<&'static str> {
    let mut violations = Vec::new();
    let len = password.chars().count();
    if len < policy.min_length {
        violations.push("too_short");
    }
    if len > policy.max_length {
        violations.push("too_long");
    }
    if policy.require_uppercase && !password.chars().any(char::is_uppercase) {
        violations.push("missing_uppercase");
    }
    if policy.require_lowercase && !password.chars().any(char::is_lowercase) {
        violations.push("missing_lowercase");
    }
    if policy.require_digit && !password.chars().any(|c| c.is_ascii_digit()) {
        violations.push("missing_digit");
    }
    if policy.require_special && !password.chars().any(|c| !c.is_alphanumeric()) {
        violations.push("missing_special");
    }
    violations
}
