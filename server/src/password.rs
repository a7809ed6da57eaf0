use argon2::password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;

use crate::errors::{AppError, AppResult};

/// Hash a password with Argon2id, returning the PHC string to store
///
/// Runs on the blocking pool since hashing is deliberately CPU intensive.
pub async fn hash_password(password: &str) -> AppResult<String> {
    let password = password.to_owned();

    tokio::task::spawn_blocking(move || {
        let salt = SaltString::generate(&mut OsRng);
        Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|e| AppError::upstream(format!("argon2 hash: {e}")))
    })
    .await
    .map_err(|e| AppError::upstream(format!("password hashing task failed: {e}")))?
}

/// Check `password` against a stored PHC string
pub async fn verify_password(password: &str, stored_hash: &str) -> AppResult<bool> {
    let password = password.to_owned();
    let stored_hash = stored_hash.to_owned();

    tokio::task::spawn_blocking(move || {
        let parsed = PasswordHash::new(&stored_hash)
            .map_err(|e| AppError::upstream(format!("stored password hash is unreadable: {e}")))?;

        Ok(Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok())
    })
    .await
    .map_err(|e| AppError::upstream(format!("password verification task failed: {e}")))?
}
