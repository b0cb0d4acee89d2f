use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use secrecy::{ExposeSecret, SecretString};

/// Checked in place of a real hash when the username is unknown, so that a
/// missing user costs the same as a wrong password.
const DUMMY_HASH: &str =
    "$argon2id$v=19$m=19456,t=2,p=1$MV8LDsXmlp3Kp2Ks0F6zaQ$GQ5XrhDWj9YQ2XaKv06wKZ3vSoPT86VsZPOnk4UU448";

/// Hash a password into a PHC string (Argon2id, default parameters, random
/// salt). This is the format static provider users are configured with.
pub fn hash_password(password: &SecretString) -> Result<String, anyhow::Error> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.expose_secret().as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("Failed to hash password: {}", e))?;
    Ok(hash.to_string())
}

/// Reject anything that is not a parseable PHC string.
pub fn check_password_hash(hash: &str) -> Result<(), anyhow::Error> {
    PasswordHash::new(hash)
        .map(|_| ())
        .map_err(|e| anyhow::anyhow!("Invalid password hash format: {}", e))
}

/// Verify `password` against `hash`, or against a dummy hash when there is
/// no stored hash. Always runs one Argon2 verification.
pub fn verify_password(password: &SecretString, hash: Option<&str>) -> bool {
    let known = hash.is_some();
    let Ok(parsed) = PasswordHash::new(hash.unwrap_or(DUMMY_HASH)) else {
        return false;
    };
    let verified = Argon2::default()
        .verify_password(password.expose_secret().as_bytes(), &parsed)
        .is_ok();
    known && verified
}
