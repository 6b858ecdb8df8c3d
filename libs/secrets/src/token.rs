use rand::RngCore;

/// Generate a random token in UUID form (version 4 layout).
///
/// Used for credentials the platform expects to look like UUIDs, such as
/// the admin API token and the health access key.
pub fn generate_token() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    uuid::Builder::from_random_bytes(bytes)
        .into_uuid()
        .hyphenated()
        .to_string()
}

/// Generate a random password (256 bits, hex encoded).
pub fn generate_password() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
