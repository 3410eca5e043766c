//! Device identity: EverID, sampling decision and identity-field hashing

use crate::error::Result;
use crate::prefs::{Preferences, SamplingDecision};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

/// Generate a new EverID: `6` + 10-digit unix seconds + 8-digit random number.
pub fn generate_ever_id(now: DateTime<Utc>) -> String {
    let random = uuid::Uuid::new_v4().as_u128() % 100_000_000;
    format!("6{:010}{:08}", now.timestamp().max(0), random)
}

/// Return the persisted EverID, generating and storing one on first use.
pub fn load_or_create_ever_id(prefs: &Preferences) -> Result<String> {
    if let Some(existing) = prefs.ever_id()? {
        if !existing.is_empty() {
            return Ok(existing);
        }
    }

    let ever_id = generate_ever_id(Utc::now());
    prefs.set_ever_id(&ever_id)?;
    tracing::info!(ever_id = %ever_id, "Generated new EverID");
    Ok(ever_id)
}

/// Whether a device with this EverID is excluded at the given rate.
///
/// Rates of 0 and 1 track every device. An EverID that is not numeric is
/// never excluded.
pub fn is_sampled_out(ever_id: &str, rate: u32) -> bool {
    if rate <= 1 {
        return false;
    }
    match ever_id.parse::<u64>() {
        Ok(id) => id % u64::from(rate) != 0,
        Err(_) => false,
    }
}

/// Return the stored sampling decision, recomputing it when the rate changed.
pub fn resolve_sampling(prefs: &Preferences, ever_id: &str, rate: u32) -> Result<bool> {
    if let Some(stored) = prefs.sampling_decision()? {
        if stored.rate == rate {
            return Ok(stored.excluded);
        }
    }

    let excluded = is_sampled_out(ever_id, rate);
    prefs.set_sampling_decision(&SamplingDecision { excluded, rate })?;
    tracing::info!(rate, excluded, "Sampling decision computed");
    Ok(excluded)
}

/// Lower-case hex SHA-256 of a value.
pub fn sha256_hex(value: &str) -> String {
    hex::encode(Sha256::digest(value.as_bytes()))
}

/// Hash an email address after trimming and lower-casing it.
pub fn hash_email(email: &str) -> String {
    sha256_hex(&email.trim().to_lowercase())
}

/// Hash a phone number keeping only its digits.
pub fn hash_phone(phone: &str) -> String {
    let digits: String = phone.chars().filter(|c| c.is_ascii_digit()).collect();
    sha256_hex(&digits)
}

/// Hash a postal address in `first|last|zip|street|number` form.
///
/// Parts are lower-cased and stripped of whitespace, umlauts are folded.
pub fn hash_address(first_name: &str, last_name: &str, zip: &str, street: &str, number: &str) -> String {
    let normalized = [first_name, last_name, zip, street, number]
        .iter()
        .map(|part| normalize_address_part(part))
        .collect::<Vec<_>>()
        .join("|");
    sha256_hex(&normalized)
}

fn normalize_address_part(part: &str) -> String {
    part.to_lowercase()
        .replace('ä', "ae")
        .replace('ö', "oe")
        .replace('ü', "ue")
        .replace('ß', "ss")
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '-' && *c != '_')
        .collect()
}
