//! Identifier normalization. Emails become lowercase SHA-256 hex hashes,
//! phone numbers become E.164 with a configurable default region. The plain
//! email never leaves this module.

use sendflow_core::config::IdentityConfig;
use sendflow_core::error::{SendFlowError, SendFlowResult};
use sendflow_core::types::{Identifier, IdentifierSet, IdentifierType};
use sha2::{Digest, Sha256};
use tracing::warn;

/// Lowercase SHA-256 hex of the trimmed, lowercased email address.
pub fn hash_email(raw: &str) -> String {
    let normalized = raw.trim().to_lowercase();
    let digest = Sha256::digest(normalized.as_bytes());
    hex::encode(digest)
}

/// Calling code for a region. Lenient by design; unknown regions fall back
/// to the North American plan.
fn calling_code(region: &str) -> &'static str {
    match region.to_ascii_uppercase().as_str() {
        "US" | "CA" => "1",
        "GB" => "44",
        "DE" => "49",
        "FR" => "33",
        "AU" => "61",
        "IN" => "91",
        _ => "1",
    }
}

/// Normalize a phone number to E.164. Input already carrying `+` keeps its
/// country code; otherwise the default region's calling code is applied.
/// Returns None when too few digits remain to form a plausible number.
pub fn normalize_phone(raw: &str, default_region: &str) -> Option<String> {
    let has_plus = raw.trim_start().starts_with('+');
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() < 7 || digits.len() > 15 {
        return None;
    }
    if has_plus {
        return Some(format!("+{digits}"));
    }

    let code = calling_code(default_region);
    // National formats commonly carry a leading trunk zero; drop it.
    let national = digits.strip_prefix('0').unwrap_or(&digits);
    // A NANP number given with its country code needs no second prefix.
    if code == "1" && national.len() == 11 && national.starts_with('1') {
        return Some(format!("+{national}"));
    }
    Some(format!("+{code}{national}"))
}

/// Normalize a raw identifier set into typed identifiers, dropping values
/// that cannot be normalized. An empty result is the caller's
/// `InvalidInput`.
pub fn normalize_set(
    set: &IdentifierSet,
    config: &IdentityConfig,
) -> SendFlowResult<Vec<Identifier>> {
    let mut out = Vec::new();

    if let Some(email) = set.email.as_deref().filter(|s| !s.trim().is_empty()) {
        out.push(Identifier::new(IdentifierType::EmailHash, hash_email(email)));
    }
    if let Some(phone) = set.phone.as_deref().filter(|s| !s.trim().is_empty()) {
        match normalize_phone(phone, &config.phone_default_region) {
            Some(e164) => out.push(Identifier::new(IdentifierType::PhoneNumber, e164)),
            None => warn!(phone = %phone, "unparseable phone number dropped"),
        }
    }
    for (value, id_type) in [
        (&set.klaviyo_id, IdentifierType::KlaviyoId),
        (&set.shopify_customer_id, IdentifierType::ShopifyCustomerId),
        (&set.esp_user_id, IdentifierType::EspUserId),
        (&set.ip_device_signature, IdentifierType::IpDeviceSignature),
    ] {
        if let Some(v) = value.as_deref().filter(|s| !s.trim().is_empty()) {
            out.push(Identifier::new(id_type, v.trim()));
        }
    }

    if out.is_empty() {
        return Err(SendFlowError::InvalidInput(
            "no usable identifiers supplied".to_string(),
        ));
    }
    Ok(out)
}
