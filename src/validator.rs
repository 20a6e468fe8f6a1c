//! Address syntax validation and EIP-55 checksum normalization.
//!
//! Validation is pure: it never touches the cache, the browser pool or the
//! network, so invalid input can be rejected before any resource is spent.

use crate::error::LookupError;
use crate::types::Network;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;
use tiny_keccak::{Hasher, Keccak};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValidationReason {
    Valid,
    Empty,
    InvalidFormat,
    BadChecksum,
}

impl fmt::Display for ValidationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ValidationReason::Valid => "Valid",
            ValidationReason::Empty => "Empty",
            ValidationReason::InvalidFormat => "InvalidFormat",
            ValidationReason::BadChecksum => "BadChecksum",
        };
        f.write_str(text)
    }
}

/// Outcome of validating one raw address string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub reason: ValidationReason,
    /// Every chain family the string is syntactically compatible with, in
    /// a stable order.
    pub candidate_networks: Vec<Network>,
    pub normalized_address: Option<String>,
    /// True only for a mixed-case EVM address whose checksum matched.
    pub checksum_verified: bool,
}

impl ValidationResult {
    fn invalid(reason: ValidationReason) -> Self {
        Self {
            valid: false,
            reason,
            candidate_networks: Vec::new(),
            normalized_address: None,
            checksum_verified: false,
        }
    }

    pub fn supports(&self, network: Network) -> bool {
        self.candidate_networks.contains(&network)
    }

    /// Maps an invalid result onto the crate error taxonomy.
    pub fn to_error(&self, address: &str) -> Option<LookupError> {
        match self.reason {
            ValidationReason::Valid => None,
            ValidationReason::Empty => Some(LookupError::EmptyAddress),
            ValidationReason::InvalidFormat => Some(LookupError::InvalidFormat(address.to_string())),
            ValidationReason::BadChecksum => Some(LookupError::InvalidFormat(format!(
                "{} (checksum mismatch)",
                address
            ))),
        }
    }
}

const BASE58: &str = "123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";
const RIPPLE: &str = "rpshnaf39wBUDNEGHJKLM4PQRST7VWXYZ2bcdeCg65jkm8oFqi1tuvAxyz";

struct Patterns {
    evm: Regex,
    btc: Regex,
    trx: Regex,
    ltc: Regex,
    doge: Regex,
    xrp: Regex,
    sol: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        let b58 = format!("[{}]", BASE58);
        let build = |p: String| Regex::new(&p).expect("valid address regex");
        Patterns {
            evm: build(r"^0x[0-9a-fA-F]{40}$".to_string()),
            btc: build(format!(r"^(?:[13]{b58}{{25,34}}|bc1[0-9A-Za-z]{{39,59}})$")),
            trx: build(format!(r"^T{b58}{{33}}$")),
            ltc: build(format!(r"^(?:[LM]{b58}{{26,33}}|ltc1[0-9a-z]{{39,59}})$")),
            doge: build(format!(r"^D[5-9A-HJ-NP-U]{b58}{{32}}$")),
            xrp: build(format!(r"^r[{RIPPLE}]{{24,34}}$")),
            sol: build(format!(r"^{b58}{{32,44}}$")),
        }
    })
}

/// Validates `address` against every supported chain family.
pub fn validate(address: &str) -> ValidationResult {
    let address = address.trim();
    if address.is_empty() {
        return ValidationResult::invalid(ValidationReason::Empty);
    }

    let p = patterns();

    if p.evm.is_match(address) {
        let hex = &address[2..];
        let mixed = hex.chars().any(|c| c.is_ascii_lowercase())
            && hex.chars().any(|c| c.is_ascii_uppercase());
        let checksummed = to_checksum(address);

        if mixed && checksummed != address {
            return ValidationResult::invalid(ValidationReason::BadChecksum);
        }

        return ValidationResult {
            valid: true,
            reason: ValidationReason::Valid,
            candidate_networks: Network::EVM.to_vec(),
            normalized_address: Some(checksummed),
            checksum_verified: mixed,
        };
    }

    let mut candidates = Vec::new();
    if p.btc.is_match(address) {
        candidates.push(Network::Btc);
    }
    if p.trx.is_match(address) {
        candidates.push(Network::Trx);
    }
    if p.ltc.is_match(address) {
        candidates.push(Network::Ltc);
    }
    if p.doge.is_match(address) {
        candidates.push(Network::Doge);
    }
    if p.xrp.is_match(address) {
        candidates.push(Network::Xrp);
    }
    // SOL accepts almost any base58 string of the right length
    if candidates.is_empty() && p.sol.is_match(address) {
        candidates.push(Network::Sol);
    }

    if candidates.is_empty() {
        return ValidationResult::invalid(ValidationReason::InvalidFormat);
    }

    ValidationResult {
        valid: true,
        reason: ValidationReason::Valid,
        candidate_networks: candidates,
        normalized_address: Some(address.to_string()),
        checksum_verified: false,
    }
}

/// Canonical form of `address`: EIP-55 case for EVM addresses, unchanged otherwise.
pub fn normalize(address: &str) -> String {
    let trimmed = address.trim();
    if patterns().evm.is_match(trimmed) {
        to_checksum(trimmed)
    } else {
        trimmed.to_string()
    }
}

/// EIP-55 mixed-case encoding. Expects a `0x` + 40 hex digit string.
fn to_checksum(address: &str) -> String {
    let lower = address[2..].to_ascii_lowercase();

    let mut hasher = Keccak::v256();
    let mut hash = [0u8; 32];
    hasher.update(lower.as_bytes());
    hasher.finalize(&mut hash);

    let mut out = String::with_capacity(42);
    out.push_str("0x");
    for (i, c) in lower.chars().enumerate() {
        let byte = hash[i / 2];
        let nibble = if i % 2 == 0 { byte >> 4 } else { byte & 0x0f };
        if c.is_ascii_alphabetic() && nibble >= 8 {
            out.push(c.to_ascii_uppercase());
        } else {
            out.push(c);
        }
    }
    out
}
