//! Core data model shared by the lookup pipeline.

use crate::error::ErrorBody;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::warn;

/// Chain family an address belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Network {
    Eth,
    Bsc,
    Matic,
    Btc,
    Trx,
    Sol,
    Ltc,
    Doge,
    Xrp,
}

impl Network {
    pub const ALL: [Network; 9] = [
        Network::Eth,
        Network::Bsc,
        Network::Matic,
        Network::Btc,
        Network::Trx,
        Network::Sol,
        Network::Ltc,
        Network::Doge,
        Network::Xrp,
    ];

    pub const EVM: [Network; 3] = [Network::Eth, Network::Bsc, Network::Matic];

    /// Parses a caller-supplied network token, accepting common aliases.
    pub fn from_token(token: &str) -> Option<Self> {
        match token.trim().to_ascii_uppercase().as_str() {
            "ETH" | "ETHEREUM" => Some(Network::Eth),
            "BSC" | "BNB" => Some(Network::Bsc),
            "MATIC" | "POLYGON" => Some(Network::Matic),
            "BTC" | "BITCOIN" => Some(Network::Btc),
            "TRX" | "TRON" => Some(Network::Trx),
            "SOL" | "SOLANA" => Some(Network::Sol),
            "LTC" | "LITECOIN" => Some(Network::Ltc),
            "DOGE" | "DOGECOIN" => Some(Network::Doge),
            "XRP" | "RIPPLE" => Some(Network::Xrp),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Eth => "ETH",
            Network::Bsc => "BSC",
            Network::Matic => "MATIC",
            Network::Btc => "BTC",
            Network::Trx => "TRX",
            Network::Sol => "SOL",
            Network::Ltc => "LTC",
            Network::Doge => "DOGE",
            Network::Xrp => "XRP",
        }
    }

    pub fn is_evm(&self) -> bool {
        Self::EVM.contains(self)
    }
}

impl Default for Network {
    fn default() -> Self {
        Network::Eth
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single lookup request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressQuery {
    pub address: String,
    #[serde(default)]
    pub network: Network,
}

impl AddressQuery {
    pub fn new(address: impl Into<String>, network: Network) -> Self {
        Self {
            address: address.into(),
            network,
        }
    }

    /// Builds a query from an optional caller token; absent or unknown
    /// tokens fall back to ETH.
    pub fn with_token(address: impl Into<String>, token: Option<&str>) -> Self {
        let network = match token {
            Some(t) if !t.trim().is_empty() => Network::from_token(t).unwrap_or_else(|| {
                warn!("Unknown network token {:?}, defaulting to ETH", t);
                Network::Eth
            }),
            _ => Network::Eth,
        };
        Self::new(address, network)
    }
}

/// An ordered set of queries submitted together.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressBatch {
    pub queries: Vec<AddressQuery>,
}

impl AddressBatch {
    pub fn new(queries: Vec<AddressQuery>) -> Self {
        Self { queries }
    }

    /// Parses `address[,network]` lines. Blank lines and `#` comments are skipped.
    pub fn from_lines(content: &str) -> Self {
        let queries = content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(|line| match line.split_once(',') {
                Some((address, network)) => {
                    AddressQuery::with_token(address.trim(), Some(network.trim()))
                }
                None => AddressQuery::with_token(line, None),
            })
            .collect();

        Self { queries }
    }

    pub fn len(&self) -> usize {
        self.queries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }
}

/// How much of a lookup result was populated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Confidence {
    /// Both the risk score and the risk level were found.
    Full,
    /// Some field was found, but not both primary ones.
    Partial,
    Empty,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub hash: Option<String>,
    pub date: Option<String>,
    pub amount: Option<String>,
}

impl Transaction {
    pub fn is_empty(&self) -> bool {
        self.hash.is_none() && self.date.is_none() && self.amount.is_none()
    }
}

/// One row of the labelled risk table, keyed by configured column name.
pub type RiskRow = BTreeMap<String, String>;

/// Risk metadata for one address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LookupResult {
    pub address: String,
    pub network: Network,
    pub risk_score: Option<f64>,
    pub risk_level: Option<String>,
    pub risk_type: Option<String>,
    pub labels: BTreeSet<String>,
    pub related_addresses: BTreeSet<String>,
    pub transactions: Vec<Transaction>,
    #[serde(default)]
    pub risk_rows: Vec<RiskRow>,
    #[serde(default)]
    pub risk_analysis: BTreeMap<String, String>,
    pub confidence: Confidence,
    /// Set when the upstream explicitly reported that it holds no data, making
    /// an Empty result a definitive answer rather than a failed scrape.
    #[serde(default)]
    pub is_final: bool,
}

impl LookupResult {
    pub fn empty(address: impl Into<String>, network: Network) -> Self {
        Self {
            address: address.into(),
            network,
            risk_score: None,
            risk_level: None,
            risk_type: None,
            labels: BTreeSet::new(),
            related_addresses: BTreeSet::new(),
            transactions: Vec::new(),
            risk_rows: Vec::new(),
            risk_analysis: BTreeMap::new(),
            confidence: Confidence::Empty,
            is_final: false,
        }
    }

    /// Recomputes `confidence` from the populated fields.
    pub fn classify(&mut self) {
        let primary = self.risk_score.is_some() && self.risk_level.is_some();
        let any = self.risk_score.is_some()
            || self.risk_level.is_some()
            || self.risk_type.is_some()
            || !self.labels.is_empty()
            || !self.related_addresses.is_empty()
            || !self.transactions.is_empty()
            || !self.risk_rows.is_empty()
            || !self.risk_analysis.is_empty();

        self.confidence = if primary {
            Confidence::Full
        } else if any {
            Confidence::Partial
        } else {
            Confidence::Empty
        };
    }

    pub fn risk_level_or_unknown(&self) -> &str {
        self.risk_level.as_deref().unwrap_or("Unknown")
    }

    pub fn risk_type_or_unknown(&self) -> &str {
        self.risk_type.as_deref().unwrap_or("Unknown")
    }

    /// Results worth keeping for the TTL window.
    pub fn is_cacheable(&self) -> bool {
        self.confidence != Confidence::Empty || self.is_final
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// Per-address outcome recorded in a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressOutcome {
    Data(LookupResult),
    Error(ErrorBody),
}

impl AddressOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, AddressOutcome::Data(_))
    }
}

/// State of one batch request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LookupTask {
    pub id: String,
    pub addresses: Vec<AddressQuery>,
    pub status: TaskStatus,
    pub progress: u8,
    pub results: BTreeMap<String, AddressOutcome>,
}

impl LookupTask {
    pub fn new(addresses: Vec<AddressQuery>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            addresses,
            status: TaskStatus::Pending,
            progress: 0,
            results: BTreeMap::new(),
        }
    }

    pub fn success_count(&self) -> usize {
        self.results.values().filter(|o| o.is_ok()).count()
    }

    pub fn error_count(&self) -> usize {
        self.results.values().filter(|o| !o.is_ok()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_tokens_and_default() {
        assert_eq!(Network::from_token("eth"), Some(Network::Eth));
        assert_eq!(Network::from_token("Polygon"), Some(Network::Matic));
        assert_eq!(Network::from_token("tron"), Some(Network::Trx));
        assert_eq!(Network::from_token("dogecoin"), Some(Network::Doge));
        assert_eq!(Network::from_token("zzz"), None);

        assert_eq!(AddressQuery::with_token("0xabc", None).network, Network::Eth);
        assert_eq!(AddressQuery::with_token("0xabc", Some("nope")).network, Network::Eth);
        assert_eq!(AddressQuery::with_token("0xabc", Some(" ")).network, Network::Eth);
        assert_eq!(AddressQuery::with_token("T1", Some("TRX")).network, Network::Trx);
    }

    #[test]
    fn test_network_serde_is_uppercase() {
        assert_eq!(serde_json::to_string(&Network::Matic).unwrap(), "\"MATIC\"");
        let parsed: AddressQuery = serde_json::from_str(r#"{"address":"a"}"#).unwrap();
        assert_eq!(parsed.network, Network::Eth);
    }

    #[test]
    fn test_batch_from_lines() {
        let batch = AddressBatch::from_lines(
            "# header\n0x28c6c06298d514db089934071355e5743bf21d60\n\n  TF5Bn4cJCT6GVeUgyCN9qCzdH1RcnnK8yF , trx \n",
        );
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.queries[0].network, Network::Eth);
        assert_eq!(batch.queries[1].address, "TF5Bn4cJCT6GVeUgyCN9qCzdH1RcnnK8yF");
        assert_eq!(batch.queries[1].network, Network::Trx);
    }

    #[test]
    fn test_classify_confidence() {
        let mut result = LookupResult::empty("a", Network::Eth);
        result.classify();
        assert_eq!(result.confidence, Confidence::Empty);
        assert!(!result.is_cacheable());

        result.labels.insert("Exchange".to_string());
        result.classify();
        assert_eq!(result.confidence, Confidence::Partial);

        result.risk_score = Some(42.0);
        result.classify();
        assert_eq!(result.confidence, Confidence::Partial);

        result.risk_level = Some("High".to_string());
        result.classify();
        assert_eq!(result.confidence, Confidence::Full);
        assert!(result.is_cacheable());

        result.risk_score = None;
        result.classify();
        assert_eq!(result.confidence, Confidence::Partial);
    }

    #[test]
    fn test_final_empty_result_is_cacheable() {
        let mut result = LookupResult::empty("a", Network::Btc);
        result.is_final = true;
        result.classify();
        assert_eq!(result.confidence, Confidence::Empty);
        assert!(result.is_cacheable());
        assert_eq!(result.risk_level_or_unknown(), "Unknown");
    }
}
