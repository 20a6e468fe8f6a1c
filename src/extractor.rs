//! Tolerant extraction of risk metadata from a rendered page.
//!
//! Every field is described by an ordered list of selector rules held as
//! configuration data. The first rule that yields a usable value wins; a field
//! no rule can resolve is left absent. Extraction never fails.

use crate::fetch::RenderedPage;
use crate::types::{Confidence, LookupResult, Network, RiskRow, Transaction};
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;
use tracing::{debug, warn};

/// One way to read a field: the text of the first element matching
/// `selector`, or its `attr` attribute when set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldRule {
    pub selector: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attr: Option<String>,
}

impl FieldRule {
    pub fn text(selector: &str) -> Self {
        Self {
            selector: selector.to_string(),
            attr: None,
        }
    }

    pub fn attr(selector: &str, attr: &str) -> Self {
        Self {
            selector: selector.to_string(),
            attr: Some(attr.to_string()),
        }
    }
}

/// Keys read from the pre-hydrated state blob, tried in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateKeys {
    pub risk_score: Vec<String>,
    pub risk_level: Vec<String>,
    pub risk_type: Vec<String>,
    pub labels: Vec<String>,
}

impl Default for StateKeys {
    fn default() -> Self {
        Self {
            risk_score: strings(&["riskScore", "score"]),
            risk_level: strings(&["riskLevel", "risk_level"]),
            risk_type: strings(&["riskType", "risk_type"]),
            labels: strings(&["labels", "tags"]),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionRules {
    /// Row containers; the first selector that matches any row is used
    pub rows: Vec<String>,
    pub hash: String,
    pub amount: String,
    pub date: String,
}

impl Default for TransactionRules {
    fn default() -> Self {
        Self {
            rows: strings(&[
                ".transaction-row",
                ".transaction-item",
                ".transaction",
                ".tx-item",
                "[data-transaction]",
            ]),
            hash: ".tx-hash a, .tx-hash, .hash, [data-hash]".to_string(),
            amount: ".tx-amount, .amount, .value, [data-amount]".to_string(),
            date: ".tx-date, .timestamp, .time, [data-time]".to_string(),
        }
    }
}

/// Labelled risk table, mapped positionally onto `columns`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TableRule {
    pub table: String,
    pub row: String,
    pub cell: String,
    pub columns: Vec<String>,
    /// Column whose values become labels when no label selector matched
    pub label_column: Option<String>,
}

impl Default for TableRule {
    fn default() -> Self {
        Self {
            table: "table.risk-table, table.transactions, table".to_string(),
            row: "tr".to_string(),
            cell: "td".to_string(),
            columns: strings(&["address", "risk_label"]),
            label_column: Some("risk_label".to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisRule {
    pub item: String,
    pub category: String,
    pub description: String,
}

impl Default for AnalysisRule {
    fn default() -> Self {
        Self {
            item: "div.risk-analysis-item".to_string(),
            category: "div.category".to_string(),
            description: "div.description".to_string(),
        }
    }
}

/// Visible labels whose following sibling holds the value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnchorRules {
    pub risk_level: Vec<String>,
    pub risk_type: Vec<String>,
    pub labels: Vec<String>,
}

impl Default for AnchorRules {
    fn default() -> Self {
        Self {
            risk_level: strings(&["Risk Level"]),
            risk_type: strings(&["Risk Type"]),
            labels: strings(&["Address Label", "Risk Label"]),
        }
    }
}

/// Declarative selector configuration for every extracted field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionRules {
    pub state_keys: StateKeys,
    pub risk_score: Vec<FieldRule>,
    pub risk_level: Vec<FieldRule>,
    pub risk_type: Vec<FieldRule>,
    pub labels: Vec<FieldRule>,
    pub address_labels: Vec<FieldRule>,
    pub related_addresses: Vec<FieldRule>,
    /// Candidates this short are link noise, not addresses
    pub related_min_len: usize,
    pub transactions: TransactionRules,
    pub table: TableRule,
    pub analysis: AnalysisRule,
    pub anchors: AnchorRules,
    /// Values treated as absent, compared case-insensitively
    pub absent_values: Vec<String>,
    /// Page text stating the upstream has nothing on this address
    pub no_data_markers: Vec<String>,
}

impl Default for ExtractionRules {
    fn default() -> Self {
        Self {
            state_keys: StateKeys::default(),
            risk_score: vec![
                FieldRule::text("div.risk-score-value"),
                FieldRule::attr("div[data-risk-score]", "data-risk-score"),
                FieldRule::text("div.risk-score"),
                FieldRule::text("span.risk-score"),
                FieldRule::text(".risk-score"),
            ],
            risk_level: vec![
                FieldRule::text(".risk-level"),
                FieldRule::text(".risk-status"),
                FieldRule::attr("[data-risk-level]", "data-risk-level"),
                FieldRule::text("div.risk-level"),
                FieldRule::text("span.risk-level"),
                FieldRule::text("div.risk-status"),
            ],
            risk_type: vec![
                FieldRule::text(".risk-type"),
                FieldRule::text(".risk-category"),
                FieldRule::attr("[data-risk-type]", "data-risk-type"),
                FieldRule::text("div.risk-type"),
                FieldRule::text("span.risk-type"),
            ],
            labels: vec![
                FieldRule::text(".label-tag"),
                FieldRule::text(".label"),
                FieldRule::text(".tag"),
                FieldRule::text(".risk-label"),
                FieldRule::attr("[data-label]", "data-label"),
            ],
            address_labels: vec![
                FieldRule::text(".address-label"),
                FieldRule::text(".address-tag"),
                FieldRule::attr("[data-address-label]", "data-address-label"),
                FieldRule::text("div.address-label"),
                FieldRule::text("span.address-label"),
            ],
            related_addresses: vec![
                FieldRule::text(".related-address a"),
                FieldRule::text(".related-address"),
                FieldRule::text(".address-item"),
                FieldRule::attr("[data-address]", "data-address"),
                FieldRule::text("a[href*=\"address\"]"),
            ],
            related_min_len: 10,
            transactions: TransactionRules::default(),
            table: TableRule::default(),
            analysis: AnalysisRule::default(),
            anchors: AnchorRules::default(),
            absent_values: strings(&["unknown", "n/a", "-", "none", "null"]),
            no_data_markers: strings(&["No data available", "No risk data", "No results found"]),
        }
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

struct CompiledRule {
    selector: Selector,
    attr: Option<String>,
}

fn compile_selector(raw: &str) -> Option<Selector> {
    match Selector::parse(raw) {
        Ok(selector) => Some(selector),
        Err(e) => {
            warn!("Skipping invalid selector {:?}: {}", raw, e);
            None
        }
    }
}

fn compile(rules: &[FieldRule]) -> Vec<CompiledRule> {
    rules
        .iter()
        .filter_map(|rule| {
            compile_selector(&rule.selector).map(|selector| CompiledRule {
                selector,
                attr: rule.attr.clone(),
            })
        })
        .collect()
}

fn score_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"-?\d+(?:\.\d+)?").expect("valid score regex"))
}

fn whitespace_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\s+").expect("valid whitespace regex"))
}

/// First number in `text`, if any.
pub fn parse_score(text: &str) -> Option<f64> {
    score_pattern()
        .find(text)
        .and_then(|m| m.as_str().parse::<f64>().ok())
        .filter(|score| score.is_finite())
}

fn element_text(element: &ElementRef) -> String {
    let joined = element.text().collect::<Vec<_>>().join(" ");
    whitespace_pattern().replace_all(joined.trim(), " ").into_owned()
}

/// Turns `ExtractionRules` into compiled selectors once and applies them to
/// any number of pages.
pub struct Extractor {
    rules: ExtractionRules,
    risk_score: Vec<CompiledRule>,
    risk_level: Vec<CompiledRule>,
    risk_type: Vec<CompiledRule>,
    labels: Vec<CompiledRule>,
    address_labels: Vec<CompiledRule>,
    related_addresses: Vec<CompiledRule>,
    tx_rows: Vec<Selector>,
    tx_hash: Option<Selector>,
    tx_amount: Option<Selector>,
    tx_date: Option<Selector>,
    table: Option<Selector>,
    table_row: Option<Selector>,
    table_cell: Option<Selector>,
    analysis_item: Option<Selector>,
    analysis_category: Option<Selector>,
    analysis_description: Option<Selector>,
    any_element: Option<Selector>,
}

impl Default for Extractor {
    fn default() -> Self {
        Self::new(ExtractionRules::default())
    }
}

impl Extractor {
    pub fn new(rules: ExtractionRules) -> Self {
        Self {
            risk_score: compile(&rules.risk_score),
            risk_level: compile(&rules.risk_level),
            risk_type: compile(&rules.risk_type),
            labels: compile(&rules.labels),
            address_labels: compile(&rules.address_labels),
            related_addresses: compile(&rules.related_addresses),
            tx_rows: rules
                .transactions
                .rows
                .iter()
                .filter_map(|s| compile_selector(s))
                .collect(),
            tx_hash: compile_selector(&rules.transactions.hash),
            tx_amount: compile_selector(&rules.transactions.amount),
            tx_date: compile_selector(&rules.transactions.date),
            table: compile_selector(&rules.table.table),
            table_row: compile_selector(&rules.table.row),
            table_cell: compile_selector(&rules.table.cell),
            analysis_item: compile_selector(&rules.analysis.item),
            analysis_category: compile_selector(&rules.analysis.category),
            analysis_description: compile_selector(&rules.analysis.description),
            any_element: compile_selector("body *"),
            rules,
        }
    }

    pub fn rules(&self) -> &ExtractionRules {
        &self.rules
    }

    /// Builds a `LookupResult` from whatever the page yields.
    ///
    /// Field precedence: script state, then HTML selector rules, then visible
    /// text anchors, then the risk table.
    pub fn extract(&self, page: &RenderedPage, address: &str, network: Network) -> LookupResult {
        let document = Html::parse_document(&page.html);
        let state = page.script_state.as_ref().filter(|v| v.is_object());
        let mut result = LookupResult::empty(address, network);

        result.risk_score = state
            .and_then(|s| self.state_number(s, &self.rules.state_keys.risk_score))
            .or_else(|| self.first_value(&document, &self.risk_score).and_then(|t| parse_score(&t)));

        result.risk_level = state
            .and_then(|s| self.state_string(s, &self.rules.state_keys.risk_level))
            .or_else(|| self.first_value(&document, &self.risk_level))
            .or_else(|| self.anchored_value(&document, &self.rules.anchors.risk_level));

        result.risk_type = state
            .and_then(|s| self.state_string(s, &self.rules.state_keys.risk_type))
            .or_else(|| self.first_value(&document, &self.risk_type))
            .or_else(|| self.anchored_value(&document, &self.rules.anchors.risk_type));

        if let Some(s) = state {
            result.labels.extend(self.state_labels(s));
        }
        if result.labels.is_empty() {
            result.labels.extend(self.first_values(&document, &self.labels));
        }
        result.labels.extend(self.first_values(&document, &self.address_labels));
        if result.labels.is_empty() {
            result
                .labels
                .extend(self.anchored_value(&document, &self.rules.anchors.labels));
        }

        result.related_addresses = self
            .first_values(&document, &self.related_addresses)
            .into_iter()
            .filter(|candidate| {
                candidate.len() > self.rules.related_min_len && !candidate.eq_ignore_ascii_case(address)
            })
            .collect();

        result.transactions = self.transactions(&document);
        result.risk_rows = self.risk_rows(&document);

        if result.labels.is_empty() {
            if let Some(column) = &self.rules.table.label_column {
                result.labels.extend(
                    result
                        .risk_rows
                        .iter()
                        .filter_map(|row| row.get(column))
                        .filter_map(|v| self.clean(v)),
                );
            }
        }

        result.risk_analysis = self.risk_analysis(&document);
        result.classify();

        if result.risk_score.is_none() && result.risk_level.is_none() && self.reports_no_data(&page.html) {
            result.is_final = result.confidence == Confidence::Empty;
        }

        debug!(
            "Extracted {} on {}: confidence {:?}, {} labels, {} transactions",
            address,
            network,
            result.confidence,
            result.labels.len(),
            result.transactions.len()
        );
        result
    }

    /// Trimmed value, or None when it is blank or a placeholder like "Unknown".
    fn clean(&self, raw: &str) -> Option<String> {
        let value = whitespace_pattern().replace_all(raw.trim(), " ").into_owned();
        if value.is_empty()
            || self
                .rules
                .absent_values
                .iter()
                .any(|absent| absent.eq_ignore_ascii_case(&value))
        {
            None
        } else {
            Some(value)
        }
    }

    fn rule_value(&self, element: &ElementRef, rule: &CompiledRule) -> Option<String> {
        match &rule.attr {
            Some(attr) => element.value().attr(attr).and_then(|v| self.clean(v)),
            None => self.clean(&element_text(element)),
        }
    }

    fn first_value(&self, document: &Html, rules: &[CompiledRule]) -> Option<String> {
        rules.iter().find_map(|rule| {
            document
                .select(&rule.selector)
                .find_map(|element| self.rule_value(&element, rule))
        })
    }

    /// All values of the first rule that yields any.
    fn first_values(&self, document: &Html, rules: &[CompiledRule]) -> BTreeSet<String> {
        for rule in rules {
            let values: BTreeSet<String> = document
                .select(&rule.selector)
                .filter_map(|element| self.rule_value(&element, rule))
                .collect();
            if !values.is_empty() {
                return values;
            }
        }
        BTreeSet::new()
    }

    fn state_field<'a>(&self, state: &'a Value, keys: &[String]) -> Option<&'a Value> {
        keys.iter().find_map(|key| state.get(key).filter(|v| !v.is_null()))
    }

    fn state_string(&self, state: &Value, keys: &[String]) -> Option<String> {
        match self.state_field(state, keys)? {
            Value::String(s) => self.clean(s),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    fn state_number(&self, state: &Value, keys: &[String]) -> Option<f64> {
        match self.state_field(state, keys)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => parse_score(s),
            _ => None,
        }
    }

    fn state_labels(&self, state: &Value) -> Vec<String> {
        match self.state_field(state, &self.rules.state_keys.labels) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .filter_map(|s| self.clean(s))
                .collect(),
            Some(Value::String(s)) => s.split(',').filter_map(|s| self.clean(s)).collect(),
            _ => Vec::new(),
        }
    }

    /// Value of the element following a visible label such as "Risk Level".
    fn anchored_value(&self, document: &Html, anchors: &[String]) -> Option<String> {
        let any = self.any_element.as_ref()?;
        anchors.iter().find_map(|anchor| {
            document
                .select(any)
                .filter(|element| {
                    element_text(element)
                        .trim_end_matches(':')
                        .trim()
                        .eq_ignore_ascii_case(anchor)
                })
                .find_map(|label| {
                    label
                        .next_siblings()
                        .filter_map(ElementRef::wrap)
                        .find_map(|sibling| self.clean(&element_text(&sibling)))
                })
        })
    }

    fn transactions(&self, document: &Html) -> Vec<Transaction> {
        let pick = |row: &ElementRef, selector: &Option<Selector>| {
            selector
                .as_ref()
                .and_then(|s| row.select(s).find_map(|el| self.clean(&element_text(&el))))
        };

        for rows in &self.tx_rows {
            let transactions: Vec<Transaction> = document
                .select(rows)
                .map(|row| Transaction {
                    hash: pick(&row, &self.tx_hash),
                    amount: pick(&row, &self.tx_amount),
                    date: pick(&row, &self.tx_date),
                })
                .filter(|tx| !tx.is_empty())
                .collect();
            if !transactions.is_empty() {
                return transactions;
            }
        }
        Vec::new()
    }

    fn risk_rows(&self, document: &Html) -> Vec<RiskRow> {
        let (Some(table), Some(row), Some(cell)) = (&self.table, &self.table_row, &self.table_cell) else {
            return Vec::new();
        };
        let columns = &self.rules.table.columns;
        if columns.is_empty() {
            return Vec::new();
        }

        for table in document.select(table) {
            let rows: Vec<RiskRow> = table
                .select(row)
                .filter_map(|tr| {
                    let cells: Vec<String> = tr.select(cell).map(|td| element_text(&td)).collect();
                    if cells.len() < columns.len() {
                        return None;
                    }
                    let mapped: RiskRow = columns
                        .iter()
                        .zip(cells)
                        .filter_map(|(name, value)| self.clean(&value).map(|v| (name.clone(), v)))
                        .collect();
                    (!mapped.is_empty()).then_some(mapped)
                })
                .collect();
            if !rows.is_empty() {
                return rows;
            }
        }
        Vec::new()
    }

    fn risk_analysis(&self, document: &Html) -> BTreeMap<String, String> {
        let mut analysis = BTreeMap::new();
        let (Some(item), Some(category), Some(description)) =
            (&self.analysis_item, &self.analysis_category, &self.analysis_description)
        else {
            return analysis;
        };

        for element in document.select(item) {
            let category = element
                .select(category)
                .find_map(|el| self.clean(&element_text(&el)));
            let description = element
                .select(description)
                .find_map(|el| self.clean(&element_text(&el)));
            if let (Some(category), Some(description)) = (category, description) {
                analysis.insert(category, description);
            }
        }
        analysis
    }

    fn reports_no_data(&self, html: &str) -> bool {
        let lowered = html.to_lowercase();
        self.rules
            .no_data_markers
            .iter()
            .any(|marker| !marker.is_empty() && lowered.contains(&marker.to_lowercase()))
    }
}
