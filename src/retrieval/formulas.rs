//! Reference formula lookup used when scoring reasoning actions

use super::{tokenize, Bm25Index};
use crate::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormulaEntry {
    pub formula_name: String,
    pub formula: String,
    #[serde(default)]
    pub meaning: String,
}

impl FormulaEntry {
    pub fn new(name: &str, formula: &str, meaning: &str) -> Self {
        Self {
            formula_name: name.to_string(),
            formula: formula.to_string(),
            meaning: meaning.to_string(),
        }
    }

    fn searchable_text(&self) -> String {
        format!("{} {} {}", self.formula_name, self.formula, self.meaning)
    }
}

/// Returns reference formulas related to a query.
pub trait FormulaStore: Send + Sync {
    fn related(&self, query: &str, n: usize) -> Vec<FormulaEntry>;
}

pub struct InMemoryFormulaStore {
    entries: Vec<FormulaEntry>,
    index: Bm25Index,
}

impl InMemoryFormulaStore {
    pub fn from_entries(entries: Vec<FormulaEntry>) -> Self {
        let index = Bm25Index::new(
            entries
                .iter()
                .map(|entry| tokenize(&entry.searchable_text()))
                .collect(),
        );
        Self { entries, index }
    }

    /// Load a JSON array of `{formula_name, formula, meaning}` objects.
    pub async fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path.as_ref()).await?;
        let entries: Vec<FormulaEntry> = serde_json::from_str(&raw)?;
        info!(path = %path.as_ref().display(), count = entries.len(), "Loaded formula reference");
        Ok(Self::from_entries(entries))
    }

    pub fn with_defaults() -> Self {
        Self::from_entries(vec![
            FormulaEntry::new(
                "Growth Rate",
                "(current_value - previous_value) / previous_value * 100",
                "Percentage change of a value between two periods",
            ),
            FormulaEntry::new(
                "Return on Equity",
                "net_income / shareholders_equity",
                "Profit generated per unit of shareholder equity",
            ),
            FormulaEntry::new(
                "Return on Assets",
                "net_income / total_assets",
                "Profit generated per unit of assets",
            ),
            FormulaEntry::new(
                "Gross Margin",
                "(revenue - cost_of_goods_sold) / revenue",
                "Share of revenue left after direct costs",
            ),
            FormulaEntry::new(
                "Operating Margin",
                "operating_income / revenue",
                "Share of revenue left after operating expenses",
            ),
            FormulaEntry::new(
                "Current Ratio",
                "current_assets / current_liabilities",
                "Ability to cover short-term obligations",
            ),
            FormulaEntry::new(
                "Debt to Equity",
                "total_liabilities / shareholders_equity",
                "Leverage of the company's capital structure",
            ),
            FormulaEntry::new(
                "Earnings per Share",
                "(net_income - preferred_dividends) / weighted_average_shares",
                "Profit attributable to each common share",
            ),
        ])
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FormulaStore for InMemoryFormulaStore {
    fn related(&self, query: &str, n: usize) -> Vec<FormulaEntry> {
        let scores = self.index.scores(&tokenize(query));
        let mut ranked: Vec<(usize, f64)> = scores.into_iter().enumerate().collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1));

        ranked
            .into_iter()
            .take(n)
            .map(|(i, _)| self.entries[i].clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_related_ranks_by_query_terms() {
        let store = InMemoryFormulaStore::with_defaults();
        let related = store.related("what was the growth rate of revenue", 2);

        assert_eq!(related.len(), 2);
        assert_eq!(related[0].formula_name, "Growth Rate");
    }

    #[test]
    fn test_related_caps_at_store_size() {
        let store = InMemoryFormulaStore::from_entries(vec![FormulaEntry::new("A", "a + b", "")]);
        assert_eq!(store.related("anything", 5).len(), 1);
        assert!(store.related("anything", 0).is_empty());
    }

    #[tokio::test]
    async fn test_load_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("formulas.json");
        std::fs::write(
            &path,
            r#"[{"formula_name": "Quick Ratio", "formula": "(cash + receivables) / current_liabilities"}]"#,
        )
        .unwrap();

        let store = InMemoryFormulaStore::from_json_file(&path).await.unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.related("quick", 1)[0].meaning, "");
    }
}
