//! Parameter sets: scalar keys plus indexed category maps.

use super::catalog::{Category, Param};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// One layer of request parameters.
///
/// Serialized with configuration names:
///
/// ```toml
/// [params]
/// customer_id = "c-42"
///
/// [categories.ecommerce]
/// 4 = "checkout"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawParameterSet", into = "RawParameterSet")]
pub struct ParameterSet {
    params: BTreeMap<Param, String>,
    categories: BTreeMap<Category, BTreeMap<String, String>>,
}

impl ParameterSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty() && self.categories.values().all(|m| m.is_empty())
    }

    pub fn get(&self, param: Param) -> Option<&str> {
        self.params.get(&param).map(String::as_str)
    }

    pub fn contains(&self, param: Param) -> bool {
        self.params.contains_key(&param)
    }

    pub fn set(&mut self, param: Param, value: impl Into<String>) -> &mut Self {
        self.params.insert(param, value.into());
        self
    }

    /// Builder-style [`set`](Self::set)
    pub fn with(mut self, param: Param, value: impl Into<String>) -> Self {
        self.set(param, value);
        self
    }

    pub fn remove(&mut self, param: Param) -> Option<String> {
        self.params.remove(&param)
    }

    pub fn set_category(
        &mut self,
        category: Category,
        index: impl Into<String>,
        value: impl Into<String>,
    ) -> &mut Self {
        self.categories
            .entry(category)
            .or_default()
            .insert(index.into(), value.into());
        self
    }

    /// Builder-style [`set_category`](Self::set_category)
    pub fn with_category(
        mut self,
        category: Category,
        index: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.set_category(category, index, value);
        self
    }

    pub fn category(&self, category: Category) -> Option<&BTreeMap<String, String>> {
        self.categories.get(&category)
    }

    pub fn category_value(&self, category: Category, index: &str) -> Option<&str> {
        self.categories
            .get(&category)
            .and_then(|m| m.get(index))
            .map(String::as_str)
    }

    pub fn params(&self) -> impl Iterator<Item = (Param, &str)> {
        self.params.iter().map(|(k, v)| (*k, v.as_str()))
    }

    /// Overlay `other` on top of this set; its values win per key and per index.
    pub fn merge(&mut self, other: &ParameterSet) {
        for (param, value) in &other.params {
            self.params.insert(*param, value.clone());
        }
        for (category, values) in &other.categories {
            let target = self.categories.entry(*category).or_default();
            for (index, value) in values {
                target.insert(index.clone(), value.clone());
            }
        }
    }

    /// Resolve a mapped layer: every value names a fact in `facts`.
    ///
    /// Entries whose fact is missing are dropped.
    pub fn remap(&self, facts: &HashMap<String, String>) -> ParameterSet {
        let mut resolved = ParameterSet::new();
        for (param, source) in &self.params {
            if let Some(value) = facts.get(source) {
                resolved.set(*param, value.clone());
            }
        }
        for (category, values) in &self.categories {
            for (index, source) in values {
                if let Some(value) = facts.get(source) {
                    resolved.set_category(*category, index.clone(), value.clone());
                }
            }
        }
        resolved
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RawParameterSet {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    params: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    categories: BTreeMap<String, BTreeMap<String, String>>,
}

impl TryFrom<RawParameterSet> for ParameterSet {
    type Error = String;

    fn try_from(raw: RawParameterSet) -> Result<Self, Self::Error> {
        let mut set = ParameterSet::new();
        for (name, value) in raw.params {
            let param =
                Param::from_name(&name).ok_or_else(|| format!("unknown parameter `{}`", name))?;
            set.set(param, value);
        }
        for (name, values) in raw.categories {
            let category = Category::from_name(&name)
                .ok_or_else(|| format!("unknown parameter category `{}`", name))?;
            for (index, value) in values {
                set.set_category(category, index, value);
            }
        }
        Ok(set)
    }
}

impl From<ParameterSet> for RawParameterSet {
    fn from(set: ParameterSet) -> Self {
        RawParameterSet {
            params: set
                .params
                .into_iter()
                .map(|(k, v)| (k.name().to_string(), v))
                .collect(),
            categories: set
                .categories
                .into_iter()
                .filter(|(_, values)| !values.is_empty())
                .map(|(k, v)| (k.name().to_string(), v))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_overwrites_per_key_and_index() {
        let mut base = ParameterSet::new()
            .with(Param::CustomerId, "a")
            .with(Param::Currency, "EUR")
            .with_category(Category::Page, "1", "x")
            .with_category(Category::Page, "2", "y");
        let overlay = ParameterSet::new()
            .with(Param::CustomerId, "b")
            .with_category(Category::Page, "2", "z");

        base.merge(&overlay);

        assert_eq!(base.get(Param::CustomerId), Some("b"));
        assert_eq!(base.get(Param::Currency), Some("EUR"));
        assert_eq!(base.category_value(Category::Page, "1"), Some("x"));
        assert_eq!(base.category_value(Category::Page, "2"), Some("z"));
    }

    #[test]
    fn test_remap_drops_missing_facts() {
        let mapped = ParameterSet::new()
            .with(Param::CustomerId, "userKey")
            .with_category(Category::Session, "3", "appVersion")
            .with_category(Category::Session, "4", "missing");
        let facts = HashMap::from([
            ("userKey".to_string(), "u-1".to_string()),
            ("appVersion".to_string(), "2.1".to_string()),
        ]);

        let resolved = mapped.remap(&facts);

        assert_eq!(resolved.get(Param::CustomerId), Some("u-1"));
        assert_eq!(resolved.category_value(Category::Session, "3"), Some("2.1"));
        assert_eq!(resolved.category_value(Category::Session, "4"), None);
    }

    #[test]
    fn test_json_uses_configuration_names() {
        let set = ParameterSet::new()
            .with(Param::EverId, "6123")
            .with_category(Category::Ecommerce, "4", "checkout");

        let json = serde_json::to_string(&set).unwrap();
        assert!(json.contains("\"ever_id\""));
        assert!(json.contains("\"ecommerce\""));

        let parsed: ParameterSet = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, set);
    }

    #[test]
    fn test_unknown_category_rejected() {
        let err = serde_json::from_str::<ParameterSet>(r#"{"categories":{"bogus":{"1":"x"}}}"#)
            .unwrap_err();
        assert!(err.to_string().contains("bogus"));
    }
}
