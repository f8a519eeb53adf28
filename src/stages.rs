//! Declarative stage dictionary.
//!
//! A dictionary maps stage names to their storage value, keyboard shortcut,
//! display order and colour. It is validated once at load time so that the
//! rest of the crate can rely on values, shortcuts and display orders being
//! unique.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SleepError};

pub const DEFAULT_COLOR: &str = "black";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageInfo {
    pub name: String,
    pub color: String,
    pub shortcut: String,
    pub value: i32,
    pub display_order: i32,
}

/// Entry as written in a dictionary file; mandatory keys are checked later.
#[derive(Debug, Clone, Default, Deserialize)]
struct RawStage {
    color: Option<String>,
    shortcut: Option<String>,
    value: Option<i32>,
    display_order: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageDict {
    states: Vec<StageInfo>,
}

impl Default for StageDict {
    fn default() -> Self {
        let stage = |name: &str, color: &str, shortcut: &str, value, display_order| StageInfo {
            name: name.to_owned(),
            color: color.to_owned(),
            shortcut: shortcut.to_owned(),
            value,
            display_order,
        };
        Self {
            states: vec![
                stage("Art", "#8bbf56", "a", -1, 0),
                stage("Wake", "#56bf8b", "w", 0, 1),
                stage("N1", "#aabcce", "1", 1, 3),
                stage("N2", "#405c79", "2", 2, 4),
                stage("N3", "#0b1c2c", "3", 3, 5),
                stage("REM", "#bf5656", "r", 4, 2),
            ],
        }
    }
}

impl StageDict {
    /// Validates and builds a dictionary; every violation is reported.
    pub fn new(states: Vec<StageInfo>) -> Result<Self> {
        let mut errors = Vec::new();
        if states.is_empty() {
            errors.push("stage dictionary is empty".to_owned());
        }
        let mut names = HashSet::new();
        let mut values = HashMap::new();
        let mut shortcuts = HashMap::new();
        let mut orders = HashMap::new();
        for state in &states {
            if state.name.trim().is_empty() {
                errors.push("stage with an empty name".to_owned());
            }
            if !names.insert(state.name.as_str()) {
                errors.push(format!("duplicate stage name '{}'", state.name));
            }
            if state.shortcut.is_empty() {
                errors.push(format!("{}: empty 'shortcut'", state.name));
            }
            if let Some(other) = values.insert(state.value, state.name.as_str()) {
                errors.push(format!(
                    "'value' {} shared by {} and {}",
                    state.value, other, state.name
                ));
            }
            if let Some(other) = shortcuts.insert(state.shortcut.as_str(), state.name.as_str()) {
                errors.push(format!(
                    "'shortcut' '{}' shared by {} and {}",
                    state.shortcut, other, state.name
                ));
            }
            if let Some(other) = orders.insert(state.display_order, state.name.as_str()) {
                errors.push(format!(
                    "'display_order' {} shared by {} and {}",
                    state.display_order, other, state.name
                ));
            }
        }
        if errors.is_empty() {
            Ok(Self { states })
        } else {
            Err(SleepError::StateDictInvalid(errors))
        }
    }

    /// Parses `{"Wake": {"value": 0, "shortcut": "w", "display_order": 1}, ...}`.
    pub fn from_json_str(text: &str) -> Result<Self> {
        let raw: BTreeMap<String, RawStage> = serde_json::from_str(text)?;
        let mut errors = Vec::new();
        let mut states = Vec::with_capacity(raw.len());
        for (name, entry) in raw {
            let mut missing = |key: &str| errors.push(format!("{name}: missing key '{key}'"));
            let (Some(shortcut), Some(value), Some(display_order)) =
                (entry.shortcut.clone(), entry.value, entry.display_order)
            else {
                if entry.shortcut.is_none() {
                    missing("shortcut");
                }
                if entry.value.is_none() {
                    missing("value");
                }
                if entry.display_order.is_none() {
                    missing("display_order");
                }
                continue;
            };
            states.push(StageInfo {
                color: entry.color.unwrap_or_else(|| DEFAULT_COLOR.to_owned()),
                name,
                shortcut,
                value,
                display_order,
            });
        }
        if !errors.is_empty() {
            return Err(SleepError::StateDictInvalid(errors));
        }
        states.sort_by_key(|s| s.value);
        Self::new(states)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_json_str(&std::fs::read_to_string(path)?)
    }

    pub fn to_json_string(&self) -> Result<String> {
        let map: BTreeMap<&str, serde_json::Value> = self
            .states
            .iter()
            .map(|s| {
                (
                    s.name.as_str(),
                    serde_json::json!({
                        "color": s.color,
                        "shortcut": s.shortcut,
                        "value": s.value,
                        "display_order": s.display_order,
                    }),
                )
            })
            .collect();
        Ok(serde_json::to_string_pretty(&map)?)
    }

    pub fn states(&self) -> &[StageInfo] {
        &self.states
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.states.iter().map(|s| s.name.as_str()).collect()
    }

    pub fn values(&self) -> Vec<i32> {
        self.states.iter().map(|s| s.value).collect()
    }

    pub fn get(&self, name: &str) -> Option<&StageInfo> {
        self.states.iter().find(|s| s.name.eq_ignore_ascii_case(name))
    }

    pub fn value_of(&self, name: &str) -> Option<i32> {
        self.get(name).map(|s| s.value)
    }

    pub fn by_value(&self, value: i32) -> Option<&StageInfo> {
        self.states.iter().find(|s| s.value == value)
    }

    pub fn name_of(&self, value: i32) -> Option<&str> {
        self.by_value(value).map(|s| s.name.as_str())
    }

    pub fn contains_value(&self, value: i32) -> bool {
        self.by_value(value).is_some()
    }

    pub fn by_shortcut(&self, shortcut: &str) -> Option<&StageInfo> {
        self.states.iter().find(|s| s.shortcut == shortcut)
    }

    /// Whether this is the fixed six-stage layout Elan files can carry.
    pub fn is_default(&self) -> bool {
        let default = Self::default();
        default
            .states
            .iter()
            .all(|d| self.value_of(&d.name) == Some(d.value))
            && self.len() == default.len()
    }

    /// Stage names ordered by `display_order`.
    pub fn href(&self) -> Vec<String> {
        let mut states: Vec<&StageInfo> = self.states.iter().collect();
        states.sort_by_key(|s| s.display_order);
        states.into_iter().map(|s| s.name.clone()).collect()
    }

    /// Returns a copy whose display orders follow `href`.
    pub fn with_href(&self, href: &[String]) -> Result<Self> {
        validate_href(href, self)?;
        let mut states = self.states.clone();
        for state in &mut states {
            state.display_order = href
                .iter()
                .position(|h| h.eq_ignore_ascii_case(&state.name))
                .map(|p| p as i32)
                .unwrap_or(state.display_order);
        }
        Self::new(states)
    }
}

/// `href` must name every stage of `stages` exactly once.
pub fn validate_href(href: &[String], stages: &StageDict) -> Result<()> {
    let mut errors = Vec::new();
    let mut seen = HashSet::new();
    for name in href {
        match stages.get(name) {
            Some(state) => {
                if !seen.insert(state.name.as_str()) {
                    errors.push(format!("href names '{name}' twice"));
                }
            }
            None => errors.push(format!("href names unknown stage '{name}'")),
        }
    }
    for name in stages.names() {
        if !seen.contains(name) {
            errors.push(format!("href is missing stage '{name}'"));
        }
    }
    if errors.is_empty() {
        Ok(())
    } else {
        Err(SleepError::StateDictInvalid(errors))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_dictionary_is_valid() {
        let d = StageDict::default();
        assert!(StageDict::new(d.states().to_vec()).is_ok());
        assert!(d.is_default());
        assert_eq!(d.value_of("rem"), Some(4));
        assert_eq!(d.name_of(-1), Some("Art"));
        assert_eq!(d.href(), vec!["Art", "Wake", "REM", "N1", "N2", "N3"]);
    }

    #[test]
    fn json_dictionary_defaults_color_to_black() {
        let d = StageDict::from_json_str(
            r#"{"Awake": {"value": 0, "shortcut": "w", "display_order": 0},
                "Sleep": {"value": 1, "shortcut": "s", "display_order": 1, "color": "blue"}}"#,
        )
        .unwrap();
        assert_eq!(d.get("Awake").unwrap().color, DEFAULT_COLOR);
        assert_eq!(d.get("Sleep").unwrap().color, "blue");
        assert!(!d.is_default());
        let again = StageDict::from_json_str(&d.to_json_string().unwrap()).unwrap();
        assert_eq!(again, d);
    }

    #[test]
    fn each_violation_is_named() {
        let err = StageDict::from_json_str(
            r#"{"A": {"value": 0, "display_order": 0},
                "B": {"shortcut": "b"}}"#,
        )
        .unwrap_err();
        let SleepError::StateDictInvalid(errors) = err else {
            panic!("wrong error kind");
        };
        assert!(errors.contains(&"A: missing key 'shortcut'".to_owned()));
        assert!(errors.contains(&"B: missing key 'value'".to_owned()));
        assert!(errors.contains(&"B: missing key 'display_order'".to_owned()));
    }

    #[test]
    fn duplicate_keys_are_rejected() {
        let err = StageDict::from_json_str(
            r#"{"A": {"value": 0, "shortcut": "x", "display_order": 0},
                "B": {"value": 0, "shortcut": "x", "display_order": 0}}"#,
        )
        .unwrap_err();
        let SleepError::StateDictInvalid(errors) = err else {
            panic!("wrong error kind");
        };
        assert_eq!(errors.len(), 3, "{errors:?}");
        assert!(StageDict::from_json_str("{}").is_err());
    }

    #[test]
    fn href_must_be_a_permutation() {
        let d = StageDict::default();
        let ok: Vec<String> = ["wake", "rem", "n1", "n2", "n3", "art"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert!(validate_href(&ok, &d).is_ok());
        let reordered = d.with_href(&ok).unwrap();
        assert_eq!(reordered.href(), vec!["Wake", "REM", "N1", "N2", "N3", "Art"]);

        let missing: Vec<String> = ok[..5].to_vec();
        let SleepError::StateDictInvalid(errors) = validate_href(&missing, &d).unwrap_err() else {
            panic!("wrong error kind");
        };
        assert_eq!(errors, vec!["href is missing stage 'Art'"]);
    }
}
