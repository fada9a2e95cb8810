//! Label selectors derived from target controllers

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;

use crate::error::{Error, Result};

/// Pod labels
pub type Labels = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum Requirement {
    Equals(String, String),
    NotEquals(String, String),
    In(String, BTreeSet<String>),
    NotIn(String, BTreeSet<String>),
    Exists(String),
    DoesNotExist(String),
}

impl Requirement {
    fn key(&self) -> &str {
        match self {
            Requirement::Equals(k, _)
            | Requirement::NotEquals(k, _)
            | Requirement::In(k, _)
            | Requirement::NotIn(k, _)
            | Requirement::Exists(k)
            | Requirement::DoesNotExist(k) => k,
        }
    }

    fn matches(&self, labels: &Labels) -> bool {
        match self {
            Requirement::Equals(k, v) => labels.get(k) == Some(v),
            Requirement::NotEquals(k, v) => labels.get(k) != Some(v),
            Requirement::In(k, values) => labels.get(k).map_or(false, |v| values.contains(v)),
            Requirement::NotIn(k, values) => labels.get(k).map_or(true, |v| !values.contains(v)),
            Requirement::Exists(k) => labels.contains_key(k),
            Requirement::DoesNotExist(k) => !labels.contains_key(k),
        }
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let join = |values: &BTreeSet<String>| values.iter().cloned().collect::<Vec<_>>().join(",");
        match self {
            Requirement::Equals(k, v) => write!(f, "{}={}", k, v),
            Requirement::NotEquals(k, v) => write!(f, "{}!={}", k, v),
            Requirement::In(k, values) => write!(f, "{} in ({})", k, join(values)),
            Requirement::NotIn(k, values) => write!(f, "{} notin ({})", k, join(values)),
            Requirement::Exists(k) => write!(f, "{}", k),
            Requirement::DoesNotExist(k) => write!(f, "!{}", k),
        }
    }
}

/// Parsed label selector
///
/// `Selector::nothing()` matches no pods and is used for MPAs whose target
/// could not be resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selector {
    requirements: Vec<Requirement>,
    nothing: bool,
}

impl Selector {
    pub fn everything() -> Self {
        Self {
            requirements: Vec::new(),
            nothing: false,
        }
    }

    pub fn nothing() -> Self {
        Self {
            requirements: Vec::new(),
            nothing: true,
        }
    }

    pub fn is_nothing(&self) -> bool {
        self.nothing
    }

    pub fn is_everything(&self) -> bool {
        !self.nothing && self.requirements.is_empty()
    }

    pub fn matches(&self, labels: &Labels) -> bool {
        !self.nothing && self.requirements.iter().all(|r| r.matches(labels))
    }

    fn from_requirements(mut requirements: Vec<Requirement>) -> Self {
        requirements.sort_by(|a, b| a.key().cmp(b.key()).then_with(|| a.cmp(b)));
        requirements.dedup();
        Self {
            requirements,
            nothing: false,
        }
    }

    /// Converts a structured selector as found on workload controllers
    pub fn from_label_selector(selector: &LabelSelector) -> Result<Self> {
        let mut requirements = Vec::new();
        for (k, v) in selector.match_labels.iter().flatten() {
            requirements.push(Requirement::Equals(k.clone(), v.clone()));
        }
        for expr in selector.match_expressions.iter().flatten() {
            let values: BTreeSet<String> = expr.values.iter().flatten().cloned().collect();
            let requirement = match expr.operator.as_str() {
                "In" if !values.is_empty() => Requirement::In(expr.key.clone(), values),
                "NotIn" if !values.is_empty() => Requirement::NotIn(expr.key.clone(), values),
                "Exists" if values.is_empty() => Requirement::Exists(expr.key.clone()),
                "DoesNotExist" if values.is_empty() => Requirement::DoesNotExist(expr.key.clone()),
                op => {
                    return Err(Error::validation(format!(
                        "invalid label selector operator {:?} for key {:?}",
                        op, expr.key
                    )))
                }
            };
            requirements.push(requirement);
        }
        Ok(Self::from_requirements(requirements))
    }

    /// Parses the string form used by the scale sub-resource's `status.selector`
    pub fn parse(input: &str) -> Result<Self> {
        let mut requirements = Vec::new();
        for term in split_terms(input)? {
            requirements.push(parse_term(term)?);
        }
        Ok(Self::from_requirements(requirements))
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.nothing {
            return write!(f, "<none>");
        }
        let terms: Vec<String> = self.requirements.iter().map(|r| r.to_string()).collect();
        write!(f, "{}", terms.join(","))
    }
}

fn split_terms(input: &str) -> Result<Vec<&str>> {
    let mut terms = Vec::new();
    let mut depth = 0i32;
    let mut start = 0;
    for (i, c) in input.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth -= 1,
            ',' if depth == 0 => {
                terms.push(&input[start..i]);
                start = i + 1;
            }
            _ => {}
        }
        if depth < 0 {
            return Err(Error::validation(format!("unbalanced selector {:?}", input)));
        }
    }
    if depth != 0 {
        return Err(Error::validation(format!("unbalanced selector {:?}", input)));
    }
    terms.push(&input[start..]);
    Ok(terms
        .into_iter()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .collect())
}

fn parse_set(key: &str, rest: &str) -> Result<BTreeSet<String>> {
    let rest = rest.trim();
    let inner = rest
        .strip_prefix('(')
        .and_then(|r| r.strip_suffix(')'))
        .ok_or_else(|| Error::validation(format!("expected value set for key {:?}", key)))?;
    let values: BTreeSet<String> = inner
        .split(',')
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .collect();
    if values.is_empty() {
        return Err(Error::validation(format!("empty value set for key {:?}", key)));
    }
    Ok(values)
}

fn parse_term(term: &str) -> Result<Requirement> {
    if let Some(key) = term.strip_prefix('!') {
        return Ok(Requirement::DoesNotExist(valid_key(key.trim())?));
    }
    if let Some((key, value)) = term.split_once("!=") {
        return Ok(Requirement::NotEquals(
            valid_key(key.trim())?,
            value.trim().to_string(),
        ));
    }
    if let Some((key, value)) = term.split_once("==").or_else(|| term.split_once('=')) {
        return Ok(Requirement::Equals(
            valid_key(key.trim())?,
            value.trim().to_string(),
        ));
    }
    if let Some((key, rest)) = term.split_once(" notin ") {
        let key = valid_key(key.trim())?;
        let values = parse_set(&key, rest)?;
        return Ok(Requirement::NotIn(key, values));
    }
    if let Some((key, rest)) = term.split_once(" in ") {
        let key = valid_key(key.trim())?;
        let values = parse_set(&key, rest)?;
        return Ok(Requirement::In(key, values));
    }
    Ok(Requirement::Exists(valid_key(term)?))
}

fn valid_key(key: &str) -> Result<String> {
    if key.is_empty() || key.contains(char::is_whitespace) {
        return Err(Error::validation(format!("invalid label key {:?}", key)));
    }
    Ok(key.to_string())
}
