//! Concept-map extraction from free-form model output.
//!
//! Models often wrap JSON in prose or markdown fences. [`parse_concept_map`]
//! scrapes the outermost `{...}` span and decodes it; anything that does not
//! decode degrades to an empty map instead of an error.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};

/// First `{` through last `}`, across lines.
static JSON_OBJECT: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"(?s)\{.*\}").ok());

/// A concept in the map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConceptNode {
    /// Node id, referenced by links.
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// `main`, `sub` or `detail`.
    #[serde(default)]
    pub category: String,
}

/// A prerequisite relationship between two concepts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConceptLink {
    /// Prerequisite node id.
    #[serde(deserialize_with = "string_or_number")]
    pub source: String,
    /// Dependent node id.
    #[serde(deserialize_with = "string_or_number")]
    pub target: String,
    /// `requires`, `leads-to` or `part-of`.
    #[serde(default)]
    pub relationship: String,
}

/// Concepts and their relationships.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConceptMap {
    /// Concepts.
    #[serde(default)]
    pub nodes: Vec<ConceptNode>,
    /// Relationships.
    #[serde(default)]
    pub links: Vec<ConceptLink>,
}

/// Result of decoding model output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConceptMapOutcome {
    /// The output contained a decodable map.
    Parsed(ConceptMap),
    /// The output was unusable; carries the reason.
    Fallback(String),
}

impl ConceptMapOutcome {
    /// Returns `true` for [`ConceptMapOutcome::Fallback`].
    #[must_use]
    pub const fn is_fallback(&self) -> bool {
        matches!(self, Self::Fallback(_))
    }

    /// The decoded map, or an empty one.
    #[must_use]
    pub fn into_map(self) -> ConceptMap {
        match self {
            Self::Parsed(map) => map,
            Self::Fallback(_) => ConceptMap::default(),
        }
    }
}

/// Decodes a concept map out of model text.
#[must_use]
pub fn parse_concept_map(text: &str) -> ConceptMapOutcome {
    let Some(span) = JSON_OBJECT.as_ref().and_then(|re| re.find(text)) else {
        return ConceptMapOutcome::Fallback("no JSON object in model output".to_string());
    };

    match serde_json::from_str::<ConceptMap>(span.as_str()) {
        Ok(map) => ConceptMapOutcome::Parsed(map),
        Err(e) => ConceptMapOutcome::Fallback(format!("invalid concept map JSON: {e}")),
    }
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Id {
        Text(String),
        Number(serde_json::Number),
    }

    Ok(match Id::deserialize(deserializer)? {
        Id::Text(s) => s,
        Id::Number(n) => n.to_string(),
    })
}
