use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::EngineResult;

/// Stand-in for the previous hop's answer inside chain question templates.
pub const PREV: &str = "{prev}";

/// Upper bound on generated Cartesian leaves.
pub const MAX_CARTESIAN_LEAVES: usize = 32;

/// Structural reading of a query.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryShape {
    /// Nothing to split
    Atomic,
    /// Nested relation hops (`the A of the B of X`)
    Chain(ChainShape),
    /// Independent dimensions (entities x axes x temporal anchors)
    Cartesian(CartesianShape),
}

/// Root of a relation chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChainRoot {
    /// `the <head> that <clause>`: resolved by its own question
    Clause { head: String, clause: String },
    /// A named entity used directly as the innermost subject
    Entity { name: String },
}

/// `What <verb> the <a_n> of ... the <a_1> of <root>?`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainShape {
    pub verb: String,
    pub root: ChainRoot,
    /// Innermost first
    pub attributes: Vec<String>,
}

impl ChainShape {
    /// Number of questions the full chain produces.
    pub fn len(&self) -> usize {
        self.attributes.len() + usize::from(matches!(self.root, ChainRoot::Clause { .. }))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Hop questions, innermost first, using at most `levels` hops.
    ///
    /// Every question after the first references the previous answer as
    /// [`PREV`]. When the chain is longer than `levels`, the outer hops are
    /// folded into the last question.
    pub fn questions(&self, levels: usize) -> Vec<String> {
        let levels = levels.max(1);
        let total = self.len();
        let kept = if total <= levels { total } else { levels - 1 };

        let mut out = Vec::with_capacity(kept + 1);
        let mut attrs = self.attributes.iter();
        let mut subject = match &self.root {
            ChainRoot::Clause { head, clause } if kept > 0 => {
                out.push(format!("Which {} {}?", head, clause));
                PREV.to_string()
            }
            ChainRoot::Clause { head, clause } => format!("the {} that {}", head, clause),
            ChainRoot::Entity { name } => name.clone(),
        };

        while out.len() < kept {
            match attrs.next() {
                Some(attr) => {
                    out.push(format!("What {} the {} of {}?", self.verb, attr, subject));
                    subject = PREV.to_string();
                }
                None => break,
            }
        }

        let rest: Vec<&String> = attrs.collect();
        if !rest.is_empty() {
            let mut phrase = subject;
            for attr in rest {
                phrase = format!("the {} of {}", attr, phrase);
            }
            out.push(format!("What {} {}?", self.verb, phrase));
        }
        out
    }
}

/// Independent query dimensions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CartesianShape {
    pub verb: String,
    pub axes: Vec<String>,
    pub entities: Vec<String>,
    pub temporal_anchors: Vec<String>,
}

impl CartesianShape {
    /// One question per (entity, axis, anchor), entity-major.
    pub fn leaves(&self) -> Vec<String> {
        let mut out = Vec::new();
        for entity in &self.entities {
            for axis in &self.axes {
                if self.temporal_anchors.is_empty() {
                    out.push(format!("What {} the {} of {}?", self.verb, axis, entity));
                } else {
                    for year in &self.temporal_anchors {
                        out.push(format!(
                            "What {} the {} of {} in {}?",
                            self.verb, axis, entity, year
                        ));
                    }
                }
            }
        }
        out
    }

    fn leaf_count(&self) -> usize {
        self.entities.len() * self.axes.len() * self.temporal_anchors.len().max(1)
    }
}

/// Regex-driven query shape detection.
pub struct QueryAnalyzer {
    interrogative: Regex,
    relative: Regex,
    of_split: Regex,
    years: Regex,
    year_tail: Regex,
    compare: Regex,
    list_question: Regex,
    list_sep: Regex,
}

impl QueryAnalyzer {
    pub fn new() -> EngineResult<Self> {
        Ok(Self {
            interrogative: Regex::new(
                r"(?i)^\s*(?:what|which|who)\s+(is|are|was|were)\s+(?:the\s+)?(.+?)\s*\??\s*$",
            )?,
            relative: Regex::new(r"(?i)\s+(?:that|which|who)\s+")?,
            of_split: Regex::new(r"(?i)\s+of\s+")?,
            years: Regex::new(r"\b(1[5-9]\d{2}|20\d{2})\b")?,
            year_tail: Regex::new(
                r"(?i)[\s,]*(?:\b(?:in|during|for|between|from|across|over)\s+)?(?:the\s+)?(?:years?\s+)?\d{4}(?:\s*(?:,|and|or|to|vs\.?|versus|-)\s*\d{4})*\s*\??\s*$",
            )?,
            compare: Regex::new(
                r"(?i)^\s*(?:compare|contrast)\s+(?:the\s+)?(.+?)\s+(?:of|for|between|across)\s+(.+?)\s*\??\s*$",
            )?,
            list_question: Regex::new(
                r"(?i)^\s*(?:what|how)\s+(is|are|was|were)\s+(?:the\s+)?(.+?)\s+(?:of|for)\s+(.+?)\s*\??\s*$",
            )?,
            list_sep: Regex::new(
                r"(?i)\s*,\s*(?:and\s+|or\s+)?|\s+and\s+|\s+or\s+|\s+vs\.?\s+|\s+versus\s+",
            )?,
        })
    }

    /// Classify a query. Cartesian structure wins over chains.
    pub fn analyze(&self, text: &str) -> QueryShape {
        if let Some(shape) = self.cartesian(text) {
            return QueryShape::Cartesian(shape);
        }
        match self.chain(text) {
            Some(chain) => QueryShape::Chain(chain),
            None => QueryShape::Atomic,
        }
    }

    /// Relation-chain reading only; `None` unless it yields two or more hops.
    pub fn chain(&self, text: &str) -> Option<ChainShape> {
        let caps = self.interrogative.captures(text)?;
        let verb = caps.get(1)?.as_str().to_lowercase();
        let body = caps.get(2)?.as_str();

        // Only split the part before a relative clause.
        let (head_part, clause_part) = match self.relative.find(body) {
            Some(m) => (&body[..m.start()], Some(&body[m.end()..])),
            None => (body, None),
        };

        let mut parts: Vec<String> = self
            .of_split
            .split(head_part)
            .map(|p| strip_article(p).to_string())
            .collect();
        if parts.iter().any(|p| p.is_empty()) {
            return None;
        }

        let innermost = parts.pop()?;
        let root = match clause_part {
            Some(clause) if !clause.trim().is_empty() => ChainRoot::Clause {
                head: innermost,
                clause: clause.trim().to_string(),
            },
            _ => ChainRoot::Entity { name: innermost },
        };

        parts.reverse();
        let shape = ChainShape {
            verb,
            root,
            attributes: parts,
        };
        (shape.len() >= 2).then_some(shape)
    }

    fn cartesian(&self, text: &str) -> Option<CartesianShape> {
        let mut anchors: Vec<String> = Vec::new();
        for m in self.years.find_iter(text) {
            if !anchors.iter().any(|a| a == m.as_str()) {
                anchors.push(m.as_str().to_string());
            }
        }

        let stripped = if anchors.len() >= 2 {
            self.year_tail.replace(text, "").into_owned()
        } else {
            anchors.clear();
            text.to_string()
        };

        let (verb, axes, entities) = if let Some(caps) = self.compare.captures(&stripped) {
            let verb = if anchors.is_empty() { "is" } else { "was" };
            (verb.to_string(), caps.get(1)?.as_str(), caps.get(2)?.as_str())
        } else if let Some(caps) = self.list_question.captures(&stripped) {
            (
                caps.get(1)?.as_str().to_lowercase(),
                caps.get(2)?.as_str(),
                caps.get(3)?.as_str(),
            )
        } else {
            return None;
        };

        let axes = self.split_list(axes);
        let entities = self.split_list(entities);
        if axes.is_empty() || entities.is_empty() {
            return None;
        }
        // Relation hops inside a dimension belong to the chain reading.
        if axes.iter().any(|a| self.of_split.is_match(a)) {
            return None;
        }

        let shape = CartesianShape {
            verb,
            axes,
            entities,
            temporal_anchors: anchors,
        };
        let count = shape.leaf_count();
        (count >= 2 && count <= MAX_CARTESIAN_LEAVES).then_some(shape)
    }

    fn split_list(&self, segment: &str) -> Vec<String> {
        let segment = segment.trim();
        let segment = segment
            .strip_prefix("both ")
            .or_else(|| segment.strip_prefix("Both "))
            .unwrap_or(segment);
        // A relative clause may contain its own conjunctions.
        if self.relative.is_match(segment) {
            return vec![strip_article(segment).to_string()];
        }
        self.list_sep
            .split(segment)
            .map(strip_article)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect()
    }
}

fn strip_article(s: &str) -> &str {
    let s = s.trim();
    for article in ["the ", "The "] {
        if let Some(rest) = s.strip_prefix(article) {
            return rest.trim();
        }
    }
    s
}
