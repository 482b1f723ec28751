//! Intent and entity classification for free-form requests.
//!
//! Classification runs a deterministic pass first: every intent pattern
//! carries trigger phrases, and the first pattern (in table order) whose
//! triggers appear in the lower-cased text wins with that pattern's fixed
//! confidence. When nothing clears the minimum confidence, an optional
//! `TextUnderstanding` backend is asked instead and its JSON answer parsed
//! into the same shape.
//!
//! Entities are extracted from the same text through a separate table and
//! do not depend on which intent matched.

use crate::core::task::Requirement;
use crate::error::{Error, Result};
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Default minimum confidence an intent needs to be accepted.
pub const DEFAULT_MIN_CONFIDENCE: f64 = 0.7;

fn default_pattern_confidence() -> f64 {
    0.9
}

/// External text understanding: request text in, raw JSON out.
#[async_trait]
pub trait TextUnderstanding: Send + Sync {
    async fn understand(&self, text: &str) -> Result<String>;
}

/// One stage of a multi-part intent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagePattern {
    pub name: String,
    pub competencies: BTreeMap<String, f64>,
    /// The stage needs the previous stage's output.
    #[serde(default)]
    pub consumes_previous: bool,
}

impl StagePattern {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            competencies: BTreeMap::new(),
            consumes_previous: false,
        }
    }

    pub fn routes_to(mut self, competency: &str, weight: f64) -> Self {
        self.competencies.insert(competency.to_string(), weight);
        self
    }

    pub fn consuming_previous(mut self) -> Self {
        self.consumes_previous = true;
        self
    }
}

/// A known intent: trigger phrases and where the work routes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentPattern {
    pub name: String,
    pub triggers: Vec<String>,
    #[serde(default = "default_pattern_confidence")]
    pub confidence: f64,
    /// Required competencies for a single-step intent.
    #[serde(default)]
    pub competencies: BTreeMap<String, f64>,
    /// Ordered parts for a multi-step intent.
    #[serde(default)]
    pub stages: Vec<StagePattern>,
    /// Competencies of a lead that supervises the stages.
    #[serde(default)]
    pub supervisor: Option<BTreeMap<String, f64>>,
}

impl IntentPattern {
    pub fn new(name: &str, confidence: f64) -> Self {
        Self {
            name: name.to_string(),
            triggers: Vec::new(),
            confidence,
            competencies: BTreeMap::new(),
            stages: Vec::new(),
            supervisor: None,
        }
    }

    pub fn triggered_by(mut self, phrases: &[&str]) -> Self {
        self.triggers.extend(phrases.iter().map(|p| p.to_string()));
        self
    }

    pub fn routes_to(mut self, competency: &str, weight: f64) -> Self {
        self.competencies.insert(competency.to_string(), weight);
        self
    }

    pub fn with_stage(mut self, stage: StagePattern) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn supervised_by(mut self, competency: &str, weight: f64) -> Self {
        self.supervisor
            .get_or_insert_with(BTreeMap::new)
            .insert(competency.to_string(), weight);
        self
    }

    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Validation("intent pattern has an empty name".to_string()));
        }
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(Error::Validation(format!(
                "intent '{}' has confidence {} outside [0, 1]",
                self.name, self.confidence
            )));
        }
        if self.competencies.is_empty() && self.stages.is_empty() {
            return Err(Error::Validation(format!(
                "intent '{}' routes to no competencies",
                self.name
            )));
        }
        validate_weights(&self.name, &self.competencies)?;
        for (i, stage) in self.stages.iter().enumerate() {
            if stage.competencies.is_empty() {
                return Err(Error::Validation(format!(
                    "stage '{}' of intent '{}' routes to no competencies",
                    stage.name, self.name
                )));
            }
            if i == 0 && stage.consumes_previous {
                return Err(Error::Validation(format!(
                    "first stage of intent '{}' has no previous stage to consume",
                    self.name
                )));
            }
            validate_weights(&stage.name, &stage.competencies)?;
        }
        if let Some(supervisor) = &self.supervisor {
            if self.stages.is_empty() {
                return Err(Error::Validation(format!(
                    "intent '{}' has a supervisor but no stages",
                    self.name
                )));
            }
            validate_weights(&self.name, supervisor)?;
        }
        Ok(())
    }
}

fn validate_weights(owner: &str, weights: &BTreeMap<String, f64>) -> Result<()> {
    match weights.iter().find(|(_, w)| !w.is_finite() || **w < 0.0) {
        Some((name, w)) => Err(Error::Validation(format!(
            "'{}' has invalid weight {} for '{}'",
            owner, w, name
        ))),
        None => Ok(()),
    }
}

fn requirements(weights: &BTreeMap<String, f64>) -> Vec<Requirement> {
    weights.iter().map(|(name, w)| Requirement::new(name, *w)).collect()
}

/// A known entity value and the phrases that reveal it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityPattern {
    pub entity_type: String,
    pub value: String,
    pub triggers: Vec<String>,
    #[serde(default = "default_pattern_confidence")]
    pub confidence: f64,
}

impl EntityPattern {
    pub fn new(entity_type: &str, value: &str, triggers: &[&str], confidence: f64) -> Self {
        Self {
            entity_type: entity_type.to_string(),
            value: value.to_string(),
            triggers: triggers.iter().map(|t| t.to_string()).collect(),
            confidence,
        }
    }
}

/// A classified intent with its routing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Intent {
    pub name: String,
    pub confidence: f64,
    pub required: Vec<Requirement>,
    pub stages: Vec<StagePattern>,
    pub supervisor: Option<Vec<Requirement>>,
}

/// An extracted entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    #[serde(rename = "type", alias = "entity_type")]
    pub entity_type: String,
    pub value: String,
    pub confidence: f64,
}

/// Which path produced a classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassificationSource {
    Pattern,
    Understanding,
}

/// Output of `IntentClassifier::classify`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Classification {
    pub intent: Intent,
    pub entities: Vec<Entity>,
    pub source: ClassificationSource,
}

impl Classification {
    pub fn entity(&self, entity_type: &str) -> Option<&Entity> {
        self.entities.iter().find(|e| e.entity_type == entity_type)
    }
}

struct CompiledIntent {
    pattern: IntentPattern,
    matcher: Regex,
}

struct CompiledEntity {
    pattern: EntityPattern,
    matcher: Regex,
}

/// Build a case-folded matcher that only fires on whole words.
fn trigger_regex(owner: &str, triggers: &[String]) -> Result<Regex> {
    let alternatives: Vec<String> = triggers
        .iter()
        .map(|t| t.trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .map(|t| {
            let head = if t.starts_with(|c: char| c.is_alphanumeric()) { r"\b" } else { "" };
            let tail = if t.ends_with(|c: char| c.is_alphanumeric()) { r"\b" } else { "" };
            format!("{}{}{}", head, regex::escape(&t), tail)
        })
        .collect();
    if alternatives.is_empty() {
        return Err(Error::Validation(format!("'{}' has no trigger phrases", owner)));
    }
    Regex::new(&format!("(?:{})", alternatives.join("|")))
        .map_err(|e| Error::Validation(format!("invalid triggers for '{}': {}", owner, e)))
}

/// Two-path intent classifier.
///
/// # Example
///
/// ```
/// use swarm_router::orchestration::classifier::{builtin_entities, builtin_intents, IntentClassifier};
///
/// let classifier = IntentClassifier::new(0.7, builtin_intents(), builtin_entities()).unwrap();
/// let result = classifier.classify_local("write unit tests for the billing module").unwrap();
/// assert_eq!(result.intent.name, "write-tests");
/// ```
pub struct IntentClassifier {
    intents: Vec<CompiledIntent>,
    entities: Vec<CompiledEntity>,
    min_confidence: f64,
    understanding: Option<Arc<dyn TextUnderstanding>>,
}

impl IntentClassifier {
    /// Compile the pattern tables. Earlier intents take precedence.
    pub fn new(
        min_confidence: f64,
        intents: Vec<IntentPattern>,
        entities: Vec<EntityPattern>,
    ) -> Result<Self> {
        let intents = intents
            .into_iter()
            .map(|pattern| {
                pattern.validate()?;
                let matcher = trigger_regex(&pattern.name, &pattern.triggers)?;
                Ok(CompiledIntent { pattern, matcher })
            })
            .collect::<Result<Vec<_>>>()?;
        let entities = entities
            .into_iter()
            .map(|pattern| {
                let matcher = trigger_regex(&pattern.value, &pattern.triggers)?;
                Ok(CompiledEntity { pattern, matcher })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            intents,
            entities,
            min_confidence,
            understanding: None,
        })
    }

    /// Fall back to `understanding` when no pattern clears the minimum.
    pub fn with_understanding(mut self, understanding: Arc<dyn TextUnderstanding>) -> Self {
        self.understanding = Some(understanding);
        self
    }

    pub fn min_confidence(&self) -> f64 {
        self.min_confidence
    }

    pub fn intent_names(&self) -> Vec<&str> {
        self.intents.iter().map(|i| i.pattern.name.as_str()).collect()
    }

    /// Classify `text`, using the external backend if the patterns fall short.
    ///
    /// # Errors
    /// `LowConfidence` if no intent clears the minimum and there is no
    /// backend (or the backend's answer is below the minimum);
    /// `Classification` if the backend fails or its answer cannot be parsed.
    pub async fn classify(&self, text: &str) -> Result<Classification> {
        let lowered = text.to_lowercase();
        let best_local = match self.match_intent(&lowered) {
            Ok(intent) => {
                info!(intent = %intent.name, confidence = intent.confidence, "classified by pattern");
                return Ok(Classification {
                    intent,
                    entities: self.extract_entities(&lowered),
                    source: ClassificationSource::Pattern,
                });
            }
            Err(best) => best,
        };

        let Some(understanding) = &self.understanding else {
            debug!(best = ?best_local, "no pattern matched and no fallback configured");
            return Err(Error::LowConfidence {
                min: self.min_confidence,
                best: best_local,
            });
        };

        debug!("no pattern matched, asking text understanding");
        let raw = understanding.understand(text).await.map_err(|e| match e {
            Error::Classification(_) => e,
            other => Error::Classification(other.to_string()),
        })?;
        let classification = self.parse_understanding(&raw, &lowered)?;
        if classification.intent.confidence < self.min_confidence {
            return Err(Error::LowConfidence {
                min: self.min_confidence,
                best: Some(classification.intent.name),
            });
        }
        info!(
            intent = %classification.intent.name,
            confidence = classification.intent.confidence,
            "classified by text understanding"
        );
        Ok(classification)
    }

    /// Deterministic path only.
    pub fn classify_local(&self, text: &str) -> Result<Classification> {
        let lowered = text.to_lowercase();
        match self.match_intent(&lowered) {
            Ok(intent) => Ok(Classification {
                intent,
                entities: self.extract_entities(&lowered),
                source: ClassificationSource::Pattern,
            }),
            Err(best) => Err(Error::LowConfidence {
                min: self.min_confidence,
                best,
            }),
        }
    }

    /// First matching pattern that clears the minimum, or the name of the
    /// best matching pattern that did not.
    fn match_intent(&self, lowered: &str) -> std::result::Result<Intent, Option<String>> {
        let mut best_below: Option<&IntentPattern> = None;
        for compiled in &self.intents {
            if !compiled.matcher.is_match(lowered) {
                continue;
            }
            let pattern = &compiled.pattern;
            if pattern.confidence >= self.min_confidence {
                return Ok(intent_from_pattern(pattern, pattern.confidence));
            }
            if best_below.map_or(true, |b| pattern.confidence > b.confidence) {
                best_below = Some(pattern);
            }
        }
        Err(best_below.map(|p| p.name.clone()))
    }

    /// Every entity whose triggers appear in the text, in table order.
    pub fn extract_entities(&self, lowered: &str) -> Vec<Entity> {
        self.entities
            .iter()
            .filter(|e| e.matcher.is_match(lowered))
            .map(|e| Entity {
                entity_type: e.pattern.entity_type.clone(),
                value: e.pattern.value.clone(),
                confidence: e.pattern.confidence,
            })
            .collect()
    }

    fn parse_understanding(&self, raw: &str, lowered: &str) -> Result<Classification> {
        let response = parse_raw_response(raw)?;
        let (name, confidence) = match response.intent {
            RawIntent::Name(name) => (name, response.confidence),
            RawIntent::Detailed { name, confidence } => (name, confidence.or(response.confidence)),
        };
        let confidence = confidence
            .ok_or_else(|| Error::Classification(format!("response for '{}' has no confidence", name)))?
            .clamp(0.0, 1.0);

        let intent = match self.intents.iter().find(|i| i.pattern.name == name) {
            Some(known) => intent_from_pattern(&known.pattern, confidence),
            None if !response.competencies.is_empty() => {
                validate_weights(&name, &response.competencies)?;
                Intent {
                    required: requirements(&response.competencies),
                    name,
                    confidence,
                    stages: Vec::new(),
                    supervisor: None,
                }
            }
            None => {
                return Err(Error::Classification(format!(
                    "intent '{}' has no competency routing",
                    name
                )))
            }
        };

        let mut entities: Vec<Entity> = response
            .entities
            .into_iter()
            .map(|e| Entity {
                confidence: e.confidence.unwrap_or(confidence).clamp(0.0, 1.0),
                entity_type: e.entity_type,
                value: e.value,
            })
            .collect();
        for local in self.extract_entities(lowered) {
            let seen = entities
                .iter()
                .any(|e| e.entity_type == local.entity_type && e.value == local.value);
            if !seen {
                entities.push(local);
            }
        }

        Ok(Classification {
            intent,
            entities,
            source: ClassificationSource::Understanding,
        })
    }
}

fn intent_from_pattern(pattern: &IntentPattern, confidence: f64) -> Intent {
    Intent {
        name: pattern.name.clone(),
        confidence,
        required: requirements(&pattern.competencies),
        stages: pattern.stages.clone(),
        supervisor: pattern.supervisor.as_ref().map(requirements),
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawIntent {
    Name(String),
    Detailed {
        name: String,
        #[serde(default)]
        confidence: Option<f64>,
    },
}

#[derive(Debug, Deserialize)]
struct RawEntity {
    #[serde(rename = "type", alias = "entity_type")]
    entity_type: String,
    value: String,
    #[serde(default)]
    confidence: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RawResponse {
    intent: RawIntent,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    entities: Vec<RawEntity>,
    #[serde(default)]
    competencies: BTreeMap<String, f64>,
}

/// Parse the JSON object in a backend response, tolerating surrounding prose.
fn parse_raw_response(raw: &str) -> Result<RawResponse> {
    let start = raw.find('{');
    let end = raw.rfind('}');
    let body = match (start, end) {
        (Some(s), Some(e)) if s < e => &raw[s..=e],
        _ => {
            return Err(Error::Classification(
                "text understanding returned no JSON object".to_string(),
            ))
        }
    };
    serde_json::from_str(body)
        .map_err(|e| Error::Classification(format!("unparseable understanding response: {}", e)))
}

/// Built-in intent table, most specific first.
pub fn builtin_intents() -> Vec<IntentPattern> {
    vec![
        IntentPattern::new("write-tests", 0.9)
            .triggered_by(&[
                "unit tests",
                "unit test",
                "write tests",
                "write a test",
                "add tests",
                "integration tests",
                "test coverage",
            ])
            .routes_to("testing", 1.0),
        IntentPattern::new("review-code", 0.85)
            .triggered_by(&["code review", "review the code", "review this", "review my", "pull request"])
            .routes_to("review", 1.0),
        IntentPattern::new("diagnose", 0.85)
            .triggered_by(&["debug", "fix the bug", "fix a bug", "stack trace", "crash", "root cause"])
            .routes_to("diagnostics", 1.0)
            .routes_to("coding", 0.5),
        IntentPattern::new("build-feature", 0.8)
            .triggered_by(&["new feature", "build a feature", "implement a feature", "from scratch"])
            .with_stage(StagePattern::new("specify").routes_to("specification", 1.0))
            .with_stage(StagePattern::new("plan").routes_to("planning", 1.0).consuming_previous())
            .with_stage(StagePattern::new("implement").routes_to("coding", 1.0).consuming_previous())
            .with_stage(StagePattern::new("test").routes_to("testing", 1.0).consuming_previous())
            .with_stage(StagePattern::new("review").routes_to("review", 1.0).consuming_previous()),
        IntentPattern::new("audit", 0.8)
            .triggered_by(&["audit", "security review", "health check"])
            .with_stage(StagePattern::new("security").routes_to("security", 1.0))
            .with_stage(StagePattern::new("performance").routes_to("performance", 1.0))
            .with_stage(StagePattern::new("dependencies").routes_to("dependencies", 1.0)),
        IntentPattern::new("coordinate", 0.8)
            .triggered_by(&["coordinate", "orchestrate", "full stack", "whole team"])
            .with_stage(StagePattern::new("backend").routes_to("coding", 1.0))
            .with_stage(StagePattern::new("frontend").routes_to("ui", 1.0))
            .with_stage(StagePattern::new("verify").routes_to("testing", 1.0))
            .supervised_by("coordination", 1.0),
        IntentPattern::new("deploy", 0.85)
            .triggered_by(&["deploy", "ci/cd", "continuous integration", "release pipeline"])
            .routes_to("devops", 1.0),
        IntentPattern::new("document", 0.8)
            .triggered_by(&["document", "documentation", "readme", "changelog", "api docs"])
            .routes_to("documentation", 1.0),
        IntentPattern::new("monitor", 0.8)
            .triggered_by(&["monitor", "monitoring", "alerting", "dashboard", "observability"])
            .routes_to("monitoring", 1.0),
        IntentPattern::new("implement", 0.75)
            .triggered_by(&["implement", "write code", "refactor", "add a function", "add a method"])
            .routes_to("coding", 1.0),
    ]
}

/// Built-in entity table.
pub fn builtin_entities() -> Vec<EntityPattern> {
    vec![
        EntityPattern::new("language", "rust", &["rust", "cargo"], 0.95),
        EntityPattern::new("language", "python", &["python", "pytest"], 0.95),
        EntityPattern::new("language", "typescript", &["typescript", "tsx"], 0.95),
        EntityPattern::new("language", "javascript", &["javascript", "node.js"], 0.9),
        EntityPattern::new("language", "go", &["golang"], 0.9),
        EntityPattern::new("artifact", "module", &["module", "package"], 0.8),
        EntityPattern::new("artifact", "function", &["function", "method"], 0.8),
        EntityPattern::new("artifact", "api", &["api", "endpoint"], 0.8),
        EntityPattern::new("artifact", "database", &["database", "schema", "migration"], 0.8),
        EntityPattern::new("environment", "production", &["production", "prod"], 0.85),
        EntityPattern::new("environment", "staging", &["staging"], 0.85),
    ]
}
