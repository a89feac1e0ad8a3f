//! Declarative success predicates.
//!
//! A [`Predicate`] describes what observed state counts as fulfilling a
//! request. Predicates are a closed, serializable enum rather than closures
//! so they can be logged, persisted, and tested in isolation.
//!
//! # Evaluation
//!
//! Each observation is classified as one of:
//! - [`Evaluation::Satisfied`] - the observation proves the effect happened
//! - [`Evaluation::Contradicts`] - the relevant attributes hold some other value
//! - [`Evaluation::Incomplete`] - the relevant attributes are missing or still moving
//!
//! Whether a contradiction is *final* (the device went somewhere else) or
//! *transient* (an intermediate step of a ramp) is decided by [`Matcher`],
//! which tracks how long the relevant value has stayed unchanged.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;

use crate::core::{Attributes, Operation, StateObservation};

/// Attribute used by on/off operations.
pub const STATE_ATTRIBUTE: &str = "state";

/// What observed state counts as success for a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Predicate {
    /// Named attribute equals a literal value.
    ExactMatch { attribute: String, value: Value },
    /// All named attributes match within a single observation.
    SubsetMatch { attributes: Attributes },
    /// Array-valued attribute contains the member.
    Contains { attribute: String, member: Value },
    /// Array-valued attribute does not contain the member.
    Excludes { attribute: String, member: Value },
    /// The resource appears in the tracked set.
    Exists,
    /// The resource disappears from the tracked set.
    Absent,
    /// Attribute stays unchanged across `window` consecutive observations,
    /// each at most `max_gap_ms` apart. With a `target`, the settled value
    /// must also equal it.
    Settle {
        attribute: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        window: Option<usize>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_gap_ms: Option<u64>,
    },
}

/// Classification of a single observation against a predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Evaluation {
    Satisfied,
    Contradicts,
    Incomplete,
}

impl Predicate {
    /// Default predicate for an operation when the caller supplies none.
    pub fn for_operation(operation: &Operation) -> Self {
        match operation {
            Operation::TurnOn { attributes } if attributes.is_empty() => Predicate::ExactMatch {
                attribute: STATE_ATTRIBUTE.into(),
                value: Value::from("on"),
            },
            Operation::TurnOn { attributes } => {
                let mut expected = attributes.clone();
                expected.insert(STATE_ATTRIBUTE.into(), Value::from("on"));
                Predicate::SubsetMatch {
                    attributes: expected,
                }
            }
            Operation::TurnOff => Predicate::ExactMatch {
                attribute: STATE_ATTRIBUTE.into(),
                value: Value::from("off"),
            },
            Operation::Set { attributes } if attributes.len() == 1 => {
                let (attribute, value) = attributes
                    .iter()
                    .next()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .unwrap_or_default();
                Predicate::ExactMatch { attribute, value }
            }
            Operation::Set { attributes } => Predicate::SubsetMatch {
                attributes: attributes.clone(),
            },
            Operation::AddMember { attribute, member } => Predicate::Contains {
                attribute: attribute.clone(),
                member: member.clone(),
            },
            Operation::RemoveMember { attribute, member } => Predicate::Excludes {
                attribute: attribute.clone(),
                member: member.clone(),
            },
            Operation::Create { .. } => Predicate::Exists,
            Operation::Delete => Predicate::Absent,
        }
    }

    /// Short name used in logs and results.
    pub fn kind(&self) -> &'static str {
        match self {
            Predicate::ExactMatch { .. } => "exact_match",
            Predicate::SubsetMatch { .. } => "subset_match",
            Predicate::Contains { .. } => "contains",
            Predicate::Excludes { .. } => "excludes",
            Predicate::Exists => "exists",
            Predicate::Absent => "absent",
            Predicate::Settle { .. } => "settle",
        }
    }

    /// Structural problems that make the predicate unsatisfiable by construction.
    pub(crate) fn validate(&self) -> Result<(), String> {
        match self {
            Predicate::ExactMatch { attribute, .. }
            | Predicate::Contains { attribute, .. }
            | Predicate::Excludes { attribute, .. }
                if attribute.trim().is_empty() =>
            {
                Err(format!("{} predicate requires an attribute name", self.kind()))
            }
            Predicate::SubsetMatch { attributes } if attributes.is_empty() => {
                Err("subset_match predicate requires at least one attribute".into())
            }
            Predicate::SubsetMatch { attributes } if attributes.keys().any(|k| k.trim().is_empty()) => {
                Err("subset_match attribute names must not be blank".into())
            }
            Predicate::Settle { attribute, .. } if attribute.trim().is_empty() => {
                Err("settle predicate requires an attribute name".into())
            }
            Predicate::Settle {
                window: Some(0), ..
            } => Err("settle window must be at least 1".into()),
            Predicate::Settle {
                max_gap_ms: Some(0),
                ..
            } => Err("settle gap must be positive".into()),
            _ => Ok(()),
        }
    }

    /// Classify one observation in isolation.
    ///
    /// For [`Predicate::Settle`] this only compares against the target;
    /// stability across observations is tracked by [`Matcher`].
    pub fn evaluate(&self, obs: &StateObservation) -> Evaluation {
        match self {
            Predicate::ExactMatch { attribute, value } => match obs.attribute(attribute) {
                None => Evaluation::Incomplete,
                Some(actual) if values_match(actual, value) => Evaluation::Satisfied,
                Some(_) => Evaluation::Contradicts,
            },
            Predicate::SubsetMatch { attributes } => {
                let mut contradicts = false;
                for (name, expected) in attributes {
                    match obs.attribute(name) {
                        None => return Evaluation::Incomplete,
                        Some(actual) if !values_match(actual, expected) => contradicts = true,
                        Some(_) => {}
                    }
                }
                if contradicts {
                    Evaluation::Contradicts
                } else {
                    Evaluation::Satisfied
                }
            }
            Predicate::Contains { attribute, member } => match obs.attribute(attribute) {
                None => Evaluation::Incomplete,
                Some(actual) if has_member(actual, member) => Evaluation::Satisfied,
                Some(_) => Evaluation::Contradicts,
            },
            Predicate::Excludes { attribute, member } => {
                if obs.is_removal() {
                    return Evaluation::Incomplete;
                }
                match obs.attribute(attribute) {
                    Some(actual) if has_member(actual, member) => Evaluation::Contradicts,
                    _ => Evaluation::Satisfied,
                }
            }
            Predicate::Exists => {
                if obs.is_removal() {
                    Evaluation::Contradicts
                } else {
                    Evaluation::Satisfied
                }
            }
            Predicate::Absent => {
                if obs.is_removal() {
                    Evaluation::Satisfied
                } else {
                    Evaluation::Contradicts
                }
            }
            Predicate::Settle {
                attribute, target, ..
            } => match (obs.attribute(attribute), target) {
                (None, _) => Evaluation::Incomplete,
                (Some(_), None) => Evaluation::Satisfied,
                (Some(actual), Some(target)) if values_match(actual, target) => {
                    Evaluation::Satisfied
                }
                (Some(_), Some(_)) => Evaluation::Contradicts,
            },
        }
    }

    /// True when a single observation is enough to prove the predicate.
    ///
    /// Settle predicates never qualify without a target, since any value
    /// would match.
    pub fn is_satisfied_by(&self, obs: &StateObservation) -> bool {
        match self {
            Predicate::Settle { target: None, .. } => false,
            _ => self.evaluate(obs) == Evaluation::Satisfied,
        }
    }

    /// The part of an observation this predicate looks at.
    ///
    /// Two observations with equal projections are "unchanged" as far as
    /// this predicate is concerned.
    fn project(&self, obs: &StateObservation) -> Option<Value> {
        match self {
            Predicate::ExactMatch { attribute, .. }
            | Predicate::Contains { attribute, .. }
            | Predicate::Excludes { attribute, .. }
            | Predicate::Settle { attribute, .. } => obs.attribute(attribute).cloned(),
            Predicate::SubsetMatch { attributes } => {
                let mut projected = Attributes::new();
                for name in attributes.keys() {
                    projected.insert(name.clone(), obs.attribute(name)?.clone());
                }
                Some(Value::Object(projected))
            }
            Predicate::Exists | Predicate::Absent => Some(Value::Bool(!obs.is_removal())),
        }
    }
}

/// JSON equality that treats `80` and `80.0` as the same number.
pub(crate) fn values_match(actual: &Value, expected: &Value) -> bool {
    match (actual, expected) {
        (Value::Number(a), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(a), Some(b)) => a == b,
            _ => a == b,
        },
        _ => actual == expected,
    }
}

fn has_member(actual: &Value, member: &Value) -> bool {
    match actual {
        Value::Array(items) => items.iter().any(|item| values_match(item, member)),
        other => values_match(other, member),
    }
}

// =============================================================================
// Matcher
// =============================================================================

/// Stateful evaluator for one pending verification.
///
/// Tracks how many consecutive observations carried the same projected value
/// (with gaps no larger than `max_gap`), which drives both settle-detection
/// and the final-vs-transient distinction at the deadline.
#[derive(Debug)]
pub(crate) struct Matcher {
    predicate: Predicate,
    window: usize,
    max_gap: Duration,
    last_projection: Option<Value>,
    last_raw: Option<Evaluation>,
    last_at: Option<Instant>,
    run: usize,
    observed: usize,
    /// Presence does not count until a removal has been seen.
    awaiting_removal: bool,
}

impl Matcher {
    /// Build a matcher; settle predicates override the default window and gap.
    pub(crate) fn new(predicate: Predicate, default_window: usize, default_gap: Duration) -> Self {
        let (window, max_gap) = match &predicate {
            Predicate::Settle {
                window, max_gap_ms, ..
            } => (
                window.unwrap_or(default_window),
                max_gap_ms.map(Duration::from_millis).unwrap_or(default_gap),
            ),
            _ => (default_window, default_gap),
        };
        Self {
            predicate,
            window: window.max(1),
            max_gap,
            last_projection: None,
            last_raw: None,
            last_at: None,
            run: 0,
            observed: 0,
            awaiting_removal: false,
        }
    }

    /// For [`Predicate::Exists`] on a resource that was already present when
    /// the wait was registered: only a fresh appearance satisfies, so updates
    /// to the existing resource are ignored until it has been removed.
    pub(crate) fn require_appearance(mut self, present_at_registration: bool) -> Self {
        self.awaiting_removal = present_at_registration && self.predicate == Predicate::Exists;
        self
    }

    pub(crate) fn predicate(&self) -> &Predicate {
        &self.predicate
    }

    /// Number of observations seen so far.
    pub(crate) fn observed(&self) -> usize {
        self.observed
    }

    /// Feed one observation; returns the evaluation after stability is considered.
    pub(crate) fn observe(&mut self, obs: &StateObservation) -> Evaluation {
        self.observed += 1;
        let projection = self.predicate.project(obs);

        let within_gap = self
            .last_at
            .map(|at| obs.received_at.saturating_duration_since(at) <= self.max_gap)
            .unwrap_or(false);
        self.run = match (&projection, &self.last_projection) {
            (Some(current), Some(previous)) if within_gap && values_match(current, previous) => {
                self.run + 1
            }
            (Some(_), _) => 1,
            (None, _) => 0,
        };
        self.last_projection = projection;
        self.last_at = Some(obs.received_at);

        let mut raw = self.predicate.evaluate(obs);
        if self.awaiting_removal {
            match raw {
                Evaluation::Contradicts => self.awaiting_removal = false,
                Evaluation::Satisfied => raw = Evaluation::Incomplete,
                Evaluation::Incomplete => {}
            }
        }
        self.last_raw = Some(raw);

        match &self.predicate {
            Predicate::Settle { .. } if raw != Evaluation::Incomplete && !self.is_stable() => {
                Evaluation::Incomplete
            }
            _ => raw,
        }
    }

    fn is_stable(&self) -> bool {
        self.run >= self.window
    }

    /// True when the last observation contradicts the predicate and has held
    /// still long enough to count as a final state rather than a step of a
    /// transition.
    pub(crate) fn contradiction_is_final(&self, now: Instant) -> bool {
        if self.last_raw != Some(Evaluation::Contradicts) {
            return false;
        }
        let quiet = self
            .last_at
            .map(|at| now.saturating_duration_since(at) >= self.max_gap)
            .unwrap_or(false);
        self.is_stable() || quiet
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::to_attributes;
    use chrono::Utc;
    use serde_json::json;

    fn obs(seq: u64, attrs: Value) -> StateObservation {
        StateObservation::new("light.kitchen".into(), seq, Utc::now(), Some(to_attributes(attrs)))
    }

    fn removed(seq: u64) -> StateObservation {
        StateObservation::new("light.kitchen".into(), seq, Utc::now(), None)
    }

    #[test]
    fn test_default_predicates() {
        assert_eq!(
            Predicate::for_operation(&Operation::TurnOff),
            Predicate::ExactMatch {
                attribute: "state".into(),
                value: json!("off")
            }
        );

        let turn_on = Operation::TurnOn {
            attributes: to_attributes(json!({"brightness": 80})),
        };
        assert_eq!(
            Predicate::for_operation(&turn_on),
            Predicate::SubsetMatch {
                attributes: to_attributes(json!({"brightness": 80, "state": "on"}))
            }
        );

        let set_one = Operation::Set {
            attributes: to_attributes(json!({"brightness": 80})),
        };
        assert_eq!(
            Predicate::for_operation(&set_one),
            Predicate::ExactMatch {
                attribute: "brightness".into(),
                value: json!(80)
            }
        );

        assert_eq!(
            Predicate::for_operation(&Operation::Create {
                attributes: Attributes::new()
            }),
            Predicate::Exists
        );
        assert_eq!(Predicate::for_operation(&Operation::Delete), Predicate::Absent);
    }

    #[test]
    fn test_exact_match() {
        let p = Predicate::ExactMatch {
            attribute: "brightness".into(),
            value: json!(80),
        };
        assert_eq!(p.evaluate(&obs(1, json!({"brightness": 80}))), Evaluation::Satisfied);
        assert_eq!(p.evaluate(&obs(1, json!({"brightness": 80.0}))), Evaluation::Satisfied);
        assert_eq!(p.evaluate(&obs(1, json!({"brightness": 40}))), Evaluation::Contradicts);
        assert_eq!(p.evaluate(&obs(1, json!({"state": "on"}))), Evaluation::Incomplete);
        assert_eq!(p.evaluate(&removed(1)), Evaluation::Incomplete);
    }

    #[test]
    fn test_subset_match_requires_single_observation() {
        let p = Predicate::SubsetMatch {
            attributes: to_attributes(json!({"state": "on", "brightness": 80})),
        };
        assert_eq!(
            p.evaluate(&obs(1, json!({"state": "on", "brightness": 80, "color": "red"}))),
            Evaluation::Satisfied
        );
        assert_eq!(p.evaluate(&obs(1, json!({"state": "on"}))), Evaluation::Incomplete);
        assert_eq!(
            p.evaluate(&obs(1, json!({"state": "off", "brightness": 80}))),
            Evaluation::Contradicts
        );
    }

    #[test]
    fn test_membership() {
        let contains = Predicate::Contains {
            attribute: "labels".into(),
            member: json!("kitchen"),
        };
        let excludes = Predicate::Excludes {
            attribute: "labels".into(),
            member: json!("kitchen"),
        };
        let with = obs(1, json!({"labels": ["kitchen", "upstairs"]}));
        let without = obs(2, json!({"labels": ["upstairs"]}));
        let no_labels = obs(3, json!({"state": "on"}));

        assert_eq!(contains.evaluate(&with), Evaluation::Satisfied);
        assert_eq!(contains.evaluate(&without), Evaluation::Contradicts);
        assert_eq!(contains.evaluate(&no_labels), Evaluation::Incomplete);
        assert_eq!(excludes.evaluate(&with), Evaluation::Contradicts);
        assert_eq!(excludes.evaluate(&without), Evaluation::Satisfied);
        assert_eq!(excludes.evaluate(&no_labels), Evaluation::Satisfied);
        assert_eq!(excludes.evaluate(&removed(4)), Evaluation::Incomplete);
    }

    #[test]
    fn test_existence() {
        assert_eq!(Predicate::Exists.evaluate(&obs(1, json!({}))), Evaluation::Satisfied);
        assert_eq!(Predicate::Exists.evaluate(&removed(2)), Evaluation::Contradicts);
        assert_eq!(Predicate::Absent.evaluate(&removed(2)), Evaluation::Satisfied);
        assert_eq!(Predicate::Absent.evaluate(&obs(1, json!({}))), Evaluation::Contradicts);
    }

    #[test]
    fn test_validation_rejects_empty_shapes() {
        assert!(Predicate::SubsetMatch {
            attributes: Attributes::new()
        }
        .validate()
        .is_err());
        assert!(Predicate::ExactMatch {
            attribute: "".into(),
            value: json!(1)
        }
        .validate()
        .is_err());
        assert!(Predicate::Settle {
            attribute: "brightness".into(),
            target: None,
            window: Some(0),
            max_gap_ms: None
        }
        .validate()
        .is_err());
        assert!(Predicate::Exists.validate().is_ok());
    }

    #[test]
    fn test_predicate_serializes_with_kind_tag() {
        let p = Predicate::Settle {
            attribute: "brightness".into(),
            target: Some(json!(80)),
            window: Some(3),
            max_gap_ms: None,
        };
        let value = serde_json::to_value(&p).unwrap();
        assert_eq!(value["kind"], "settle");
        assert!(value.get("max_gap_ms").is_none());
        let back: Predicate = serde_json::from_value(value).unwrap();
        assert_eq!(back, p);
    }

    #[tokio::test(start_paused = true)]
    async fn test_settle_requires_consecutive_stable_observations() {
        let p = Predicate::Settle {
            attribute: "brightness".into(),
            target: Some(json!(80)),
            window: Some(3),
            max_gap_ms: Some(500),
        };
        let mut matcher = Matcher::new(p, 3, Duration::from_secs(1));

        assert_eq!(matcher.observe(&obs(1, json!({"brightness": 40}))), Evaluation::Incomplete);
        tokio::time::advance(Duration::from_millis(100)).await;
        assert_eq!(matcher.observe(&obs(2, json!({"brightness": 80}))), Evaluation::Incomplete);
        tokio::time::advance(Duration::from_millis(100)).await;
        assert_eq!(matcher.observe(&obs(3, json!({"brightness": 80}))), Evaluation::Incomplete);
        tokio::time::advance(Duration::from_millis(100)).await;
        assert_eq!(matcher.observe(&obs(4, json!({"brightness": 80}))), Evaluation::Satisfied);
    }

    #[tokio::test(start_paused = true)]
    async fn test_settle_run_resets_after_gap() {
        let p = Predicate::Settle {
            attribute: "brightness".into(),
            target: None,
            window: Some(2),
            max_gap_ms: Some(200),
        };
        let mut matcher = Matcher::new(p, 3, Duration::from_secs(1));

        assert_eq!(matcher.observe(&obs(1, json!({"brightness": 50}))), Evaluation::Incomplete);
        tokio::time::advance(Duration::from_millis(300)).await;
        // Too far apart to count as consecutive.
        assert_eq!(matcher.observe(&obs(2, json!({"brightness": 50}))), Evaluation::Incomplete);
        tokio::time::advance(Duration::from_millis(100)).await;
        assert_eq!(matcher.observe(&obs(3, json!({"brightness": 50}))), Evaluation::Satisfied);
    }

    #[tokio::test(start_paused = true)]
    async fn test_contradiction_finality() {
        let p = Predicate::ExactMatch {
            attribute: "brightness".into(),
            value: json!(80),
        };
        let mut matcher = Matcher::new(p, 3, Duration::from_millis(500));

        matcher.observe(&obs(1, json!({"brightness": 30})));
        // A single fresh contradicting value is still a transition step.
        assert!(!matcher.contradiction_is_final(Instant::now()));

        tokio::time::advance(Duration::from_millis(600)).await;
        // It has now held still for longer than the gap tolerance.
        assert!(matcher.contradiction_is_final(Instant::now()));

        matcher.observe(&obs(2, json!({"state": "on"})));
        assert!(!matcher.contradiction_is_final(Instant::now()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stable_contradiction_is_final() {
        let p = Predicate::ExactMatch {
            attribute: "state".into(),
            value: json!("on"),
        };
        let mut matcher = Matcher::new(p, 2, Duration::from_secs(1));
        matcher.observe(&obs(1, json!({"state": "off"})));
        tokio::time::advance(Duration::from_millis(10)).await;
        matcher.observe(&obs(2, json!({"state": "off"})));
        assert!(matcher.contradiction_is_final(Instant::now()));
        assert_eq!(matcher.observed(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exists_on_present_resource_needs_removal_first() {
        let mut matcher = Matcher::new(Predicate::Exists, 3, Duration::from_secs(1)).require_appearance(true);
        assert_eq!(matcher.observe(&obs(1, json!({"state": "on"}))), Evaluation::Incomplete);
        assert!(!matcher.contradiction_is_final(Instant::now()));
        assert_eq!(matcher.observe(&removed(2)), Evaluation::Contradicts);
        assert_eq!(matcher.observe(&obs(3, json!({"state": "on"}))), Evaluation::Satisfied);
    }

    #[tokio::test(start_paused = true)]
    async fn test_appearance_requirement_ignored_for_other_predicates() {
        let mut matcher = Matcher::new(Predicate::Absent, 3, Duration::from_secs(1)).require_appearance(true);
        assert_eq!(matcher.observe(&removed(1)), Evaluation::Satisfied);
    }
}
