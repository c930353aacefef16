//! Layered permission policy: a map from reserved keys (`*`, the four
//! operation names, `tool.<name>`) to either a scalar decision or a
//! pattern→decision map. Evaluation is pure; later layers override earlier
//! ones and, within a layer, later (lexicographically sorted) matching
//! patterns override earlier ones.

use blah_core::{Decision, Op};
use glob::Pattern;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(thiserror::Error, Debug)]
pub enum PolicyError {
    #[error("invalid policy: {0}")]
    InvalidPolicy(String),
}

/// Either a scalar decision or a nested pattern map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PolicyEntry {
    Decision(Decision),
    Rules(BTreeMap<String, Decision>),
}

/// The policy value itself. `BTreeMap` keeps pattern iteration
/// lexicographic, which makes the last-match-wins pass deterministic
/// across platforms.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Policy(pub BTreeMap<String, PolicyEntry>);

impl Policy {
    /// Parse a policy out of arbitrary JSON. Every reachable leaf must be
    /// one of `allow|deny|ask`; anything else is rejected before the engine
    /// starts.
    pub fn from_value(value: &Value) -> Result<Self, PolicyError> {
        if value.is_null() {
            return Ok(Self::default());
        }
        serde_json::from_value(value.clone())
            .map_err(|err| PolicyError::InvalidPolicy(err.to_string()))
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Merge the standard defaults underneath a user-supplied policy: the
    /// user map wins wherever it sets a key.
    pub fn normalize(user: Self) -> Self {
        let mut merged = default_policy();
        for (key, entry) in user.0 {
            merged.0.insert(key, entry);
        }
        merged
    }

    fn get(&self, key: &str) -> Option<&PolicyEntry> {
        self.0.get(key)
    }
}

/// `{"*":"ask","read":"allow","write":"ask","exec":"ask","network":"ask"}`
pub fn default_policy() -> Policy {
    let mut map = BTreeMap::new();
    map.insert("*".to_string(), PolicyEntry::Decision(Decision::Ask));
    map.insert("read".to_string(), PolicyEntry::Decision(Decision::Allow));
    map.insert("write".to_string(), PolicyEntry::Decision(Decision::Ask));
    map.insert("exec".to_string(), PolicyEntry::Decision(Decision::Ask));
    map.insert("network".to_string(), PolicyEntry::Decision(Decision::Ask));
    Policy(map)
}

/// Resolve a decision for `(op, subject, target)` against the layered
/// policy. Layers, each overriding the previous:
///
/// 1. the global `*` baseline (default `ask`),
/// 2. the rule at the operation key,
/// 3. the rule at the subject key (`tool.<name>`), when a subject is given.
pub fn evaluate(policy: &Policy, op: Op, subject: Option<&str>, target: Option<&str>) -> Decision {
    let mut decision = match policy.get("*") {
        Some(PolicyEntry::Decision(d)) => *d,
        _ => Decision::Ask,
    };
    decision = apply_layer(policy, op.as_str(), target, decision);
    if let Some(subject) = subject {
        decision = apply_layer(policy, subject, target, decision);
    }
    decision
}

fn apply_layer(policy: &Policy, key: &str, target: Option<&str>, current: Decision) -> Decision {
    match policy.get(key) {
        None => current,
        Some(PolicyEntry::Decision(d)) => *d,
        Some(PolicyEntry::Rules(rules)) => {
            let mut decision = current;
            if let Some(d) = rules.get("*") {
                decision = *d;
            }
            if let Some(target) = target {
                // BTreeMap iteration is sorted; the last match wins.
                for (pattern, d) in rules {
                    if pattern == "*" {
                        continue;
                    }
                    if pattern_matches(pattern, target) {
                        decision = *d;
                    }
                }
            }
            decision
        }
    }
}

/// Literal equality first, glob second. A pattern that fails to compile as
/// a glob only ever matches literally.
fn pattern_matches(pattern: &str, target: &str) -> bool {
    if pattern == target {
        return true;
    }
    match Pattern::new(pattern) {
        Ok(compiled) => compiled.matches(target),
        Err(_) => false,
    }
}

/// Pure update: set `pattern → decision` under `key`, converting a scalar
/// entry to a map with the scalar preserved at `*`.
pub fn append_rule(policy: &Policy, key: &str, pattern: &str, decision: Decision) -> Policy {
    let mut next = policy.clone();
    let entry = match next.0.remove(key) {
        None => {
            let mut rules = BTreeMap::new();
            rules.insert(pattern.to_string(), decision);
            PolicyEntry::Rules(rules)
        }
        Some(PolicyEntry::Decision(scalar)) => {
            let mut rules = BTreeMap::new();
            rules.insert("*".to_string(), scalar);
            rules.insert(pattern.to_string(), decision);
            PolicyEntry::Rules(rules)
        }
        Some(PolicyEntry::Rules(mut rules)) => {
            rules.insert(pattern.to_string(), decision);
            PolicyEntry::Rules(rules)
        }
    };
    next.0.insert(key.to_string(), entry);
    next
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn policy_from(value: Value) -> Policy {
        Policy::from_value(&value).expect("valid policy")
    }

    #[test]
    fn default_baseline_is_ask() {
        let policy = Policy::default();
        assert_eq!(evaluate(&policy, Op::Exec, None, None), Decision::Ask);
    }

    #[test]
    fn normalized_defaults_allow_reads_and_ask_everything_else() {
        let policy = Policy::normalize(Policy::default());
        assert_eq!(evaluate(&policy, Op::Read, None, Some("x")), Decision::Allow);
        assert_eq!(evaluate(&policy, Op::Write, None, Some("x")), Decision::Ask);
        assert_eq!(evaluate(&policy, Op::Exec, None, Some("x")), Decision::Ask);
        assert_eq!(
            evaluate(&policy, Op::Network, None, Some("x")),
            Decision::Ask
        );
    }

    #[test]
    fn scalar_op_rule_replaces_baseline() {
        let policy = policy_from(json!({"*": "deny", "exec": "allow"}));
        assert_eq!(
            evaluate(&policy, Op::Exec, None, Some("anything")),
            Decision::Allow
        );
        assert_eq!(
            evaluate(&policy, Op::Write, None, Some("anything")),
            Decision::Deny
        );
    }

    #[test]
    fn map_rule_star_applies_before_specific_patterns() {
        let policy = policy_from(json!({
            "exec": {"*": "deny", "git status": "allow"}
        }));
        assert_eq!(
            evaluate(&policy, Op::Exec, None, Some("git status")),
            Decision::Allow
        );
        assert_eq!(
            evaluate(&policy, Op::Exec, None, Some("rm -rf /")),
            Decision::Deny
        );
    }

    #[test]
    fn glob_patterns_match_targets() {
        let policy = policy_from(json!({
            "exec": {"git *": "allow"}
        }));
        assert_eq!(
            evaluate(&policy, Op::Exec, None, Some("git status")),
            Decision::Allow
        );
        assert_eq!(
            evaluate(&policy, Op::Exec, None, Some("cargo build")),
            Decision::Ask
        );
    }

    #[test]
    fn later_sorted_match_wins() {
        // "git *" < "git status" lexicographically, so the exact pattern
        // is applied second and wins.
        let policy = policy_from(json!({
            "exec": {"git *": "allow", "git status": "deny"}
        }));
        assert_eq!(
            evaluate(&policy, Op::Exec, None, Some("git status")),
            Decision::Deny
        );
        assert_eq!(
            evaluate(&policy, Op::Exec, None, Some("git diff")),
            Decision::Allow
        );
    }

    #[test]
    fn subject_layer_overrides_op_layer() {
        let policy = policy_from(json!({
            "exec": "deny",
            "tool.exec": {"git status": "allow"}
        }));
        assert_eq!(
            evaluate(&policy, Op::Exec, Some("tool.exec"), Some("git status")),
            Decision::Allow
        );
        assert_eq!(
            evaluate(&policy, Op::Exec, Some("tool.exec"), Some("rm x")),
            Decision::Deny
        );
    }

    #[test]
    fn missing_target_only_applies_star_in_maps() {
        let policy = policy_from(json!({
            "write": {"*": "deny", "src/**": "allow"}
        }));
        assert_eq!(evaluate(&policy, Op::Write, None, None), Decision::Deny);
    }

    #[test]
    fn append_rule_creates_map_from_absent_key() {
        let policy = Policy::default();
        let next = append_rule(&policy, "exec", "git status", Decision::Allow);
        assert_eq!(
            evaluate(&next, Op::Exec, None, Some("git status")),
            Decision::Allow
        );
        // Original untouched.
        assert_eq!(
            evaluate(&policy, Op::Exec, None, Some("git status")),
            Decision::Ask
        );
    }

    #[test]
    fn append_rule_converts_scalar_preserving_it_at_star() {
        let policy = policy_from(json!({"exec": "deny"}));
        let next = append_rule(&policy, "exec", "git status", Decision::Allow);
        assert_eq!(
            evaluate(&next, Op::Exec, None, Some("git status")),
            Decision::Allow
        );
        assert_eq!(
            evaluate(&next, Op::Exec, None, Some("rm -rf /")),
            Decision::Deny
        );
    }

    #[test]
    fn invalid_leaf_is_rejected() {
        let err = Policy::from_value(&json!({"exec": "maybe"})).expect_err("must fail");
        assert!(err.to_string().contains("invalid policy"));
        let err = Policy::from_value(&json!({"exec": {"git *": 42}})).expect_err("must fail");
        assert!(err.to_string().contains("invalid policy"));
    }

    #[test]
    fn null_policy_is_empty() {
        let policy = Policy::from_value(&Value::Null).expect("null ok");
        assert!(policy.0.is_empty());
    }

    fn decision_strategy() -> impl Strategy<Value = Decision> {
        prop_oneof![
            Just(Decision::Allow),
            Just(Decision::Deny),
            Just(Decision::Ask),
        ]
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            Just(Op::Read),
            Just(Op::Write),
            Just(Op::Exec),
            Just(Op::Network),
        ]
    }

    proptest! {
        #[test]
        fn evaluate_is_deterministic(
            op in op_strategy(),
            baseline in decision_strategy(),
            rule in decision_strategy(),
            target in "[a-z ./*]{0,24}",
        ) {
            let mut map = BTreeMap::new();
            map.insert("*".to_string(), PolicyEntry::Decision(baseline));
            map.insert(op.as_str().to_string(), PolicyEntry::Decision(rule));
            let policy = Policy(map);
            let first = evaluate(&policy, op, None, Some(&target));
            let second = evaluate(&policy, op, None, Some(&target));
            prop_assert_eq!(first, second);
            prop_assert_eq!(first, rule);
        }

        #[test]
        fn append_rule_is_idempotent(
            key in prop::sample::select(vec!["read", "write", "exec", "network", "tool.exec"]),
            pattern in "[a-z *]{1,16}",
            decision in decision_strategy(),
            op in op_strategy(),
            target in "[a-z ]{0,16}",
        ) {
            let base = Policy::normalize(Policy::default());
            let once = append_rule(&base, key, &pattern, decision);
            let twice = append_rule(&once, key, &pattern, decision);
            let subject = if key.starts_with("tool.") { Some(key) } else { None };
            prop_assert_eq!(
                evaluate(&once, op, subject, Some(&target)),
                evaluate(&twice, op, subject, Some(&target))
            );
        }

        #[test]
        fn serde_round_trip_preserves_evaluation(
            pattern in "[a-z *]{1,12}",
            decision in decision_strategy(),
            target in "[a-z ]{0,12}",
        ) {
            let policy = append_rule(&Policy::normalize(Policy::default()), "exec", &pattern, decision);
            let value = policy.to_value();
            let back = Policy::from_value(&value).expect("round trip");
            prop_assert_eq!(
                evaluate(&policy, Op::Exec, None, Some(&target)),
                evaluate(&back, Op::Exec, None, Some(&target))
            );
        }
    }
}
