//! Rule-driven selection of the target queue for a published event.

use std::sync::Arc;

use devlens_model::{Event, EventCategory, QueueName};

pub type RulePredicate = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

pub struct RoutingRule {
    pub name: String,
    pub priority: i32,
    pub target: QueueName,
    predicate: RulePredicate,
    seq: u64,
}

impl std::fmt::Debug for RoutingRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutingRule")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("target", &self.target)
            .finish()
    }
}

impl RoutingRule {
    pub fn matches(&self, event: &Event) -> bool {
        (self.predicate)(event)
    }
}

/// Rules ordered by priority descending, registration order on ties.
/// Routing is deterministic: first match wins, `default` otherwise.
#[derive(Debug, Default)]
pub struct RuleSet {
    rules: Vec<RoutingRule>,
    next_seq: u64,
}

impl RuleSet {
    pub fn add(
        &mut self,
        name: impl Into<String>,
        priority: i32,
        target: QueueName,
        predicate: RulePredicate,
    ) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.rules.push(RoutingRule {
            name: name.into(),
            priority,
            target,
            predicate,
            seq,
        });
        self.rules
            .sort_by(|a, b| b.priority.cmp(&a.priority).then(a.seq.cmp(&b.seq)));
    }

    pub fn route(&self, event: &Event) -> QueueName {
        self.rules
            .iter()
            .find(|rule| rule.matches(event))
            .map(|rule| rule.target.clone())
            .unwrap_or(QueueName::Default)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// The stock ruleset installed when auto-routing is on: high-severity
    /// events jump to `priority`, low-value telemetry batches up.
    pub fn install_defaults(&mut self) {
        self.add(
            "high-severity",
            100,
            QueueName::Priority,
            Arc::new(|event: &Event| event.severity.is_high()),
        );
        self.add(
            "telemetry-batch",
            50,
            QueueName::Batch,
            Arc::new(|event: &Event| {
                matches!(event.category, EventCategory::Activity)
            }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devlens_model::{EventBuilder, EventSeverity};

    fn event(severity: EventSeverity, category: EventCategory) -> Event {
        EventBuilder::new("git:commit", category)
            .severity(severity)
            .data(serde_json::json!({"action": "commit"}))
            .build()
    }

    #[test]
    fn default_rules_route_by_severity_then_category() {
        let mut rules = RuleSet::default();
        rules.install_defaults();

        let critical = event(EventSeverity::Critical, EventCategory::Git);
        assert_eq!(rules.route(&critical), QueueName::Priority);

        let activity = event(EventSeverity::Info, EventCategory::Activity);
        assert_eq!(rules.route(&activity), QueueName::Batch);

        let plain = event(EventSeverity::Info, EventCategory::Git);
        assert_eq!(rules.route(&plain), QueueName::Default);
    }

    #[test]
    fn routing_is_deterministic() {
        let mut rules = RuleSet::default();
        rules.install_defaults();
        let event = event(EventSeverity::Error, EventCategory::Activity);
        let first = rules.route(&event);
        for _ in 0..10 {
            assert_eq!(rules.route(&event), first);
        }
        // Severity rule outranks the category rule.
        assert_eq!(first, QueueName::Priority);
    }

    #[test]
    fn ties_break_by_registration_order() {
        let mut rules = RuleSet::default();
        rules.add(
            "first",
            10,
            QueueName::Custom("a".into()),
            Arc::new(|_| true),
        );
        rules.add(
            "second",
            10,
            QueueName::Custom("b".into()),
            Arc::new(|_| true),
        );
        let event = event(EventSeverity::Info, EventCategory::Git);
        assert_eq!(rules.route(&event), QueueName::Custom("a".into()));
    }
}
