// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Decision model
//!
//! A [`Decision`] is the engine's verdict on what to do about one
//! classified signal: exactly one per signal, though a decision may
//! result in zero executed actions if it is rejected in review or
//! times out.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::classification::{Classification, Importance, Urgency};

/// What the core decided to do about a signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// Create a task on the tracker
    CreateTask,
    /// Send a notification to a channel
    SendNotification,
    /// File or update a document
    UpdateDocument,
    /// Put a meeting on the calendar
    ScheduleMeeting,
    /// Do nothing
    Ignore,
    /// Route to a human with elevated visibility
    Escalate,
    /// Ask the sender for clarification
    Clarify,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionKind::CreateTask => write!(f, "create_task"),
            ActionKind::SendNotification => write!(f, "send_notification"),
            ActionKind::UpdateDocument => write!(f, "update_document"),
            ActionKind::ScheduleMeeting => write!(f, "schedule_meeting"),
            ActionKind::Ignore => write!(f, "ignore"),
            ActionKind::Escalate => write!(f, "escalate"),
            ActionKind::Clarify => write!(f, "clarify"),
        }
    }
}

/// Which platform executes the decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetPlatform {
    /// Task tracker (boards, tickets)
    TaskTracker,
    /// Chat workspace
    Chat,
    /// Document store
    Filesystem,
    /// Spreadsheet service
    Spreadsheet,
    /// Calendar service
    Calendar,
    /// No platform involved (ignore / clarify handled in-core)
    None,
}

impl fmt::Display for TargetPlatform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetPlatform::TaskTracker => write!(f, "task-tracker"),
            TargetPlatform::Chat => write!(f, "chat"),
            TargetPlatform::Filesystem => write!(f, "filesystem"),
            TargetPlatform::Spreadsheet => write!(f, "spreadsheet"),
            TargetPlatform::Calendar => write!(f, "calendar"),
            TargetPlatform::None => write!(f, "none"),
        }
    }
}

/// Which rules fired and what they found
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    /// Rule ids in evaluation order; the first entry is the rule that fired
    #[serde(default)]
    pub rules_applied: Vec<String>,
    /// Non-fatal findings (e.g. defaulted fields)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    /// Fatal findings; a decision with blockers never dispatches
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blockers: Vec<String>,
}

impl ValidationReport {
    /// Record a fired rule.
    pub fn applied(&mut self, rule: impl Into<String>) {
        self.rules_applied.push(rule.into());
    }

    /// Record a warning.
    pub fn warn(&mut self, warning: impl Into<String>) {
        self.warnings.push(warning.into());
    }

    /// True when nothing blocks dispatch.
    #[must_use]
    pub fn is_dispatchable(&self) -> bool {
        self.blockers.is_empty()
    }
}

/// The engine's verdict on one classified signal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    /// Unique decision id
    pub decision_id: String,
    /// Signal this decision is about
    pub signal_id: String,
    /// What to do
    pub action: ActionKind,
    /// Where to do it
    pub target_platform: TargetPlatform,
    /// Action parameters; the parameter builder refines these into a
    /// platform payload
    pub parameters: serde_json::Value,
    /// 1 (most urgent) ..= 5
    pub priority: u8,
    /// True when a human must approve before dispatch
    pub requires_approval: bool,
    /// Why the engine chose this action
    pub reasoning: String,
    /// Confidence inherited from the classification
    pub confidence: f64,
    /// Rules applied, warnings, blockers
    #[serde(default)]
    pub validation: ValidationReport,
    /// When the decision was made
    pub decided_at: DateTime<Utc>,
}

impl Decision {
    /// Create a decision for a signal.
    pub fn new(signal_id: impl Into<String>, action: ActionKind, platform: TargetPlatform) -> Self {
        Self {
            decision_id: uuid::Uuid::new_v4().to_string(),
            signal_id: signal_id.into(),
            action,
            target_platform: platform,
            parameters: serde_json::Value::Null,
            priority: 3,
            requires_approval: false,
            reasoning: String::new(),
            confidence: 0.0,
            validation: ValidationReport::default(),
            decided_at: Utc::now(),
        }
    }

    /// Set the parameter blob.
    #[must_use]
    pub fn with_parameters(mut self, parameters: serde_json::Value) -> Self {
        self.parameters = parameters;
        self
    }

    /// Set the priority, clamped into 1..=5.
    #[must_use]
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority.clamp(1, 5);
        self
    }

    /// Require human approval before dispatch.
    #[must_use]
    pub fn with_approval_required(mut self, required: bool) -> Self {
        self.requires_approval = required;
        self
    }

    /// Set the reasoning.
    #[must_use]
    pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = reasoning.into();
        self
    }

    /// Set the confidence.
    #[must_use]
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }

    /// True when this decision produces an external side effect.
    #[must_use]
    pub fn is_actionable(&self) -> bool {
        !matches!(self.action, ActionKind::Ignore) && self.target_platform != TargetPlatform::None
    }
}

/// Numeric priority for a classification: urgency maps
/// critical=1, high=2, medium=3, low=4; high importance pulls one
/// step more urgent, floored at 1.
#[must_use]
pub fn priority_for(classification: &Classification) -> u8 {
    let base: u8 = match classification.urgency {
        Urgency::Critical => 1,
        Urgency::High => 2,
        Urgency::Medium => 3,
        Urgency::Low => 4,
    };
    if classification.importance == Importance::High {
        base.saturating_sub(1).max(1)
    } else {
        base
    }
}

/// Details the parameter builder needs for task-creating decisions
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskDetails {
    /// Task title
    pub title: String,
    /// Task description (falls back to the signal body)
    #[serde(default)]
    pub description: String,
    /// Explicit due date, if the signal carried one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub due_date: Option<DateTime<Utc>>,
    /// Assignee, if known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
    /// Extra labels
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<String>,
    /// 1..=5
    #[serde(default)]
    pub priority: u8,
    /// Source tag ("email", "chat", "sheet")
    #[serde(default)]
    pub source: String,
    /// Free-form metadata
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classification::Category;

    fn classification(urgency: Urgency, importance: Importance) -> Classification {
        Classification::new(urgency, importance, Category::Request, 0.8, "test")
    }

    #[test]
    fn test_priority_mapping() {
        assert_eq!(
            priority_for(&classification(Urgency::Critical, Importance::Medium)),
            1
        );
        assert_eq!(
            priority_for(&classification(Urgency::High, Importance::Medium)),
            2
        );
        assert_eq!(
            priority_for(&classification(Urgency::Medium, Importance::Medium)),
            3
        );
        assert_eq!(
            priority_for(&classification(Urgency::Low, Importance::Medium)),
            4
        );
    }

    #[test]
    fn test_priority_importance_adjustment() {
        // High importance pulls one step more urgent, floored at 1.
        assert_eq!(
            priority_for(&classification(Urgency::Critical, Importance::High)),
            1
        );
        assert_eq!(
            priority_for(&classification(Urgency::High, Importance::High)),
            1
        );
        assert_eq!(
            priority_for(&classification(Urgency::Low, Importance::High)),
            3
        );
    }

    #[test]
    fn test_decision_builder_clamps() {
        let d = Decision::new("sig-1", ActionKind::CreateTask, TargetPlatform::TaskTracker)
            .with_priority(9)
            .with_confidence(2.0);
        assert_eq!(d.priority, 5);
        assert_eq!(d.confidence, 1.0);
        assert!(d.is_actionable());
    }

    #[test]
    fn test_ignore_is_not_actionable() {
        let d = Decision::new("sig-1", ActionKind::Ignore, TargetPlatform::None);
        assert!(!d.is_actionable());
    }

    #[test]
    fn test_validation_report() {
        let mut report = ValidationReport::default();
        report.applied("duplicate_suppression");
        report.warn("defaulted due_date");
        assert!(report.is_dispatchable());
        report.blockers.push("missing board id".to_string());
        assert!(!report.is_dispatchable());
    }

    #[test]
    fn test_wire_names() {
        assert_eq!(
            serde_json::to_string(&ActionKind::CreateTask).unwrap(),
            "\"create_task\""
        );
        assert_eq!(
            serde_json::to_string(&TargetPlatform::TaskTracker).unwrap(),
            "\"task_tracker\""
        );
        assert_eq!(TargetPlatform::TaskTracker.to_string(), "task-tracker");
    }

    #[test]
    fn test_decision_serde_round_trip() {
        let d = Decision::new("sig-7", ActionKind::Escalate, TargetPlatform::Chat)
            .with_parameters(serde_json::json!({"channel": "#ops"}))
            .with_reasoning("contract language at high importance")
            .with_approval_required(true);
        let json = serde_json::to_string(&d).unwrap();
        let back: Decision = serde_json::from_str(&json).unwrap();
        assert_eq!(d, back);
    }
}
