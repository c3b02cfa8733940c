// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Decision engine
//!
//! A pure rule cascade over `(prepared signal, classification)` given a
//! patterns snapshot and the duplicate-index lookup result. Rules are
//! evaluated in a fixed order; the first match fires and its id is
//! recorded in the decision's `validation.rules_applied`.

use regex::Regex;
use std::sync::LazyLock;

use crate::classification::{Category, Classification, Importance, Urgency};
use crate::constants::{DEFAULT_CONFIDENCE_APPROVAL_THRESHOLD, DEFAULT_DUPLICATE_THRESHOLD};
use crate::decision::{priority_for, ActionKind, Decision, TargetPlatform};
use crate::duplicates::DuplicateMatch;
use crate::patterns::Patterns;
use crate::preprocess::PreparedSignal;

/// Hours until a critical incident task is due.
const CRITICAL_INCIDENT_SLA_HOURS: i64 = 4;

static AUTO_REPLY_RE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::expect_used)]
    let re = Regex::new(
        r"(?i)\b(out of office|automatic reply|auto-?reply|vacation responder|do not reply|delivery status notification)\b",
    )
    .expect("valid auto-reply regex");
    re
});

/// Keywords that mark a signal as meeting-related.
const MEETING_KEYWORDS: &[&str] = &[
    "meeting", "meet", "sync", "standup", "catchup", "invite", "reschedule", "calendar",
];

/// Document hints mapped to destination folders.
const DOCUMENT_HINTS: &[(&str, &str)] = &[
    ("invoice", "Invoices/"),
    ("receipt", "Invoices/"),
    ("statement", "Invoices/"),
    ("report", "Reports/"),
    ("contract", "Contracts/"),
    ("agreement", "Contracts/"),
    ("proposal", "Proposals/"),
];

/// Document hints that make filing a financial action needing approval.
const FINANCIAL_HINTS: &[&str] = &["invoice", "receipt", "statement"];

/// Markers that escalate high-importance signals.
const HIGH_IMPACT_MARKERS: &[&str] = &[
    "budget", "contract", "legal", "lawsuit", "compliance", "liability", "acquisition",
];

/// Tunables the cascade reads
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Similarity at or above which a title is a duplicate
    pub duplicate_threshold: f64,
    /// Confidence below which the engine asks for clarification
    pub confidence_threshold: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            duplicate_threshold: DEFAULT_DUPLICATE_THRESHOLD,
            confidence_threshold: DEFAULT_CONFIDENCE_APPROVAL_THRESHOLD,
        }
    }
}

/// The rule cascade
pub struct DecisionEngine {
    config: EngineConfig,
}

impl DecisionEngine {
    /// Engine with default thresholds.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    /// Engine with explicit thresholds.
    #[must_use]
    pub fn with_config(config: EngineConfig) -> Self {
        Self { config }
    }

    /// The task title a signal would create; used for the duplicate
    /// lookup before deciding.
    #[must_use]
    pub fn intended_title(prepared: &PreparedSignal) -> String {
        let subject = prepared.signal.subject.trim();
        if !subject.is_empty() {
            return subject.to_string();
        }
        let body: String = prepared.signal.body.chars().take(60).collect();
        let body = body.trim();
        if body.is_empty() {
            format!("{} signal from {}", prepared.signal.source, prepared.signal.sender)
        } else {
            body.to_string()
        }
    }

    /// Run the cascade. Pure: everything the rules read is an argument.
    #[must_use]
    pub fn decide(
        &self,
        prepared: &PreparedSignal,
        classification: &Classification,
        patterns: &Patterns,
        duplicate: Option<&DuplicateMatch>,
    ) -> Decision {
        let signal = &prepared.signal;

        // Rule 1: duplicate suppression.
        if let Some(m) = duplicate {
            if m.similarity >= self.config.duplicate_threshold {
                let mut decision = Decision::new(&signal.id, ActionKind::Ignore, TargetPlatform::None)
                    .with_parameters(serde_json::json!({
                        "reason": "duplicate_detected",
                        "existing_title": m.title,
                        "existing_reference": m.reference,
                        "similarity": m.similarity,
                    }))
                    .with_reasoning(format!(
                        "duplicate of existing task '{}' (similarity {:.2})",
                        m.title, m.similarity
                    ))
                    .with_confidence(classification.confidence);
                decision.validation.applied("duplicate_suppression");
                return decision;
            }
        }

        // Rule 2: spam.
        if classification.category == Category::Spam {
            let mut decision = Decision::new(&signal.id, ActionKind::Ignore, TargetPlatform::None)
                .with_reasoning("classified as spam")
                .with_confidence(classification.confidence);
            decision.validation.applied("spam_filter");
            return decision;
        }

        // Rule 3: auto-replies.
        if AUTO_REPLY_RE.is_match(&signal.subject) || AUTO_REPLY_RE.is_match(&signal.body) {
            let mut decision = Decision::new(&signal.id, ActionKind::Ignore, TargetPlatform::None)
                .with_reasoning("automated reply")
                .with_confidence(classification.confidence);
            decision.validation.applied("auto_reply_filter");
            return decision;
        }

        // Rule 4: critical incidents cut straight to a P1 task.
        if classification.urgency == Urgency::Critical
            && classification.importance == Importance::High
            && classification.category == Category::Incident
        {
            let mut decision =
                Decision::new(&signal.id, ActionKind::CreateTask, TargetPlatform::TaskTracker)
                    .with_priority(1)
                    .with_parameters(serde_json::json!({
                        "title": Self::intended_title(prepared),
                        "description": signal.body,
                        "due_in_hours": CRITICAL_INCIDENT_SLA_HOURS,
                        "labels": ["incident"],
                    }))
                    .with_reasoning("critical incident at high importance")
                    .with_confidence(classification.confidence);
            decision.validation.applied("critical_incident");
            return decision;
        }

        // Rule 5: meetings.
        let meeting_hint = prepared
            .keywords
            .iter()
            .any(|k| MEETING_KEYWORDS.contains(&k.as_str()));
        if meeting_hint {
            let has_time = !prepared.entities.dates.is_empty();
            let mut decision = if has_time {
                Decision::new(&signal.id, ActionKind::ScheduleMeeting, TargetPlatform::Calendar)
                    .with_priority(3)
                    .with_parameters(serde_json::json!({
                        "title": Self::intended_title(prepared),
                        "description": signal.body,
                        "date_hints": prepared.entities.dates,
                        "attendees": prepared.entities.emails,
                    }))
                    .with_reasoning("meeting request with a time reference")
            } else {
                Decision::new(&signal.id, ActionKind::CreateTask, TargetPlatform::TaskTracker)
                    .with_priority(3)
                    .with_parameters(serde_json::json!({
                        "title": Self::intended_title(prepared),
                        "description": signal.body,
                        "labels": ["meeting"],
                    }))
                    .with_reasoning("meeting request without a concrete time")
            };
            decision = decision.with_confidence(classification.confidence);
            decision.validation.applied("meeting_detection");
            return decision;
        }

        // Rule 6: document filing.
        if signal.has_attachments() {
            let hint = DOCUMENT_HINTS.iter().find(|(hint, _)| {
                prepared.normalized_subject.contains(hint) || prepared.normalized_body.contains(hint)
            });
            if let Some((hint, folder)) = hint {
                let financial = FINANCIAL_HINTS.contains(hint);
                let mut decision =
                    Decision::new(&signal.id, ActionKind::UpdateDocument, TargetPlatform::Filesystem)
                        .with_priority(priority_for(classification))
                        .with_parameters(serde_json::json!({
                            "folder": folder,
                            "document_kind": hint,
                            "attachments": signal.attachments,
                            "description": signal.subject,
                        }))
                        .with_approval_required(financial)
                        .with_reasoning(format!("attachment filed under {folder}"))
                        .with_confidence(classification.confidence);
                decision.validation.applied("document_categorization");
                if financial {
                    decision.validation.warn("financial document requires approval");
                }
                return decision;
            }
        }

        // Rule 7: low confidence asks instead of acting.
        if classification.confidence < self.config.confidence_threshold {
            let mut decision = Decision::new(&signal.id, ActionKind::Clarify, TargetPlatform::Chat)
                .with_priority(priority_for(classification))
                .with_parameters(serde_json::json!({
                    "question": format!(
                        "Low-confidence classification ({:.2}) for '{}'. How should this be handled?",
                        classification.confidence,
                        Self::intended_title(prepared),
                    ),
                    "thread_ref": signal.thread_ref,
                }))
                .with_approval_required(true)
                .with_reasoning("confidence below actionable threshold")
                .with_confidence(classification.confidence);
            decision.validation.applied("low_confidence");
            return decision;
        }

        // Rule 8: high-impact terms escalate.
        let high_impact = HIGH_IMPACT_MARKERS
            .iter()
            .any(|marker| prepared.normalized_body.contains(marker));
        if high_impact && classification.importance == Importance::High {
            let mut decision = Decision::new(&signal.id, ActionKind::Escalate, TargetPlatform::Chat)
                .with_priority(priority_for(classification).min(2))
                .with_parameters(serde_json::json!({
                    "summary": Self::intended_title(prepared),
                    "sender": signal.sender,
                    "body": signal.body,
                }))
                .with_approval_required(true)
                .with_reasoning("high-impact terms at high importance")
                .with_confidence(classification.confidence);
            decision.validation.applied("high_impact_escalation");
            return decision;
        }

        // Rule 9: FYI traffic becomes a notification.
        let fyi = matches!(
            classification.category,
            Category::Information | Category::Discussion
        ) || (classification.urgency == Urgency::Low
            && classification.importance == Importance::Low);
        if fyi {
            let mut decision =
                Decision::new(&signal.id, ActionKind::SendNotification, TargetPlatform::Chat)
                    .with_priority(priority_for(classification))
                    .with_parameters(serde_json::json!({
                        "header": Self::intended_title(prepared),
                        "body": signal.body,
                        "source": signal.source,
                        "thread_ref": signal.thread_ref,
                    }))
                    .with_reasoning("informational signal")
                    .with_confidence(classification.confidence);
            decision.validation.applied("fyi_notification");
            return decision;
        }

        // Rule 10: default task creation, with the learned affinity as
        // a tiebreaker between a task and a notification.
        let preferred = patterns.preferred_action(classification.category);
        if preferred == Some(ActionKind::SendNotification) {
            let mut decision =
                Decision::new(&signal.id, ActionKind::SendNotification, TargetPlatform::Chat)
                    .with_priority(priority_for(classification))
                    .with_parameters(serde_json::json!({
                        "header": Self::intended_title(prepared),
                        "body": signal.body,
                        "source": signal.source,
                        "thread_ref": signal.thread_ref,
                    }))
                    .with_reasoning("learned affinity prefers a notification")
                    .with_confidence(classification.confidence);
            decision.validation.applied("default_task");
            decision.validation.warn("category-action affinity overrode task creation");
            return decision;
        }

        let mut decision =
            Decision::new(&signal.id, ActionKind::CreateTask, TargetPlatform::TaskTracker)
                .with_priority(priority_for(classification))
                .with_parameters(serde_json::json!({
                    "title": Self::intended_title(prepared),
                    "description": signal.body,
                    "labels": [],
                }))
                .with_reasoning("actionable signal defaults to a task")
                .with_confidence(classification.confidence);
        decision.validation.applied("default_task");
        decision
    }
}

impl Default for DecisionEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preprocess::preprocess;
    use crate::signal::{Attachment, Signal, SignalSource};

    fn engine() -> DecisionEngine {
        DecisionEngine::new()
    }

    fn prepared(subject: &str, body: &str) -> PreparedSignal {
        preprocess(Signal::new(SignalSource::Email, subject, body, "sender@x.com"))
    }

    fn classified(
        urgency: Urgency,
        importance: Importance,
        category: Category,
        confidence: f64,
    ) -> Classification {
        Classification::new(urgency, importance, category, confidence, "test")
    }

    #[test]
    fn test_rule_order_duplicate_wins_over_spam() {
        let prepared = prepared("Buy now!", "unsubscribe link inside");
        let classification = classified(Urgency::Low, Importance::Low, Category::Spam, 0.95);
        let duplicate = DuplicateMatch {
            title: "Buy now!".to_string(),
            reference: "TASK-1".to_string(),
            similarity: 0.92,
        };

        let decision = engine().decide(&prepared, &classification, &Patterns::default(), Some(&duplicate));
        assert_eq!(decision.action, ActionKind::Ignore);
        assert_eq!(decision.validation.rules_applied, vec!["duplicate_suppression"]);
        assert_eq!(decision.parameters["existing_reference"], "TASK-1");
    }

    #[test]
    fn test_below_threshold_duplicate_does_not_fire() {
        let prepared = prepared("Fix the login bug", "details");
        let classification = classified(Urgency::Medium, Importance::Medium, Category::Issue, 0.8);
        let duplicate = DuplicateMatch {
            title: "Unrelated".to_string(),
            reference: "TASK-9".to_string(),
            similarity: 0.4,
        };

        let decision = engine().decide(&prepared, &classification, &Patterns::default(), Some(&duplicate));
        assert_ne!(decision.action, ActionKind::Ignore);
    }

    #[test]
    fn test_spam_ignored() {
        let prepared = prepared("LIMITED TIME OFFER!", "click to unsubscribe");
        let classification = classified(Urgency::Low, Importance::Low, Category::Spam, 0.95);
        let decision = engine().decide(&prepared, &classification, &Patterns::default(), None);
        assert_eq!(decision.action, ActionKind::Ignore);
        assert_eq!(decision.validation.rules_applied, vec!["spam_filter"]);
    }

    #[test]
    fn test_auto_reply_ignored() {
        let prepared = prepared("Automatic reply: Re: budget", "I am out of office until Monday");
        let classification = classified(Urgency::Low, Importance::Medium, Category::Information, 0.9);
        let decision = engine().decide(&prepared, &classification, &Patterns::default(), None);
        assert_eq!(decision.action, ActionKind::Ignore);
        assert_eq!(decision.validation.rules_applied, vec!["auto_reply_filter"]);
    }

    #[test]
    fn test_critical_incident_priority_one_no_approval() {
        let prepared = prepared("URGENT: Production database is down", "all reads failing");
        let classification = classified(Urgency::Critical, Importance::High, Category::Incident, 0.95);
        let decision = engine().decide(&prepared, &classification, &Patterns::default(), None);

        assert_eq!(decision.action, ActionKind::CreateTask);
        assert_eq!(decision.target_platform, TargetPlatform::TaskTracker);
        assert_eq!(decision.priority, 1);
        assert!(!decision.requires_approval);
        assert_eq!(decision.validation.rules_applied, vec!["critical_incident"]);
        assert_eq!(decision.parameters["due_in_hours"], CRITICAL_INCIDENT_SLA_HOURS);
    }

    #[test]
    fn test_meeting_with_time_schedules() {
        let prepared = prepared("Sync on roadmap", "can we meet tomorrow at 10?");
        let classification = classified(Urgency::Medium, Importance::Medium, Category::Request, 0.85);
        let decision = engine().decide(&prepared, &classification, &Patterns::default(), None);

        assert_eq!(decision.action, ActionKind::ScheduleMeeting);
        assert_eq!(decision.target_platform, TargetPlatform::Calendar);
        assert_eq!(decision.priority, 3);
        assert_eq!(decision.validation.rules_applied, vec!["meeting_detection"]);
    }

    #[test]
    fn test_meeting_without_time_creates_task() {
        let prepared = prepared("We should sync", "let's find a slot sometime");
        let classification = classified(Urgency::Medium, Importance::Medium, Category::Request, 0.85);
        let decision = engine().decide(&prepared, &classification, &Patterns::default(), None);

        assert_eq!(decision.action, ActionKind::CreateTask);
        assert_eq!(decision.priority, 3);
        assert_eq!(decision.validation.rules_applied, vec!["meeting_detection"]);
    }

    #[test]
    fn test_invoice_attachment_files_with_approval() {
        let signal = Signal::new(
            SignalSource::Email,
            "Invoice #12345",
            "Please find attached the invoice for March.",
            "billing@vendor.com",
        )
        .with_attachment(Attachment::new("invoice.pdf").with_file_id("f-1"));
        let prepared = preprocess(signal);
        let classification = classified(Urgency::Medium, Importance::Medium, Category::Request, 0.85);
        let decision = engine().decide(&prepared, &classification, &Patterns::default(), None);

        assert_eq!(decision.action, ActionKind::UpdateDocument);
        assert_eq!(decision.target_platform, TargetPlatform::Filesystem);
        assert!(decision.requires_approval);
        assert_eq!(decision.parameters["folder"], "Invoices/");
        assert_eq!(decision.validation.rules_applied, vec!["document_categorization"]);
    }

    #[test]
    fn test_report_attachment_no_approval() {
        let signal = Signal::new(
            SignalSource::Email,
            "Weekly report attached",
            "numbers look fine",
            "analyst@x.com",
        )
        .with_attachment(Attachment::new("report.xlsx"));
        let prepared = preprocess(signal);
        let classification = classified(Urgency::Low, Importance::Medium, Category::Information, 0.85);
        let decision = engine().decide(&prepared, &classification, &Patterns::default(), None);

        assert_eq!(decision.action, ActionKind::UpdateDocument);
        assert!(!decision.requires_approval);
        assert_eq!(decision.parameters["folder"], "Reports/");
    }

    #[test]
    fn test_low_confidence_clarifies_with_approval() {
        let prepared = prepared("hmm", "not sure what this is about");
        let classification = classified(Urgency::Medium, Importance::Medium, Category::Request, 0.45);
        let decision = engine().decide(&prepared, &classification, &Patterns::default(), None);

        assert_eq!(decision.action, ActionKind::Clarify);
        assert!(decision.requires_approval);
        assert_eq!(decision.validation.rules_applied, vec!["low_confidence"]);
    }

    #[test]
    fn test_high_impact_terms_escalate() {
        let prepared = prepared(
            "Q3 vendor renewal",
            "the contract exposes us to legal liability beyond budget",
        );
        let classification = classified(Urgency::Medium, Importance::High, Category::Request, 0.8);
        let decision = engine().decide(&prepared, &classification, &Patterns::default(), None);

        assert_eq!(decision.action, ActionKind::Escalate);
        assert!(decision.requires_approval);
        assert!(decision.priority <= 2);
        assert_eq!(decision.validation.rules_applied, vec!["high_impact_escalation"]);
    }

    #[test]
    fn test_high_impact_without_importance_does_not_escalate() {
        let prepared = prepared("FYI budget doc", "budget numbers attached for reference");
        let classification = classified(Urgency::Low, Importance::Medium, Category::Request, 0.8);
        let decision = engine().decide(&prepared, &classification, &Patterns::default(), None);
        assert_ne!(decision.action, ActionKind::Escalate);
    }

    #[test]
    fn test_fyi_sends_notification() {
        let prepared = prepared("Heads up", "deploy window moved to thursday evening");
        let classification = classified(Urgency::Low, Importance::Low, Category::Information, 0.9);
        let decision = engine().decide(&prepared, &classification, &Patterns::default(), None);

        assert_eq!(decision.action, ActionKind::SendNotification);
        assert_eq!(decision.target_platform, TargetPlatform::Chat);
        assert_eq!(decision.validation.rules_applied, vec!["fyi_notification"]);
    }

    #[test]
    fn test_default_creates_task_with_urgency_priority() {
        let prepared = prepared("Access needed for new hire", "please grant repo access");
        let classification = classified(Urgency::High, Importance::Medium, Category::Request, 0.85);
        let decision = engine().decide(&prepared, &classification, &Patterns::default(), None);

        assert_eq!(decision.action, ActionKind::CreateTask);
        assert_eq!(decision.priority, 2);
        assert!(!decision.requires_approval);
        assert_eq!(decision.validation.rules_applied, vec!["default_task"]);
    }

    #[test]
    fn test_intended_title_falls_back_to_body() {
        let prepared = preprocess(Signal::new(
            SignalSource::Chat,
            "",
            "the staging environment certificate expires friday",
            "dev@x.com",
        ));
        let title = DecisionEngine::intended_title(&prepared);
        assert!(title.starts_with("the staging environment"));
    }

    #[test]
    fn test_engine_is_deterministic() {
        let prepared = prepared("Access needed", "please grant access to the analytics dashboard");
        let classification = classified(Urgency::Medium, Importance::Medium, Category::Request, 0.8);
        let a = engine().decide(&prepared, &classification, &Patterns::default(), None);
        let b = engine().decide(&prepared, &classification, &Patterns::default(), None);
        assert_eq!(a.action, b.action);
        assert_eq!(a.priority, b.priority);
        assert_eq!(a.validation, b.validation);
        assert_eq!(a.parameters, b.parameters);
    }
}
