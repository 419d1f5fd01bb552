use serde::{Deserialize, Serialize};

/// Whether a node is still owned by the automatic refiner.
///
/// The transition is one-way: once a human edits a node it stays `UserEdited`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefinementState {
    #[default]
    Auto,
    UserEdited,
}

/// Who is asking for a structural edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EditOrigin {
    /// The refiner or classifier acting on its own.
    Automatic,
    /// A person editing the tree directly.
    User,
    /// A person approving a queued suggestion.
    Approved,
}

impl EditOrigin {
    #[must_use]
    pub const fn is_human(self) -> bool {
        !matches!(self, Self::Automatic)
    }
}

/// Structured answer to "may this edit proceed?".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardrailDecision {
    pub allowed: bool,
    pub requires_approval: bool,
    pub reason: String,
}

impl GuardrailDecision {
    #[must_use]
    pub fn allow() -> Self {
        Self {
            allowed: true,
            requires_approval: false,
            reason: "no protected categories involved".to_string(),
        }
    }
}

/// Evaluates an edit touching `protected` user-edited node names.
#[must_use]
pub fn evaluate(action: &str, protected: &[String], origin: EditOrigin) -> GuardrailDecision {
    if protected.is_empty() {
        return GuardrailDecision::allow();
    }
    let names = protected.join("', '");
    if origin.is_human() {
        GuardrailDecision {
            allowed: true,
            requires_approval: true,
            reason: format!("{action} touches user-edited '{names}'; proceeding on explicit approval"),
        }
    } else {
        GuardrailDecision {
            allowed: false,
            requires_approval: true,
            reason: format!("automatic {action} refused: '{names}' was edited by the user"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unprotected_edits_pass() {
        let decision = evaluate("merge", &[], EditOrigin::Automatic);
        assert!(decision.allowed);
        assert!(!decision.requires_approval);
    }

    #[test]
    fn protected_edits_need_a_human() {
        let names = vec!["Taxes".to_string()];
        let auto = evaluate("merge", &names, EditOrigin::Automatic);
        assert!(!auto.allowed);
        assert!(auto.requires_approval);
        assert!(auto.reason.contains("Taxes"));

        let approved = evaluate("merge", &names, EditOrigin::Approved);
        assert!(approved.allowed);
        assert!(approved.requires_approval);
    }
}
