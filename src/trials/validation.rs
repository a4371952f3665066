// Phase rules for trial management commands

use crate::errors::OnboardingError;

pub const VALID_PHASES: &[&str] = &[
    "Phase I",
    "Phase II",
    "Phase III",
    "Phase IV",
    "Preclinical",
    "terminated",
    "completed",
];

/// Allowed phase transitions, from -> to
const PHASE_TRANSITIONS: &[(&str, &[&str])] = &[
    ("Preclinical", &["Phase I"]),
    ("Phase I", &["Phase II", "terminated"]),
    ("Phase II", &["Phase III", "terminated"]),
    ("Phase III", &["Phase IV", "terminated"]),
    ("Phase IV", &["completed", "terminated"]),
];

fn sorted_list(values: &[&str]) -> String {
    let mut values = values.to_vec();
    values.sort_unstable();
    values.join(", ")
}

pub fn validate_phase(phase: &str) -> Result<(), OnboardingError> {
    if VALID_PHASES.contains(&phase) {
        return Ok(());
    }
    Err(OnboardingError::validation(format!(
        "Invalid phase: {phase}. Must be one of: {}",
        sorted_list(VALID_PHASES)
    )))
}

pub fn allowed_transitions(from_phase: &str) -> &'static [&'static str] {
    PHASE_TRANSITIONS
        .iter()
        .find(|(from, _)| *from == from_phase)
        .map(|(_, to)| *to)
        .unwrap_or(&[])
}

pub fn validate_phase_transition(from_phase: &str, to_phase: &str) -> Result<(), OnboardingError> {
    validate_phase(from_phase)?;
    validate_phase(to_phase)?;

    if from_phase == to_phase {
        return Ok(());
    }

    let allowed = allowed_transitions(from_phase);
    if allowed.contains(&to_phase) {
        return Ok(());
    }

    let allowed_text = if allowed.is_empty() {
        "none".to_string()
    } else {
        sorted_list(allowed)
    };
    Err(OnboardingError::validation(format!(
        "Invalid phase transition from {from_phase} to {to_phase}. Allowed transitions: {allowed_text}"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_phases() {
        for phase in VALID_PHASES {
            assert!(validate_phase(phase).is_ok());
        }
        let err = validate_phase("Phase X").unwrap_err();
        assert!(err.to_string().starts_with("Invalid phase: Phase X"));
        assert!(err.to_string().contains("Phase I"));
    }

    #[test]
    fn test_phase_transitions() {
        assert!(validate_phase_transition("Phase I", "Phase II").is_ok());
        assert!(validate_phase_transition("Phase I", "Phase I").is_ok());
        assert!(validate_phase_transition("Phase II", "terminated").is_ok());

        let err = validate_phase_transition("Phase I", "Phase III").unwrap_err();
        assert!(err.to_string().contains("Allowed transitions: Phase II, terminated"));

        // Terminal phases have nowhere to go
        let err = validate_phase_transition("completed", "Phase I").unwrap_err();
        assert!(err.to_string().ends_with("Allowed transitions: none"));
    }
}
