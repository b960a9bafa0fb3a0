//! Operator form state: offense selection, tier, look-back, and the status
//! line shown after a submission.

use crate::reconcile::{submit, Submission, SubmitOutcome, NO_OFFENSE_SELECTED};
use crate::{
    DecisionError, DecisionGateway, DecisionLevel, DecisionPayload, Offense, OffenseCatalog,
    SessionConfig,
};

pub const MSG_DECISION_UPDATED: &str = "Decision updated successfully!";
pub const MSG_DECISION_SUBMITTED: &str = "Decision submitted successfully!";
pub const MSG_SELECT_OFFENSE: &str = "Please select an offense.";

impl SubmitOutcome {
    #[must_use]
    pub fn status_message(self) -> &'static str {
        match self {
            Self::Created => MSG_DECISION_SUBMITTED,
            Self::Updated => MSG_DECISION_UPDATED,
        }
    }
}

/// Status line for a failed submission.
#[must_use]
pub fn error_status_message(err: &DecisionError) -> String {
    match err {
        DecisionError::Validation(message) if message == NO_OFFENSE_SELECTED => {
            MSG_SELECT_OFFENSE.to_string()
        }
        other => format!("Error: {}", other.message()),
    }
}

/// Parses the look-back field. Blank input means "not specified".
///
/// # Errors
/// Returns [`DecisionError::Validation`] when the text is not a non-negative
/// whole number of years.
pub fn parse_look_back(raw: &str) -> Result<Option<u32>, DecisionError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }

    trimmed.parse::<u32>().map(Some).map_err(|_| {
        DecisionError::Validation(format!(
            "look_back_period MUST be a non-negative whole number of years: {trimmed}"
        ))
    })
}

#[derive(Debug, Clone)]
pub struct DecisionForm {
    config: SessionConfig,
    offenses: Vec<Offense>,
    selected_offense: Option<i64>,
    decision_level: DecisionLevel,
    look_back_period: Option<u32>,
    status_message: Option<String>,
}

impl DecisionForm {
    #[must_use]
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            offenses: Vec::new(),
            selected_offense: None,
            decision_level: DecisionLevel::Green,
            look_back_period: None,
            status_message: None,
        }
    }

    /// Loads the offense catalog. A failing catalog is logged and leaves the
    /// list empty so the rest of the form stays usable.
    pub fn load_offenses<C>(&mut self, catalog: &C) -> usize
    where
        C: OffenseCatalog + ?Sized,
    {
        self.offenses = match catalog.list_offenses() {
            Ok(offenses) => offenses,
            Err(err) => {
                tracing::warn!(error = %err, "offense catalog unavailable");
                Vec::new()
            }
        };
        self.offenses.len()
    }

    #[must_use]
    pub fn offenses(&self) -> &[Offense] {
        &self.offenses
    }

    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn select_offense(&mut self, uccs_code: Option<i64>) {
        self.selected_offense = uccs_code;
    }

    #[must_use]
    pub fn selected_offense(&self) -> Option<i64> {
        self.selected_offense
    }

    pub fn set_decision_level(&mut self, decision_level: DecisionLevel) {
        self.decision_level = decision_level;
    }

    #[must_use]
    pub fn decision_level(&self) -> DecisionLevel {
        self.decision_level
    }

    pub fn set_look_back_period(&mut self, look_back_period: Option<u32>) {
        self.look_back_period = look_back_period;
    }

    /// Sets the look-back from raw field text; invalid text leaves the
    /// previous value in place.
    ///
    /// # Errors
    /// Returns [`DecisionError::Validation`] from [`parse_look_back`].
    pub fn set_look_back_text(&mut self, raw: &str) -> Result<(), DecisionError> {
        self.look_back_period = parse_look_back(raw)?;
        Ok(())
    }

    #[must_use]
    pub fn look_back_period(&self) -> Option<u32> {
        self.look_back_period
    }

    #[must_use]
    pub fn status_message(&self) -> Option<&str> {
        self.status_message.as_deref()
    }

    /// Submits the current form through the reconciliation engine and
    /// records the resulting status line.
    ///
    /// # Errors
    /// Returns whatever [`submit`] returns; the status line is set either way.
    pub fn submit<G>(&mut self, gateway: &mut G) -> Result<SubmitOutcome, DecisionError>
    where
        G: DecisionGateway + ?Sized,
    {
        let submission = Submission::for_session(&self.config, self.selected_offense);
        let payload = DecisionPayload {
            decision_level: self.decision_level,
            look_back_period: self.look_back_period,
        };

        let result = submit(gateway, &submission, &payload);

        self.status_message = Some(match &result {
            Ok(outcome) => outcome.status_message().to_string(),
            Err(err) => {
                tracing::warn!(error = %err, "decision submission failed");
                error_status_message(err)
            }
        });
        result
    }
}
