//! Contracts the core consumes from the data backend.
//!
//! Implementations report every failure as [`DecisionError::Backend`].
//! Nothing here promises uniqueness of [`DecisionKey`]: a backend may hold
//! several records for one key if two writers raced.

use crate::{
    Decision, DecisionError, DecisionId, DecisionKey, DecisionPayload, Offense, Subscription,
};

pub trait OffenseCatalog {
    /// All classifiable offenses ordered by `uccs_code` ascending.
    ///
    /// # Errors
    /// Returns [`DecisionError::Backend`] when the catalog cannot be read.
    fn list_offenses(&self) -> Result<Vec<Offense>, DecisionError>;
}

pub trait DecisionGateway {
    /// At most one decision matching the full key.
    ///
    /// # Errors
    /// Returns [`DecisionError::Backend`] when the lookup fails.
    fn find_decision(&self, key: &DecisionKey) -> Result<Option<Decision>, DecisionError>;

    /// Creates a decision; the backend assigns `id` and `updated_at` and
    /// emits an insert event.
    ///
    /// # Errors
    /// Returns [`DecisionError::Backend`] when the write fails.
    fn insert_decision(
        &mut self,
        key: &DecisionKey,
        payload: &DecisionPayload,
    ) -> Result<Decision, DecisionError>;

    /// Overwrites level and look-back of an existing decision; the backend
    /// refreshes `updated_at` and emits an update event.
    ///
    /// # Errors
    /// Returns [`DecisionError::Backend`] when the write fails or `id` is
    /// unknown.
    fn update_decision(
        &mut self,
        id: DecisionId,
        payload: &DecisionPayload,
    ) -> Result<Decision, DecisionError>;

    /// Snapshot of every decision in one matrix, oldest first.
    ///
    /// # Errors
    /// Returns [`DecisionError::Backend`] when the query fails.
    fn list_decisions(&self, matrix_id: &str) -> Result<Vec<Decision>, DecisionError>;

    /// Opens a change-feed subscription scoped to one matrix.
    ///
    /// # Errors
    /// Returns [`DecisionError::Backend`] when the subscription cannot be
    /// established.
    fn subscribe_decision_changes(&self, matrix_id: &str) -> Result<Subscription, DecisionError>;
}
