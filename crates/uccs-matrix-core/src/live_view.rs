//! Live, arrival-ordered view of one matrix's decisions.
//!
//! The view is the only writer of its collection. It is seeded from a
//! snapshot and then fed change events in delivery order: a record whose id
//! is already held is replaced where it sits, anything else is appended.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::{
    ChangeEvent, ChangeKind, Decision, DecisionError, DecisionGateway, DecisionId, Subscription,
};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum MergeOutcome {
    Inserted,
    Replaced,
    /// The held copy has a newer `updated_at` than the incoming record.
    Stale,
    /// Delete events are reported but never remove records.
    DeleteIgnored,
    ForeignMatrix,
}

#[derive(Debug)]
pub struct LiveDecisionView {
    matrix_id: String,
    records: Vec<Decision>,
    positions: HashMap<DecisionId, usize>,
    subscription: Option<Subscription>,
}

impl LiveDecisionView {
    /// An empty, inactive view. Use [`LiveDecisionView::activate`] to attach
    /// it to a backend.
    #[must_use]
    pub fn new(matrix_id: impl Into<String>) -> Self {
        Self {
            matrix_id: matrix_id.into(),
            records: Vec::new(),
            positions: HashMap::new(),
            subscription: None,
        }
    }

    /// Subscribes to the matrix's change feed and seeds from a snapshot.
    ///
    /// The subscription is opened before the snapshot is read so no commit
    /// can fall between the two; events for writes the snapshot already
    /// contains merge by id. A failed snapshot is logged and leaves the view
    /// empty but subscribed.
    ///
    /// # Errors
    /// Returns [`DecisionError::Backend`] when the subscription cannot be
    /// opened.
    pub fn activate<G>(gateway: &G, matrix_id: &str) -> Result<Self, DecisionError>
    where
        G: DecisionGateway + ?Sized,
    {
        let subscription = gateway.subscribe_decision_changes(matrix_id)?;
        let mut view = Self::new(matrix_id);
        view.subscription = Some(subscription);

        match gateway.list_decisions(matrix_id) {
            Ok(snapshot) => view.seed(snapshot),
            Err(err) => {
                tracing::warn!(matrix_id, error = %err, "decision snapshot unavailable");
            }
        }

        Ok(view)
    }

    /// True while the view holds a subscription whose feed is still
    /// connected.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.subscription
            .as_ref()
            .is_some_and(|subscription| !subscription.is_disconnected())
    }

    /// Releases the change-feed subscription. Records stay readable.
    pub fn deactivate(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            subscription.close();
        }
    }

    /// Replaces the whole collection with `snapshot`.
    pub fn seed(&mut self, snapshot: Vec<Decision>) {
        self.records.clear();
        self.positions.clear();

        for record in snapshot {
            if record.matrix_id != self.matrix_id {
                tracing::debug!(
                    decision_id = %record.id,
                    matrix_id = %record.matrix_id,
                    "snapshot row outside view matrix skipped"
                );
                continue;
            }
            self.upsert(record);
        }

        tracing::debug!(
            matrix_id = %self.matrix_id,
            records = self.records.len(),
            "live view seeded"
        );
    }

    pub fn apply(&mut self, event: ChangeEvent) -> MergeOutcome {
        if event.record.matrix_id != self.matrix_id {
            return MergeOutcome::ForeignMatrix;
        }

        match event.kind {
            ChangeKind::Delete => {
                tracing::warn!(
                    decision_id = %event.record.id,
                    matrix_id = %self.matrix_id,
                    "delete event ignored; live view has no removal path"
                );
                MergeOutcome::DeleteIgnored
            }
            ChangeKind::Insert | ChangeKind::Update => {
                if let Some(&position) = self.positions.get(&event.record.id) {
                    if event.record.updated_at < self.records[position].updated_at {
                        return MergeOutcome::Stale;
                    }
                }
                self.upsert(event.record)
            }
        }
    }

    /// Applies every queued change event in delivery order and returns how
    /// many were processed.
    pub fn pump(&mut self) -> usize {
        let Some(subscription) = self.subscription.as_mut() else {
            return 0;
        };

        let events = subscription.drain();
        let processed = events.len();
        for event in events {
            let outcome = self.apply(event);
            tracing::trace!(?outcome, "change event merged");
        }
        processed
    }

    #[must_use]
    pub fn matrix_id(&self) -> &str {
        &self.matrix_id
    }

    #[must_use]
    pub fn records(&self) -> &[Decision] {
        &self.records
    }

    #[must_use]
    pub fn get(&self, id: DecisionId) -> Option<&Decision> {
        self.positions
            .get(&id)
            .and_then(|&position| self.records.get(position))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn upsert(&mut self, record: Decision) -> MergeOutcome {
        if let Some(&position) = self.positions.get(&record.id) {
            self.records[position] = record;
            return MergeOutcome::Replaced;
        }

        self.positions.insert(record.id, self.records.len());
        self.records.push(record);
        MergeOutcome::Inserted
    }
}
