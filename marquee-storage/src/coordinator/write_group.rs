//! One aggregate write: a transaction, the steps run inside it, and the
//! entities those steps touched.

use marquee_core::{
    CacheKeyPattern, Change, EntityId, EntityType, MarqueeError, MarqueeResult, Touched,
};
use serde::Serialize;

use crate::cache::InvalidationReport;
use crate::store::{Collection, Document, FieldFilter, StoreSession, StoreSessionExt};

/// The aggregate writes the coordinator knows how to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum WriteKind {
    CreateTvShow,
    CreateSeason,
    CreateEpisode,
    UpdateEpisode,
    RateEpisode,
    DeleteEpisode,
    DeleteSeason,
    DeleteTvShow,
}

impl WriteKind {
    pub const ALL: [WriteKind; 8] = [
        WriteKind::CreateTvShow,
        WriteKind::CreateSeason,
        WriteKind::CreateEpisode,
        WriteKind::UpdateEpisode,
        WriteKind::RateEpisode,
        WriteKind::DeleteEpisode,
        WriteKind::DeleteSeason,
        WriteKind::DeleteTvShow,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            WriteKind::CreateTvShow => "create_tv_show",
            WriteKind::CreateSeason => "create_season",
            WriteKind::CreateEpisode => "create_episode",
            WriteKind::UpdateEpisode => "update_episode",
            WriteKind::RateEpisode => "rate_episode",
            WriteKind::DeleteEpisode => "delete_episode",
            WriteKind::DeleteSeason => "delete_season",
            WriteKind::DeleteTvShow => "delete_tv_show",
        }
    }
}

impl std::fmt::Display for WriteKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a write group.
///
/// `Pending -> InTransaction -> Committed -> Invalidated`, or
/// `Pending -> InTransaction -> Aborted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WriteState {
    Pending,
    InTransaction,
    Committed,
    Invalidated,
    Aborted,
}

impl WriteState {
    pub fn is_terminal(self) -> bool {
        matches!(self, WriteState::Invalidated | WriteState::Aborted)
    }

    /// Whether moving to `next` is a legal transition.
    pub fn can_transition_to(self, next: WriteState) -> bool {
        matches!(
            (self, next),
            (WriteState::Pending, WriteState::InTransaction)
                | (WriteState::InTransaction, WriteState::Committed)
                | (WriteState::InTransaction, WriteState::Aborted)
                | (WriteState::Committed, WriteState::Invalidated)
        )
    }
}

/// A store mutation performed inside the transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Mutation {
    Insert { id: EntityId },
    Delete { id: EntityId },
    SetFields { id: EntityId, fields: Vec<String> },
    PushId { id: EntityId, field: String, value: EntityId },
    PullId { id: EntityId, field: String, value: EntityId },
    Increment { id: EntityId, field: String, by: i64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WriteStep {
    pub collection: Collection,
    pub mutation: Mutation,
}

/// Result of an aggregate write that committed.
#[derive(Debug, Clone)]
pub struct WriteReceipt<T> {
    pub value: T,
    pub kind: WriteKind,
    pub state: WriteState,
    pub steps: Vec<WriteStep>,
    pub touched: Vec<Touched>,
    /// Patterns purged after commit, in the order they were purged.
    pub targets: Vec<CacheKeyPattern>,
    pub invalidation: InvalidationReport,
}

impl<T> WriteReceipt<T> {
    pub fn into_value(self) -> T {
        self.value
    }
}

/// A committed group, waiting for its invalidation cascade.
#[derive(Debug)]
pub struct CommittedGroup {
    pub kind: WriteKind,
    pub steps: Vec<WriteStep>,
    pub touched: Vec<Touched>,
}

/// Runs mutations inside one store transaction and records what they did.
///
/// Every mutation goes through the group so the step list and the touched
/// entities stay in sync with what was actually written.
pub struct AggregateWriteGroup<S: StoreSession> {
    kind: WriteKind,
    state: WriteState,
    session: S,
    steps: Vec<WriteStep>,
    touched: Vec<Touched>,
}

impl<S: StoreSession> AggregateWriteGroup<S> {
    /// Wrap a session that has not yet started a transaction.
    pub fn new(kind: WriteKind, session: S) -> Self {
        Self {
            kind,
            state: WriteState::Pending,
            session,
            steps: Vec::new(),
            touched: Vec::new(),
        }
    }

    /// Enter `InTransaction`.
    pub async fn begin(&mut self) -> MarqueeResult<()> {
        self.session.start_transaction().await?;
        self.transition(WriteState::InTransaction);
        Ok(())
    }

    pub fn kind(&self) -> WriteKind {
        self.kind
    }

    pub fn state(&self) -> WriteState {
        self.state
    }

    pub fn steps(&self) -> &[WriteStep] {
        &self.steps
    }

    fn transition(&mut self, next: WriteState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal write state transition {:?} -> {:?}",
            self.state,
            next
        );
        tracing::debug!(kind = %self.kind, from = ?self.state, to = ?next, "Write group transition");
        self.state = next;
    }

    fn record(&mut self, collection: Collection, mutation: Mutation) {
        self.steps.push(WriteStep {
            collection,
            mutation,
        });
    }

    /// Record that `id` was changed by this group.
    pub fn touch(&mut self, entity_type: EntityType, id: EntityId, change: Change) {
        let touched = Touched::new(entity_type, id, change);
        if !self.touched.contains(&touched) {
            self.touched.push(touched);
        }
    }

    // ========================================================================
    // READS
    // ========================================================================

    pub async fn find<D: Document>(&mut self, id: EntityId) -> MarqueeResult<Option<D>> {
        self.session.find::<D>(id).await
    }

    /// Like [`find`](Self::find), failing with not-found when absent.
    pub async fn require<D: Document>(&mut self, id: EntityId) -> MarqueeResult<D> {
        self.session
            .find::<D>(id)
            .await?
            .ok_or_else(|| MarqueeError::not_found(D::COLLECTION.entity_type(), id))
    }

    pub async fn find_by_fields<D: Document>(
        &mut self,
        filter: &FieldFilter,
    ) -> MarqueeResult<Vec<D>> {
        self.session.find_by_fields::<D>(filter).await
    }

    // ========================================================================
    // MUTATIONS
    // ========================================================================

    pub async fn insert<D: Document>(&mut self, doc: &D) -> MarqueeResult<()> {
        self.session.insert(doc).await?;
        self.record(D::COLLECTION, Mutation::Insert { id: doc.id() });
        Ok(())
    }

    /// Delete a document, failing with not-found if it was already gone.
    pub async fn delete(&mut self, collection: Collection, id: EntityId) -> MarqueeResult<()> {
        if !self.session.delete_raw(collection, id).await? {
            return Err(MarqueeError::not_found(collection.entity_type(), id));
        }
        self.record(collection, Mutation::Delete { id });
        Ok(())
    }

    pub async fn set_fields(
        &mut self,
        collection: Collection,
        id: EntityId,
        fields: FieldFilter,
    ) -> MarqueeResult<()> {
        let names = fields.keys().cloned().collect();
        let found = self.session.set_fields(collection, id, fields).await?;
        self.expect_found(collection, id, found)?;
        self.record(collection, Mutation::SetFields { id, fields: names });
        Ok(())
    }

    pub async fn push_id(
        &mut self,
        collection: Collection,
        id: EntityId,
        field: &str,
        value: EntityId,
    ) -> MarqueeResult<()> {
        let found = self.session.push_id(collection, id, field, value).await?;
        self.expect_found(collection, id, found)?;
        self.record(
            collection,
            Mutation::PushId {
                id,
                field: field.to_string(),
                value,
            },
        );
        Ok(())
    }

    pub async fn pull_id(
        &mut self,
        collection: Collection,
        id: EntityId,
        field: &str,
        value: EntityId,
    ) -> MarqueeResult<()> {
        let found = self.session.pull_id(collection, id, field, value).await?;
        self.expect_found(collection, id, found)?;
        self.record(
            collection,
            Mutation::PullId {
                id,
                field: field.to_string(),
                value,
            },
        );
        Ok(())
    }

    pub async fn increment(
        &mut self,
        collection: Collection,
        id: EntityId,
        field: &str,
        by: i64,
    ) -> MarqueeResult<()> {
        let found = self.session.increment(collection, id, field, by).await?;
        self.expect_found(collection, id, found)?;
        self.record(
            collection,
            Mutation::Increment {
                id,
                field: field.to_string(),
                by,
            },
        );
        Ok(())
    }

    fn expect_found(&self, collection: Collection, id: EntityId, found: bool) -> MarqueeResult<()> {
        if found {
            Ok(())
        } else {
            Err(MarqueeError::not_found(collection.entity_type(), id))
        }
    }

    // ========================================================================
    // COMPLETION
    // ========================================================================

    /// Commit on `Ok`, abort on `Err`, and end the session either way.
    ///
    /// A step error is returned exactly as it was raised. A commit failure
    /// aborts the group and is returned instead.
    pub async fn conclude<T>(
        mut self,
        result: MarqueeResult<T>,
    ) -> MarqueeResult<(T, CommittedGroup)> {
        let outcome = match result {
            Ok(value) => match self.session.commit_transaction().await {
                Ok(()) => {
                    self.transition(WriteState::Committed);
                    Ok(value)
                }
                Err(e) => {
                    self.abort(&e).await;
                    Err(e)
                }
            },
            Err(e) => {
                self.abort(&e).await;
                Err(e)
            }
        };

        if let Err(e) = self.session.end_session().await {
            tracing::warn!(kind = %self.kind, error = %e, "Failed to end store session");
        }

        let value = outcome?;
        Ok((
            value,
            CommittedGroup {
                kind: self.kind,
                steps: self.steps,
                touched: self.touched,
            },
        ))
    }

    async fn abort(&mut self, cause: &MarqueeError) {
        tracing::warn!(
            kind = %self.kind,
            steps = self.steps.len(),
            error = %cause,
            "Aggregate write aborted"
        );
        if self.session.in_transaction() {
            if let Err(e) = self.session.abort_transaction().await {
                tracing::warn!(kind = %self.kind, error = %e, "Abort failed; session end will discard the transaction");
            }
        }
        self.transition(WriteState::Aborted);
        self.steps.clear();
        self.touched.clear();
    }
}
