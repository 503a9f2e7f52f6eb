use async_trait::async_trait;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use super::core::{Aggregate, AggregateRoot, Registry, Snapshot};
use super::factory::AggregateFactory;
use super::store::{StoreSet, TransactionManager};
use crate::error::{EsError, EsResult};

// ============================================================================
// Aggregate Query Service - read path
// ============================================================================
//
// Local aggregates are rebuilt through the factory in a transaction that is
// always rolled back. Aggregates owned by another origin are never replayed
// here: the call goes to the query endpoint registered for that origin, which
// answers with a state snapshot.
//
// ============================================================================

/// Query endpoint of another service.
#[async_trait]
pub trait RemoteAggregateQuery: Send + Sync {
    /// State of `aggregate_type/aggregate_id` at `to_sequence_number` (or the
    /// head), `None` if the aggregate does not exist.
    async fn fetch(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
        to_sequence_number: Option<i64>,
    ) -> EsResult<Option<Snapshot>>;
}

pub struct AggregateQueryService<T: TransactionManager> {
    registry: Arc<Registry>,
    transactions: Arc<T>,
    factory: AggregateFactory<T::Tx>,
    remotes: HashMap<String, Arc<dyn RemoteAggregateQuery>>,
}

impl<T: TransactionManager> Clone for AggregateQueryService<T> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
            transactions: self.transactions.clone(),
            factory: self.factory.clone(),
            remotes: self.remotes.clone(),
        }
    }
}

impl<T: TransactionManager> AggregateQueryService<T> {
    pub fn new(registry: Arc<Registry>, transactions: Arc<T>, stores: &StoreSet<T::Tx>) -> Self {
        Self {
            factory: AggregateFactory::new(registry.clone(), stores),
            registry,
            transactions,
            remotes: HashMap::new(),
        }
    }

    /// Route queries for aggregates of `origin` to `remote`.
    pub fn with_remote(mut self, origin: &str, remote: Arc<dyn RemoteAggregateQuery>) -> Self {
        self.remotes.insert(origin.to_string(), remote);
        self
    }

    pub fn remote_origins(&self) -> impl Iterator<Item = &str> {
        self.remotes.keys().map(String::as_str)
    }

    /// State of `aggregate_id` as of `to_sequence_number` (or the head).
    pub async fn build<A: Aggregate>(
        &self,
        aggregate_id: &str,
        to_sequence_number: Option<i64>,
    ) -> EsResult<Option<AggregateRoot<A>>> {
        let metadata = self.registry.lookup::<A>()?;

        if self.registry.is_local(metadata) {
            return self.build_local::<A>(aggregate_id, to_sequence_number).await;
        }

        let remote = self
            .remotes
            .get(&metadata.origin)
            .ok_or_else(|| EsError::RemoteOriginNotConfigured(metadata.origin.clone()))?;

        tracing::debug!(
            origin = %metadata.origin,
            aggregate_type = %metadata.aggregate_type,
            aggregate_id = %aggregate_id,
            "Resolving aggregate through its owning service"
        );

        let snapshot = match remote
            .fetch(&metadata.aggregate_type, aggregate_id, to_sequence_number)
            .await?
        {
            Some(snapshot) => snapshot,
            None => return Ok(None),
        };

        if snapshot.origin != metadata.origin
            || snapshot.aggregate_type != metadata.aggregate_type
        {
            return Err(EsError::CommandRejected(format!(
                "remote answered with {}/{} for a {}/{} query",
                snapshot.origin, snapshot.aggregate_type, metadata.origin, metadata.aggregate_type
            )));
        }
        if snapshot.aggregate_id != aggregate_id {
            return Err(EsError::AggregateIdMismatch {
                expected: aggregate_id.to_string(),
                actual: snapshot.aggregate_id,
            });
        }

        AggregateRoot::restore(self.registry.clone(), &snapshot).map(Some)
    }

    async fn build_local<A: Aggregate>(
        &self,
        aggregate_id: &str,
        to_sequence_number: Option<i64>,
    ) -> EsResult<Option<AggregateRoot<A>>> {
        let mut tx = self.transactions.begin().await?;
        let result = self
            .factory
            .build::<A>(&mut tx, aggregate_id, to_sequence_number)
            .await;
        if let Err(e) = self.transactions.rollback(tx).await {
            tracing::warn!(error = %e, "Rollback of read transaction failed");
        }
        result
    }
}

/// Serves the local aggregates of type `A` to other services' query
/// services. Mount it as their remote for this origin.
pub struct LocalQueryEndpoint<A: Aggregate, T: TransactionManager> {
    service: AggregateQueryService<T>,
    _aggregate: PhantomData<fn() -> A>,
}

impl<A: Aggregate, T: TransactionManager> LocalQueryEndpoint<A, T> {
    pub fn new(service: AggregateQueryService<T>) -> Self {
        Self {
            service,
            _aggregate: PhantomData,
        }
    }
}

#[async_trait]
impl<A: Aggregate, T: TransactionManager> RemoteAggregateQuery for LocalQueryEndpoint<A, T> {
    async fn fetch(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
        to_sequence_number: Option<i64>,
    ) -> EsResult<Option<Snapshot>> {
        let metadata = self.service.registry.lookup::<A>()?;
        if metadata.aggregate_type != aggregate_type {
            return Err(EsError::MetadataNotFound(std::any::type_name::<A>()));
        }
        match self
            .service
            .build::<A>(aggregate_id, to_sequence_number)
            .await?
        {
            Some(root) => root.to_snapshot().map(Some),
            None => Ok(None),
        }
    }
}
