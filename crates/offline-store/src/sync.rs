//! SyncCoordinator: local-first reads and writes plus push/pull replay.
//!
//! Reads and writes hit the [`LocalCache`] first and, when auto-sync is on,
//! follow up with a pull or a push, emitting a second result. Every local
//! write is tracked in the [`SyncLog`] until `push` replays it against the
//! [`RemoteStore`].
//!
//! `push` never fails for an individual record: per-record outcomes are
//! returned as [`PushResult`]s and failed records stay in the log. `pull`
//! is all-or-nothing and refuses to run while mutations in its scope are
//! pending, unless the caller asks to push first.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use async_stream::try_stream;
use chrono::{SecondsFormat, Utc};
use futures::future::{join3, join_all};
use futures::stream::{BoxStream, FuturesUnordered, Stream, StreamExt};
use serde_json::Value;
use tokio::sync::Mutex as TokioMutex;

use crate::cache::{LocalCache, QueryCache, SyncLog};
use crate::config::{ResolvedOptions, SyncConfig};
use crate::error::{RemoteError, RemoteErrorKind, Result, StoreError, SyncError};
use crate::query::Query;
use crate::remote::{RemoteResult, RemoteStore};
use crate::storage::Storage;
use crate::types::{
    entity_id, is_local, kmd_mut, strip_local_identity, PendingMutation, PushError, PushResult,
    SyncEvent, SyncOptions, SyncResult, ID_FIELD, LMT_FIELD, LOCAL_FIELD,
};

fn boxed<T, S>(stream: S) -> BoxStream<'static, Result<T>>
where
    S: Stream<Item = Result<T>> + Send + 'static,
{
    Box::pin(stream)
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

type PushOutcome = std::result::Result<Option<Value>, PushError>;

fn storage_failure(e: StoreError) -> PushError {
    PushError::Storage(e.to_string())
}

// ============================================================================
// SyncCoordinator
// ============================================================================

struct Inner {
    cache: LocalCache,
    sync_log: SyncLog,
    query_cache: QueryCache,
    remote: Arc<dyn RemoteStore>,
    config: SyncConfig,
    /// Serializes replays so a record is never pushed twice concurrently.
    push_lock: TokioMutex<()>,
}

/// Coordinates one (namespace, collection, tag) with its remote collection.
///
/// Cheap to clone; clones share the same caches and push lock.
#[derive(Clone)]
pub struct SyncCoordinator {
    inner: Arc<Inner>,
}

impl SyncCoordinator {
    pub fn new(cache: LocalCache, remote: Arc<dyn RemoteStore>, config: SyncConfig) -> Self {
        let sync_log = SyncLog::for_cache(&cache);
        let query_cache = QueryCache::for_cache(&cache);
        Self {
            inner: Arc::new(Inner {
                cache,
                sync_log,
                query_cache,
                remote,
                config,
                push_lock: TokioMutex::new(()),
            }),
        }
    }

    /// Open the caches for `collection` in `namespace` (+ `tag`).
    pub async fn open(
        storage: &Storage,
        namespace: &str,
        collection: &str,
        tag: Option<&str>,
        remote: Arc<dyn RemoteStore>,
        config: SyncConfig,
    ) -> Result<Self> {
        let cache = LocalCache::open(storage, namespace, collection, tag).await?;
        Ok(Self::new(cache, remote, config))
    }

    pub fn cache(&self) -> &LocalCache {
        &self.inner.cache
    }

    pub fn sync_log(&self) -> &SyncLog {
        &self.inner.sync_log
    }

    pub fn query_cache(&self) -> &QueryCache {
        &self.inner.query_cache
    }

    fn collection(&self) -> &str {
        self.inner.cache.collection()
    }

    fn resolve(&self, options: &SyncOptions) -> ResolvedOptions {
        self.inner.config.resolve(options)
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Cached matches, then (with auto-sync) the matches after a pull.
    pub fn find(
        &self,
        query: Option<Query>,
        options: SyncOptions,
    ) -> BoxStream<'static, Result<Vec<Value>>> {
        let this = self.clone();
        let auto_sync = self.resolve(&options).auto_sync;
        boxed(try_stream! {
            yield this.inner.cache.find(query.as_ref()).await?;
            if auto_sync {
                this.pull(query.as_ref(), options).await?;
                yield this.inner.cache.find(query.as_ref()).await?;
            }
        })
    }

    pub fn count(
        &self,
        query: Option<Query>,
        options: SyncOptions,
    ) -> BoxStream<'static, Result<usize>> {
        let this = self.clone();
        let auto_sync = self.resolve(&options).auto_sync;
        boxed(try_stream! {
            yield this.inner.cache.count(query.as_ref()).await?;
            if auto_sync {
                this.pull(query.as_ref(), options).await?;
                yield this.inner.cache.count(query.as_ref()).await?;
            }
        })
    }

    /// With auto-sync, a local miss is not emitted; the entity is pulled
    /// and the stream fails with `NotFound` only if it is still absent.
    pub fn find_by_id(
        &self,
        id: impl Into<String>,
        options: SyncOptions,
    ) -> BoxStream<'static, Result<Value>> {
        let this = self.clone();
        let id = id.into();
        let auto_sync = self.resolve(&options).auto_sync;
        boxed(try_stream! {
            match this.inner.cache.find_by_id(&id).await {
                Ok(doc) => {
                    yield doc;
                }
                Err(e) if auto_sync && e.is_not_found() => {}
                Err(e) => Err(e)?,
            }
            if auto_sync {
                this.pull(Some(&Query::by_id(&id)), options).await?;
                yield this.inner.cache.find_by_id(&id).await?;
            }
        })
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Save locally (assigning a local id if needed) and track a Create.
    /// With auto-sync, the remote-confirmed entity is emitted second.
    pub fn create(&self, entity: Value, options: SyncOptions) -> BoxStream<'static, Result<Value>> {
        self.write(SyncEvent::Create, entity, options)
    }

    /// Save locally and track an Update. The entity must carry an id.
    pub fn update(&self, entity: Value, options: SyncOptions) -> BoxStream<'static, Result<Value>> {
        self.write(SyncEvent::Update, entity, options)
    }

    fn write(
        &self,
        event: SyncEvent,
        entity: Value,
        options: SyncOptions,
    ) -> BoxStream<'static, Result<Value>> {
        let this = self.clone();
        let auto_sync = self.resolve(&options).auto_sync;
        boxed(try_stream! {
            let saved = this.save_local(event, entity).await?;
            let id = entity_id(&saved).unwrap_or_default().to_string();
            yield saved;
            if auto_sync {
                yield this.push_entity(&id).await?;
            }
        })
    }

    async fn save_local(&self, event: SyncEvent, mut entity: Value) -> Result<Value> {
        let missing_id = || SyncError::MissingId {
            collection: self.collection().to_string(),
        };
        if entity_id(&entity).is_none() {
            if event != SyncEvent::Create {
                return Err(missing_id().into());
            }
            let obj = entity.as_object_mut().ok_or_else(missing_id)?;
            obj.insert(ID_FIELD.to_string(), Value::String(uuid::Uuid::new_v4().to_string()));
            let kmd = kmd_mut(&mut entity).ok_or_else(missing_id)?;
            kmd.insert(LOCAL_FIELD.to_string(), Value::Bool(true));
        }
        let kmd = kmd_mut(&mut entity).ok_or_else(missing_id)?;
        kmd.insert(LMT_FIELD.to_string(), Value::String(now_rfc3339()));

        let saved = self.inner.cache.save(entity).await?;
        self.inner.sync_log.add_mutation(event, &saved).await?;
        Ok(saved)
    }

    /// Push the pending mutation of one entity and return the confirmed copy.
    async fn push_entity(&self, id: &str) -> Result<Value> {
        let results = self.push(Some(&Query::by_id(id))).await?;
        match results.into_iter().find(|r| r.id == id) {
            Some(PushResult {
                entity: Some(entity),
                ..
            }) => Ok(entity),
            Some(PushResult {
                error: Some(error), ..
            }) => Err(self.push_error(id, error)),
            // Replayed elsewhere already.
            _ => self.inner.cache.find_by_id(id).await,
        }
    }

    fn push_error(&self, id: &str, error: PushError) -> StoreError {
        match error {
            PushError::Remote(e) => e.into(),
            PushError::Storage(message) => StoreError::Internal(message),
            PushError::MissingEntity => SyncError::MissingEntity {
                collection: self.collection().to_string(),
                id: id.to_string(),
            }
            .into(),
        }
    }

    // -----------------------------------------------------------------------
    // Deletes
    // -----------------------------------------------------------------------

    /// Remove matching entities locally and track their deletion. Returns
    /// the number removed, minus remote failures when auto-sync pushes.
    pub async fn remove(&self, query: Option<&Query>, options: SyncOptions) -> Result<usize> {
        let docs = self.inner.cache.find(query).await?;
        self.remove_documents(docs, self.resolve(&options)).await
    }

    /// Fails with `NotFound` if the entity is not cached.
    pub async fn remove_by_id(&self, id: &str, options: SyncOptions) -> Result<usize> {
        let doc = self.inner.cache.find_by_id(id).await?;
        self.remove_documents(vec![doc], self.resolve(&options)).await
    }

    async fn remove_documents(&self, docs: Vec<Value>, opts: ResolvedOptions) -> Result<usize> {
        if docs.is_empty() {
            return Ok(0);
        }
        let recorded = self
            .inner
            .sync_log
            .add_mutations(SyncEvent::Delete, &docs)
            .await?;

        let mut removed: usize = 0;
        for id in docs.iter().filter_map(entity_id) {
            match self.inner.cache.remove_by_id(id).await {
                Ok(n) => removed += n,
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }

        if opts.auto_sync && !recorded.is_empty() {
            let _guard = self.inner.push_lock.lock().await;
            let results = self.replay(recorded).await;
            let failed = results.iter().filter(|r| !r.is_ok()).count();
            removed = removed.saturating_sub(failed);
        }
        Ok(removed)
    }

    /// Empty the entity cache, the sync log and the query cursors for this
    /// collection. With a query, only matching entities and their pending
    /// mutations are dropped; cursors are always reset.
    pub async fn clear(&self, query: Option<&Query>) -> Result<usize> {
        let log_scope = match query {
            Some(q) => Some(self.ids_matching(q).await.map(Query::by_ids)?),
            None => None,
        };
        let (entities, log, cursors) = join3(
            self.inner.cache.clear(query),
            self.inner.sync_log.clear(log_scope.as_ref()),
            self.inner.query_cache.clear(),
        )
        .await;
        let entities = entities?;
        log?;
        cursors?;
        Ok(entities)
    }

    // -----------------------------------------------------------------------
    // Pending mutations
    // -----------------------------------------------------------------------

    async fn ids_matching(&self, query: &Query) -> Result<Vec<String>> {
        Ok(self
            .inner
            .cache
            .find(Some(query))
            .await?
            .iter()
            .filter_map(entity_id)
            .map(str::to_string)
            .collect())
    }

    /// Pending mutations of the cached entities matching `query`; every
    /// pending mutation without a query.
    async fn pending_in_scope(&self, query: Option<&Query>) -> Result<Vec<PendingMutation>> {
        let Some(query) = query else {
            return self.inner.sync_log.find(None).await;
        };
        let ids = self.ids_matching(query).await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.inner.sync_log.find(Some(&Query::by_ids(ids))).await
    }

    /// Ids whose Delete has not reached the remote store yet. A pull must
    /// not bring these entities back into the cache.
    async fn pending_deletes(&self) -> Result<HashSet<String>> {
        Ok(self
            .inner
            .sync_log
            .find(Some(&Query::new().equal_to("event", SyncEvent::Delete.to_string())))
            .await?
            .into_iter()
            .map(|m| m.id)
            .collect())
    }

    /// Save pulled documents, skipping those deleted locally.
    async fn save_pulled(&self, docs: Vec<Value>, deleted: &HashSet<String>) -> Result<()> {
        let docs: Vec<Value> = docs
            .into_iter()
            .filter(|d| entity_id(d).map_or(true, |id| !deleted.contains(id)))
            .collect();
        self.inner.cache.save_many(docs).await?;
        Ok(())
    }

    pub async fn pending_sync_count(&self, query: Option<&Query>) -> Result<usize> {
        Ok(self.pending_in_scope(query).await?.len())
    }

    pub async fn pending_sync_entities(&self, query: Option<&Query>) -> Result<Vec<PendingMutation>> {
        self.pending_in_scope(query).await
    }

    /// Drop pending mutations without replaying them.
    pub async fn clear_sync(&self, query: Option<&Query>) -> Result<usize> {
        match query {
            None => self.inner.sync_log.clear(None).await,
            Some(_) => {
                let ids: Vec<String> = self
                    .pending_in_scope(query)
                    .await?
                    .into_iter()
                    .map(|m| m.id)
                    .collect();
                self.inner.sync_log.clear(Some(&Query::by_ids(ids))).await
            }
        }
    }

    // -----------------------------------------------------------------------
    // Push
    // -----------------------------------------------------------------------

    /// Replay pending mutations in scope against the remote store.
    ///
    /// Fails only if the sync log cannot be read.
    pub async fn push(&self, query: Option<&Query>) -> Result<Vec<PushResult>> {
        let _guard = self.inner.push_lock.lock().await;
        let records = self.pending_in_scope(query).await?;
        Ok(self.replay(records).await)
    }

    /// Batches run in sequence; records inside a batch run concurrently.
    /// Caller holds the push lock.
    async fn replay(&self, records: Vec<PendingMutation>) -> Vec<PushResult> {
        let batch_size = self.inner.config.push_batch_size.max(1);
        let mut results = Vec::with_capacity(records.len());
        for (n, batch) in records.chunks(batch_size).enumerate() {
            tracing::debug!(
                collection = %self.collection(),
                batch = n,
                size = batch.len(),
                "pushing batch"
            );
            results.extend(join_all(batch.iter().map(|record| self.push_record(record))).await);
        }
        results
    }

    async fn push_record(&self, record: &PendingMutation) -> PushResult {
        let outcome = match record.event {
            SyncEvent::Delete => self.push_delete(record).await,
            SyncEvent::Create | SyncEvent::Update => self.push_upsert(record).await,
        };
        match outcome {
            Ok(entity) => PushResult {
                id: record.id.clone(),
                event: record.event,
                entity,
                error: None,
            },
            Err(error) => {
                tracing::warn!(
                    collection = %self.collection(),
                    id = %record.id,
                    event = %record.event,
                    error = %error,
                    "push failed, mutation retained"
                );
                PushResult {
                    id: record.id.clone(),
                    event: record.event,
                    entity: None,
                    error: Some(error),
                }
            }
        }
    }

    async fn push_delete(&self, record: &PendingMutation) -> PushOutcome {
        match self.call(self.inner.remote.remove_by_id(&record.id)).await {
            Ok(_) => {}
            Err(e) if e.kind == RemoteErrorKind::NotFound => {
                tracing::debug!(collection = %self.collection(), id = %record.id, "already deleted remotely");
            }
            Err(e) => return Err(PushError::Remote(e)),
        }
        self.inner
            .sync_log
            .remove_if_unchanged(record)
            .await
            .map_err(storage_failure)?;
        Ok(None)
    }

    async fn push_upsert(&self, record: &PendingMutation) -> PushOutcome {
        let entity = match self.inner.cache.get(&record.id).await {
            Ok(Some(entity)) => entity,
            Ok(None) => {
                // Nothing left to send; the record can never succeed.
                self.inner
                    .sync_log
                    .remove_if_unchanged(record)
                    .await
                    .map_err(storage_failure)?;
                return Err(PushError::MissingEntity);
            }
            Err(e) => return Err(storage_failure(e)),
        };

        if is_local(&entity) {
            let mut outbound = entity;
            strip_local_identity(&mut outbound);
            let confirmed = self
                .call(self.inner.remote.create(outbound))
                .await
                .map_err(PushError::Remote)?
                .data;
            self.confirm_create(record, confirmed)
                .await
                .map_err(storage_failure)
        } else {
            let confirmed = self
                .call(self.inner.remote.update(entity))
                .await
                .map_err(PushError::Remote)?
                .data;
            self.confirm_update(record, confirmed)
                .await
                .map_err(storage_failure)
        }
    }

    /// Swap the local-id row for the server copy.
    async fn confirm_create(&self, record: &PendingMutation, confirmed: Value) -> Result<Option<Value>> {
        let local_id = record.id.as_str();
        let Some(server_id) = entity_id(&confirmed).map(str::to_string) else {
            return Err(SyncError::MissingId {
                collection: self.collection().to_string(),
            }
            .into());
        };

        let Some(mut latest) = self.inner.cache.get(local_id).await? else {
            // Deleted locally while the create was in flight: the remote copy
            // must go too.
            tracing::warn!(
                collection = %self.collection(),
                local_id,
                server_id = %server_id,
                "entity deleted during push, scheduling remote delete"
            );
            self.inner.sync_log.remove_if_unchanged(record).await?;
            self.inner
                .sync_log
                .add_mutation(SyncEvent::Delete, &confirmed)
                .await?;
            return Ok(Some(confirmed));
        };

        let edited_in_flight = matches!(
            self.inner.sync_log.get(local_id).await?,
            Some(current) if current.stamp != record.stamp
        );
        if edited_in_flight {
            // Keep the newer local edit, now under the server id.
            if let Some(obj) = latest.as_object_mut() {
                obj.insert(ID_FIELD.to_string(), Value::String(server_id.clone()));
            }
            if let Some(kmd) = kmd_mut(&mut latest) {
                kmd.remove(LOCAL_FIELD);
            }
            self.inner.cache.save(latest).await?;
            self.remove_local_row(local_id, &server_id).await?;
            self.inner.sync_log.rekey(local_id, &server_id).await?;
            return Ok(Some(confirmed));
        }

        let confirmed = self.inner.cache.save(confirmed).await?;
        self.remove_local_row(local_id, &server_id).await?;
        self.inner.sync_log.remove_if_unchanged(record).await?;
        Ok(Some(confirmed))
    }

    async fn remove_local_row(&self, local_id: &str, server_id: &str) -> Result<()> {
        if local_id == server_id {
            return Ok(());
        }
        match self.inner.cache.remove_by_id(local_id).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn confirm_update(&self, record: &PendingMutation, mut confirmed: Value) -> Result<Option<Value>> {
        if let Some(current) = self.inner.sync_log.get(&record.id).await? {
            if current.stamp != record.stamp {
                // A newer local write is pending; it wins locally.
                return Ok(Some(confirmed));
            }
        }
        if entity_id(&confirmed).is_none() {
            if let Some(obj) = confirmed.as_object_mut() {
                obj.insert(ID_FIELD.to_string(), Value::String(record.id.clone()));
            }
        }
        let confirmed = self.inner.cache.save(confirmed).await?;
        self.inner.sync_log.remove_if_unchanged(record).await?;
        Ok(Some(confirmed))
    }

    // -----------------------------------------------------------------------
    // Pull
    // -----------------------------------------------------------------------

    /// Refresh the cache from the remote store. Returns the number of
    /// documents received.
    pub async fn pull(&self, query: Option<&Query>, options: SyncOptions) -> Result<usize> {
        let opts = self.resolve(&options);
        let pending = self.pending_in_scope(query).await?.len();
        if pending > 0 {
            if !opts.push_first {
                return Err(self.dirty(pending));
            }
            self.push(query).await?;
            let remaining = self.pending_in_scope(query).await?.len();
            if remaining > 0 {
                return Err(self.dirty(remaining));
            }
        }
        self.fetch(query, opts).await
    }

    fn dirty(&self, count: usize) -> StoreError {
        SyncError::DirtyState {
            collection: self.collection().to_string(),
            count,
        }
        .into()
    }

    async fn fetch(&self, query: Option<&Query>, opts: ResolvedOptions) -> Result<usize> {
        if opts.use_delta_set {
            if let Some(since) = self.inner.query_cache.last_request(query).await? {
                match self.delta_pull(query, &since).await {
                    Ok(changed) => return Ok(changed),
                    Err(StoreError::Remote(RemoteError {
                        kind: RemoteErrorKind::DeltaSetUnavailable,
                        message,
                        ..
                    })) => {
                        tracing::warn!(
                            collection = %self.collection(),
                            reason = %message,
                            "delta set unavailable, falling back to full pull"
                        );
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        match opts.page_size {
            Some(page_size) => self.paginated_pull(query, page_size).await,
            None => self.plain_pull(query).await,
        }
    }

    async fn delta_pull(&self, query: Option<&Query>, since: &str) -> Result<usize> {
        tracing::debug!(collection = %self.collection(), since, "delta pull");
        let delta = self.call(self.inner.remote.delta_fetch(query, since)).await?;
        for id in &delta.deleted {
            match self.inner.cache.remove_by_id(id).await {
                Ok(_) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        let changed = delta.changed.len();
        let deleted = self.pending_deletes().await?;
        self.save_pulled(delta.changed, &deleted).await?;
        self.inner
            .query_cache
            .record_successful_fetch(query, &delta.meta)
            .await?;
        Ok(changed)
    }

    async fn paginated_pull(&self, query: Option<&Query>, page_size: usize) -> Result<usize> {
        let base = query.cloned().unwrap_or_default();
        let count = self.call(self.inner.remote.count(query)).await?;
        // The remote count ignores the window; pages stay inside it.
        let after_skip = count.data.saturating_sub(base.skip);
        let total = base.limit.map_or(after_skip, |limit| after_skip.min(limit));

        // Cached entities in the window are replaced by the fetched pages.
        self.inner.cache.remove(Some(&base)).await?;
        let deleted = self.pending_deletes().await?;

        let page_size = page_size.max(1);
        tracing::debug!(
            collection = %self.collection(),
            total,
            pages = total.div_ceil(page_size),
            "paginated pull"
        );
        let mut pages: FuturesUnordered<_> = (0..total)
            .step_by(page_size)
            .map(|offset| {
                let page = base
                    .clone()
                    .with_skip(base.skip + offset)
                    .with_limit(page_size.min(total - offset));
                async move { self.call(self.inner.remote.find(Some(&page))).await }
            })
            .collect();

        let mut received: usize = 0;
        while let Some(page) = pages.next().await {
            let page = page?.data;
            received += page.len();
            self.save_pulled(page, &deleted).await?;
        }
        self.inner
            .query_cache
            .record_successful_fetch(query, &count.meta)
            .await?;
        Ok(received)
    }

    async fn plain_pull(&self, query: Option<&Query>) -> Result<usize> {
        let response = self.call(self.inner.remote.find(query)).await?;
        let received = response.data.len();
        let deleted = self.pending_deletes().await?;
        self.save_pulled(response.data, &deleted).await?;
        self.inner
            .query_cache
            .record_successful_fetch(query, &response.meta)
            .await?;
        Ok(received)
    }

    /// Push, then pull.
    pub async fn sync(&self, query: Option<&Query>, options: SyncOptions) -> Result<SyncResult> {
        let push = self.push(query).await?;
        let pull = self.pull(query, options).await?;
        Ok(SyncResult { push, pull })
    }

    // -----------------------------------------------------------------------
    // Remote calls
    // -----------------------------------------------------------------------

    async fn call<T>(&self, request: impl Future<Output = RemoteResult<T>>) -> RemoteResult<T> {
        match self.inner.config.remote_timeout() {
            Some(limit) => tokio::time::timeout(limit, request)
                .await
                .unwrap_or_else(|_| Err(RemoteError::timeout(limit.as_millis() as u64))),
            None => request.await,
        }
    }
}
