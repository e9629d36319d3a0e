//! Database facade
//!
//! [`Repository`] is the one entry point callers use. It resolves the join
//! plan, validates and normalizes options and payloads, then hands a native
//! request to a [`Backend`] on tokio's blocking pool. Every configuration
//! error is raised before the backend is called.

use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::debug;

use super::error::{QueryError, Result};
use super::normalize::{EntitySchema, Normalizer, StoreFlavor, API_ID};
use super::operation::Operation;
use super::options::{Page, PagedResult, QueryOptions, StorageFilter, StorageOptions};
use super::plan::JoinPlan;

/// A compiled-ready read against the root collection
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub collection: String,
    pub plan: JoinPlan,
    pub options: StorageOptions,
    /// Native primary key restricting the root
    pub by_id: Option<Value>,
}

/// Native-form entities of one page plus the total across pages
#[derive(Debug, Clone, Default)]
pub struct FetchResult {
    pub entities: Vec<Value>,
    pub total: u64,
}

/// Store-specific execution. All values are in the store's native form.
pub trait Backend: Send + Sync + 'static {
    fn flavor(&self) -> StoreFlavor;

    /// Short label for logs and `status`
    fn name(&self) -> &str;

    /// Run the joins, filters and paging of `request` in one round trip
    fn fetch_joined(&self, request: &FetchRequest) -> Result<FetchResult>;

    /// The native query `fetch_joined` would run
    fn explain(&self, request: &FetchRequest) -> Result<Value>;

    /// Insert atomically, returning the stored rows or documents
    fn insert_many(&self, collection: &str, entities: Vec<Map<String, Value>>) -> Result<Vec<Value>>;

    fn update_by_id(&self, collection: &str, id: &Value, changes: Map<String, Value>) -> Result<Option<Value>>;

    fn update_where(&self, collection: &str, filters: &[StorageFilter], changes: Map<String, Value>) -> Result<u64>;

    fn delete_by_id(&self, collection: &str, id: &Value) -> Result<bool>;

    fn delete_where(&self, collection: &str, filters: &[StorageFilter]) -> Result<u64>;

    fn ping(&self) -> Result<()>;
}

/// Joined reads and plain writes over one root collection
pub struct Repository<B: Backend> {
    backend: Arc<B>,
    collection: String,
    schema: Arc<EntitySchema>,
    max_page_size: u64,
}

impl<B: Backend> Clone for Repository<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            collection: self.collection.clone(),
            schema: Arc::clone(&self.schema),
            max_page_size: self.max_page_size,
        }
    }
}

impl<B: Backend> Repository<B> {
    pub fn new(backend: Arc<B>, collection: &str) -> Self {
        Self {
            backend,
            collection: collection.to_string(),
            schema: Arc::new(EntitySchema::default()),
            max_page_size: u64::MAX,
        }
    }

    /// Declare which fields hold ids, dates, booleans and joined entities
    pub fn with_schema(mut self, schema: EntitySchema) -> Self {
        self.schema = Arc::new(schema);
        self
    }

    pub fn with_max_page_size(mut self, max_page_size: u64) -> Self {
        self.max_page_size = max_page_size;
        self
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    fn normalizer(&self) -> Normalizer<'_> {
        Normalizer::new(self.backend.flavor(), &self.schema)
    }

    async fn run<T, F>(&self, task: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&B) -> Result<T> + Send + 'static,
    {
        let backend = Arc::clone(&self.backend);
        tokio::task::spawn_blocking(move || task(&backend))
            .await
            .map_err(|e| QueryError::Task(e.to_string()))?
    }

    fn request(&self, operations: &[Operation], options: &QueryOptions, id: Option<&str>) -> Result<FetchRequest> {
        let plan = JoinPlan::resolve(operations)?;
        options.validate(self.max_page_size)?;
        let normalizer = self.normalizer();
        let storage = normalizer.options(options)?;
        let by_id = match id {
            Some(id) => Some(normalizer.id_to_storage(API_ID, &Value::String(id.to_string()))?),
            None => None,
        };
        Ok(FetchRequest { collection: self.collection.clone(), plan, options: storage, by_id })
    }

    async fn fetch(&self, request: FetchRequest) -> Result<(Vec<Value>, u64, Option<Page>)> {
        let page = request.options.page;
        let result = self.run(move |backend| backend.fetch_joined(&request)).await?;
        debug!(entities = result.entities.len(), total = result.total, "Fetched");
        let entities = self.normalizer().many_to_api(&result.entities)?;
        Ok((entities, result.total, page))
    }

    /// Every root entity with its joins, unpaged
    #[tracing::instrument(skip_all, fields(collection = %self.collection))]
    pub async fn get_all(&self, operations: &[Operation]) -> Result<Vec<Value>> {
        let request = self.request(operations, &QueryOptions::default(), None)?;
        Ok(self.fetch(request).await?.0)
    }

    /// One page of joined root entities plus the filtered total
    #[tracing::instrument(skip_all, fields(collection = %self.collection))]
    pub async fn get(&self, operations: &[Operation], options: &QueryOptions) -> Result<PagedResult> {
        let request = self.request(operations, options, None)?;
        let (entities, total, page) = self.fetch(request).await?;
        Ok(PagedResult::new(entities, total, page))
    }

    /// One joined root entity; `None` when it does not exist or an inner join excludes it
    #[tracing::instrument(skip_all, fields(collection = %self.collection, id = %id))]
    pub async fn get_by_id(&self, operations: &[Operation], id: &str) -> Result<Option<Value>> {
        let request = self.request(operations, &QueryOptions::default(), Some(id))?;
        Ok(self.fetch(request).await?.0.into_iter().next())
    }

    /// Root entities only
    #[tracing::instrument(skip_all, fields(collection = %self.collection))]
    pub async fn find(&self, options: &QueryOptions) -> Result<Vec<Value>> {
        let request = self.request(&[], options, None)?;
        Ok(self.fetch(request).await?.0)
    }

    /// First root entity in sort order
    #[tracing::instrument(skip_all, fields(collection = %self.collection))]
    pub async fn find_one(&self, options: &QueryOptions) -> Result<Option<Value>> {
        let mut first = options.clone();
        first.page = Some(1);
        first.page_size = Some(1);
        let request = self.request(&[], &first, None)?;
        Ok(self.fetch(request).await?.0.into_iter().next())
    }

    #[tracing::instrument(skip_all, fields(collection = %self.collection))]
    pub async fn create(&self, entity: Value) -> Result<Value> {
        let mut created = self.create_many(vec![entity]).await?;
        created
            .pop()
            .ok_or_else(|| QueryError::Task("insert returned nothing".to_string()))
    }

    /// Insert all entities or none
    #[tracing::instrument(skip_all, fields(collection = %self.collection, count = entities.len()))]
    pub async fn create_many(&self, entities: Vec<Value>) -> Result<Vec<Value>> {
        let normalizer = self.normalizer();
        let native = entities
            .iter()
            .map(|entity| match normalizer.to_storage(entity)? {
                Value::Object(map) => Ok(map),
                other => Err(QueryError::invalid_identifier("<entity>", other)),
            })
            .collect::<Result<Vec<_>>>()?;

        let collection = self.collection.clone();
        let stored = self.run(move |backend| backend.insert_many(&collection, native)).await?;
        self.normalizer().many_to_api(&stored)
    }

    /// Merge `changes` into one entity; the primary key cannot change
    #[tracing::instrument(skip_all, fields(collection = %self.collection, id = %id))]
    pub async fn update(&self, id: &str, changes: Value) -> Result<Value> {
        let normalizer = self.normalizer();
        let native_id = normalizer.id_to_storage(API_ID, &Value::String(id.to_string()))?;
        let changes = self.native_changes(&changes)?;

        let collection = self.collection.clone();
        let updated = self
            .run(move |backend| backend.update_by_id(&collection, &native_id, changes))
            .await?;
        match updated {
            Some(stored) => self.normalizer().to_api(&stored),
            None => Err(self.not_found(id)),
        }
    }

    /// Merge `changes` into every entity matching the filters
    #[tracing::instrument(skip_all, fields(collection = %self.collection))]
    pub async fn batch_update(&self, options: &QueryOptions, changes: Value) -> Result<u64> {
        options.validate_for_write()?;
        let filters = self.normalizer().options(options)?.filters;
        let changes = self.native_changes(&changes)?;

        let collection = self.collection.clone();
        self.run(move |backend| backend.update_where(&collection, &filters, changes))
            .await
    }

    #[tracing::instrument(skip_all, fields(collection = %self.collection, id = %id))]
    pub async fn delete_by_id(&self, id: &str) -> Result<()> {
        let native_id = self
            .normalizer()
            .id_to_storage(API_ID, &Value::String(id.to_string()))?;

        let collection = self.collection.clone();
        let deleted = self.run(move |backend| backend.delete_by_id(&collection, &native_id)).await?;
        if deleted {
            Ok(())
        } else {
            Err(self.not_found(id))
        }
    }

    /// Delete every entity matching the filters
    #[tracing::instrument(skip_all, fields(collection = %self.collection))]
    pub async fn delete_many(&self, options: &QueryOptions) -> Result<u64> {
        options.validate_for_write()?;
        let filters = self.normalizer().options(options)?.filters;

        let collection = self.collection.clone();
        self.run(move |backend| backend.delete_where(&collection, &filters)).await
    }

    /// The native query `get` would run, without running it
    #[tracing::instrument(skip_all, fields(collection = %self.collection))]
    pub async fn explain(&self, operations: &[Operation], options: &QueryOptions) -> Result<Value> {
        let request = self.request(operations, options, None)?;
        self.run(move |backend| backend.explain(&request)).await
    }

    pub async fn ping(&self) -> Result<()> {
        self.run(|backend| backend.ping()).await
    }

    fn native_changes(&self, changes: &Value) -> Result<Map<String, Value>> {
        let Value::Object(mut native) = self.normalizer().to_storage(changes)? else {
            return Err(QueryError::invalid_identifier("<changes>", changes));
        };
        native.remove(self.backend.flavor().pk_name());
        Ok(native)
    }

    fn not_found(&self, id: &str) -> QueryError {
        QueryError::NotFound { collection: self.collection.clone(), id: id.to_string() }
    }
}
