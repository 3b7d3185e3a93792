//! MongoDB document store.
//!
//! Documents cross the boundary as JSON. BSON dates are surfaced as RFC 3339
//! strings and written back as dates for `lastUpdated` fields; ObjectIds are
//! surfaced as their hex form and restored when addressing `_id`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use mongodb::bson::{self, Bson, Document, doc, oid::ObjectId};
use mongodb::error::ErrorKind;
use mongodb::options::{
    IndexOptions, InsertOneModel, ReplaceOneModel, UpdateOneModel, WriteModel,
};
use mongodb::{Client, Database, IndexModel};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use tracing::{debug, instrument};

use super::{
    BulkOperation, BulkWriteOptions, BulkWriteSummary, Comparable, DocumentStore, Filter,
    IndexSpec,
};
use crate::error::{StoreError, StoreResult};
use crate::types::{CollectionName, DocumentId, StoredDocument};

/// MongoDB server error codes for an index that already exists with other options.
const INDEX_ALREADY_EXISTS_CODES: [i32; 2] = [85, 86];

/// Connection settings for [`MongoStore`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MongoStoreConfig {
    /// Connection string, e.g. `mongodb://localhost:27017`.
    pub uri: String,
    /// Database holding the resource collections.
    pub database: String,
}

/// A [`DocumentStore`] backed by MongoDB.
#[derive(Debug, Clone)]
pub struct MongoStore {
    client: Client,
    database: Database,
}

impl MongoStore {
    /// Connects to MongoDB.
    pub async fn connect(config: &MongoStoreConfig) -> StoreResult<Self> {
        let client = Client::with_uri_str(&config.uri).await?;
        let database = client.database(&config.database);
        debug!(database = %config.database, "Connected to MongoDB");
        Ok(Self { client, database })
    }

    fn collection(&self, name: &CollectionName) -> mongodb::Collection<Document> {
        self.database.collection::<Document>(name.as_str())
    }

    fn to_write_model(&self, operation: BulkOperation) -> StoreResult<WriteModel> {
        let model = match operation {
            BulkOperation::UpdateOne {
                collection,
                id,
                update,
            } => {
                let mut modifications = Document::new();
                if !update.set.is_empty() {
                    let mut set = Document::new();
                    for (path, value) in update.set {
                        let leaf = path.rsplit('.').next().unwrap_or(&path).to_string();
                        set.insert(path, json_to_bson(value, Some(&leaf))?);
                    }
                    modifications.insert("$set", set);
                }
                if !update.unset.is_empty() {
                    let unset: Document = update
                        .unset
                        .into_iter()
                        .map(|path| (path, Bson::String(String::new())))
                        .collect();
                    modifications.insert("$unset", unset);
                }
                UpdateOneModel::builder()
                    .namespace(self.collection(&collection).namespace())
                    .filter(doc! { "_id": id_to_bson(&id) })
                    .update(modifications)
                    .build()
                    .into()
            }
            BulkOperation::ReplaceOne {
                collection,
                id,
                replacement,
            } => ReplaceOneModel::builder()
                .namespace(self.collection(&collection).namespace())
                .filter(doc! { "_id": id_to_bson(&id) })
                .replacement(json_to_document(replacement)?)
                .build()
                .into(),
            BulkOperation::InsertOne {
                collection,
                document,
            } => InsertOneModel::builder()
                .namespace(self.collection(&collection).namespace())
                .document(json_to_document(document)?)
                .build()
                .into(),
        };
        Ok(model)
    }
}

#[async_trait]
impl DocumentStore for MongoStore {
    fn backend_name(&self) -> &'static str {
        "mongodb"
    }

    async fn list_collections(&self) -> StoreResult<Vec<CollectionName>> {
        let mut names = self.database.list_collection_names().await?;
        names.sort();
        Ok(names.into_iter().map(CollectionName::from).collect())
    }

    async fn count(&self, collection: &CollectionName, filter: &Filter) -> StoreResult<u64> {
        Ok(self
            .collection(collection)
            .count_documents(filter_to_document(filter)?)
            .await?)
    }

    #[instrument(skip(self, filter, projection), fields(collection = %collection))]
    async fn find_page(
        &self,
        collection: &CollectionName,
        filter: &Filter,
        after_id: Option<&DocumentId>,
        limit: usize,
        projection: Option<&[String]>,
    ) -> StoreResult<Vec<StoredDocument>> {
        let filter = match after_id {
            Some(after) => filter.clone().and(Filter::IdGt(after.clone())),
            None => filter.clone(),
        };
        let coll = self.collection(collection);
        let mut find = coll
            .find(filter_to_document(&filter)?)
            .sort(doc! { "_id": 1 })
            .limit(i64::try_from(limit).unwrap_or(i64::MAX));
        if let Some(fields) = projection {
            let projection: Document = fields
                .iter()
                .map(|field| (field.clone(), Bson::Int32(1)))
                .collect();
            find = find.projection(projection);
        }
        let cursor = find.await?;
        let documents: Vec<Document> = cursor.try_collect().await?;
        documents.into_iter().map(document_to_stored).collect()
    }

    async fn find_one(
        &self,
        collection: &CollectionName,
        filter: &Filter,
    ) -> StoreResult<Option<StoredDocument>> {
        self.collection(collection)
            .find_one(filter_to_document(filter)?)
            .await?
            .map(document_to_stored)
            .transpose()
    }

    async fn bulk_write(
        &self,
        operations: Vec<BulkOperation>,
        options: BulkWriteOptions,
    ) -> StoreResult<BulkWriteSummary> {
        if operations.is_empty() {
            return Ok(BulkWriteSummary::default());
        }
        let collection = operations[0].collection().to_string();
        let models = operations
            .into_iter()
            .map(|op| self.to_write_model(op))
            .collect::<StoreResult<Vec<_>>>()?;

        let to_bulk_error = |err: mongodb::error::Error| StoreError::BulkWrite {
            collection: collection.clone(),
            message: err.to_string(),
        };

        let result = if options.transaction {
            let mut session = self.client.start_session().await?;
            session.start_transaction().await?;
            let result = self
                .client
                .bulk_write(models)
                .ordered(options.ordered)
                .session(&mut session)
                .await
                .map_err(to_bulk_error)?;
            session.commit_transaction().await?;
            result
        } else {
            self.client
                .bulk_write(models)
                .ordered(options.ordered)
                .await
                .map_err(to_bulk_error)?
        };

        Ok(BulkWriteSummary {
            matched: result.matched_count.max(0) as u64,
            modified: result.modified_count.max(0) as u64,
            inserted: result.inserted_count.max(0) as u64,
            upserted: result.upserted_count.max(0) as u64,
        })
    }

    async fn create_index(&self, collection: &CollectionName, index: &IndexSpec) -> StoreResult<()> {
        let model = IndexModel::builder()
            .keys(doc! { index.field.as_str(): 1 })
            .options(IndexOptions::builder().name(index.name.clone()).build())
            .build();
        match self.collection(collection).create_index(model).await {
            Ok(_) => Ok(()),
            Err(err) if command_code(&err).is_some_and(|c| INDEX_ALREADY_EXISTS_CODES.contains(&c)) => {
                debug!(collection = %collection, index = %index.name, "Index already exists");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn drop_index(&self, collection: &CollectionName, name: &str) -> StoreResult<()> {
        self.collection(collection).drop_index(name).await?;
        Ok(())
    }

    async fn index_exists(&self, collection: &CollectionName, name: &str) -> StoreResult<bool> {
        let names = self.collection(collection).list_index_names().await?;
        Ok(names.iter().any(|n| n == name))
    }
}

fn command_code(err: &mongodb::error::Error) -> Option<i32> {
    match err.kind.as_ref() {
        ErrorKind::Command(command) => Some(command.code),
        _ => None,
    }
}

fn id_to_bson(id: &DocumentId) -> Bson {
    if id.is_object_id()
        && let Ok(oid) = ObjectId::parse_str(id.as_str())
    {
        return Bson::ObjectId(oid);
    }
    Bson::String(id.as_str().to_string())
}

fn comparable_to_bson(value: &Comparable) -> Bson {
    match value {
        Comparable::Date(date) => Bson::DateTime(bson::DateTime::from_millis(date.timestamp_millis())),
        Comparable::Number(n) => Bson::Double(*n),
        Comparable::Text(s) => Bson::String(s.clone()),
    }
}

/// Converts a typed filter to a MongoDB query document.
pub(crate) fn filter_to_document(filter: &Filter) -> StoreResult<Document> {
    let document = match filter {
        Filter::All => Document::new(),
        Filter::And(inner) => doc! { "$and": filters_to_array(inner)? },
        Filter::Or(inner) => doc! { "$or": filters_to_array(inner)? },
        Filter::Eq { field, value } => {
            let leaf = field.rsplit('.').next().map(str::to_string);
            doc! { field.as_str(): json_to_bson(value.clone(), leaf.as_deref())? }
        }
        Filter::EqIgnoreCase { field, value } => doc! {
            field.as_str(): { "$regex": format!("^{}$", regex::escape(value)), "$options": "i" }
        },
        Filter::In { field, values } => {
            let values = values
                .iter()
                .map(|v| json_to_bson(v.clone(), None))
                .collect::<StoreResult<Vec<_>>>()?;
            doc! { field.as_str(): { "$in": values } }
        }
        Filter::Exists { field, exists } => doc! { field.as_str(): { "$exists": *exists } },
        Filter::SecurityTag {
            field,
            system,
            code,
        } => doc! {
            field.as_str(): { "$elemMatch": { "system": system.as_str(), "code": code.as_str() } }
        },
        Filter::StringLongerThan { field, length } => doc! {
            field.as_str(): { "$type": "string", "$regex": format!("^.{{{},}}$", length + 1) }
        },
        Filter::Gt { field, value } => doc! { field.as_str(): { "$gt": comparable_to_bson(value) } },
        Filter::Lt { field, value } => doc! { field.as_str(): { "$lt": comparable_to_bson(value) } },
        Filter::IdGte(id) => doc! { "_id": { "$gte": id_to_bson(id) } },
        Filter::IdGt(id) => doc! { "_id": { "$gt": id_to_bson(id) } },
    };
    Ok(document)
}

fn filters_to_array(filters: &[Filter]) -> StoreResult<Vec<Bson>> {
    filters
        .iter()
        .map(|f| filter_to_document(f).map(Bson::Document))
        .collect()
}

fn document_to_stored(mut document: Document) -> StoreResult<StoredDocument> {
    let id = match document.remove("_id") {
        Some(Bson::ObjectId(oid)) => DocumentId::new(oid.to_hex()),
        Some(Bson::String(s)) => DocumentId::new(s),
        Some(other) => DocumentId::new(other.to_string()),
        None => {
            return Err(StoreError::Serialization {
                message: "document without _id".to_string(),
            });
        }
    };
    Ok(StoredDocument::new(id, bson_to_json(Bson::Document(document))))
}

fn bson_to_json(value: Bson) -> Value {
    match value {
        Bson::Document(document) => Value::Object(
            document
                .into_iter()
                .map(|(k, v)| (k, bson_to_json(v)))
                .collect::<Map<String, Value>>(),
        ),
        Bson::Array(items) => Value::Array(items.into_iter().map(bson_to_json).collect()),
        Bson::String(s) => Value::String(s),
        Bson::Boolean(b) => Value::Bool(b),
        Bson::Null | Bson::Undefined => Value::Null,
        Bson::Int32(n) => Value::from(n),
        Bson::Int64(n) => Value::from(n),
        Bson::Double(n) => Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null),
        Bson::ObjectId(oid) => Value::String(oid.to_hex()),
        Bson::DateTime(dt) => DateTime::<Utc>::from_timestamp_millis(dt.timestamp_millis())
            .map(|d| Value::String(d.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)))
            .unwrap_or(Value::Null),
        other => other.into_relaxed_extjson(),
    }
}

/// Converts JSON to BSON. `key` is the field name the value is stored under.
fn json_to_bson(value: Value, key: Option<&str>) -> StoreResult<Bson> {
    let bson = match value {
        Value::Null => Bson::Null,
        Value::Bool(b) => Bson::Boolean(b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => i32::try_from(i).map(Bson::Int32).unwrap_or(Bson::Int64(i)),
            None => Bson::Double(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => {
            if key == Some("lastUpdated")
                && let Ok(date) = DateTime::parse_from_rfc3339(&s)
            {
                Bson::DateTime(bson::DateTime::from_millis(date.timestamp_millis()))
            } else {
                Bson::String(s)
            }
        }
        Value::Array(items) => Bson::Array(
            items
                .into_iter()
                .map(|item| json_to_bson(item, None))
                .collect::<StoreResult<Vec<_>>>()?,
        ),
        Value::Object(map) => {
            let mut document = Document::new();
            for (k, v) in map {
                let converted = json_to_bson(v, Some(&k))?;
                document.insert(k, converted);
            }
            Bson::Document(document)
        }
    };
    Ok(bson)
}

fn json_to_document(value: Value) -> StoreResult<Document> {
    match json_to_bson(value, None)? {
        Bson::Document(mut document) => {
            if let Some(Bson::String(id)) = document.get("_id").cloned() {
                document.insert("_id", id_to_bson(&DocumentId::new(id)));
            }
            Ok(document)
        }
        other => Err(StoreError::Serialization {
            message: format!("expected a JSON object, got {other}"),
        }),
    }
}
