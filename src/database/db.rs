use std::sync::Arc;

use arrow::record_batch::RecordBatchIterator;
use arrow_array::RecordBatch;
use arrow_schema::Schema;
use async_trait::async_trait;
use futures::StreamExt;
use lancedb::query::{ExecutableQuery, QueryBase};
use lancedb::{connect, Connection, DistanceType, Table};
use tracing::{debug, info};

use super::rows::{decode_profiles, decode_search_hits};
use super::schema::{profiles_schema, profiles_to_batch};
use crate::errors::MatchError;
use crate::profile::Profile;
use crate::store::{ProfileStore, ScoredId, UserDirectory, VectorIndex};

const TABLE_NAME: &str = "profiles";
const MISSING_EMBEDDING_FILTER: &str = "vector IS NULL OR embedding_text = ''";

/// LanceDB-backed profile store and vector index. One table holds both the
/// preference fields and the embedding column, so the same adapter serves
/// `ProfileStore`, `VectorIndex`, and `UserDirectory`.
pub struct VectorDB {
    #[allow(dead_code)]
    connection: Connection,
    table: Table,
    schema: Arc<Schema>,
    vector_size: i32,
}

impl VectorDB {
    pub async fn new(db_path: &str, vector_size: i32) -> Result<Self, MatchError> {
        let connection = connect(db_path).execute().await?;
        let schema = profiles_schema(vector_size);

        let table = match connection.open_table(TABLE_NAME).execute().await {
            Ok(table) => table,
            Err(e) if e.to_string().contains("Table not found") => {
                info!("profiles table not found, creating an empty one");
                let empty: Vec<Result<RecordBatch, arrow_schema::ArrowError>> = Vec::new();
                connection
                    .create_table(
                        TABLE_NAME,
                        Box::new(RecordBatchIterator::new(empty, schema.clone())),
                    )
                    .execute()
                    .await?
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            connection,
            table,
            schema,
            vector_size,
        })
    }

    /// Replaces the whole table contents with the given profiles. Used by
    /// the seed import path.
    pub async fn replace_all(&self, profiles: &[Profile]) -> Result<(), MatchError> {
        self.table.delete("true").await?;
        if profiles.is_empty() {
            return Ok(());
        }
        let batch = profiles_to_batch(profiles, &self.schema, self.vector_size)?;
        self.table
            .add(Box::new(RecordBatchIterator::new(
                vec![Ok(batch)],
                self.schema.clone(),
            )))
            .execute()
            .await?;
        info!(count = profiles.len(), "profiles imported");
        Ok(())
    }

    async fn query_profiles(
        &self,
        filter: &str,
        limit: Option<usize>,
    ) -> Result<Vec<Profile>, MatchError> {
        let mut query = self.table.query().only_if(filter.to_string());
        if let Some(limit) = limit {
            query = query.limit(limit);
        }
        let mut results = query.execute().await?;

        let mut profiles = Vec::new();
        while let Some(Ok(rb)) = results.next().await {
            profiles.extend(decode_profiles(&rb)?);
        }
        Ok(profiles)
    }
}

fn sql_quote(value: &str) -> String {
    value.replace('\'', "''")
}

#[async_trait]
impl ProfileStore for VectorDB {
    async fn get_profile(&self, user_id: &str) -> Result<Option<Profile>, MatchError> {
        let filter = format!("user_id = '{}'", sql_quote(user_id));
        let mut profiles = self.query_profiles(&filter, Some(1)).await?;
        Ok(profiles.pop())
    }

    async fn get_profiles(&self, user_ids: &[String]) -> Result<Vec<Profile>, MatchError> {
        if user_ids.is_empty() {
            return Ok(Vec::new());
        }
        let quoted: Vec<String> = user_ids
            .iter()
            .map(|id| format!("'{}'", sql_quote(id)))
            .collect();
        let filter = format!("user_id IN ({})", quoted.join(", "));
        self.query_profiles(&filter, None).await
    }

    async fn profiles_missing_embedding(
        &self,
        limit: usize,
    ) -> Result<Vec<Profile>, MatchError> {
        self.query_profiles(MISSING_EMBEDDING_FILTER, Some(limit))
            .await
    }

    async fn upsert_profile(&self, profile: &Profile) -> Result<(), MatchError> {
        self.table
            .delete(&format!("user_id = '{}'", sql_quote(&profile.user_id)))
            .await?;
        let batch = profiles_to_batch(std::slice::from_ref(profile), &self.schema, self.vector_size)?;
        self.table
            .add(Box::new(RecordBatchIterator::new(
                vec![Ok(batch)],
                self.schema.clone(),
            )))
            .execute()
            .await?;
        debug!(user_id = %profile.user_id, "profile upserted");
        Ok(())
    }

    async fn update_embedding(
        &self,
        user_id: &str,
        text: &str,
        vector: &[f32],
        version: &str,
    ) -> Result<(), MatchError> {
        let mut profile = self
            .get_profile(user_id)
            .await?
            .ok_or_else(|| MatchError::ProfileNotFound(user_id.to_string()))?;

        profile.embedding_text = text.to_string();
        profile.embedding = Some(vector.to_vec());
        profile.embedding_version = version.to_string();
        self.upsert_profile(&profile).await
    }

    async fn count_profiles(&self) -> Result<usize, MatchError> {
        Ok(self.table.count_rows(None).await?)
    }

    async fn count_profiles_with_embedding(&self) -> Result<usize, MatchError> {
        Ok(self
            .table
            .count_rows(Some("vector IS NOT NULL".to_string()))
            .await?)
    }
}

#[async_trait]
impl VectorIndex for VectorDB {
    #[tracing::instrument(skip(self, query))]
    async fn top_k(&self, query: &[f32], k: usize) -> Result<Vec<ScoredId>, MatchError> {
        let mut results = self
            .table
            .vector_search(query.to_vec())?
            .distance_type(DistanceType::Cosine)
            .limit(k)
            .execute()
            .await?;

        let mut hits = Vec::new();
        while let Some(Ok(rb)) = results.next().await {
            for (user_id, similarity) in decode_search_hits(&rb)? {
                hits.push(ScoredId {
                    user_id,
                    similarity,
                });
            }
        }
        debug!(hits = hits.len(), "vector search complete");
        Ok(hits)
    }
}

#[async_trait]
impl UserDirectory for VectorDB {
    async fn display_name(&self, user_id: &str) -> Result<Option<String>, MatchError> {
        Ok(self
            .get_profile(user_id)
            .await?
            .map(|p| p.display_name)
            .filter(|name| !name.is_empty()))
    }
}
