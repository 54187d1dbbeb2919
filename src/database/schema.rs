use std::sync::Arc;

use arrow_array::types::Float32Type;
use arrow_array::{FixedSizeListArray, RecordBatch, StringArray};
use arrow_schema::{DataType, Field, Schema};

use crate::errors::MatchError;
use crate::profile::Profile;

/// Arrow schema for the `profiles` table. List-valued preference fields are
/// stored as JSON-encoded Utf8 columns; the embedding is a nullable
/// fixed-size vector column searchable by LanceDB.
pub fn profiles_schema(vector_size: i32) -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("user_id", DataType::Utf8, false),
        Field::new("display_name", DataType::Utf8, false),
        Field::new("profession", DataType::Utf8, false),
        Field::new("about_me", DataType::Utf8, false),
        Field::new("languages", DataType::Utf8, false),
        Field::new("interests", DataType::Utf8, false),
        Field::new("commute_start", DataType::Utf8, true),
        Field::new("commute_end", DataType::Utf8, true),
        Field::new("commute_days", DataType::Utf8, false),
        Field::new("embedding_text", DataType::Utf8, false),
        Field::new("embedding_version", DataType::Utf8, false),
        Field::new(
            "vector",
            DataType::FixedSizeList(
                Arc::new(Field::new("item", DataType::Float32, true)),
                vector_size,
            ),
            true,
        ),
    ]))
}

pub fn profiles_to_batch(
    profiles: &[Profile],
    schema: &Arc<Schema>,
    vector_size: i32,
) -> Result<RecordBatch, MatchError> {
    for profile in profiles {
        if let Some(embedding) = &profile.embedding {
            if embedding.len() != vector_size as usize {
                return Err(MatchError::Database(format!(
                    "embedding for {} has length {}, table expects {}",
                    profile.user_id,
                    embedding.len(),
                    vector_size
                )));
            }
        }
    }

    let json_column = |f: fn(&Profile) -> Result<String, serde_json::Error>| {
        profiles
            .iter()
            .map(f)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| MatchError::Database(e.to_string()))
    };

    let user_ids = Arc::new(StringArray::from_iter_values(
        profiles.iter().map(|p| p.user_id.as_str()),
    ));
    let display_names = Arc::new(StringArray::from_iter_values(
        profiles.iter().map(|p| p.display_name.as_str()),
    ));
    let professions = Arc::new(StringArray::from_iter_values(
        profiles.iter().map(|p| p.profession.as_str()),
    ));
    let about_mes = Arc::new(StringArray::from_iter_values(
        profiles.iter().map(|p| p.about_me.as_str()),
    ));
    let languages = Arc::new(StringArray::from(json_column(|p| {
        serde_json::to_string(&p.languages)
    })?));
    let interests = Arc::new(StringArray::from(json_column(|p| {
        serde_json::to_string(&p.interests)
    })?));
    let commute_starts = Arc::new(StringArray::from(
        profiles
            .iter()
            .map(|p| p.commute_window.as_ref().map(|w| w.start.clone()))
            .collect::<Vec<_>>(),
    ));
    let commute_ends = Arc::new(StringArray::from(
        profiles
            .iter()
            .map(|p| p.commute_window.as_ref().map(|w| w.end.clone()))
            .collect::<Vec<_>>(),
    ));
    let commute_days = Arc::new(StringArray::from(json_column(|p| {
        serde_json::to_string(&p.commute_days)
    })?));
    let embedding_texts = Arc::new(StringArray::from_iter_values(
        profiles.iter().map(|p| p.embedding_text.as_str()),
    ));
    let embedding_versions = Arc::new(StringArray::from_iter_values(
        profiles.iter().map(|p| p.embedding_version.as_str()),
    ));
    let vectors = Arc::new(FixedSizeListArray::from_iter_primitive::<Float32Type, _, _>(
        profiles.iter().map(|p| {
            p.embedding
                .as_ref()
                .map(|v| v.iter().copied().map(Some).collect::<Vec<_>>())
        }),
        vector_size,
    ));

    RecordBatch::try_new(
        schema.clone(),
        vec![
            user_ids,
            display_names,
            professions,
            about_mes,
            languages,
            interests,
            commute_starts,
            commute_ends,
            commute_days,
            embedding_texts,
            embedding_versions,
            vectors,
        ],
    )
    .map_err(MatchError::from)
}
