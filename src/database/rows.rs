use arrow_array::{Array, FixedSizeListArray, Float32Array, RecordBatch, StringArray};

use crate::errors::MatchError;
use crate::profile::{CommuteWindow, Profile, Weekday};

fn str_column<'a>(rb: &'a RecordBatch, name: &str) -> Result<&'a StringArray, MatchError> {
    rb.column_by_name(name)
        .ok_or_else(|| MatchError::Database(format!("column {name} not found")))?
        .as_any()
        .downcast_ref::<StringArray>()
        .ok_or_else(|| MatchError::Database(format!("column {name} has unexpected type")))
}

fn json_cell<T: serde::de::DeserializeOwned + Default>(
    column: &StringArray,
    row: usize,
) -> Result<T, MatchError> {
    let raw = column.value(row);
    if raw.is_empty() {
        return Ok(T::default());
    }
    serde_json::from_str(raw).map_err(|e| MatchError::Database(e.to_string()))
}

fn optional_cell(column: &StringArray, row: usize) -> Option<String> {
    if column.is_null(row) {
        None
    } else {
        Some(column.value(row).to_string())
    }
}

/// Decodes every row of a record batch back into profiles.
pub fn decode_profiles(rb: &RecordBatch) -> Result<Vec<Profile>, MatchError> {
    let user_ids = str_column(rb, "user_id")?;
    let display_names = str_column(rb, "display_name")?;
    let professions = str_column(rb, "profession")?;
    let about_mes = str_column(rb, "about_me")?;
    let languages = str_column(rb, "languages")?;
    let interests = str_column(rb, "interests")?;
    let commute_starts = str_column(rb, "commute_start")?;
    let commute_ends = str_column(rb, "commute_end")?;
    let commute_days = str_column(rb, "commute_days")?;
    let embedding_texts = str_column(rb, "embedding_text")?;
    let embedding_versions = str_column(rb, "embedding_version")?;
    let vectors = rb
        .column_by_name("vector")
        .ok_or_else(|| MatchError::Database("column vector not found".to_string()))?
        .as_any()
        .downcast_ref::<FixedSizeListArray>()
        .ok_or_else(|| MatchError::Database("column vector has unexpected type".to_string()))?;

    let mut profiles = Vec::with_capacity(rb.num_rows());
    for i in 0..rb.num_rows() {
        let commute_window = match (
            optional_cell(commute_starts, i),
            optional_cell(commute_ends, i),
        ) {
            (Some(start), Some(end)) => Some(CommuteWindow { start, end }),
            _ => None,
        };

        let embedding = if vectors.is_null(i) {
            None
        } else {
            let values = vectors.value(i);
            let floats = values
                .as_any()
                .downcast_ref::<Float32Array>()
                .ok_or_else(|| {
                    MatchError::Database("vector items have unexpected type".to_string())
                })?;
            Some(floats.values().to_vec())
        };

        profiles.push(Profile {
            user_id: user_ids.value(i).to_string(),
            display_name: display_names.value(i).to_string(),
            profession: professions.value(i).to_string(),
            about_me: about_mes.value(i).to_string(),
            languages: json_cell(languages, i)?,
            interests: json_cell(interests, i)?,
            commute_window,
            commute_days: json_cell::<Vec<Weekday>>(commute_days, i)?,
            embedding_text: embedding_texts.value(i).to_string(),
            embedding,
            embedding_version: embedding_versions.value(i).to_string(),
        });
    }

    Ok(profiles)
}

/// Extracts the ids and `_distance` column from a vector-search batch,
/// converting cosine distance into similarity.
pub fn decode_search_hits(rb: &RecordBatch) -> Result<Vec<(String, f32)>, MatchError> {
    let user_ids = str_column(rb, "user_id")?;
    let distances = rb
        .column_by_name("_distance")
        .ok_or_else(|| MatchError::Database("_distance column not found".to_string()))?
        .as_any()
        .downcast_ref::<Float32Array>()
        .ok_or_else(|| MatchError::Database("_distance column has unexpected type".to_string()))?;

    let mut hits = Vec::with_capacity(rb.num_rows());
    for i in 0..rb.num_rows() {
        hits.push((user_ids.value(i).to_string(), 1.0 - distances.value(i)));
    }
    Ok(hits)
}
