use std::collections::BTreeSet;

use pof_core::{
    Cluster, DescriptorProfile, Opportunity, PainEvent, Post, Recommendation, ScoreBreakdown,
};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use uuid::Uuid;

use crate::{StoreError, StoreResult};

pub fn encode_vector(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub fn decode_vector(bytes: &[u8]) -> StoreResult<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return Err(StoreError::Corrupt(format!(
            "vector blob of {} bytes is not a multiple of 4",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

pub(crate) fn parse_uuid(raw: &str, column: &str) -> StoreResult<Uuid> {
    Uuid::parse_str(raw).map_err(|err| StoreError::Corrupt(format!("{column} `{raw}`: {err}")))
}

pub(crate) fn parse_enum<T>(raw: &str) -> StoreResult<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse::<T>().map_err(|err| StoreError::Corrupt(err.to_string()))
}

fn parse_json<T: serde::de::DeserializeOwned>(raw: &str, column: &str) -> StoreResult<T> {
    serde_json::from_str(raw).map_err(|err| StoreError::Corrupt(format!("{column}: {err}")))
}

pub(crate) fn to_json<T: serde::Serialize>(value: &T) -> StoreResult<String> {
    serde_json::to_string(value).map_err(|err| StoreError::Corrupt(err.to_string()))
}

pub(crate) fn post_from_row(row: &SqliteRow) -> StoreResult<Post> {
    Ok(Post {
        id: row.try_get("id")?,
        community: row.try_get("community")?,
        author: row.try_get("author")?,
        title: row.try_get("title")?,
        body: row.try_get("body")?,
        url: row.try_get("url")?,
        created_at: row.try_get("created_at")?,
    })
}

pub(crate) fn pain_event_from_row(row: &SqliteRow) -> StoreResult<PainEvent> {
    let id: String = row.try_get("id")?;
    let frequency: String = row.try_get("frequency")?;
    let sentiment: String = row.try_get("sentiment")?;
    let embedding: Option<Vec<u8>> = row.try_get("embedding")?;
    let stage: String = row.try_get("lifecycle_stage")?;
    let cluster_id: Option<String> = row.try_get("cluster_id")?;

    Ok(PainEvent {
        id: parse_uuid(&id, "pain_events.id")?,
        event_key: row.try_get("event_key")?,
        post_id: row.try_get("post_id")?,
        community: row.try_get("community")?,
        problem: row.try_get("problem")?,
        workaround: row.try_get("workaround")?,
        frequency: parse_enum(&frequency)?,
        sentiment: parse_json::<BTreeSet<String>>(&sentiment, "pain_events.sentiment")?,
        embedding: embedding.as_deref().map(decode_vector).transpose()?,
        lifecycle_stage: parse_enum(&stage)?,
        cluster_id: cluster_id
            .as_deref()
            .map(|raw| parse_uuid(raw, "pain_events.cluster_id"))
            .transpose()?,
        needs_recluster: row.try_get("needs_recluster")?,
        last_seen_pass: row.try_get("last_seen_pass")?,
        created_at: row.try_get("created_at")?,
        last_seen_at: row.try_get("last_seen_at")?,
    })
}

pub(crate) fn cluster_from_row(row: &SqliteRow) -> StoreResult<Cluster> {
    let id: String = row.try_get("id")?;
    let centroid: Vec<u8> = row.try_get("centroid")?;
    let status: String = row.try_get("status")?;
    let profile: String = row.try_get("profile")?;

    Ok(Cluster {
        id: parse_uuid(&id, "clusters.id")?,
        description: row.try_get("description")?,
        centroid: decode_vector(&centroid)?,
        member_count: row.try_get("member_count")?,
        active_count: row.try_get("active_count")?,
        status: parse_enum(&status)?,
        profile: parse_json::<DescriptorProfile>(&profile, "clusters.profile")?,
        last_reinforced_pass: row.try_get("last_reinforced_pass")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

pub(crate) fn opportunity_from_row(row: &SqliteRow) -> StoreResult<Opportunity> {
    let id: String = row.try_get("id")?;
    let cluster_id: String = row.try_get("cluster_id")?;
    let breakdown: String = row.try_get("score_breakdown")?;
    let outcome: Option<String> = row.try_get("recommendation")?;
    let reason: Option<String> = row.try_get("reason_code")?;
    let threshold: Option<f64> = row.try_get("rec_threshold")?;
    let observed: Option<f64> = row.try_get("rec_observed")?;

    let recommendation = match (outcome, reason) {
        (Some(outcome), Some(reason)) => Some(Recommendation {
            outcome: parse_enum(&outcome)?,
            reason: parse_enum(&reason)?,
            threshold: threshold.unwrap_or_default(),
            observed: observed.unwrap_or_default(),
        }),
        _ => None,
    };

    Ok(Opportunity {
        id: parse_uuid(&id, "opportunities.id")?,
        cluster_id: parse_uuid(&cluster_id, "opportunities.cluster_id")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        total_score: row.try_get("total_score")?,
        breakdown: parse_json::<ScoreBreakdown>(&breakdown, "opportunities.score_breakdown")?,
        recommendation,
        scored_pass: row.try_get("scored_pass")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vectors_survive_blob_encoding_bit_for_bit() {
        let values = vec![0.1f32, -3.75, f32::MIN_POSITIVE, 1.0e-7];
        let decoded = decode_vector(&encode_vector(&values)).expect("decode");
        let bits = |v: &[f32]| v.iter().map(|x| x.to_bits()).collect::<Vec<_>>();
        assert_eq!(bits(&decoded), bits(&values));
    }

    #[test]
    fn truncated_blob_is_corrupt() {
        assert!(matches!(decode_vector(&[0, 1, 2]), Err(StoreError::Corrupt(_))));
    }
}
