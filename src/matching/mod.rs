//! Trained-image lookup for a predicted label.
//!
//! Ranking is by label membership: images of the predicted label come back in
//! insertion order with a fixed descending score. No pixel comparison happens.

use anyhow::Result;
use serde::Serialize;

use crate::db::trained::TrainedImage;
use crate::db::Database;

/// Number of images returned when the predicted label has no trained images.
pub const FALLBACK_LIMIT: usize = 3;
const FALLBACK_SCORE: f64 = 0.5;
const TOP_SCORE: f64 = 0.95;
const RANK_STEP: f64 = 0.1;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MatchResult {
    pub filename: String,
    pub filepath: String,
    pub similarity_score: f64,
    pub feature_similarity: f64,
    pub color_similarity: f64,
    pub actual_label: String,
    pub fallback: bool,
}

impl MatchResult {
    fn scored(image: TrainedImage, score: f64, fallback: bool) -> Self {
        Self {
            filename: image.filename,
            filepath: image.filepath,
            similarity_score: score,
            feature_similarity: score,
            color_similarity: score,
            actual_label: image.label,
            fallback,
        }
    }
}

/// Score of the `rank`-th match (0-based).
fn rank_score(rank: usize) -> f64 {
    (TOP_SCORE - RANK_STEP * rank as f64).max(0.0)
}

pub fn find_matches(db: &Database, label: &str, top_k: usize) -> Result<Vec<MatchResult>> {
    let same_label = db.get_trained_images(label)?;
    if !same_label.is_empty() {
        return Ok(same_label
            .into_iter()
            .take(top_k)
            .enumerate()
            .map(|(rank, image)| MatchResult::scored(image, rank_score(rank), false))
            .collect());
    }

    tracing::debug!(label = %label, "No trained images for label, using fallback");
    Ok(db
        .get_any_trained_images(FALLBACK_LIMIT)?
        .into_iter()
        .map(|image| MatchResult::scored(image, FALLBACK_SCORE, true))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{test_db, ImageOrigin, NewModel};

    fn trained_db(dir: &std::path::Path, labels: &[(&str, usize)]) -> Database {
        let db = test_db(dir);
        let model_id = db
            .insert_model(&NewModel {
                name: "latest_model",
                filepath: "model/latest_model.json",
                artifact_sha256: "abc",
                num_classes: labels.len(),
                num_images: 0,
                validation_accuracy: None,
            })
            .unwrap();
        for (label, count) in labels {
            let ids: Vec<i64> = (0..*count)
                .map(|i| {
                    let name = format!("{label}{i}.jpg");
                    db.insert_labeled_image(&name, &name, label, ImageOrigin::Upload)
                        .unwrap()
                })
                .collect();
            db.move_images(label, &ids, model_id).unwrap();
        }
        db
    }

    #[test]
    fn test_same_label_ranked_scores() {
        let dir = tempfile::tempdir().unwrap();
        let db = trained_db(dir.path(), &[("cat", 5), ("dog", 2)]);

        let matches = find_matches(&db, "cat", 3).unwrap();
        let scores: Vec<f64> = matches.iter().map(|m| m.similarity_score).collect();

        assert_eq!(matches.len(), 3);
        for (got, want) in scores.iter().zip([0.95, 0.85, 0.75]) {
            assert!((got - want).abs() < 1e-9);
        }
        assert_eq!(matches[0].filename, "cat0.jpg");
        assert!(matches.iter().all(|m| m.actual_label == "cat" && !m.fallback));
        assert_eq!(matches[1].feature_similarity, matches[1].similarity_score);
    }

    #[test]
    fn test_scores_floor_at_zero() {
        assert_eq!(rank_score(20), 0.0);
    }

    #[test]
    fn test_unknown_label_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let db = trained_db(dir.path(), &[("cat", 2), ("dog", 2)]);

        let matches = find_matches(&db, "unknown-label", 3).unwrap();
        assert_eq!(matches.len(), 3);
        assert!(matches.iter().all(|m| m.fallback && m.similarity_score == 0.5));
        assert_eq!(matches[2].actual_label, "dog");
    }

    #[test]
    fn test_empty_trained_set() {
        let dir = tempfile::tempdir().unwrap();
        let db = test_db(dir.path());
        assert!(find_matches(&db, "cat", 3).unwrap().is_empty());
    }
}
