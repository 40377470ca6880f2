use crate::models::{Assessment, FusedVerdict, Verdict};

/// Merge two model assessments: flagged if either flags, score is the mean of
/// both when at least one is non-zero
pub fn combine(density: Assessment, sequence: Assessment) -> Assessment {
    let score = if density.score != 0.0 || sequence.score != 0.0 {
        (density.score + sequence.score) / 2.0
    } else {
        0.0
    };

    Assessment {
        score,
        is_anomaly: density.is_anomaly || sequence.is_anomaly,
    }
}

/// Fuse the per-event density verdict with the sequence verdict attributed to
/// the same event, if any
pub fn fuse(density: &Verdict, sequence: Option<&Verdict>) -> FusedVerdict {
    let density_part = density.assessment();
    let sequence_part = sequence.map(Verdict::assessment).unwrap_or_default();
    let combined = combine(density_part, sequence_part);

    FusedVerdict {
        sequence_index: density.sequence_index,
        modality: density.modality.clone(),
        timestamp: density.timestamp.clone(),
        is_anomaly_density: density_part.is_anomaly,
        anomaly_score_density: density_part.score,
        is_anomaly_sequence: sequence_part.is_anomaly,
        anomaly_score_sequence: sequence_part.score,
        is_anomaly_combined: combined.is_anomaly,
        anomaly_score_combined: combined.score,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verdict(score: f64, is_anomaly: bool) -> Verdict {
        Verdict {
            modality: "touch_drag".to_string(),
            sequence_index: 4,
            timestamp: "2024-05-01T10:00:00Z".to_string(),
            score,
            is_anomaly,
        }
    }

    #[test]
    fn test_flag_is_or() {
        let fused = fuse(&verdict(0.1, false), Some(&verdict(0.9, true)));
        assert!(fused.is_anomaly_combined);
        assert!(!fused.is_anomaly_density);
        assert!(fused.is_anomaly_sequence);

        let fused = fuse(&verdict(0.1, false), Some(&verdict(0.9, false)));
        assert!(!fused.is_anomaly_combined);
    }

    #[test]
    fn test_score_is_mean_when_any_non_zero() {
        let fused = fuse(&verdict(-0.2, true), Some(&verdict(0.6, false)));
        assert!((fused.anomaly_score_combined - 0.2).abs() < 1e-12);

        let fused = fuse(&verdict(0.0, false), Some(&verdict(0.5, false)));
        assert_eq!(fused.anomaly_score_combined, 0.25);
    }

    #[test]
    fn test_both_zero_scores_combine_to_zero() {
        let fused = fuse(&verdict(0.0, false), Some(&verdict(0.0, true)));
        assert_eq!(fused.anomaly_score_combined, 0.0);
        assert!(fused.is_anomaly_combined);
    }

    #[test]
    fn test_missing_sequence_verdict_counts_as_neutral() {
        let fused = fuse(&verdict(-0.4, true), None);

        assert_eq!(fused.anomaly_score_sequence, 0.0);
        assert!(!fused.is_anomaly_sequence);
        assert_eq!(fused.anomaly_score_combined, -0.2);
        assert!(fused.is_anomaly_combined);
        assert_eq!(fused.sequence_index, 4);
        assert_eq!(fused.modality, "touch_drag");
    }
}
