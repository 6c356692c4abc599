use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use meridian_ids::{BlobId, ResponseId, WorkerId};

/// A single worker's submission against a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub response_id: ResponseId,
    pub worker_id: WorkerId,
    pub submitted_at: DateTime<Utc>,
    pub processing_time_s: f64,
    pub accuracy_score: Option<f64>,
    pub speed_score: Option<f64>,
    pub output: serde_json::Value,
    pub output_blob_id: Option<BlobId>,
    pub error: Option<String>,
}

/// `score(r) = 0.7*accuracy + 0.3*speed` (§4.4.1). Exposed as a constant
/// pair rather than hard-coded so operators can retune without a rebuild
/// (the weights are asserted by the source without further justification).
pub const ACCURACY_WEIGHT: f64 = 0.7;
pub const SPEED_WEIGHT: f64 = 0.3;

pub fn score(response: &Response) -> Option<f64> {
    let accuracy = response.accuracy_score?;
    let speed = response.speed_score.unwrap_or(0.0);
    Some(ACCURACY_WEIGHT * accuracy + SPEED_WEIGHT * speed)
}

/// Pick the best response per §4.4.1: rank by `score` descending, break
/// ties by lower `processing_time_s`. If no response carries an accuracy
/// score, fall back to lowest `processing_time_s`. `None` for an empty set.
pub fn best_response(responses: &[Response]) -> Option<&Response> {
    if responses.is_empty() {
        return None;
    }
    if responses.iter().any(|r| r.accuracy_score.is_some()) {
        responses.iter().max_by(|a, b| {
            let sa = score(a).unwrap_or(f64::MIN);
            let sb = score(b).unwrap_or(f64::MIN);
            sa.partial_cmp(&sb)
                .unwrap()
                .then_with(|| b.processing_time_s.partial_cmp(&a.processing_time_s).unwrap())
        })
    } else {
        responses
            .iter()
            .min_by(|a, b| a.processing_time_s.partial_cmp(&b.processing_time_s).unwrap())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(worker: u64, accuracy: Option<f64>, speed: Option<f64>, time: f64) -> Response {
        Response {
            response_id: ResponseId::new(),
            worker_id: WorkerId::from(worker),
            submitted_at: Utc::now(),
            processing_time_s: time,
            accuracy_score: accuracy,
            speed_score: speed,
            output: serde_json::Value::Null,
            output_blob_id: None,
            error: None,
        }
    }

    #[test]
    fn best_response_picks_highest_weighted_score() {
        let responses = vec![
            response(1, Some(0.9), Some(0.8), 2.0),
            response(2, Some(0.8), Some(0.9), 1.5),
            response(3, Some(0.95), Some(0.7), 2.5),
        ];
        // scores: 0.7*0.9+0.3*0.8=0.87, 0.7*0.8+0.3*0.9=0.83, 0.7*0.95+0.3*0.7=0.875
        let best = best_response(&responses).unwrap();
        assert_eq!(best.worker_id, WorkerId::from(3));
    }

    #[test]
    fn best_response_is_commutative_with_arrival_order() {
        let forward = vec![
            response(1, Some(0.9), Some(0.8), 2.0),
            response(2, Some(0.8), Some(0.9), 1.5),
            response(3, Some(0.95), Some(0.7), 2.5),
        ];
        let mut shuffled = forward.clone();
        shuffled.reverse();
        assert_eq!(
            best_response(&forward).unwrap().worker_id,
            best_response(&shuffled).unwrap().worker_id
        );
    }

    #[test]
    fn ties_break_on_lower_processing_time() {
        let responses = vec![
            response(1, Some(0.9), Some(0.9), 3.0),
            response(2, Some(0.9), Some(0.9), 1.0),
        ];
        let best = best_response(&responses).unwrap();
        assert_eq!(best.worker_id, WorkerId::from(2));
    }

    #[test]
    fn falls_back_to_lowest_processing_time_without_accuracy() {
        let responses = vec![
            response(1, None, None, 3.0),
            response(2, None, None, 1.2),
            response(3, None, None, 5.0),
        ];
        let best = best_response(&responses).unwrap();
        assert_eq!(best.worker_id, WorkerId::from(2));
    }

    #[test]
    fn empty_response_set_has_no_best() {
        assert!(best_response(&[]).is_none());
    }
}
