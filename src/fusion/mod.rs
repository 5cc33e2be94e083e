use crate::config::FusionConfig;
use crate::detection::{AlarmRequest, AlarmType, DetectionCandidate};
use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use log::debug;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

/// Merges per-camera detection candidates into deduplicated alarm requests.
///
/// Candidates are partitioned by area id. Within one area, candidates of the
/// same type captured within the dedup window are one physical incident:
/// a second camera corroborates the first and the pair is emitted fused.
/// Non-corroborated candidates are held for the window and then either emitted
/// (at or above the single-camera floor) or discarded as noise. The engine
/// only emits requests; persisting alarms is the lifecycle engine's job.
pub struct FusionEngine {
    config: FusionConfig,
    state: Mutex<FusionState>,
}

#[derive(Default)]
struct FusionState {
    areas: HashMap<Uuid, AreaState>,
    /// Rolling per-camera false-positive rate (exponential moving average)
    camera_fp: HashMap<Uuid, f64>,
}

#[derive(Default)]
struct AreaState {
    held: Vec<HeldCandidate>,
    recent: Vec<RecentIncident>,
}

struct HeldCandidate {
    candidate: DetectionCandidate,
    held_until: DateTime<Utc>,
    /// Lower-severity detections folded into this one on cross-type collision
    suppressed: Vec<serde_json::Value>,
}

struct RecentIncident {
    event_type: AlarmType,
    emitted_at: DateTime<Utc>,
}

impl FusionEngine {
    pub fn new(config: FusionConfig) -> Self {
        Self {
            config,
            state: Mutex::new(FusionState::default()),
        }
    }

    fn window(&self) -> Duration {
        Duration::milliseconds(self.config.window_ms as i64)
    }

    /// Probabilistic OR of two detector confidences; never below the max input
    fn combine(c1: f64, c2: f64) -> f64 {
        c1 + c2 - c1 * c2
    }

    fn mean_fp_rate(state: &FusionState, camera_ids: &[Uuid]) -> f64 {
        if camera_ids.is_empty() {
            return 0.0;
        }
        let sum: f64 = camera_ids
            .iter()
            .map(|id| state.camera_fp.get(id).copied().unwrap_or(0.0))
            .sum();
        sum / camera_ids.len() as f64
    }

    fn reliability(&self, confidence: f64, cameras: usize, mean_fp: f64) -> f64 {
        let corroboration = 1.0 + self.config.corroboration_bonus * (cameras as f64 - 1.0);
        (confidence * corroboration * (1.0 - mean_fp)).clamp(0.0, 1.0)
    }

    /// Feed back a caregiver decision so camera track records influence the
    /// reliability of future detections
    pub fn record_outcome(&self, camera_ids: &[Uuid], false_positive: bool) {
        let mut state = self.state.lock().unwrap();
        let observed = if false_positive { 1.0 } else { 0.0 };
        let alpha = self.config.fp_rate_alpha;
        for camera_id in camera_ids {
            let rate = state.camera_fp.entry(*camera_id).or_insert(0.0);
            *rate = alpha * observed + (1.0 - alpha) * *rate;
        }
    }

    /// Admit one candidate. Returns an alarm request when the candidate
    /// completes an incident (corroborated pair or manual emergency); held
    /// candidates surface later through `flush_expired`.
    pub fn ingest(&self, candidate: DetectionCandidate) -> Result<Option<AlarmRequest>> {
        candidate.validate()?;

        let window = self.window();
        let captured_at = candidate.captured_at;
        let mut state = self.state.lock().unwrap();
        let area = state.areas.entry(candidate.area_id).or_default();

        area.recent
            .retain(|r| captured_at - r.emitted_at <= window);
        if area
            .recent
            .iter()
            .any(|r| r.event_type == candidate.event_type)
        {
            debug!(
                "Suppressing duplicate {} detection in area {} (incident already emitted)",
                candidate.event_type, candidate.area_id
            );
            return Ok(None);
        }

        // Same camera re-reporting inside the window refreshes the held
        // candidate instead of counting as corroboration
        if let Some(held) = area.held.iter_mut().find(|h| {
            h.candidate.event_type == candidate.event_type
                && h.candidate.camera_id == candidate.camera_id
                && within(h.candidate.captured_at, captured_at, window)
        }) {
            if candidate.confidence > held.candidate.confidence {
                held.candidate.confidence = candidate.confidence;
            }
            return Ok(None);
        }

        // Cross-type collision: higher severity wins, the loser is carried in
        // context rather than dropped silently
        let mut candidate = candidate;
        let mut suppressed: Vec<serde_json::Value> = Vec::new();
        if let Some(index) = area.held.iter().position(|h| {
            h.candidate.event_type != candidate.event_type
                && within(h.candidate.captured_at, captured_at, window)
        }) {
            let other = &area.held[index];
            if candidate.event_type.severity() >= other.candidate.event_type.severity() {
                let loser = area.held.remove(index);
                suppressed.push(suppressed_summary(&loser.candidate));
                suppressed.extend(loser.suppressed);
            } else {
                let winner = &mut area.held[index];
                winner.suppressed.push(suppressed_summary(&candidate));
                debug!(
                    "Folding lower-severity {} detection into held {} incident",
                    candidate.event_type, winner.candidate.event_type
                );
                return Ok(None);
            }
        }

        // Corroborating second camera, same type
        if let Some(index) = area.held.iter().position(|h| {
            h.candidate.event_type == candidate.event_type
                && h.candidate.camera_id != candidate.camera_id
                && within(h.candidate.captured_at, captured_at, window)
        }) {
            let partner = area.held.remove(index);
            let fused = Self::combine(partner.candidate.confidence, candidate.confidence);
            if fused >= self.config.joint_floor {
                area.recent.push(RecentIncident {
                    event_type: candidate.event_type,
                    emitted_at: captured_at,
                });
                let mut all_suppressed = partner.suppressed.clone();
                all_suppressed.append(&mut suppressed);
                let request = build_request(
                    &[&partner.candidate, &candidate],
                    fused,
                    all_suppressed,
                );
                let mean_fp = Self::mean_fp_rate(&state, &request.camera_ids);
                let mut request = request;
                request.reliability = self.reliability(fused, 2, mean_fp);
                return Ok(Some(request));
            }
            // Fused pair still under the joint floor: keep holding both
            let held_until = captured_at + window;
            if let Some(area) = state.areas.get_mut(&candidate.area_id) {
                area.held.extend([
                    partner,
                    HeldCandidate {
                        candidate,
                        held_until,
                        suppressed,
                    },
                ]);
            }
            return Ok(None);
        }

        // Manual emergencies are operator-triggered and never wait for
        // corroboration
        if candidate.event_type == AlarmType::ManualEmergency {
            area.recent.push(RecentIncident {
                event_type: candidate.event_type,
                emitted_at: captured_at,
            });
            let confidence = candidate.confidence;
            let request = build_request(&[&candidate], confidence, suppressed);
            let mean_fp = Self::mean_fp_rate(&state, &request.camera_ids);
            let mut request = request;
            request.reliability = self.reliability(confidence, 1, mean_fp);
            return Ok(Some(request));
        }

        let held_until = captured_at + window;
        if let Some(area) = state.areas.get_mut(&candidate.area_id) {
            area.held.push(HeldCandidate {
                candidate,
                held_until,
                suppressed,
            });
        }
        Ok(None)
    }

    /// Emit or discard held candidates whose fuse window has closed: singles
    /// at or above the floor become requests, the rest are noise.
    pub fn flush_expired(&self, now: DateTime<Utc>) -> Vec<AlarmRequest> {
        let mut state = self.state.lock().unwrap();
        let min_confidence = self.config.min_confidence;

        let mut requests = Vec::new();
        let mut emitted: Vec<(Uuid, AlarmType, DateTime<Utc>)> = Vec::new();
        for (area_id, area) in state.areas.iter_mut() {
            let matured: Vec<HeldCandidate> = {
                let (done, keep) = std::mem::take(&mut area.held)
                    .into_iter()
                    .partition(|h| h.held_until <= now);
                area.held = keep;
                done
            };
            for held in matured {
                if held.candidate.confidence >= min_confidence {
                    emitted.push((*area_id, held.candidate.event_type, held.candidate.captured_at));
                    let confidence = held.candidate.confidence;
                    let request = build_request(&[&held.candidate], confidence, held.suppressed);
                    requests.push(request);
                } else {
                    debug!(
                        "Discarding {} detection from camera {} as noise (confidence {:.2})",
                        held.candidate.event_type, held.candidate.camera_id, held.candidate.confidence
                    );
                }
            }
        }
        for (area_id, event_type, emitted_at) in emitted {
            if let Some(area) = state.areas.get_mut(&area_id) {
                area.recent.push(RecentIncident {
                    event_type,
                    emitted_at,
                });
            }
        }
        for request in &mut requests {
            let mean_fp = Self::mean_fp_rate(&state, &request.camera_ids);
            request.reliability = self.reliability(request.confidence, 1, mean_fp);
        }
        requests
    }
}

fn within(a: DateTime<Utc>, b: DateTime<Utc>, window: Duration) -> bool {
    (a - b).abs() <= window
}

fn suppressed_summary(candidate: &DetectionCandidate) -> serde_json::Value {
    json!({
        "camera_id": candidate.camera_id,
        "event_type": candidate.event_type,
        "confidence": candidate.confidence,
        "captured_at": candidate.captured_at,
    })
}

fn build_request(
    candidates: &[&DetectionCandidate],
    confidence: f64,
    suppressed: Vec<serde_json::Value>,
) -> AlarmRequest {
    let first = candidates[0];
    let earliest = candidates
        .iter()
        .map(|c| c.captured_at)
        .min()
        .unwrap_or(first.captured_at);
    let sources: Vec<serde_json::Value> = candidates
        .iter()
        .map(|c| {
            json!({
                "camera_id": c.camera_id,
                "confidence": c.confidence,
                "captured_at": c.captured_at,
                "bounding_boxes": c.bounding_boxes,
                "context": c.context,
            })
        })
        .collect();

    AlarmRequest {
        subject_id: first.subject_id,
        area_id: first.area_id,
        camera_ids: candidates.iter().map(|c| c.camera_id).collect(),
        event_type: first.event_type,
        confidence,
        reliability: confidence,
        captured_at: earliest,
        context: json!({
            "sources": sources,
            "suppressed_detections": suppressed,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FusionConfig;

    fn engine() -> FusionEngine {
        FusionEngine::new(FusionConfig::default())
    }

    fn candidate(
        camera: Uuid,
        area: Uuid,
        subject: Uuid,
        event_type: AlarmType,
        confidence: f64,
        at: DateTime<Utc>,
    ) -> DetectionCandidate {
        DetectionCandidate {
            camera_id: camera,
            area_id: area,
            subject_id: subject,
            event_type,
            confidence,
            captured_at: at,
            bounding_boxes: None,
            context: None,
        }
    }

    #[test]
    fn corroborated_pair_fuses_into_one_request() {
        let engine = engine();
        let area = Uuid::new_v4();
        let subject = Uuid::new_v4();
        let cam_a = Uuid::new_v4();
        let cam_b = Uuid::new_v4();
        let t0 = Utc::now();

        let first = engine
            .ingest(candidate(cam_a, area, subject, AlarmType::Fall, 0.6, t0))
            .unwrap();
        assert!(first.is_none());

        let fused = engine
            .ingest(candidate(
                cam_b,
                area,
                subject,
                AlarmType::Fall,
                0.55,
                t0 + Duration::milliseconds(1200),
            ))
            .unwrap()
            .expect("pair should fuse");

        assert_eq!(fused.camera_ids.len(), 2);
        assert!(fused.confidence >= 0.6);
        assert!((fused.confidence - 0.82).abs() < 1e-9);
        // corroboration bonus shows up in reliability
        assert!(fused.reliability > fused.confidence);
        assert_eq!(fused.event_type, AlarmType::Fall);

        // a third report of the same incident is suppressed, not duplicated
        let third = engine
            .ingest(candidate(
                cam_a,
                area,
                subject,
                AlarmType::Fall,
                0.9,
                t0 + Duration::milliseconds(3000),
            ))
            .unwrap();
        assert!(third.is_none());
    }

    #[test]
    fn single_above_floor_emits_on_flush() {
        let engine = engine();
        let area = Uuid::new_v4();
        let t0 = Utc::now();
        let held = engine
            .ingest(candidate(
                Uuid::new_v4(),
                area,
                Uuid::new_v4(),
                AlarmType::Fall,
                0.7,
                t0,
            ))
            .unwrap();
        assert!(held.is_none());

        assert!(engine.flush_expired(t0 + Duration::seconds(1)).is_empty());
        let flushed = engine.flush_expired(t0 + Duration::seconds(6));
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].camera_ids.len(), 1);
        assert!((flushed[0].confidence - 0.7).abs() < 1e-9);
    }

    #[test]
    fn single_below_floor_is_noise() {
        let engine = engine();
        let t0 = Utc::now();
        engine
            .ingest(candidate(
                Uuid::new_v4(),
                Uuid::new_v4(),
                Uuid::new_v4(),
                AlarmType::Fall,
                0.2,
                t0,
            ))
            .unwrap();
        assert!(engine.flush_expired(t0 + Duration::seconds(6)).is_empty());
    }

    #[test]
    fn weak_pair_clears_joint_floor_together() {
        // 0.28 and 0.25 are both below min_confidence (0.45); fused they reach
        // 0.46 which clears the joint floor (0.35)
        let engine = engine();
        let area = Uuid::new_v4();
        let subject = Uuid::new_v4();
        let t0 = Utc::now();
        engine
            .ingest(candidate(
                Uuid::new_v4(),
                area,
                subject,
                AlarmType::Seizure,
                0.28,
                t0,
            ))
            .unwrap();
        let fused = engine
            .ingest(candidate(
                Uuid::new_v4(),
                area,
                subject,
                AlarmType::Seizure,
                0.25,
                t0 + Duration::seconds(2),
            ))
            .unwrap()
            .expect("joint floor corroboration");
        assert!(fused.confidence >= 0.28);
        assert!(fused.confidence >= engine.config.joint_floor);
    }

    #[test]
    fn cross_type_collision_prefers_higher_severity() {
        let engine = engine();
        let area = Uuid::new_v4();
        let subject = Uuid::new_v4();
        let t0 = Utc::now();
        engine
            .ingest(candidate(
                Uuid::new_v4(),
                area,
                subject,
                AlarmType::Fall,
                0.6,
                t0,
            ))
            .unwrap();
        engine
            .ingest(candidate(
                Uuid::new_v4(),
                area,
                subject,
                AlarmType::Seizure,
                0.7,
                t0 + Duration::seconds(1),
            ))
            .unwrap();

        let flushed = engine.flush_expired(t0 + Duration::seconds(7));
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].event_type, AlarmType::Seizure);
        let suppressed = flushed[0].context["suppressed_detections"]
            .as_array()
            .unwrap();
        assert_eq!(suppressed.len(), 1);
        assert_eq!(suppressed[0]["event_type"], "fall");
    }

    #[test]
    fn manual_emergency_emits_immediately() {
        let engine = engine();
        let request = engine
            .ingest(candidate(
                Uuid::new_v4(),
                Uuid::new_v4(),
                Uuid::new_v4(),
                AlarmType::ManualEmergency,
                1.0,
                Utc::now(),
            ))
            .unwrap();
        assert!(request.is_some());
    }

    #[test]
    fn false_positive_feedback_lowers_reliability() {
        let engine = engine();
        let area = Uuid::new_v4();
        let subject = Uuid::new_v4();
        let camera = Uuid::new_v4();
        let t0 = Utc::now();

        engine.record_outcome(&[camera], true);
        engine.record_outcome(&[camera], true);

        engine
            .ingest(candidate(camera, area, subject, AlarmType::Fall, 0.8, t0))
            .unwrap();
        let flushed = engine.flush_expired(t0 + Duration::seconds(6));
        assert_eq!(flushed.len(), 1);
        assert!(flushed[0].reliability < flushed[0].confidence);
    }

    #[test]
    fn rejects_invalid_confidence() {
        let engine = engine();
        let result = engine.ingest(candidate(
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            AlarmType::Fall,
            1.5,
            Utc::now(),
        ));
        assert!(result.is_err());
    }
}
