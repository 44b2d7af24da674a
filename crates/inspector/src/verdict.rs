//! Turns the inference peer's loosely-typed JSON into an inspection result.
//!
//! Nothing here does I/O; the same input always yields the same interpretation.

use schema::{Camera, DetectionRecord, InspectionResult};
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::str::FromStr;
use thiserror::Error;

pub const REASON_NO_RESPONSE: &str = "no response";
pub const REASON_UNPARSEABLE: &str = "unparseable response";
pub const REASON_NOT_RECOGNIZED: &str = "object not recognized";
pub const REASON_INFERENCE_UNAVAILABLE: &str = "inference unavailable";

/// Label used in a reason when a camera is defective but reported no label.
const FALLBACK_DEFECT_LABEL: &str = "defect";

/// How detections and the peer's overall verdict are reconciled once at least
/// one detection exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VerdictPolicy {
    /// The peer's verdict decides; detections only shape the reason text.
    #[default]
    PeerVerdict,
    /// Any detection turns a `Normal` verdict into `Defect`.
    AnyDetectionIsDefect,
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("unknown verdict policy `{0}`, expected `peer` or `any-detection`")]
pub struct UnknownPolicy(String);

impl FromStr for VerdictPolicy {
    type Err = UnknownPolicy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "peer" | "peer-verdict" => Ok(VerdictPolicy::PeerVerdict),
            "any-detection" | "any-detection-is-defect" => Ok(VerdictPolicy::AnyDetectionIsDefect),
            other => Err(UnknownPolicy(other.to_string())),
        }
    }
}

/// One `[label, score, ...]` row as reported by the peer.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerDetection {
    pub label: String,
    pub confidence: Option<f32>,
}

/// The peer response. Every field is optional and absent fields take their
/// default: no verdict, no sub-verdicts, empty detection lists.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct InferenceVerdict {
    #[serde(deserialize_with = "lenient_string")]
    pub result: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub top_result: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub side_result: Option<String>,
    #[serde(rename = "det_top", deserialize_with = "detection_rows")]
    pub top: Vec<PeerDetection>,
    #[serde(rename = "det_side", deserialize_with = "detection_rows")]
    pub side: Vec<PeerDetection>,
}

impl InferenceVerdict {
    fn sub_verdict(&self, camera: Camera) -> Option<&str> {
        match camera {
            Camera::Top => self.top_result.as_deref(),
            Camera::Side => self.side_result.as_deref(),
        }
    }

    fn detections(&self, camera: Camera) -> &[PeerDetection] {
        match camera {
            Camera::Top => &self.top,
            Camera::Side => &self.side,
        }
    }
}

/// What the bridge concluded from one peer response.
#[derive(Debug, Clone, PartialEq)]
pub struct Interpretation {
    pub result: InspectionResult,
    pub reason: String,
    pub detections: Vec<DetectionRecord>,
}

impl Interpretation {
    pub fn error(reason: &str) -> Self {
        Self {
            result: InspectionResult::Error,
            reason: reason.to_string(),
            detections: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct VerdictInterpreter {
    policy: VerdictPolicy,
}

impl VerdictInterpreter {
    pub fn new(policy: VerdictPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> VerdictPolicy {
        self.policy
    }

    /// Interprets a dual-camera response. Never fails: malformed input becomes
    /// an `Error` interpretation with a fixed reason.
    pub fn interpret(&self, raw: &str) -> Interpretation {
        match parse(raw) {
            Ok(verdict) => self.reconcile(&verdict),
            Err(reason) => Interpretation::error(reason),
        }
    }

    /// Interprets a single-camera response. The peer only sends the overall
    /// verdict there, so it stands in for the missing sub-verdict of `camera`.
    pub fn interpret_single(&self, raw: &str, camera: Camera) -> Interpretation {
        match parse(raw) {
            Ok(mut verdict) => {
                let sub = match camera {
                    Camera::Top => &mut verdict.top_result,
                    Camera::Side => &mut verdict.side_result,
                };
                if sub.is_none() {
                    *sub = verdict.result.clone();
                }
                self.reconcile(&verdict)
            }
            Err(reason) => Interpretation::error(reason),
        }
    }

    fn reconcile(&self, verdict: &InferenceVerdict) -> Interpretation {
        if verdict.top.is_empty() && verdict.side.is_empty() {
            // Nothing detected at all is an inconclusive read, whatever the peer claims.
            return Interpretation::error(REASON_NOT_RECOGNIZED);
        }

        let mut result = classify(verdict.result.as_deref()).unwrap_or(InspectionResult::Error);
        if self.policy == VerdictPolicy::AnyDetectionIsDefect && result == InspectionResult::Normal {
            result = InspectionResult::Defect;
        }

        Interpretation {
            result,
            reason: compose_reason(verdict),
            detections: flatten(verdict),
        }
    }
}

fn parse(raw: &str) -> Result<InferenceVerdict, &'static str> {
    if raw.trim().is_empty() {
        return Err(REASON_NO_RESPONSE);
    }
    let document = serde_json::from_str::<Value>(raw).map_err(|e| {
        tracing::debug!(error = %e, "Peer response is not JSON");
        REASON_UNPARSEABLE
    })?;
    // The derived visitor would also read arrays positionally.
    if !document.is_object() {
        tracing::debug!("Peer response is not a JSON object");
        return Err(REASON_UNPARSEABLE);
    }
    InferenceVerdict::deserialize(document).map_err(|e| {
        tracing::debug!(error = %e, "Peer response is not a verdict object");
        REASON_UNPARSEABLE
    })
}

/// Maps the peer's verdict vocabulary onto inspection results.
/// `None` means the verdict is absent or not understood.
fn classify(verdict: Option<&str>) -> Option<InspectionResult> {
    match verdict?.trim().to_lowercase().as_str() {
        "ok" | "normal" | "정상" => Some(InspectionResult::Normal),
        "not-ok" | "not_ok" | "ng" | "defect" | "defective" | "비정상" => {
            Some(InspectionResult::Defect)
        }
        "anomaly" => Some(InspectionResult::Anomaly),
        _ => None,
    }
}

/// `"TOP: <expr> · SIDE: <expr>"`, top always first.
fn compose_reason(verdict: &InferenceVerdict) -> String {
    format!(
        "{}: {} · {}: {}",
        Camera::Top.role(),
        camera_expr(verdict, Camera::Top),
        Camera::Side.role(),
        camera_expr(verdict, Camera::Side)
    )
}

fn camera_expr(verdict: &InferenceVerdict, camera: Camera) -> String {
    let first_label = verdict
        .detections(camera)
        .first()
        .map(|d| d.label.as_str())
        .filter(|label| !label.is_empty());

    match verdict.sub_verdict(camera) {
        Some(sub) => match classify(Some(sub)) {
            Some(InspectionResult::Normal) => "ok".to_string(),
            Some(InspectionResult::Defect) => {
                format!("not-ok({})", first_label.unwrap_or(FALLBACK_DEFECT_LABEL))
            }
            _ => sub.to_string(),
        },
        None => first_label.unwrap_or("-").to_string(),
    }
}

fn flatten(verdict: &InferenceVerdict) -> Vec<DetectionRecord> {
    [Camera::Top, Camera::Side]
        .into_iter()
        .flat_map(|camera| {
            verdict
                .detections(camera)
                .iter()
                .map(move |d| DetectionRecord {
                    camera,
                    label: d.label.clone(),
                    confidence: d.confidence,
                })
        })
        .collect()
}

/// Strings pass through, `null` is absent, anything else keeps its JSON text so
/// it later classifies as an unknown verdict.
fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Null => None,
        Value::String(s) => Some(s),
        other => Some(other.to_string()),
    })
}

/// Anything that is not an array counts as an empty detection list.
fn detection_rows<'de, D>(deserializer: D) -> Result<Vec<PeerDetection>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Array(rows) => rows.iter().map(detection_row).collect(),
        _ => Vec::new(),
    })
}

/// Accepts `[label, score, ...]`, `{"name"|"label": .., "score"|"confidence": ..}`
/// or a bare label. Unusable pieces degrade to an empty label or no confidence.
fn detection_row(row: &Value) -> PeerDetection {
    let (label, score) = match row {
        Value::Array(items) => (items.first(), items.get(1)),
        Value::Object(map) => (
            map.get("name").or_else(|| map.get("label")),
            map.get("score").or_else(|| map.get("confidence")),
        ),
        scalar => (Some(scalar), None),
    };

    PeerDetection {
        label: label.map(label_text).unwrap_or_default(),
        confidence: score.and_then(confidence),
    }
}

fn label_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        _ => String::new(),
    }
}

/// Numbers or numeric strings within `[0, 1]`; anything else is no confidence.
fn confidence(value: &Value) -> Option<f32> {
    let score = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    (score.is_finite() && (0.0..=1.0).contains(&score)).then_some(score as f32)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn interpret(raw: &str) -> Interpretation {
        VerdictInterpreter::default().interpret(raw)
    }

    // ========== Unusable input ==========

    #[test]
    fn empty_and_whitespace_input_is_no_response() {
        for raw in ["", "   ", "\n\t"] {
            let out = interpret(raw);
            assert_eq!(out.result, InspectionResult::Error);
            assert_eq!(out.reason, REASON_NO_RESPONSE);
            assert!(out.detections.is_empty());
        }
    }

    #[test]
    fn garbage_input_never_panics() {
        let inputs = [
            "not json",
            "{",
            "[1, 2, 3]",
            "[]",
            r#"["ok", null, null, [["dent", 0.9]]]"#,
            "\"ok\"",
            "42",
            "null",
            "{\"result\": ",
            "\u{fffd}\u{fffd}",
        ];
        for raw in inputs {
            let out = interpret(raw);
            assert_eq!(out.result, InspectionResult::Error, "input: {raw:?}");
            assert_eq!(out.reason, REASON_UNPARSEABLE, "input: {raw:?}");
        }
    }

    #[test]
    fn array_document_is_not_read_as_a_verdict() {
        let out = interpret(r#"["ok", null, null, [["dent", 0.9]], []]"#);
        assert_eq!(out.result, InspectionResult::Error);
        assert_eq!(out.reason, REASON_UNPARSEABLE);
        assert!(out.detections.is_empty());
    }

    // ========== Empty detections override the verdict ==========

    #[test]
    fn no_detections_is_not_recognized_even_when_defective() {
        let out = interpret(r#"{"result":"not-ok","det_top":[],"det_side":[]}"#);
        assert_eq!(out.result, InspectionResult::Error);
        assert!(out.reason.contains("not recognized"));
    }

    #[test]
    fn no_detections_is_not_recognized_even_when_ok() {
        for raw in [
            r#"{"result":"ok"}"#,
            r#"{"result":"ok","det_top":null,"det_side":{}}"#,
            r#"{"result":"ok","det_top":"none"}"#,
        ] {
            let out = interpret(raw);
            assert_eq!(out.result, InspectionResult::Error, "input: {raw}");
            assert_eq!(out.reason, REASON_NOT_RECOGNIZED, "input: {raw}");
        }
    }

    // ========== Verdict mapping ==========

    #[test]
    fn verdict_table() {
        let cases = [
            ("ok", InspectionResult::Normal),
            ("OK", InspectionResult::Normal),
            ("normal", InspectionResult::Normal),
            ("정상", InspectionResult::Normal),
            ("not-ok", InspectionResult::Defect),
            ("NG", InspectionResult::Defect),
            ("defective", InspectionResult::Defect),
            ("비정상", InspectionResult::Defect),
            ("anomaly", InspectionResult::Anomaly),
            ("maybe", InspectionResult::Error),
            ("", InspectionResult::Error),
        ];
        for (verdict, expected) in cases {
            let raw = format!(r#"{{"result":"{verdict}","det_top":[["can",0.9]]}}"#);
            assert_eq!(interpret(&raw).result, expected, "verdict: {verdict:?}");
        }
    }

    #[test]
    fn missing_or_non_string_verdict_is_error() {
        assert_eq!(
            interpret(r#"{"det_top":[["can",0.9]]}"#).result,
            InspectionResult::Error
        );
        assert_eq!(
            interpret(r#"{"result":1,"det_top":[["can",0.9]]}"#).result,
            InspectionResult::Error
        );
    }

    // ========== Reconciliation policy ==========

    #[test]
    fn ok_with_detection_stays_normal_under_peer_policy() {
        let raw = r#"{"result":"ok","det_top":[["dent",0.9]],"det_side":[]}"#;
        let out = VerdictInterpreter::new(VerdictPolicy::PeerVerdict).interpret(raw);
        assert_eq!(out.result, InspectionResult::Normal);
        assert_eq!(out.detections.len(), 1);
    }

    #[test]
    fn ok_with_detection_is_defect_under_strict_policy() {
        let raw = r#"{"result":"ok","det_top":[["dent",0.9]],"det_side":[]}"#;
        let out = VerdictInterpreter::new(VerdictPolicy::AnyDetectionIsDefect).interpret(raw);
        assert_eq!(out.result, InspectionResult::Defect);
    }

    #[test]
    fn strict_policy_does_not_touch_errors() {
        let raw = r#"{"result":"???","det_top":[["dent",0.9]]}"#;
        let out = VerdictInterpreter::new(VerdictPolicy::AnyDetectionIsDefect).interpret(raw);
        assert_eq!(out.result, InspectionResult::Error);
    }

    #[test]
    fn policy_parses_from_config_strings() {
        assert_eq!("peer".parse(), Ok(VerdictPolicy::PeerVerdict));
        assert_eq!(
            "Any-Detection".parse(),
            Ok(VerdictPolicy::AnyDetectionIsDefect)
        );
        assert!("strict".parse::<VerdictPolicy>().is_err());
    }

    // ========== Reason text ==========

    #[test]
    fn reason_combines_sub_verdicts_top_first() {
        let raw = r#"{
            "result": "not-ok",
            "top_result": "not-ok",
            "side_result": "ok",
            "det_top": [["dent", 0.91], ["scratch", 0.5]],
            "det_side": [["can", 0.99]]
        }"#;
        assert_eq!(interpret(raw).reason, "TOP: not-ok(dent) · SIDE: ok");
    }

    #[test]
    fn reason_falls_back_when_defective_camera_has_no_label() {
        let raw = r#"{"result":"not-ok","top_result":"ok","side_result":"not-ok",
                      "det_top":[["can",0.9]],"det_side":[]}"#;
        assert_eq!(interpret(raw).reason, "TOP: ok · SIDE: not-ok(defect)");
    }

    #[test]
    fn reason_without_sub_verdicts_uses_first_label() {
        let raw = r#"{"result":"ok","det_top":[["can",0.9]]}"#;
        assert_eq!(interpret(raw).reason, "TOP: can · SIDE: -");
    }

    #[test]
    fn reason_keeps_unknown_sub_verdict_text() {
        let raw = r#"{"result":"ok","top_result":"skipped","det_side":[["can",0.9]]}"#;
        assert_eq!(interpret(raw).reason, "TOP: skipped · SIDE: can");
    }

    // ========== Detection records ==========

    #[test]
    fn detections_flatten_top_then_side_in_peer_order() {
        let raw = r#"{"result":"not-ok",
            "det_side":[["lid",0.4],["rim",0.3]],
            "det_top":[["dent",0.9],["scratch",0.8]]}"#;
        let labels: Vec<_> = interpret(raw)
            .detections
            .into_iter()
            .map(|d| (d.camera, d.label))
            .collect();
        assert_eq!(
            labels,
            vec![
                (Camera::Top, "dent".to_string()),
                (Camera::Top, "scratch".to_string()),
                (Camera::Side, "lid".to_string()),
                (Camera::Side, "rim".to_string()),
            ]
        );
    }

    #[test]
    fn bad_scores_become_missing_confidence() {
        let raw = r#"{"result":"not-ok","det_top":[
            ["a", 0.25],
            ["b", "0.5"],
            ["c", "high"],
            ["d"],
            ["e", null],
            ["f", 7.5],
            ["g", 0.75, [1, 2, 3, 4]]
        ]}"#;
        let scores: Vec<_> = interpret(raw)
            .detections
            .into_iter()
            .map(|d| d.confidence)
            .collect();
        assert_eq!(
            scores,
            vec![Some(0.25), Some(0.5), None, None, None, None, Some(0.75)]
        );
    }

    #[test]
    fn odd_rows_degrade_instead_of_failing() {
        let raw = r#"{"result":"not-ok","det_top":[
            [null, 0.9],
            {"name": "dent", "score": 0.6},
            "scratch",
            [],
            [404, 0.1]
        ]}"#;
        let out = interpret(raw);
        assert_eq!(out.result, InspectionResult::Defect);
        let rows: Vec<_> = out
            .detections
            .into_iter()
            .map(|d| (d.label, d.confidence))
            .collect();
        assert_eq!(
            rows,
            vec![
                (String::new(), Some(0.9)),
                ("dent".to_string(), Some(0.6)),
                ("scratch".to_string(), None),
                (String::new(), None),
                ("404".to_string(), Some(0.1)),
            ]
        );
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let raw = r#"{"result":"ok","model":"yolo8","inference_ms":12.5,"det_top":[["can",0.9]]}"#;
        assert_eq!(interpret(raw).result, InspectionResult::Normal);
    }

    // ========== Single camera ==========

    #[test]
    fn single_camera_uses_overall_verdict_for_its_camera() {
        let raw = r#"{"result":"not-ok","det_side":[["dent",0.8]]}"#;
        let out = VerdictInterpreter::default().interpret_single(raw, Camera::Side);
        assert_eq!(out.result, InspectionResult::Defect);
        assert_eq!(out.reason, "TOP: - · SIDE: not-ok(dent)");
        assert_eq!(out.detections[0].camera, Camera::Side);
    }

    #[test]
    fn single_camera_still_requires_a_detection() {
        let out = VerdictInterpreter::default().interpret_single(r#"{"result":"ok"}"#, Camera::Top);
        assert_eq!(out.reason, REASON_NOT_RECOGNIZED);
    }
}
