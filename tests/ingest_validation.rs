
use serde_json::json;
use test_support::{
    request_err, request_ok, schedule_lecture, setup_basic_workspace, spawn_sidecar,
};

#[test]
fn unknown_references_are_4xx_style_rejections() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    setup_basic_workspace(&mut stdin, &mut reader, "attendanced-validate-a");
    let lecture = schedule_lecture(&mut stdin, &mut reader, "l", "2025-04-14T09:00:00Z");

    let (code, error) = request_err(
        &mut stdin,
        &mut reader,
        "e1",
        "attendance.ingest",
        json!({
            "lectureId": "no-such-lecture",
            "studentId": "s1",
            "status": "present",
            "source": "manual",
            "recordedAt": "2025-04-14T09:05:00Z"
        }),
    );
    assert_eq!(code, "unknown_lecture");
    assert_eq!(
        error
            .get("details")
            .and_then(|d| d.get("lectureId"))
            .and_then(|v| v.as_str()),
        Some("no-such-lecture")
    );

    // s9 exists nowhere near this lecture's roster.
    let (code, _) = request_err(
        &mut stdin,
        &mut reader,
        "e2",
        "attendance.ingest",
        json!({
            "lectureId": lecture,
            "studentId": "s9",
            "status": "present",
            "source": "manual",
            "recordedAt": "2025-04-14T09:05:00Z"
        }),
    );
    assert_eq!(code, "unknown_student");
}

#[test]
fn confidence_is_required_iff_source_is_recognition() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    setup_basic_workspace(&mut stdin, &mut reader, "attendanced-validate-b");
    let lecture = schedule_lecture(&mut stdin, &mut reader, "l", "2025-04-14T09:00:00Z");

    let (code, _) = request_err(
        &mut stdin,
        &mut reader,
        "e1",
        "attendance.ingest",
        json!({
            "lectureId": lecture,
            "studentId": "s1",
            "status": "present",
            "source": "recognition",
            "recordedAt": "2025-04-14T09:05:00Z"
        }),
    );
    assert_eq!(code, "bad_params");

    let (code, _) = request_err(
        &mut stdin,
        &mut reader,
        "e2",
        "attendance.ingest",
        json!({
            "lectureId": lecture,
            "studentId": "s1",
            "status": "present",
            "source": "manual",
            "recordedAt": "2025-04-14T09:05:00Z",
            "confidence": 0.5
        }),
    );
    assert_eq!(code, "bad_params");

    let (code, _) = request_err(
        &mut stdin,
        &mut reader,
        "e3",
        "attendance.ingest",
        json!({
            "lectureId": lecture,
            "studentId": "s1",
            "status": "present",
            "source": "recognition",
            "recordedAt": "2025-04-14T09:05:00Z",
            "confidence": 1.5
        }),
    );
    assert_eq!(code, "bad_params");

    let (code, _) = request_err(
        &mut stdin,
        &mut reader,
        "e4",
        "attendance.ingest",
        json!({
            "lectureId": lecture,
            "studentId": "s1",
            "status": "late",
            "source": "manual",
            "recordedAt": "2025-04-14T09:05:00Z"
        }),
    );
    assert_eq!(code, "bad_params");
}

#[test]
fn batch_reports_each_outcome_independently() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    setup_basic_workspace(&mut stdin, &mut reader, "attendanced-validate-c");
    let lecture = schedule_lecture(&mut stdin, &mut reader, "l", "2025-04-14T09:00:00Z");

    let result = request_ok(
        &mut stdin,
        &mut reader,
        "b1",
        "attendance.ingestBatch",
        json!({ "events": [
            {
                "lectureId": lecture,
                "studentId": "s1",
                "status": "present",
                "source": "recognition",
                "recordedAt": "2025-04-14T09:05:00Z",
                "confidence": 0.88
            },
            {
                "lectureId": lecture,
                "studentId": "s9",
                "status": "present",
                "source": "recognition",
                "recordedAt": "2025-04-14T09:05:00Z",
                "confidence": 0.91
            },
            {
                "lectureId": lecture,
                "studentId": "s1",
                "status": "present",
                "source": "recognition",
                "recordedAt": "2025-04-14T09:05:00Z",
                "confidence": 0.88
            }
        ]}),
    );
    assert_eq!(result.get("applied").and_then(|v| v.as_i64()), Some(1));
    assert_eq!(result.get("rejected").and_then(|v| v.as_i64()), Some(1));
    assert_eq!(result.get("stale").and_then(|v| v.as_i64()), Some(1));

    let results = result.get("results").and_then(|v| v.as_array()).expect("results");
    assert_eq!(results.len(), 3);
    assert_eq!(results[0].get("ok").and_then(|v| v.as_bool()), Some(true));
    assert_eq!(results[1].get("ok").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(
        results[1]
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str()),
        Some("unknown_student")
    );
    assert_eq!(
        results[2]
            .get("result")
            .and_then(|r| r.get("applied"))
            .and_then(|v| v.as_bool()),
        Some(false)
    );
}
