
use serde_json::json;
use test_support::{
    request_err, request_ok, schedule_lecture, setup_basic_workspace, spawn_sidecar,
    student_params, teacher_params,
};

#[test]
fn students_see_only_their_own_numbers() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    setup_basic_workspace(&mut stdin, &mut reader, "attendanced-scope-a");
    schedule_lecture(&mut stdin, &mut reader, "l", "2025-04-14T09:00:00Z");

    let own = request_ok(
        &mut stdin,
        &mut reader,
        "q1",
        "query.studentOverall",
        student_params("s1", json!({ "studentId": "s1" })),
    );
    assert_eq!(own.get("expected").and_then(|v| v.as_i64()), Some(1));

    let (code, _) = request_err(
        &mut stdin,
        &mut reader,
        "q2",
        "query.studentOverall",
        student_params("s1", json!({ "studentId": "s2" })),
    );
    assert_eq!(code, "forbidden");

    let (code, _) = request_err(
        &mut stdin,
        &mut reader,
        "q3",
        "query.studentBySubject",
        student_params("s2", json!({ "studentId": "s1" })),
    );
    assert_eq!(code, "forbidden");

    // Class-level views are teacher-facing.
    let (code, _) = request_err(
        &mut stdin,
        &mut reader,
        "q4",
        "query.classTrend",
        student_params("s1", json!({ "classId": "c1", "subjectId": "math" })),
    );
    assert_eq!(code, "forbidden");
    let (code, _) = request_err(
        &mut stdin,
        &mut reader,
        "q5",
        "query.engagementScore",
        student_params("s1", json!({ "classId": "c1" })),
    );
    assert_eq!(code, "forbidden");
}

#[test]
fn teachers_are_scoped_to_their_assignments() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    setup_basic_workspace(&mut stdin, &mut reader, "attendanced-scope-b");
    schedule_lecture(&mut stdin, &mut reader, "l", "2025-04-14T09:00:00Z");

    // t1 is assigned to (c1, math): student and class queries both resolve.
    let by_subject = request_ok(
        &mut stdin,
        &mut reader,
        "q1",
        "query.studentBySubject",
        teacher_params(json!({ "studentId": "s1" })),
    );
    assert!(by_subject
        .get("subjects")
        .and_then(|v| v.as_array())
        .map(|a| !a.is_empty())
        .unwrap_or(false));
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "q2",
        "query.classTrend",
        teacher_params(json!({ "classId": "c1", "subjectId": "math" })),
    );

    // t2 has no assignment anywhere.
    let (code, _) = request_err(
        &mut stdin,
        &mut reader,
        "q3",
        "query.studentOverall",
        json!({
            "requesterId": "t2",
            "requesterRole": "teacher",
            "studentId": "s1"
        }),
    );
    assert_eq!(code, "forbidden");
    let (code, _) = request_err(
        &mut stdin,
        &mut reader,
        "q4",
        "query.classTrend",
        json!({
            "requesterId": "t2",
            "requesterRole": "teacher",
            "classId": "c1",
            "subjectId": "math"
        }),
    );
    assert_eq!(code, "forbidden");

    // Assignment is per class×subject, not per class.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "setup-subject-2",
        "subjects.create",
        json!({ "id": "phys", "name": "Physics" }),
    );
    let (code, _) = request_err(
        &mut stdin,
        &mut reader,
        "q5",
        "query.classTrend",
        teacher_params(json!({ "classId": "c1", "subjectId": "phys" })),
    );
    assert_eq!(code, "forbidden");
}

#[test]
fn unknown_roles_are_rejected_before_any_read() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    setup_basic_workspace(&mut stdin, &mut reader, "attendanced-scope-c");

    let (code, _) = request_err(
        &mut stdin,
        &mut reader,
        "q1",
        "query.studentOverall",
        json!({
            "requesterId": "root",
            "requesterRole": "admin",
            "studentId": "s1"
        }),
    );
    assert_eq!(code, "bad_params");
}
