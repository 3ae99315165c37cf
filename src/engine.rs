use crate::config::EngineConfig;
use crate::period;
use crate::roster;
use crate::store::{
    self, AttendanceStatus, Dimension, EventSource, LectureRow, RollupDelta, RollupKey,
};
use chrono::{DateTime, Duration, Utc};
use rusqlite::Connection;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

#[derive(Debug, Clone)]
pub struct EngineError {
    pub code: String,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl EngineError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }

    pub fn unknown_lecture(lecture_id: &str) -> Self {
        let mut e = Self::new("unknown_lecture", "lecture not found");
        e.details = Some(json!({ "lectureId": lecture_id }));
        e
    }

    pub fn unknown_student(lecture_id: &str, student_id: &str) -> Self {
        let mut e = Self::new(
            "unknown_student",
            "student is not on the lecture roster",
        );
        e.details = Some(json!({ "lectureId": lecture_id, "studentId": student_id }));
        e
    }

    pub fn contended(lecture_id: &str, student_id: &str) -> Self {
        let mut e = Self::new(
            "contended",
            "another writer holds this (lecture, student) pair; retry with backoff",
        );
        e.details = Some(json!({ "lectureId": lecture_id, "studentId": student_id }));
        e
    }
}

fn qerr(e: rusqlite::Error) -> EngineError {
    EngineError::new("db_query_failed", e.to_string())
}

fn uerr(e: rusqlite::Error) -> EngineError {
    EngineError::new("db_update_failed", e.to_string())
}

/// In-process serialization of writers per (lecture, student) pair. Slots are
/// atomic busy flags acquired under a bounded deadline; unrelated pairs never
/// wait on each other.
pub struct PairLocks {
    slots: Mutex<HashMap<(String, String), Arc<AtomicBool>>>,
}

impl Default for PairLocks {
    fn default() -> Self {
        Self::new()
    }
}

impl PairLocks {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn acquire(
        &self,
        lecture_id: &str,
        student_id: &str,
        timeout: std::time::Duration,
    ) -> Result<PairGuard, EngineError> {
        let slot = {
            let mut slots = self.slots.lock().expect("pair lock registry poisoned");
            slots
                .entry((lecture_id.to_string(), student_id.to_string()))
                .or_insert_with(|| Arc::new(AtomicBool::new(false)))
                .clone()
        };
        let deadline = Instant::now() + timeout;
        loop {
            if slot
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return Ok(PairGuard { slot });
            }
            if Instant::now() >= deadline {
                return Err(EngineError::contended(lecture_id, student_id));
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
    }
}

pub struct PairGuard {
    slot: Arc<AtomicBool>,
}

impl Drop for PairGuard {
    fn drop(&mut self) {
        self.slot.store(false, Ordering::Release);
    }
}

/// A validated ingestion request (see the ingest handler for wire parsing).
#[derive(Debug, Clone)]
pub struct IncomingEvent {
    pub lecture_id: String,
    pub student_id: String,
    pub status: AttendanceStatus,
    pub source: EventSource,
    pub recorded_at: DateTime<Utc>,
    pub confidence: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct LateCorrection {
    pub lecture_id: String,
    pub student_id: String,
    pub dimensions: Vec<RollupKey>,
}

#[derive(Debug, Clone)]
pub struct ApplyOutcome {
    pub event_id: String,
    pub applied: bool,
    pub effective_status: AttendanceStatus,
    pub late_correction: Option<LateCorrection>,
}

pub fn key_json(key: &RollupKey) -> serde_json::Value {
    json!({
        "dimension": key.dimension.as_str(),
        "studentId": key.student_id,
        "classId": key.class_id,
        "subjectId": key.subject_id,
        "bucket": key.bucket,
    })
}

// The dimension fan-out. Every event for (lecture, student) touches exactly
// these rows; adding a dimension means adding one entry here and nothing
// else.
const PROJECTORS: &[fn(&LectureRow, &str) -> RollupKey] = &[
    project_student_overall,
    project_student_subject_week,
    project_student_subject_month,
    project_class_subject_day,
];

fn project_student_overall(_lecture: &LectureRow, student_id: &str) -> RollupKey {
    RollupKey {
        dimension: Dimension::StudentOverall,
        student_id: student_id.to_string(),
        class_id: String::new(),
        subject_id: String::new(),
        bucket: String::new(),
    }
}

fn project_student_subject_week(lecture: &LectureRow, student_id: &str) -> RollupKey {
    RollupKey {
        dimension: Dimension::StudentSubjectWeek,
        student_id: student_id.to_string(),
        class_id: String::new(),
        subject_id: lecture.subject_id.clone(),
        bucket: period::week_bucket(lecture.scheduled_at),
    }
}

fn project_student_subject_month(lecture: &LectureRow, student_id: &str) -> RollupKey {
    RollupKey {
        dimension: Dimension::StudentSubjectMonth,
        student_id: student_id.to_string(),
        class_id: String::new(),
        subject_id: lecture.subject_id.clone(),
        bucket: period::month_bucket(lecture.scheduled_at),
    }
}

fn project_class_subject_day(lecture: &LectureRow, student_id: &str) -> RollupKey {
    let _ = student_id;
    RollupKey {
        dimension: Dimension::ClassSubjectDay,
        student_id: String::new(),
        class_id: lecture.class_id.clone(),
        subject_id: lecture.subject_id.clone(),
        bucket: period::day_bucket(lecture.scheduled_at),
    }
}

pub fn projections(lecture: &LectureRow, student_id: &str) -> Vec<RollupKey> {
    PROJECTORS.iter().map(|p| p(lecture, student_id)).collect()
}

fn contribution(status: AttendanceStatus) -> RollupDelta {
    match status {
        AttendanceStatus::Present => RollupDelta {
            present: 1,
            ..RollupDelta::default()
        },
        AttendanceStatus::Absent => RollupDelta {
            absent: 1,
            ..RollupDelta::default()
        },
        AttendanceStatus::Excused => RollupDelta {
            excused: 1,
            ..RollupDelta::default()
        },
    }
}

/// Pure delta for moving one (lecture, student) pair between statuses.
/// `expected` never moves here; it is owned by lecture registration.
pub fn status_delta(
    prior: Option<AttendanceStatus>,
    next: Option<AttendanceStatus>,
) -> RollupDelta {
    let mut delta = RollupDelta::default();
    if let Some(prior) = prior {
        let c = contribution(prior);
        delta.present -= c.present;
        delta.absent -= c.absent;
        delta.excused -= c.excused;
    }
    if let Some(next) = next {
        let c = contribution(next);
        delta.present += c.present;
        delta.absent += c.absent;
        delta.excused += c.excused;
    }
    delta
}

/// The engine's single write path. Appends the event, advances the effective
/// record if the event is fresher, and fans the delta out through every
/// projector inside one transaction.
pub fn apply_event(
    conn: &Connection,
    locks: &PairLocks,
    config: &EngineConfig,
    ev: &IncomingEvent,
    now: DateTime<Utc>,
) -> Result<ApplyOutcome, EngineError> {
    let lecture = store::lecture_by_id(conn, &ev.lecture_id)
        .map_err(qerr)?
        .ok_or_else(|| EngineError::unknown_lecture(&ev.lecture_id))?;
    if !roster::on_roster(conn, &ev.lecture_id, &ev.student_id).map_err(qerr)? {
        return Err(EngineError::unknown_student(&ev.lecture_id, &ev.student_id));
    }

    let _guard = locks.acquire(
        &ev.lecture_id,
        &ev.student_id,
        std::time::Duration::from_millis(config.apply_lock_timeout_ms),
    )?;

    let prior = store::effective_for_pair(conn, &ev.lecture_id, &ev.student_id).map_err(qerr)?;

    let event_id = uuid::Uuid::new_v4().to_string();
    let stored = store::StoredEvent {
        id: event_id.clone(),
        lecture_id: ev.lecture_id.clone(),
        student_id: ev.student_id.clone(),
        status: ev.status,
        source: ev.source,
        recorded_at: ev.recorded_at,
        confidence: ev.confidence,
        ingested_at: now,
    };

    let tx = conn.unchecked_transaction().map_err(uerr)?;
    store::append_event(&tx, &stored).map_err(uerr)?;

    // Idempotent-against-staleness: an effective record at a later or equal
    // recorded_at wins; the new event is audit-only.
    if let Some(prior) = &prior {
        if prior.recorded_at >= ev.recorded_at {
            tx.commit().map_err(uerr)?;
            return Ok(ApplyOutcome {
                event_id,
                applied: false,
                effective_status: prior.status,
                late_correction: None,
            });
        }
    }

    store::set_effective(
        &tx,
        &ev.lecture_id,
        &ev.student_id,
        &event_id,
        ev.status,
        ev.recorded_at,
    )
    .map_err(uerr)?;

    let keys = projections(&lecture, &ev.student_id);
    let delta = status_delta(prior.as_ref().map(|p| p.status), Some(ev.status));
    let mut rolled = false;
    if !lecture.cancelled && !delta.is_zero() {
        for key in &keys {
            store::apply_rollup_delta(&tx, key, &delta, Some(&event_id), now).map_err(uerr)?;
        }
        rolled = true;
    }
    tx.commit().map_err(uerr)?;

    let frozen = now - lecture.scheduled_at > Duration::days(config.rollup_freeze_window_days);
    let late_correction = if rolled && frozen {
        Some(LateCorrection {
            lecture_id: ev.lecture_id.clone(),
            student_id: ev.student_id.clone(),
            dimensions: keys,
        })
    } else {
        None
    };

    Ok(ApplyOutcome {
        event_id,
        applied: true,
        effective_status: ev.status,
        late_correction,
    })
}

/// Seed `expected` for every (roster student × dimension) of a freshly
/// scheduled lecture. Runs inside the caller's scheduling transaction.
pub fn register_lecture(conn: &Connection, lecture: &LectureRow) -> Result<usize, EngineError> {
    let students = roster::expected_attendees(conn, &lecture.id)
        .map_err(qerr)?
        .ok_or_else(|| EngineError::unknown_lecture(&lecture.id))?;
    let seed = RollupDelta {
        expected: 1,
        ..RollupDelta::default()
    };
    let now = Utc::now();
    for student_id in &students {
        for key in projections(lecture, student_id) {
            store::apply_rollup_delta(conn, &key, &seed, None, now).map_err(uerr)?;
        }
    }
    Ok(students.len())
}

#[derive(Debug, Clone)]
pub struct CancelSummary {
    pub already_cancelled: bool,
    pub students_withdrawn: usize,
}

/// Flip a lecture to cancelled and withdraw its whole rollup contribution,
/// expected seeds and recorded statuses alike. The event log is untouched.
pub fn cancel_lecture(
    conn: &Connection,
    lecture_id: &str,
    now: DateTime<Utc>,
) -> Result<CancelSummary, EngineError> {
    let lecture = store::lecture_by_id(conn, lecture_id)
        .map_err(qerr)?
        .ok_or_else(|| EngineError::unknown_lecture(lecture_id))?;
    if lecture.cancelled {
        return Ok(CancelSummary {
            already_cancelled: true,
            students_withdrawn: 0,
        });
    }
    let students = roster::expected_attendees(conn, lecture_id)
        .map_err(qerr)?
        .unwrap_or_default();

    let tx = conn.unchecked_transaction().map_err(uerr)?;
    tx.execute(
        "UPDATE lectures SET status = 'cancelled' WHERE id = ?",
        [lecture_id],
    )
    .map_err(uerr)?;
    for student_id in &students {
        let effective = store::effective_for_pair(&tx, lecture_id, student_id).map_err(qerr)?;
        let mut delta = status_delta(effective.map(|e| e.status), None);
        delta.expected = -1;
        for key in projections(&lecture, student_id) {
            store::apply_rollup_delta(&tx, &key, &delta, None, now).map_err(uerr)?;
        }
    }
    tx.commit().map_err(uerr)?;

    Ok(CancelSummary {
        already_cancelled: false,
        students_withdrawn: students.len(),
    })
}

#[derive(Debug, Clone)]
pub struct RebuildSummary {
    pub lectures_seeded: usize,
    pub pairs_resolved: usize,
}

/// Recompute `effective_events` and `rollups` from the event log and roster
/// snapshots. Rollups are a cache; this is the proof.
pub fn rebuild_rollups(conn: &Connection, now: DateTime<Utc>) -> Result<RebuildSummary, EngineError> {
    let tx = conn.unchecked_transaction().map_err(uerr)?;
    store::clear_rollups(&tx).map_err(uerr)?;
    store::clear_effective_events(&tx).map_err(uerr)?;

    let mut lectures: Vec<LectureRow> = Vec::new();
    {
        let mut stmt = tx
            .prepare("SELECT id FROM lectures ORDER BY id")
            .map_err(qerr)?;
        let ids = stmt
            .query_map([], |r| r.get::<_, String>(0))
            .map_err(qerr)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(qerr)?;
        for id in ids {
            if let Some(l) = store::lecture_by_id(&tx, &id).map_err(qerr)? {
                lectures.push(l);
            }
        }
    }

    let mut seeded = 0usize;
    for lecture in &lectures {
        if lecture.cancelled {
            continue;
        }
        register_lecture(&tx, lecture)?;
        seeded += 1;
    }

    // Effective status per pair: maximum recorded_at wins; on equal stamps
    // the first arrival (lowest rowid) wins, matching the incremental rule.
    let mut pairs = 0usize;
    {
        let mut stmt = tx
            .prepare(
                "SELECT lecture_id, student_id, id, status, recorded_at
                 FROM attendance_events
                 ORDER BY lecture_id, student_id, recorded_at DESC, rowid ASC",
            )
            .map_err(qerr)?;
        let rows = stmt
            .query_map([], |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, String>(3)?,
                    r.get::<_, String>(4)?,
                ))
            })
            .map_err(qerr)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(qerr)?;

        let by_lecture: HashMap<String, &LectureRow> =
            lectures.iter().map(|l| (l.id.clone(), l)).collect();
        let mut last_pair: Option<(String, String)> = None;
        for (lecture_id, student_id, event_id, status_raw, recorded_raw) in rows {
            let pair = (lecture_id.clone(), student_id.clone());
            if last_pair.as_ref() == Some(&pair) {
                continue;
            }
            last_pair = Some(pair);
            let Some(status) = AttendanceStatus::parse(&status_raw) else {
                continue;
            };
            let recorded_at = match store::parse_ts(&recorded_raw) {
                Ok(v) => v,
                Err(_) => continue,
            };
            store::set_effective(&tx, &lecture_id, &student_id, &event_id, status, recorded_at)
                .map_err(uerr)?;
            pairs += 1;

            let Some(lecture) = by_lecture.get(&lecture_id) else {
                continue;
            };
            if lecture.cancelled {
                continue;
            }
            let delta = status_delta(None, Some(status));
            for key in projections(lecture, &student_id) {
                store::apply_rollup_delta(&tx, &key, &delta, Some(&event_id), now).map_err(uerr)?;
            }
        }
    }

    tx.commit().map_err(uerr)?;
    Ok(RebuildSummary {
        lectures_seeded: seeded,
        pairs_resolved: pairs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::store::RollupCounts;
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_workspace(prefix: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "{}-{}",
            prefix,
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .expect("clock")
                .as_nanos()
        ))
    }

    fn at(s: &str) -> DateTime<Utc> {
        store::parse_ts(s).expect("timestamp")
    }

    fn seed_entities(conn: &Connection) {
        conn.execute("INSERT INTO subjects(id, name) VALUES('math', 'Mathematics')", [])
            .expect("subject");
        conn.execute("INSERT INTO classes(id, name) VALUES('c1', 'Grade 10A')", [])
            .expect("class");
        for sid in ["s1", "s2", "s3"] {
            conn.execute(
                "INSERT INTO students(id, full_name) VALUES(?, ?)",
                (sid, format!("Student {}", sid)),
            )
            .expect("student");
            conn.execute(
                "INSERT INTO enrollments(id, student_id, class_id, effective_from) VALUES(?, ?, 'c1', '2025-01-01T00:00:00Z')",
                (format!("e-{}", sid), sid),
            )
            .expect("enrollment");
        }
    }

    fn schedule_lecture(conn: &Connection, id: &str, scheduled_at: &str) -> LectureRow {
        conn.execute(
            "INSERT INTO lectures(id, subject_id, class_id, teacher_id, scheduled_at, duration_minutes, classroom)
             VALUES(?, 'math', 'c1', 't1', ?, 60, 'R101')",
            (id, scheduled_at),
        )
        .expect("lecture");
        let lecture = store::lecture_by_id(conn, id).expect("query").expect("row");
        let students =
            roster::enrolled_as_of(conn, "c1", lecture.scheduled_at).expect("roster query");
        roster::snapshot_roster(conn, id, &students).expect("snapshot");
        register_lecture(conn, &lecture).expect("register");
        lecture
    }

    fn harness(prefix: &str) -> (Connection, LectureRow, PairLocks, EngineConfig) {
        let conn = db::open_db(&temp_workspace(prefix)).expect("open db");
        seed_entities(&conn);
        let lecture = schedule_lecture(&conn, "l1", "2025-04-14T09:00:00Z");
        (conn, lecture, PairLocks::new(), EngineConfig::default())
    }

    fn event(student: &str, status: AttendanceStatus, recorded_at: &str) -> IncomingEvent {
        IncomingEvent {
            lecture_id: "l1".to_string(),
            student_id: student.to_string(),
            status,
            source: EventSource::Manual,
            recorded_at: at(recorded_at),
            confidence: None,
        }
    }

    fn overall(conn: &Connection, student: &str) -> RollupCounts {
        store::student_overall_counts(conn, student).expect("counts")
    }

    fn assert_conserved(c: &RollupCounts) {
        assert_eq!(
            c.present + c.absent + c.excused + c.not_yet_recorded(),
            c.expected
        );
    }

    #[test]
    fn delta_algebra_moves_exactly_one_unit() {
        let d = status_delta(None, Some(AttendanceStatus::Present));
        assert_eq!((d.present, d.absent, d.excused, d.expected), (1, 0, 0, 0));

        let d = status_delta(Some(AttendanceStatus::Present), Some(AttendanceStatus::Absent));
        assert_eq!((d.present, d.absent, d.excused, d.expected), (-1, 1, 0, 0));

        let d = status_delta(Some(AttendanceStatus::Excused), None);
        assert_eq!((d.present, d.absent, d.excused, d.expected), (0, 0, -1, 0));

        assert!(status_delta(Some(AttendanceStatus::Absent), Some(AttendanceStatus::Absent))
            .is_zero());
    }

    #[test]
    fn registration_seeds_expected_without_statuses() {
        let (conn, _lecture, _locks, _config) = harness("attendanced-engine-seed");
        for sid in ["s1", "s2", "s3"] {
            let c = overall(&conn, sid);
            assert_eq!(c.expected, 1);
            assert_eq!(c.present + c.absent + c.excused, 0);
            assert_eq!(c.not_yet_recorded(), 1);
        }
    }

    #[test]
    fn duplicate_event_is_idempotent_for_rollups() {
        let (conn, _lecture, locks, config) = harness("attendanced-engine-idem");
        let ev = event("s1", AttendanceStatus::Present, "2025-04-14T09:05:00Z");
        let first = apply_event(&conn, &locks, &config, &ev, at("2025-04-14T10:00:00Z"))
            .expect("first apply");
        assert!(first.applied);
        let before = overall(&conn, "s1");

        let second = apply_event(&conn, &locks, &config, &ev, at("2025-04-14T10:01:00Z"))
            .expect("second apply");
        assert!(!second.applied, "equal recorded_at must not re-apply");
        assert_eq!(overall(&conn, "s1"), before);

        // Both copies stay in the log for audit.
        let log = store::events_for_pair(&conn, "l1", "s1").expect("log");
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn stale_event_never_wins_regardless_of_arrival_order() {
        let (conn, _lecture, locks, config) = harness("attendanced-engine-stale");
        let now = at("2025-04-14T12:00:00Z");
        let fresh = event("s1", AttendanceStatus::Present, "2025-04-14T09:30:00Z");
        apply_event(&conn, &locks, &config, &fresh, now).expect("fresh");
        let c = overall(&conn, "s1");
        assert_eq!((c.present, c.absent), (1, 0));

        let stale = event("s1", AttendanceStatus::Absent, "2025-04-14T09:10:00Z");
        let outcome = apply_event(&conn, &locks, &config, &stale, now).expect("stale");
        assert!(!outcome.applied);
        assert_eq!(outcome.effective_status, AttendanceStatus::Present);
        let c = overall(&conn, "s1");
        assert_eq!((c.present, c.absent), (1, 0));
    }

    #[test]
    fn correction_moves_counts_without_double_counting() {
        let (conn, lecture, locks, config) = harness("attendanced-engine-correct");
        let now = at("2025-04-14T12:00:00Z");
        apply_event(
            &conn,
            &locks,
            &config,
            &event("s1", AttendanceStatus::Present, "2025-04-14T09:05:00Z"),
            now,
        )
        .expect("recognition pass");
        apply_event(
            &conn,
            &locks,
            &config,
            &event("s1", AttendanceStatus::Absent, "2025-04-14T09:45:00Z"),
            now,
        )
        .expect("manual override");

        // Every dimension the pair touches must agree.
        for key in projections(&lecture, "s1") {
            let c = store::rollup_counts(&conn, &key).expect("counts");
            assert_eq!(c.present, 0, "present decremented in {:?}", key.dimension);
            assert_eq!(c.absent, 1, "absent incremented in {:?}", key.dimension);
            assert_conserved(&c);
        }
    }

    #[test]
    fn conservation_holds_with_partial_marking() {
        let (conn, lecture, locks, config) = harness("attendanced-engine-conserve");
        let now = at("2025-04-14T12:00:00Z");
        apply_event(
            &conn,
            &locks,
            &config,
            &event("s1", AttendanceStatus::Present, "2025-04-14T09:05:00Z"),
            now,
        )
        .expect("s1");
        apply_event(
            &conn,
            &locks,
            &config,
            &event("s2", AttendanceStatus::Absent, "2025-04-14T09:05:00Z"),
            now,
        )
        .expect("s2");
        // s3 intentionally unmarked.

        let key = project_class_subject_day(&lecture, "");
        let c = store::rollup_counts(&conn, &key).expect("counts");
        assert_eq!(c.expected, 3);
        assert_eq!(c.present, 1);
        assert_eq!(c.absent, 1);
        assert_eq!(c.not_yet_recorded(), 1);
        assert_conserved(&c);
    }

    #[test]
    fn unknown_references_are_rejected_not_dropped() {
        let (conn, _lecture, locks, config) = harness("attendanced-engine-unknown");
        let now = at("2025-04-14T12:00:00Z");

        let mut ev = event("s1", AttendanceStatus::Present, "2025-04-14T09:05:00Z");
        ev.lecture_id = "nope".to_string();
        let err = apply_event(&conn, &locks, &config, &ev, now).unwrap_err();
        assert_eq!(err.code, "unknown_lecture");

        let ev = event("ghost", AttendanceStatus::Present, "2025-04-14T09:05:00Z");
        let err = apply_event(&conn, &locks, &config, &ev, now).unwrap_err();
        assert_eq!(err.code, "unknown_student");
        // Rejected events leave no trace in the log.
        assert!(store::events_for_pair(&conn, "l1", "ghost")
            .expect("log")
            .is_empty());
    }

    #[test]
    fn held_pair_lock_times_out_with_contended() {
        let (conn, _lecture, locks, mut config) = harness("attendanced-engine-lock");
        config.apply_lock_timeout_ms = 10;
        let _held = locks
            .acquire("l1", "s1", std::time::Duration::from_millis(10))
            .expect("first acquire");
        let err = apply_event(
            &conn,
            &locks,
            &config,
            &event("s1", AttendanceStatus::Present, "2025-04-14T09:05:00Z"),
            at("2025-04-14T12:00:00Z"),
        )
        .unwrap_err();
        assert_eq!(err.code, "contended");

        // Unrelated pairs proceed while s1 is held.
        apply_event(
            &conn,
            &locks,
            &config,
            &event("s2", AttendanceStatus::Present, "2025-04-14T09:05:00Z"),
            at("2025-04-14T12:00:00Z"),
        )
        .expect("other pair unaffected");
    }

    #[test]
    fn late_correction_fires_only_past_freeze_window() {
        let (conn, _lecture, locks, mut config) = harness("attendanced-engine-freeze");
        config.rollup_freeze_window_days = 30;

        let inside = apply_event(
            &conn,
            &locks,
            &config,
            &event("s1", AttendanceStatus::Present, "2025-04-14T09:05:00Z"),
            at("2025-05-01T00:00:00Z"),
        )
        .expect("inside window");
        assert!(inside.late_correction.is_none());

        let outside = apply_event(
            &conn,
            &locks,
            &config,
            &event("s1", AttendanceStatus::Absent, "2025-04-14T09:45:00Z"),
            at("2025-09-01T00:00:00Z"),
        )
        .expect("outside window");
        let correction = outside.late_correction.expect("late correction");
        assert_eq!(correction.lecture_id, "l1");
        assert_eq!(correction.dimensions.len(), PROJECTORS.len());
    }

    #[test]
    fn cancellation_withdraws_contribution_but_keeps_log() {
        let (conn, _lecture, locks, config) = harness("attendanced-engine-cancel");
        let now = at("2025-04-14T12:00:00Z");
        apply_event(
            &conn,
            &locks,
            &config,
            &event("s1", AttendanceStatus::Present, "2025-04-14T09:05:00Z"),
            now,
        )
        .expect("mark");

        let summary = cancel_lecture(&conn, "l1", now).expect("cancel");
        assert!(!summary.already_cancelled);
        assert_eq!(summary.students_withdrawn, 3);
        for sid in ["s1", "s2", "s3"] {
            assert_eq!(overall(&conn, sid), RollupCounts::default());
        }
        assert_eq!(store::events_for_pair(&conn, "l1", "s1").expect("log").len(), 1);

        // Post-cancel events land in the log without touching rollups.
        let outcome = apply_event(
            &conn,
            &locks,
            &config,
            &event("s1", AttendanceStatus::Absent, "2025-04-14T09:45:00Z"),
            now,
        )
        .expect("post-cancel apply");
        assert!(outcome.applied);
        assert_eq!(overall(&conn, "s1"), RollupCounts::default());

        let again = cancel_lecture(&conn, "l1", now).expect("re-cancel");
        assert!(again.already_cancelled);
    }

    #[test]
    fn rebuild_matches_incremental_state() {
        let (conn, lecture, locks, config) = harness("attendanced-engine-rebuild");
        let now = at("2025-04-14T12:00:00Z");
        apply_event(
            &conn,
            &locks,
            &config,
            &event("s1", AttendanceStatus::Present, "2025-04-14T09:05:00Z"),
            now,
        )
        .expect("s1 present");
        apply_event(
            &conn,
            &locks,
            &config,
            &event("s1", AttendanceStatus::Absent, "2025-04-14T09:45:00Z"),
            now,
        )
        .expect("s1 corrected");
        apply_event(
            &conn,
            &locks,
            &config,
            &event("s2", AttendanceStatus::Excused, "2025-04-14T09:05:00Z"),
            now,
        )
        .expect("s2 excused");

        let mut incremental = Vec::new();
        for sid in ["s1", "s2", "s3"] {
            for key in projections(&lecture, sid) {
                incremental.push(store::rollup_counts(&conn, &key).expect("counts"));
            }
        }

        let summary = rebuild_rollups(&conn, now).expect("rebuild");
        assert_eq!(summary.lectures_seeded, 1);
        assert_eq!(summary.pairs_resolved, 2);

        let mut rebuilt = Vec::new();
        for sid in ["s1", "s2", "s3"] {
            for key in projections(&lecture, sid) {
                rebuilt.push(store::rollup_counts(&conn, &key).expect("counts"));
            }
        }
        assert_eq!(incremental, rebuilt);
    }
}
