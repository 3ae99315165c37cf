use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params_from_iter, types::Value, Connection, OptionalExtension};

/// Canonical timestamp encoding for the workspace db. Everything is UTC and
/// second-resolution so stored strings compare lexicographically.
pub fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub fn parse_ts(s: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| format!("expected ISO-8601 timestamp, got {:?}", s))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttendanceStatus {
    Present,
    Absent,
    Excused,
}

impl AttendanceStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "present" => Some(Self::Present),
            "absent" => Some(Self::Absent),
            "excused" => Some(Self::Excused),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Present => "present",
            Self::Absent => "absent",
            Self::Excused => "excused",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventSource {
    Recognition,
    Manual,
}

impl EventSource {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "recognition" => Some(Self::Recognition),
            "manual" => Some(Self::Manual),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Recognition => "recognition",
            Self::Manual => "manual",
        }
    }
}

#[derive(Debug, Clone)]
pub struct LectureRow {
    pub id: String,
    pub subject_id: String,
    pub class_id: String,
    pub teacher_id: String,
    pub scheduled_at: DateTime<Utc>,
    pub duration_minutes: i64,
    pub classroom: Option<String>,
    pub cancelled: bool,
}

pub fn lecture_by_id(conn: &Connection, lecture_id: &str) -> rusqlite::Result<Option<LectureRow>> {
    conn.query_row(
        "SELECT id, subject_id, class_id, teacher_id, scheduled_at, duration_minutes,
                classroom, status
         FROM lectures WHERE id = ?",
        [lecture_id],
        |r| {
            let scheduled_raw: String = r.get(4)?;
            let status: String = r.get(7)?;
            Ok(LectureRow {
                id: r.get(0)?,
                subject_id: r.get(1)?,
                class_id: r.get(2)?,
                teacher_id: r.get(3)?,
                scheduled_at: parse_ts(&scheduled_raw).unwrap_or_default(),
                duration_minutes: r.get(5)?,
                classroom: r.get(6)?,
                cancelled: status == "cancelled",
            })
        },
    )
    .optional()
}

#[derive(Debug, Clone)]
pub struct StoredEvent {
    pub id: String,
    pub lecture_id: String,
    pub student_id: String,
    pub status: AttendanceStatus,
    pub source: EventSource,
    pub recorded_at: DateTime<Utc>,
    pub confidence: Option<f64>,
    pub ingested_at: DateTime<Utc>,
}

pub fn append_event(conn: &Connection, ev: &StoredEvent) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO attendance_events(
            id, lecture_id, student_id, status, source, recorded_at, confidence, ingested_at
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &ev.id,
            &ev.lecture_id,
            &ev.student_id,
            ev.status.as_str(),
            ev.source.as_str(),
            ts(ev.recorded_at),
            ev.confidence,
            ts(ev.ingested_at),
        ),
    )?;
    Ok(())
}

pub fn events_for_pair(
    conn: &Connection,
    lecture_id: &str,
    student_id: &str,
) -> rusqlite::Result<Vec<StoredEvent>> {
    let mut stmt = conn.prepare(
        "SELECT id, lecture_id, student_id, status, source, recorded_at, confidence, ingested_at
         FROM attendance_events
         WHERE lecture_id = ? AND student_id = ?
         ORDER BY rowid",
    )?;
    let rows = stmt.query_map((lecture_id, student_id), map_event_row)?;
    rows.collect()
}

fn map_event_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<StoredEvent> {
    let status_raw: String = r.get(3)?;
    let source_raw: String = r.get(4)?;
    let recorded_raw: String = r.get(5)?;
    let ingested_raw: String = r.get(7)?;
    Ok(StoredEvent {
        id: r.get(0)?,
        lecture_id: r.get(1)?,
        student_id: r.get(2)?,
        status: AttendanceStatus::parse(&status_raw).unwrap_or(AttendanceStatus::Absent),
        source: EventSource::parse(&source_raw).unwrap_or(EventSource::Manual),
        recorded_at: parse_ts(&recorded_raw).unwrap_or_default(),
        confidence: r.get(6)?,
        ingested_at: parse_ts(&ingested_raw).unwrap_or_default(),
    })
}

#[derive(Debug, Clone)]
pub struct EffectiveRow {
    pub event_id: String,
    pub status: AttendanceStatus,
    pub recorded_at: DateTime<Utc>,
}

pub fn effective_for_pair(
    conn: &Connection,
    lecture_id: &str,
    student_id: &str,
) -> rusqlite::Result<Option<EffectiveRow>> {
    conn.query_row(
        "SELECT event_id, status, recorded_at
         FROM effective_events WHERE lecture_id = ? AND student_id = ?",
        (lecture_id, student_id),
        |r| {
            let status_raw: String = r.get(1)?;
            let recorded_raw: String = r.get(2)?;
            Ok(EffectiveRow {
                event_id: r.get(0)?,
                status: AttendanceStatus::parse(&status_raw).unwrap_or(AttendanceStatus::Absent),
                recorded_at: parse_ts(&recorded_raw).unwrap_or_default(),
            })
        },
    )
    .optional()
}

pub fn set_effective(
    conn: &Connection,
    lecture_id: &str,
    student_id: &str,
    event_id: &str,
    status: AttendanceStatus,
    recorded_at: DateTime<Utc>,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO effective_events(lecture_id, student_id, event_id, status, recorded_at)
         VALUES(?, ?, ?, ?, ?)
         ON CONFLICT(lecture_id, student_id) DO UPDATE SET
           event_id = excluded.event_id,
           status = excluded.status,
           recorded_at = excluded.recorded_at",
        (
            lecture_id,
            student_id,
            event_id,
            status.as_str(),
            ts(recorded_at),
        ),
    )?;
    Ok(())
}

/// Rollup dimensions. This list is the whole fan-out: one event touches
/// exactly one row per dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dimension {
    StudentOverall,
    StudentSubjectWeek,
    StudentSubjectMonth,
    ClassSubjectDay,
}

impl Dimension {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::StudentOverall => "studentOverall",
            Self::StudentSubjectWeek => "studentSubjectWeek",
            Self::StudentSubjectMonth => "studentSubjectMonth",
            Self::ClassSubjectDay => "classSubjectDay",
        }
    }
}

/// Address of one rollup row. Unused key components stay empty strings so
/// the composite primary key is total.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollupKey {
    pub dimension: Dimension,
    pub student_id: String,
    pub class_id: String,
    pub subject_id: String,
    pub bucket: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RollupCounts {
    pub present: i64,
    pub absent: i64,
    pub excused: i64,
    pub expected: i64,
}

impl RollupCounts {
    pub fn not_yet_recorded(&self) -> i64 {
        self.expected - self.present - self.absent - self.excused
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RollupDelta {
    pub present: i64,
    pub absent: i64,
    pub excused: i64,
    pub expected: i64,
}

impl RollupDelta {
    pub fn is_zero(&self) -> bool {
        *self == RollupDelta::default()
    }
}

/// Commutative increment of one rollup row, stamping the contributing event.
/// Panics if any counter would go negative: that is a delta-application bug,
/// and clamping would hide it.
pub fn apply_rollup_delta(
    conn: &Connection,
    key: &RollupKey,
    delta: &RollupDelta,
    last_event_id: Option<&str>,
    now: DateTime<Utc>,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO rollups(
            dimension, student_id, class_id, subject_id, bucket,
            present, absent, excused, expected, last_event_id, updated_at
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(dimension, student_id, class_id, subject_id, bucket) DO UPDATE SET
           present = present + excluded.present,
           absent = absent + excluded.absent,
           excused = excused + excluded.excused,
           expected = expected + excluded.expected,
           last_event_id = COALESCE(excluded.last_event_id, last_event_id),
           updated_at = excluded.updated_at",
        (
            key.dimension.as_str(),
            &key.student_id,
            &key.class_id,
            &key.subject_id,
            &key.bucket,
            delta.present,
            delta.absent,
            delta.excused,
            delta.expected,
            last_event_id,
            ts(now),
        ),
    )?;

    let counts = rollup_counts(conn, key)?;
    assert!(
        counts.present >= 0
            && counts.absent >= 0
            && counts.excused >= 0
            && counts.not_yet_recorded() >= 0,
        "rollup counters went negative for {:?}: {:?}",
        key,
        counts
    );
    Ok(())
}

pub fn rollup_counts(conn: &Connection, key: &RollupKey) -> rusqlite::Result<RollupCounts> {
    let found = conn
        .query_row(
            "SELECT present, absent, excused, expected FROM rollups
             WHERE dimension = ? AND student_id = ? AND class_id = ?
               AND subject_id = ? AND bucket = ?",
            (
                key.dimension.as_str(),
                &key.student_id,
                &key.class_id,
                &key.subject_id,
                &key.bucket,
            ),
            |r| {
                Ok(RollupCounts {
                    present: r.get(0)?,
                    absent: r.get(1)?,
                    excused: r.get(2)?,
                    expected: r.get(3)?,
                })
            },
        )
        .optional()?;
    Ok(found.unwrap_or_default())
}

/// Sum of a student's rollup rows across subjects, optionally restricted to
/// a bucket set. `buckets = None` means every bucket of the dimension.
pub fn sum_student_rollups(
    conn: &Connection,
    dimension: Dimension,
    student_id: &str,
    subject_id: Option<&str>,
    buckets: Option<&[String]>,
) -> rusqlite::Result<RollupCounts> {
    let mut sql = String::from(
        "SELECT COALESCE(SUM(present), 0), COALESCE(SUM(absent), 0),
                COALESCE(SUM(excused), 0), COALESCE(SUM(expected), 0)
         FROM rollups WHERE dimension = ? AND student_id = ?",
    );
    let mut params: Vec<Value> = vec![
        Value::from(dimension.as_str().to_string()),
        Value::from(student_id.to_string()),
    ];
    if let Some(subject) = subject_id {
        sql.push_str(" AND subject_id = ?");
        params.push(Value::from(subject.to_string()));
    }
    if let Some(buckets) = buckets {
        if buckets.is_empty() {
            return Ok(RollupCounts::default());
        }
        sql.push_str(" AND bucket IN (");
        sql.push_str(&vec!["?"; buckets.len()].join(", "));
        sql.push(')');
        params.extend(buckets.iter().map(|b| Value::from(b.clone())));
    }
    conn.query_row(&sql, params_from_iter(params), |r| {
        Ok(RollupCounts {
            present: r.get(0)?,
            absent: r.get(1)?,
            excused: r.get(2)?,
            expected: r.get(3)?,
        })
    })
}

/// Day-bucket rows for one class+subject, ordered by bucket, optionally
/// bounded by an inclusive bucket range.
pub fn class_day_rows(
    conn: &Connection,
    class_id: &str,
    subject_id: Option<&str>,
    from_bucket: Option<&str>,
    to_bucket: Option<&str>,
) -> rusqlite::Result<Vec<(String, RollupCounts)>> {
    let mut sql = String::from(
        "SELECT bucket, SUM(present), SUM(absent), SUM(excused), SUM(expected)
         FROM rollups WHERE dimension = ? AND class_id = ?",
    );
    let mut params: Vec<Value> = vec![
        Value::from(Dimension::ClassSubjectDay.as_str().to_string()),
        Value::from(class_id.to_string()),
    ];
    if let Some(subject) = subject_id {
        sql.push_str(" AND subject_id = ?");
        params.push(Value::from(subject.to_string()));
    }
    if let Some(from) = from_bucket {
        sql.push_str(" AND bucket >= ?");
        params.push(Value::from(from.to_string()));
    }
    if let Some(to) = to_bucket {
        sql.push_str(" AND bucket <= ?");
        params.push(Value::from(to.to_string()));
    }
    sql.push_str(" GROUP BY bucket ORDER BY bucket");

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(params), |r| {
        Ok((
            r.get::<_, String>(0)?,
            RollupCounts {
                present: r.get(1)?,
                absent: r.get(2)?,
                excused: r.get(3)?,
                expected: r.get(4)?,
            },
        ))
    })?;
    rows.collect()
}

pub fn student_overall_counts(
    conn: &Connection,
    student_id: &str,
) -> rusqlite::Result<RollupCounts> {
    rollup_counts(
        conn,
        &RollupKey {
            dimension: Dimension::StudentOverall,
            student_id: student_id.to_string(),
            class_id: String::new(),
            subject_id: String::new(),
            bucket: String::new(),
        },
    )
}

pub fn clear_rollups(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute("DELETE FROM rollups", [])?;
    Ok(())
}

pub fn clear_effective_events(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute("DELETE FROM effective_events", [])?;
    Ok(())
}
