use crate::config::EngineConfig;
use crate::engine::EngineError;
use crate::period::{self, Granularity, Period};
use crate::store::{self, Dimension, RollupCounts};
use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Student,
    Teacher,
}

impl Role {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "student" => Some(Self::Student),
            "teacher" => Some(Self::Teacher),
            _ => None,
        }
    }
}

/// Who is asking. Every query resolves authorization against this before it
/// reads a single rollup row; there is no unscoped entry point.
#[derive(Debug, Clone)]
pub struct Requester {
    pub id: String,
    pub role: Role,
}

fn forbidden(message: &str) -> EngineError {
    EngineError::new("forbidden", message)
}

fn qerr(e: rusqlite::Error) -> EngineError {
    EngineError::new("db_query_failed", e.to_string())
}

/// Student-dimension scope: students see themselves; teachers see students
/// enrolled in a class they are assigned to teach.
fn ensure_student_scope(
    conn: &Connection,
    requester: &Requester,
    student_id: &str,
) -> Result<(), EngineError> {
    match requester.role {
        Role::Student => {
            if requester.id == student_id {
                Ok(())
            } else {
                Err(forbidden("students may only query their own attendance"))
            }
        }
        Role::Teacher => {
            let teaches = conn
                .query_row(
                    "SELECT 1 FROM teaching_assignments a
                     JOIN enrollments e ON e.class_id = a.class_id
                     WHERE a.teacher_id = ? AND e.student_id = ?
                     LIMIT 1",
                    (&requester.id, student_id),
                    |r| r.get::<_, i64>(0),
                )
                .optional()
                .map_err(qerr)?
                .is_some();
            if teaches {
                Ok(())
            } else {
                Err(forbidden(
                    "teacher is not assigned to any class this student is enrolled in",
                ))
            }
        }
    }
}

/// Class-dimension scope: teacher role only, restricted to assigned
/// class×subject pairs (`subject_id = None` accepts any subject of the
/// class).
fn ensure_class_scope(
    conn: &Connection,
    requester: &Requester,
    class_id: &str,
    subject_id: Option<&str>,
) -> Result<(), EngineError> {
    match requester.role {
        Role::Student => Err(forbidden("class-level queries require the teacher role")),
        Role::Teacher => {
            let mut sql = String::from(
                "SELECT 1 FROM teaching_assignments WHERE teacher_id = ? AND class_id = ?",
            );
            let assigned = if let Some(subject) = subject_id {
                sql.push_str(" AND subject_id = ? LIMIT 1");
                conn.query_row(&sql, (&requester.id, class_id, subject), |r| {
                    r.get::<_, i64>(0)
                })
                .optional()
                .map_err(qerr)?
                .is_some()
            } else {
                sql.push_str(" LIMIT 1");
                conn.query_row(&sql, (&requester.id, class_id), |r| r.get::<_, i64>(0))
                    .optional()
                    .map_err(qerr)?
                    .is_some()
            };
            if assigned {
                Ok(())
            } else {
                Err(forbidden("teacher is not assigned to this class/subject"))
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OverallAttendance {
    pub indeterminate: bool,
    pub present: i64,
    pub expected: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ratio: Option<f64>,
}

fn overall_of(counts: RollupCounts) -> OverallAttendance {
    if counts.expected == 0 {
        // No data yet is not a zero ratio; consumers must see the
        // difference.
        OverallAttendance {
            indeterminate: true,
            present: 0,
            expected: 0,
            ratio: None,
        }
    } else {
        OverallAttendance {
            indeterminate: false,
            present: counts.present,
            expected: counts.expected,
            ratio: Some(counts.present as f64 / counts.expected as f64),
        }
    }
}

fn student_period_counts(
    conn: &Connection,
    student_id: &str,
    subject_id: Option<&str>,
    period: &Period,
) -> Result<RollupCounts, EngineError> {
    match period.student_buckets() {
        None => match subject_id {
            // All-time overall reads the dedicated dimension row.
            None => store::student_overall_counts(conn, student_id).map_err(qerr),
            // All-time per subject sums every month bucket.
            Some(subject) => store::sum_student_rollups(
                conn,
                Dimension::StudentSubjectMonth,
                student_id,
                Some(subject),
                None,
            )
            .map_err(qerr),
        },
        Some((granularity, buckets)) => {
            let dimension = match granularity {
                Granularity::Week => Dimension::StudentSubjectWeek,
                Granularity::Month => Dimension::StudentSubjectMonth,
                Granularity::Day => unreachable!("periods map to week or month buckets"),
            };
            store::sum_student_rollups(conn, dimension, student_id, subject_id, Some(&buckets))
                .map_err(qerr)
        }
    }
}

/// Present/expected ratio across all subjects in the period.
pub fn student_overall(
    conn: &Connection,
    requester: &Requester,
    student_id: &str,
    period: &Period,
) -> Result<OverallAttendance, EngineError> {
    ensure_student_scope(conn, requester, student_id)?;
    let counts = student_period_counts(conn, student_id, None, period)?;
    Ok(overall_of(counts))
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectAttendance {
    pub subject_id: String,
    pub subject_name: String,
    pub present: i64,
    pub absent: i64,
    pub excused: i64,
    pub not_yet_recorded: i64,
    pub expected: i64,
}

/// Per-subject breakdown, one row per subject assigned to a class the
/// student is enrolled in, sorted by subject name for stable display.
pub fn student_by_subject(
    conn: &Connection,
    requester: &Requester,
    student_id: &str,
    period: &Period,
) -> Result<Vec<SubjectAttendance>, EngineError> {
    ensure_student_scope(conn, requester, student_id)?;

    let mut stmt = conn
        .prepare(
            "SELECT DISTINCT s.id, s.name FROM subjects s
             JOIN teaching_assignments a ON a.subject_id = s.id
             JOIN enrollments e ON e.class_id = a.class_id
             WHERE e.student_id = ?
             ORDER BY s.name, s.id",
        )
        .map_err(qerr)?;
    let subjects = stmt
        .query_map([student_id], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
        })
        .map_err(qerr)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(qerr)?;

    let mut rows = Vec::with_capacity(subjects.len());
    for (subject_id, subject_name) in subjects {
        let counts = student_period_counts(conn, student_id, Some(&subject_id), period)?;
        rows.push(SubjectAttendance {
            subject_id,
            subject_name,
            present: counts.present,
            absent: counts.absent,
            excused: counts.excused,
            not_yet_recorded: counts.not_yet_recorded(),
            expected: counts.expected,
        });
    }
    Ok(rows)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrendPoint {
    pub period: String,
    pub present: i64,
    pub absent: i64,
    pub excused: i64,
    pub expected: i64,
}

/// Attendance trend for one class×subject over consecutive periods. Periods
/// without lectures appear with expected = 0 so the line never skips.
pub fn class_trend(
    conn: &Connection,
    requester: &Requester,
    class_id: &str,
    subject_id: &str,
    granularity: Granularity,
    period: &Period,
) -> Result<Vec<TrendPoint>, EngineError> {
    ensure_class_scope(conn, requester, class_id, Some(subject_id))?;

    let range = period.day_range();
    let (from_bucket, to_bucket) = match &range {
        Some((from, to)) => (Some(period::day_label(*from)), Some(period::day_label(*to))),
        None => (None, None),
    };
    let day_rows = store::class_day_rows(
        conn,
        class_id,
        Some(subject_id),
        from_bucket.as_deref(),
        to_bucket.as_deref(),
    )
    .map_err(qerr)?;

    let (from, to) = match range {
        Some(r) => r,
        None => {
            // Unbounded period: span the data we have.
            let Some(first) = day_rows.first() else {
                return Ok(Vec::new());
            };
            let last = day_rows.last().expect("non-empty");
            (parse_day_bucket(&first.0)?, parse_day_bucket(&last.0)?)
        }
    };

    let mut by_label: HashMap<String, RollupCounts> = HashMap::new();
    for (bucket, counts) in &day_rows {
        let label = period::bucket_for(granularity, parse_day_bucket(bucket)?);
        let slot = by_label.entry(label).or_default();
        slot.present += counts.present;
        slot.absent += counts.absent;
        slot.excused += counts.excused;
        slot.expected += counts.expected;
    }

    let points = period::labels_between(granularity, from, to)
        .into_iter()
        .map(|label| {
            let counts = by_label.get(&label).copied().unwrap_or_default();
            TrendPoint {
                period: label,
                present: counts.present,
                absent: counts.absent,
                excused: counts.excused,
                expected: counts.expected,
            }
        })
        .collect();
    Ok(points)
}

fn parse_day_bucket(bucket: &str) -> Result<NaiveDate, EngineError> {
    period::parse_date(bucket).map_err(|m| EngineError::new("db_query_failed", m))
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngagementResult {
    pub indeterminate: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_ratio: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub excused_adjusted_ratio: Option<f64>,
    pub present: i64,
    pub excused: i64,
    pub expected: i64,
}

/// Weighted blend of the raw attendance ratio and the excused-adjusted ratio
/// (excused absences shrink the denominator instead of counting as misses).
pub fn engagement_score(
    conn: &Connection,
    config: &EngineConfig,
    requester: &Requester,
    class_id: &str,
    period: &Period,
) -> Result<EngagementResult, EngineError> {
    ensure_class_scope(conn, requester, class_id, None)?;

    let range = period.day_range();
    let (from_bucket, to_bucket) = match &range {
        Some((from, to)) => (Some(period::day_label(*from)), Some(period::day_label(*to))),
        None => (None, None),
    };
    let day_rows = store::class_day_rows(
        conn,
        class_id,
        None,
        from_bucket.as_deref(),
        to_bucket.as_deref(),
    )
    .map_err(qerr)?;

    let mut totals = RollupCounts::default();
    for (_, counts) in &day_rows {
        totals.present += counts.present;
        totals.absent += counts.absent;
        totals.excused += counts.excused;
        totals.expected += counts.expected;
    }
    Ok(engagement_of(config, totals))
}

fn engagement_of(config: &EngineConfig, totals: RollupCounts) -> EngagementResult {
    if totals.expected == 0 {
        return EngagementResult {
            indeterminate: true,
            score: None,
            raw_ratio: None,
            excused_adjusted_ratio: None,
            present: 0,
            excused: 0,
            expected: 0,
        };
    }
    let raw = totals.present as f64 / totals.expected as f64;
    let adjusted_denom = totals.expected - totals.excused;
    // A fully-excused cohort is not disengaged; treat the adjusted ratio as
    // perfect rather than undefined.
    let adjusted = if adjusted_denom > 0 {
        totals.present as f64 / adjusted_denom as f64
    } else {
        1.0
    };
    let score = 100.0
        * (config.engagement_weight_present * raw
            + config.engagement_weight_excused_adjustment * adjusted);
    EngagementResult {
        indeterminate: false,
        score: Some(score.clamp(0.0, 100.0)),
        raw_ratio: Some(raw),
        excused_adjusted_ratio: Some(adjusted),
        present: totals.present,
        excused: totals.excused,
        expected: totals.expected,
    }
}
