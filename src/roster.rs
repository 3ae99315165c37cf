use crate::store;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};

/// Students enrolled in a class as of a moment in time. An enrollment counts
/// when its effective window contains `at` (half-open: from inclusive, to
/// exclusive).
pub fn enrolled_as_of(
    conn: &Connection,
    class_id: &str,
    at: DateTime<Utc>,
) -> rusqlite::Result<Vec<String>> {
    let stamp = store::ts(at);
    let mut stmt = conn.prepare(
        "SELECT DISTINCT student_id FROM enrollments
         WHERE class_id = ?
           AND effective_from <= ?
           AND (effective_to IS NULL OR effective_to > ?)
         ORDER BY student_id",
    )?;
    let rows = stmt.query_map((class_id, &stamp, &stamp), |r| r.get::<_, String>(0))?;
    rows.collect()
}

/// Freeze a lecture's expected-attendee set. Taken once at scheduling time so
/// later enrollment churn never rewrites history.
pub fn snapshot_roster(
    conn: &Connection,
    lecture_id: &str,
    student_ids: &[String],
) -> rusqlite::Result<()> {
    let mut stmt =
        conn.prepare("INSERT OR IGNORE INTO lecture_roster(lecture_id, student_id) VALUES(?, ?)")?;
    for student_id in student_ids {
        stmt.execute((lecture_id, student_id))?;
    }
    Ok(())
}

/// The roster snapshot for a lecture. `None` means the lecture id itself is
/// unknown; an existing lecture with an empty roster yields `Some(vec![])`.
pub fn expected_attendees(
    conn: &Connection,
    lecture_id: &str,
) -> rusqlite::Result<Option<Vec<String>>> {
    let exists = conn
        .query_row("SELECT 1 FROM lectures WHERE id = ?", [lecture_id], |r| {
            r.get::<_, i64>(0)
        })
        .optional()?
        .is_some();
    if !exists {
        return Ok(None);
    }
    let mut stmt = conn.prepare(
        "SELECT student_id FROM lecture_roster WHERE lecture_id = ? ORDER BY student_id",
    )?;
    let rows = stmt.query_map([lecture_id], |r| r.get::<_, String>(0))?;
    rows.collect::<Result<Vec<_>, _>>().map(Some)
}

pub fn on_roster(conn: &Connection, lecture_id: &str, student_id: &str) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT 1 FROM lecture_roster WHERE lecture_id = ? AND student_id = ?",
        (lecture_id, student_id),
        |r| r.get::<_, i64>(0),
    )
    .optional()
    .map(|v| v.is_some())
}
