use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("attendance.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subjects(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS classes(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            full_name TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS teaching_assignments(
            teacher_id TEXT NOT NULL,
            class_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            PRIMARY KEY(teacher_id, class_id, subject_id),
            FOREIGN KEY(class_id) REFERENCES classes(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_teaching_assignments_class
         ON teaching_assignments(class_id, subject_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS enrollments(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            class_id TEXT NOT NULL,
            effective_from TEXT NOT NULL,
            effective_to TEXT,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_enrollments_student ON enrollments(student_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_enrollments_class ON enrollments(class_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS lectures(
            id TEXT PRIMARY KEY,
            subject_id TEXT NOT NULL,
            class_id TEXT NOT NULL,
            teacher_id TEXT NOT NULL,
            scheduled_at TEXT NOT NULL,
            duration_minutes INTEGER NOT NULL,
            classroom TEXT,
            status TEXT NOT NULL DEFAULT 'scheduled',
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;
    ensure_lectures_status(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_lectures_class_subject
         ON lectures(class_id, subject_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_lectures_scheduled_at ON lectures(scheduled_at)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS lecture_roster(
            lecture_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            PRIMARY KEY(lecture_id, student_id),
            FOREIGN KEY(lecture_id) REFERENCES lectures(id),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_lecture_roster_student ON lecture_roster(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendance_events(
            id TEXT PRIMARY KEY,
            lecture_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            status TEXT NOT NULL,
            source TEXT NOT NULL,
            recorded_at TEXT NOT NULL,
            confidence REAL,
            ingested_at TEXT NOT NULL DEFAULT '',
            FOREIGN KEY(lecture_id) REFERENCES lectures(id),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    ensure_events_ingested_at(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_events_pair
         ON attendance_events(lecture_id, student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS effective_events(
            lecture_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            event_id TEXT NOT NULL,
            status TEXT NOT NULL,
            recorded_at TEXT NOT NULL,
            PRIMARY KEY(lecture_id, student_id),
            FOREIGN KEY(lecture_id) REFERENCES lectures(id),
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(event_id) REFERENCES attendance_events(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS rollups(
            dimension TEXT NOT NULL,
            student_id TEXT NOT NULL DEFAULT '',
            class_id TEXT NOT NULL DEFAULT '',
            subject_id TEXT NOT NULL DEFAULT '',
            bucket TEXT NOT NULL DEFAULT '',
            present INTEGER NOT NULL DEFAULT 0,
            absent INTEGER NOT NULL DEFAULT 0,
            excused INTEGER NOT NULL DEFAULT 0,
            expected INTEGER NOT NULL DEFAULT 0,
            last_event_id TEXT,
            updated_at TEXT,
            PRIMARY KEY(dimension, student_id, class_id, subject_id, bucket)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_rollups_class_subject
         ON rollups(dimension, class_id, subject_id, bucket)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )",
        [],
    )?;

    Ok(conn)
}

pub fn settings_get_json(
    conn: &Connection,
    key: &str,
) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row("SELECT value FROM settings WHERE key = ?", [key], |r| {
            r.get(0)
        })
        .optional()?;
    match raw {
        Some(s) => Ok(Some(serde_json::from_str(&s)?)),
        None => Ok(None),
    }
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        (key, serde_json::to_string(value)?),
    )?;
    Ok(())
}

fn ensure_lectures_status(conn: &Connection) -> anyhow::Result<()> {
    // Early workspaces predate cancellation-as-a-flag.
    if table_has_column(conn, "lectures", "status")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE lectures ADD COLUMN status TEXT NOT NULL DEFAULT 'scheduled'",
        [],
    )?;
    Ok(())
}

fn ensure_events_ingested_at(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "attendance_events", "ingested_at")? {
        return Ok(());
    }
    // Older logs carried only recorded_at; backfill arrival time from it.
    conn.execute(
        "ALTER TABLE attendance_events ADD COLUMN ingested_at TEXT NOT NULL DEFAULT ''",
        [],
    )?;
    conn.execute(
        "UPDATE attendance_events SET ingested_at = recorded_at WHERE ingested_at = ''",
        [],
    )?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
