use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;

use crate::certificates::{
    CertificateEvent, CertificateEventStudent, CertificateType, HighlightStatus, PeriodMode,
    ReferenceType, SignatureMode, VerificationStatus,
};
use crate::incidents::{
    Comment, FollowUpRecord, FollowUpType, Incident, IncidentStatus, IncidentType, Severity,
};
use crate::model::{
    AttendanceRecord, AttendanceStatus, ExternalAssessment, ExternalAssessmentType, Grade,
    HistoricalGrade, ProfessionalSubject, SchoolClass, SchoolLevel, Student, StudentStatus,
    SubjectTemplate, YearSubjects,
};

pub const DB_FILE: &str = "escola.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE);
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS classes(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            series TEXT NOT NULL,
            letter TEXT,
            course TEXT,
            active INTEGER NOT NULL DEFAULT 1,
            start_year INTEGER,
            current_year INTEGER,
            start_year_date TEXT,
            start_calendar_year INTEGER,
            end_calendar_year INTEGER,
            archived INTEGER NOT NULL DEFAULT 0,
            archived_at TEXT,
            archived_reason TEXT,
            template_id TEXT,
            class_number TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subject_templates(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            course TEXT,
            subjects_by_year TEXT NOT NULL,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS professional_subjects(
            id TEXT PRIMARY KEY,
            class_id TEXT NOT NULL,
            subject TEXT NOT NULL,
            FOREIGN KEY(class_id) REFERENCES classes(id),
            UNIQUE(class_id, subject)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            class_id TEXT NOT NULL,
            name TEXT NOT NULL,
            birth_date TEXT,
            gender TEXT,
            enrollment TEXT,
            census_id TEXT,
            status TEXT NOT NULL DEFAULT 'active',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_class ON students(class_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS grades(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            class_id TEXT NOT NULL,
            subject TEXT NOT NULL,
            quarter TEXT NOT NULL,
            grade REAL NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;
    // Older workspaces stored grades without a course year; they belong to year 1.
    ensure_grades_school_year(&conn)?;
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_grades_unique
         ON grades(student_id, class_id, subject, quarter, school_year)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grades_class ON grades(class_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendance(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            class_id TEXT NOT NULL,
            date TEXT NOT NULL,
            status TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(class_id) REFERENCES classes(id),
            UNIQUE(student_id, class_id, date)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS incidents(
            id TEXT PRIMARY KEY,
            class_id TEXT NOT NULL,
            date TEXT NOT NULL,
            incident_type TEXT NOT NULL DEFAULT 'disciplinar',
            calculated_severity TEXT NOT NULL,
            final_severity TEXT NOT NULL,
            severity_override_reason TEXT,
            description TEXT NOT NULL,
            actions TEXT,
            suggested_action TEXT,
            status TEXT NOT NULL DEFAULT 'aberta',
            validated_by TEXT,
            validated_at TEXT,
            created_by TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_incidents_class ON incidents(class_id)",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS incident_students(
            incident_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            PRIMARY KEY(incident_id, student_id),
            FOREIGN KEY(incident_id) REFERENCES incidents(id),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS incident_episodes(
            incident_id TEXT NOT NULL,
            episode_id TEXT NOT NULL,
            sort_order INTEGER NOT NULL,
            PRIMARY KEY(incident_id, episode_id),
            FOREIGN KEY(incident_id) REFERENCES incidents(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS follow_ups(
            id TEXT PRIMARY KEY,
            incident_id TEXT NOT NULL,
            type TEXT NOT NULL,
            date TEXT NOT NULL,
            responsavel TEXT NOT NULL,
            motivo TEXT,
            providencias TEXT,
            assuntos_tratados TEXT,
            encaminhamentos TEXT,
            disciplina TEXT,
            tipo_situacao TEXT,
            descricao_situacao TEXT,
            nome_responsavel_pai TEXT,
            grau_parentesco TEXT,
            created_by TEXT NOT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY(incident_id) REFERENCES incidents(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS incident_comments(
            id TEXT PRIMARY KEY,
            incident_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            user_name TEXT NOT NULL,
            text TEXT NOT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY(incident_id) REFERENCES incidents(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS certificate_events(
            id TEXT PRIMARY KEY,
            created_by_name TEXT NOT NULL,
            title TEXT NOT NULL,
            certificate_type TEXT NOT NULL,
            class_id TEXT,
            class_name_snapshot TEXT NOT NULL,
            school_year INTEGER NOT NULL,
            period_mode TEXT NOT NULL,
            selected_quarters TEXT NOT NULL,
            period_label TEXT NOT NULL,
            reference_type TEXT,
            reference_value TEXT,
            reference_label TEXT,
            base_text TEXT NOT NULL,
            teacher_name TEXT,
            director_name TEXT,
            signature_mode TEXT NOT NULL DEFAULT 'digital_cursive',
            type_meta TEXT NOT NULL DEFAULT '{}',
            students_count INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS certificate_event_students(
            id TEXT PRIMARY KEY,
            certificate_event_id TEXT NOT NULL,
            student_id TEXT,
            student_name_snapshot TEXT NOT NULL,
            text_override TEXT,
            highlight_status TEXT,
            highlight_average REAL,
            created_at TEXT NOT NULL,
            FOREIGN KEY(certificate_event_id) REFERENCES certificate_events(id)
        )",
        [],
    )?;
    ensure_certificate_verification_columns(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_certificate_students_code
         ON certificate_event_students(verification_code)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS external_assessments(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            assessment_type TEXT NOT NULL,
            assessment_name TEXT NOT NULL,
            subject TEXT,
            score REAL NOT NULL,
            max_score REAL NOT NULL,
            proficiency_level TEXT,
            applied_date TEXT NOT NULL,
            school_level TEXT NOT NULL,
            grade_year INTEGER NOT NULL,
            quarter TEXT,
            notes TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_external_assessments_student
         ON external_assessments(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS historical_grades(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            school_level TEXT NOT NULL,
            grade_year INTEGER NOT NULL,
            subject TEXT NOT NULL,
            quarter TEXT,
            grade REAL NOT NULL,
            school_name TEXT,
            calendar_year INTEGER,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_historical_grades_student
         ON historical_grades(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    Ok(conn)
}

fn ensure_grades_school_year(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "grades", "school_year")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE grades ADD COLUMN school_year INTEGER NOT NULL DEFAULT 1",
        [],
    )?;
    Ok(())
}

fn ensure_certificate_verification_columns(conn: &Connection) -> anyhow::Result<()> {
    if !table_has_column(conn, "certificate_event_students", "verification_code")? {
        conn.execute(
            "ALTER TABLE certificate_event_students ADD COLUMN verification_code TEXT",
            [],
        )?;
    }
    if !table_has_column(conn, "certificate_event_students", "verification_status")? {
        conn.execute(
            "ALTER TABLE certificate_event_students
             ADD COLUMN verification_status TEXT NOT NULL DEFAULT 'valid'",
            [],
        )?;
    }
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

pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

// ---------------------------------------------------------------------------
// Settings

pub fn settings_get_json(conn: &Connection, key: &str) -> anyhow::Result<Option<Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value_json FROM settings WHERE key = ?",
            [key],
            |r| r.get(0),
        )
        .optional()?;
    match raw {
        Some(s) => Ok(Some(serde_json::from_str(&s)?)),
        None => Ok(None),
    }
}

pub fn settings_set_json(conn: &Connection, key: &str, value: &Value) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        params![key, serde_json::to_string(value)?],
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Loaders

fn small_year(v: Option<i64>) -> Option<u8> {
    v.and_then(|n| u8::try_from(n).ok())
}

pub const CLASS_COLUMNS: &str = "id, name, series, letter, course, active, start_year, current_year,
    start_year_date, start_calendar_year, end_calendar_year, archived, archived_at,
    archived_reason, template_id, class_number";

fn class_from_row(r: &Row<'_>) -> rusqlite::Result<SchoolClass> {
    Ok(SchoolClass {
        id: r.get(0)?,
        name: r.get(1)?,
        series: r.get(2)?,
        letter: r.get(3)?,
        course: r.get(4)?,
        active: r.get::<_, i64>(5)? != 0,
        start_year: small_year(r.get(6)?),
        current_year: small_year(r.get(7)?),
        start_year_date: r.get(8)?,
        start_calendar_year: r.get(9)?,
        end_calendar_year: r.get(10)?,
        archived: r.get::<_, i64>(11)? != 0,
        archived_at: r.get(12)?,
        archived_reason: r.get(13)?,
        template_id: r.get(14)?,
        class_number: r.get(15)?,
    })
}

pub fn load_classes(conn: &Connection) -> anyhow::Result<Vec<SchoolClass>> {
    let sql = format!("SELECT {} FROM classes ORDER BY name", CLASS_COLUMNS);
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([], class_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn load_class(conn: &Connection, class_id: &str) -> anyhow::Result<Option<SchoolClass>> {
    let sql = format!("SELECT {} FROM classes WHERE id = ?", CLASS_COLUMNS);
    Ok(conn.query_row(&sql, [class_id], class_from_row).optional()?)
}

fn student_from_row(r: &Row<'_>) -> rusqlite::Result<Student> {
    let status: String = r.get(7)?;
    Ok(Student {
        id: r.get(0)?,
        class_id: r.get(1)?,
        name: r.get(2)?,
        birth_date: r.get(3)?,
        gender: r.get(4)?,
        enrollment: r.get(5)?,
        census_id: r.get(6)?,
        status: StudentStatus::parse(&status).unwrap_or(StudentStatus::Active),
    })
}

pub fn load_students(conn: &Connection, class_id: Option<&str>) -> anyhow::Result<Vec<Student>> {
    let base = "SELECT id, class_id, name, birth_date, gender, enrollment, census_id, status FROM students";
    let rows = match class_id {
        Some(cid) => {
            let mut stmt = conn.prepare(&format!("{} WHERE class_id = ? ORDER BY name", base))?;
            let rows = stmt
                .query_map([cid], student_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        }
        None => {
            let mut stmt = conn.prepare(&format!("{} ORDER BY name", base))?;
            let rows = stmt
                .query_map([], student_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        }
    };
    Ok(rows)
}

pub fn load_student(conn: &Connection, student_id: &str) -> anyhow::Result<Option<Student>> {
    Ok(conn
        .query_row(
            "SELECT id, class_id, name, birth_date, gender, enrollment, census_id, status
             FROM students WHERE id = ?",
            [student_id],
            student_from_row,
        )
        .optional()?)
}

fn grade_from_row(r: &Row<'_>) -> rusqlite::Result<Grade> {
    Ok(Grade {
        id: r.get(0)?,
        student_id: r.get(1)?,
        class_id: r.get(2)?,
        subject: r.get(3)?,
        quarter: r.get(4)?,
        school_year: small_year(r.get(5)?).unwrap_or(1),
        grade: r.get(6)?,
    })
}

pub fn load_grades(conn: &Connection, class_id: Option<&str>) -> anyhow::Result<Vec<Grade>> {
    let base = "SELECT id, student_id, class_id, subject, quarter, school_year, grade FROM grades";
    let rows = match class_id {
        Some(cid) => {
            let mut stmt = conn.prepare(&format!("{} WHERE class_id = ? ORDER BY subject, quarter", base))?;
            let rows = stmt
                .query_map([cid], grade_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        }
        None => {
            let mut stmt = conn.prepare(&format!("{} ORDER BY class_id, subject, quarter", base))?;
            let rows = stmt
                .query_map([], grade_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        }
    };
    Ok(rows)
}

pub const EXTERNAL_ASSESSMENT_COLUMNS: &str = "id, student_id, assessment_type, assessment_name,
    subject, score, max_score, proficiency_level, applied_date, school_level, grade_year, quarter,
    notes, created_at, updated_at";

fn external_assessment_from_row(r: &Row<'_>) -> rusqlite::Result<ExternalAssessment> {
    let kind: String = r.get(2)?;
    let level: String = r.get(9)?;
    Ok(ExternalAssessment {
        id: r.get(0)?,
        student_id: r.get(1)?,
        assessment_type: ExternalAssessmentType::parse(&kind).unwrap_or(ExternalAssessmentType::Outro),
        assessment_name: r.get(3)?,
        subject: r.get(4)?,
        score: r.get(5)?,
        max_score: r.get(6)?,
        proficiency_level: r.get(7)?,
        applied_date: r.get(8)?,
        school_level: SchoolLevel::parse(&level).unwrap_or(SchoolLevel::Medio),
        grade_year: small_year(r.get(10)?).unwrap_or(1),
        quarter: r.get(11)?,
        notes: r.get(12)?,
        created_at: r.get(13)?,
        updated_at: r.get(14)?,
    })
}

/// Newest first.
pub fn load_external_assessments(
    conn: &Connection,
    student_id: Option<&str>,
) -> anyhow::Result<Vec<ExternalAssessment>> {
    let base = format!("SELECT {} FROM external_assessments", EXTERNAL_ASSESSMENT_COLUMNS);
    let rows = match student_id {
        Some(sid) => {
            let mut stmt = conn.prepare(&format!(
                "{} WHERE student_id = ? ORDER BY applied_date DESC, created_at DESC",
                base
            ))?;
            let rows = stmt
                .query_map([sid], external_assessment_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        }
        None => {
            let mut stmt = conn.prepare(&format!("{} ORDER BY applied_date DESC, created_at DESC", base))?;
            let rows = stmt
                .query_map([], external_assessment_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        }
    };
    Ok(rows)
}

pub fn load_external_assessment(
    conn: &Connection,
    id: &str,
) -> anyhow::Result<Option<ExternalAssessment>> {
    let sql = format!(
        "SELECT {} FROM external_assessments WHERE id = ?",
        EXTERNAL_ASSESSMENT_COLUMNS
    );
    Ok(conn.query_row(&sql, [id], external_assessment_from_row).optional()?)
}

fn historical_grade_from_row(r: &Row<'_>) -> rusqlite::Result<HistoricalGrade> {
    let level: String = r.get(2)?;
    Ok(HistoricalGrade {
        id: r.get(0)?,
        student_id: r.get(1)?,
        school_level: SchoolLevel::parse(&level).unwrap_or(SchoolLevel::Fundamental),
        grade_year: small_year(r.get(3)?).unwrap_or(6),
        subject: r.get(4)?,
        quarter: r.get(5)?,
        grade: r.get(6)?,
        school_name: r.get(7)?,
        calendar_year: r.get(8)?,
    })
}

pub fn load_historical_grades(
    conn: &Connection,
    student_id: Option<&str>,
) -> anyhow::Result<Vec<HistoricalGrade>> {
    let base = "SELECT id, student_id, school_level, grade_year, subject, quarter, grade,
        school_name, calendar_year FROM historical_grades";
    let rows = match student_id {
        Some(sid) => {
            let mut stmt = conn.prepare(&format!(
                "{} WHERE student_id = ? ORDER BY school_level, grade_year, subject",
                base
            ))?;
            let rows = stmt
                .query_map([sid], historical_grade_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        }
        None => {
            let mut stmt = conn.prepare(&format!(
                "{} ORDER BY student_id, school_level, grade_year, subject",
                base
            ))?;
            let rows = stmt
                .query_map([], historical_grade_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        }
    };
    Ok(rows)
}

fn attendance_from_row(r: &Row<'_>) -> rusqlite::Result<AttendanceRecord> {
    let status: String = r.get(4)?;
    Ok(AttendanceRecord {
        id: r.get(0)?,
        student_id: r.get(1)?,
        class_id: r.get(2)?,
        date: r.get(3)?,
        status: AttendanceStatus::parse(&status).unwrap_or(AttendanceStatus::Presente),
    })
}

pub fn load_attendance(conn: &Connection, class_id: Option<&str>) -> anyhow::Result<Vec<AttendanceRecord>> {
    let base = "SELECT id, student_id, class_id, date, status FROM attendance";
    let rows = match class_id {
        Some(cid) => {
            let mut stmt = conn.prepare(&format!("{} WHERE class_id = ? ORDER BY date", base))?;
            let rows = stmt
                .query_map([cid], attendance_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        }
        None => {
            let mut stmt = conn.prepare(&format!("{} ORDER BY date", base))?;
            let rows = stmt
                .query_map([], attendance_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        }
    };
    Ok(rows)
}

pub fn load_templates(conn: &Connection) -> anyhow::Result<Vec<SubjectTemplate>> {
    let mut stmt =
        conn.prepare("SELECT id, name, course, subjects_by_year FROM subject_templates ORDER BY name")?;
    let raw = stmt
        .query_map([], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, Option<String>>(2)?,
                r.get::<_, String>(3)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    let mut out = Vec::with_capacity(raw.len());
    for (id, name, course, by_year) in raw {
        let subjects_by_year: Vec<YearSubjects> = serde_json::from_str(&by_year).unwrap_or_default();
        out.push(SubjectTemplate {
            id,
            name,
            course,
            subjects_by_year,
        });
    }
    Ok(out)
}

pub fn load_professional_subjects(
    conn: &Connection,
    class_id: Option<&str>,
) -> anyhow::Result<Vec<ProfessionalSubject>> {
    let map = |r: &Row<'_>| {
        Ok(ProfessionalSubject {
            id: r.get(0)?,
            class_id: r.get(1)?,
            subject: r.get(2)?,
        })
    };
    let rows = match class_id {
        Some(cid) => {
            let mut stmt = conn.prepare(
                "SELECT id, class_id, subject FROM professional_subjects WHERE class_id = ? ORDER BY subject",
            )?;
            let rows = stmt.query_map([cid], map)?.collect::<Result<Vec<_>, _>>()?;
            rows
        }
        None => {
            let mut stmt =
                conn.prepare("SELECT id, class_id, subject FROM professional_subjects ORDER BY class_id, subject")?;
            let rows = stmt.query_map([], map)?.collect::<Result<Vec<_>, _>>()?;
            rows
        }
    };
    Ok(rows)
}

fn follow_up_from_row(r: &Row<'_>) -> rusqlite::Result<FollowUpRecord> {
    let kind: String = r.get(2)?;
    Ok(FollowUpRecord {
        id: r.get(0)?,
        incident_id: r.get(1)?,
        follow_up_type: FollowUpType::parse(&kind).unwrap_or(FollowUpType::ConversaIndividual),
        date: r.get(3)?,
        responsavel: r.get(4)?,
        motivo: r.get(5)?,
        providencias: r.get(6)?,
        assuntos_tratados: r.get(7)?,
        encaminhamentos: r.get(8)?,
        disciplina: r.get(9)?,
        tipo_situacao: r.get(10)?,
        descricao_situacao: r.get(11)?,
        nome_responsavel_pai: r.get(12)?,
        grau_parentesco: r.get(13)?,
        created_by: r.get(14)?,
        created_at: r.get(15)?,
    })
}

fn incident_children(
    conn: &Connection,
    incidents: &mut [Incident],
) -> anyhow::Result<()> {
    let mut students_stmt =
        conn.prepare("SELECT student_id FROM incident_students WHERE incident_id = ? ORDER BY rowid")?;
    let mut episodes_stmt =
        conn.prepare("SELECT episode_id FROM incident_episodes WHERE incident_id = ? ORDER BY sort_order")?;
    let mut follow_stmt = conn.prepare(
        "SELECT id, incident_id, type, date, responsavel, motivo, providencias, assuntos_tratados,
                encaminhamentos, disciplina, tipo_situacao, descricao_situacao,
                nome_responsavel_pai, grau_parentesco, created_by, created_at
         FROM follow_ups WHERE incident_id = ? ORDER BY date, created_at",
    )?;
    let mut comments_stmt = conn.prepare(
        "SELECT id, user_id, user_name, text, created_at
         FROM incident_comments WHERE incident_id = ? ORDER BY created_at, rowid",
    )?;

    for incident in incidents.iter_mut() {
        incident.student_ids = students_stmt
            .query_map([&incident.id], |r| r.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        incident.episodes = episodes_stmt
            .query_map([&incident.id], |r| r.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        incident.follow_ups = follow_stmt
            .query_map([&incident.id], follow_up_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        incident.comments = comments_stmt
            .query_map([&incident.id], |r| {
                Ok(Comment {
                    id: r.get(0)?,
                    user_id: r.get(1)?,
                    user_name: r.get(2)?,
                    text: r.get(3)?,
                    created_at: r.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
    }
    Ok(())
}

fn incident_from_row(r: &Row<'_>) -> rusqlite::Result<Incident> {
    let kind: String = r.get(3)?;
    let calculated: String = r.get(4)?;
    let final_severity: String = r.get(5)?;
    let status: String = r.get(10)?;
    Ok(Incident {
        id: r.get(0)?,
        class_id: r.get(1)?,
        date: r.get(2)?,
        incident_type: IncidentType::parse(&kind).unwrap_or_default(),
        student_ids: Vec::new(),
        episodes: Vec::new(),
        calculated_severity: Severity::parse(&calculated).unwrap_or(Severity::Leve),
        final_severity: Severity::parse(&final_severity).unwrap_or(Severity::Leve),
        severity_override_reason: r.get(6)?,
        description: r.get(7)?,
        actions: r.get(8)?,
        suggested_action: r.get(9)?,
        status: IncidentStatus::parse(&status).unwrap_or(IncidentStatus::Aberta),
        validated_by: r.get(11)?,
        validated_at: r.get(12)?,
        follow_ups: Vec::new(),
        comments: Vec::new(),
        created_by: r.get(13)?,
        created_at: r.get(14)?,
        updated_at: r.get(15)?,
    })
}

const INCIDENT_COLUMNS: &str = "id, class_id, date, incident_type, calculated_severity, final_severity,
    severity_override_reason, description, actions, suggested_action, status, validated_by,
    validated_at, created_by, created_at, updated_at";

pub fn load_incidents(conn: &Connection, class_id: Option<&str>) -> anyhow::Result<Vec<Incident>> {
    let mut incidents = match class_id {
        Some(cid) => {
            let sql = format!(
                "SELECT {} FROM incidents WHERE class_id = ? ORDER BY date DESC, created_at DESC",
                INCIDENT_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([cid], incident_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        }
        None => {
            let sql = format!(
                "SELECT {} FROM incidents ORDER BY date DESC, created_at DESC",
                INCIDENT_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([], incident_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        }
    };
    incident_children(conn, &mut incidents)?;
    Ok(incidents)
}

pub fn load_incident(conn: &Connection, incident_id: &str) -> anyhow::Result<Option<Incident>> {
    let sql = format!("SELECT {} FROM incidents WHERE id = ?", INCIDENT_COLUMNS);
    let Some(incident) = conn.query_row(&sql, [incident_id], incident_from_row).optional()? else {
        return Ok(None);
    };
    let mut one = [incident];
    incident_children(conn, &mut one)?;
    let [incident] = one;
    Ok(Some(incident))
}

/// Removes an incident and everything hanging off it. Runs inside the caller's
/// transaction.
pub fn delete_incident_rows(conn: &Connection, incident_id: &str) -> rusqlite::Result<usize> {
    for table in ["incident_comments", "follow_ups", "incident_episodes", "incident_students"] {
        conn.execute(
            &format!("DELETE FROM {} WHERE incident_id = ?", table),
            [incident_id],
        )?;
    }
    conn.execute("DELETE FROM incidents WHERE id = ?", [incident_id])
}

fn certificate_student_from_row(r: &Row<'_>) -> rusqlite::Result<CertificateEventStudent> {
    let highlight: Option<String> = r.get(5)?;
    let status: Option<String> = r.get(8)?;
    let id: String = r.get(0)?;
    let code: Option<String> = r.get(7)?;
    Ok(CertificateEventStudent {
        certificate_event_id: r.get(1)?,
        student_id: r.get(2)?,
        student_name_snapshot: r.get(3)?,
        text_override: r.get(4)?,
        highlight_status: highlight.as_deref().and_then(HighlightStatus::parse),
        highlight_average: r.get(6)?,
        verification_code: code
            .map(|c| c.trim().to_uppercase())
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| id.replace('-', "").to_uppercase()),
        verification_status: VerificationStatus::parse_lenient(status.as_deref()),
        created_at: r.get(9)?,
        id,
    })
}

const CERTIFICATE_EVENT_COLUMNS: &str = "id, created_by_name, title, certificate_type, class_id,
    class_name_snapshot, school_year, period_mode, selected_quarters, period_label,
    reference_type, reference_value, reference_label, base_text, teacher_name, director_name,
    signature_mode, type_meta, students_count, created_at, updated_at";

fn certificate_event_from_row(r: &Row<'_>) -> rusqlite::Result<CertificateEvent> {
    let ty: String = r.get(3)?;
    let mode: String = r.get(7)?;
    let quarters: String = r.get(8)?;
    let reference_type: Option<String> = r.get(10)?;
    let signature: Option<String> = r.get(16)?;
    let type_meta: String = r.get(17)?;
    Ok(CertificateEvent {
        id: r.get(0)?,
        created_by_name: r.get(1)?,
        title: r.get(2)?,
        certificate_type: CertificateType::parse(&ty).unwrap_or(CertificateType::Monitoria),
        class_id: r.get(4)?,
        class_name_snapshot: r.get(5)?,
        school_year: small_year(r.get(6)?).unwrap_or(1),
        period_mode: PeriodMode::parse(&mode).unwrap_or_default(),
        selected_quarters: serde_json::from_str(&quarters).unwrap_or_default(),
        period_label: r.get(9)?,
        reference_type: reference_type.as_deref().and_then(ReferenceType::parse),
        reference_value: r.get(11)?,
        reference_label: r.get(12)?,
        base_text: r.get(13)?,
        teacher_name: r.get(14)?,
        director_name: r.get(15)?,
        signature_mode: SignatureMode::parse_lenient(signature.as_deref()),
        type_meta: serde_json::from_str(&type_meta).unwrap_or(Value::Object(Default::default())),
        students_count: r.get::<_, i64>(18)?.max(0) as usize,
        created_at: r.get(19)?,
        updated_at: r.get(20)?,
        students: Vec::new(),
    })
}

const CERTIFICATE_STUDENT_COLUMNS: &str = "id, certificate_event_id, student_id,
    student_name_snapshot, text_override, highlight_status, highlight_average,
    verification_code, verification_status, created_at";

fn load_event_students(conn: &Connection, event_id: &str) -> anyhow::Result<Vec<CertificateEventStudent>> {
    let sql = format!(
        "SELECT {} FROM certificate_event_students WHERE certificate_event_id = ?",
        CERTIFICATE_STUDENT_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt
        .query_map([event_id], certificate_student_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.sort_by(|a, b| crate::text::compare_pt(&a.student_name_snapshot, &b.student_name_snapshot));
    Ok(rows)
}

/// Events newest first, each with its students sorted by name.
pub fn load_certificate_events(conn: &Connection) -> anyhow::Result<Vec<CertificateEvent>> {
    let sql = format!(
        "SELECT {} FROM certificate_events ORDER BY created_at DESC",
        CERTIFICATE_EVENT_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut events = stmt
        .query_map([], certificate_event_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    for event in events.iter_mut() {
        event.students = load_event_students(conn, &event.id)?;
    }
    Ok(events)
}

pub fn load_certificate_event(conn: &Connection, event_id: &str) -> anyhow::Result<Option<CertificateEvent>> {
    let sql = format!(
        "SELECT {} FROM certificate_events WHERE id = ?",
        CERTIFICATE_EVENT_COLUMNS
    );
    let Some(mut event) = conn
        .query_row(&sql, [event_id], certificate_event_from_row)
        .optional()?
    else {
        return Ok(None);
    };
    event.students = load_event_students(conn, event_id)?;
    Ok(Some(event))
}

/// Rows saved before verification codes existed get one derived from their id.
pub fn repair_missing_verification_codes(conn: &Connection) -> anyhow::Result<usize> {
    let n = conn.execute(
        "UPDATE certificate_event_students
         SET verification_code = UPPER(REPLACE(id, '-', ''))
         WHERE verification_code IS NULL OR TRIM(verification_code) = ''",
        [],
    )?;
    Ok(n)
}

pub struct VerificationRow {
    pub verification_code: String,
    pub verification_status: VerificationStatus,
    pub issued_at: String,
    pub student_name: String,
    pub certificate_type: CertificateType,
    pub event_title: String,
    pub class_name: String,
}

pub fn find_by_verification_code(conn: &Connection, code: &str) -> anyhow::Result<Option<VerificationRow>> {
    let row = conn
        .query_row(
            "SELECT s.verification_code, s.verification_status, s.created_at,
                    s.student_name_snapshot, e.certificate_type, e.title, e.class_name_snapshot
             FROM certificate_event_students s
             JOIN certificate_events e ON e.id = s.certificate_event_id
             WHERE UPPER(s.verification_code) = ?",
            [code],
            |r| {
                let status: Option<String> = r.get(1)?;
                let ty: String = r.get(4)?;
                Ok(VerificationRow {
                    verification_code: r.get(0)?,
                    verification_status: VerificationStatus::parse_lenient(status.as_deref()),
                    issued_at: r.get(2)?,
                    student_name: r.get(3)?,
                    certificate_type: CertificateType::parse(&ty).unwrap_or(CertificateType::Monitoria),
                    event_title: r.get(5)?,
                    class_name: r.get(6)?,
                })
            },
        )
        .optional()?;
    Ok(row)
}

/// Student counts per class, for list views.
pub fn student_counts(conn: &Connection) -> anyhow::Result<HashMap<String, i64>> {
    let mut stmt = conn.prepare("SELECT class_id, COUNT(*) FROM students GROUP BY class_id")?;
    let rows = stmt
        .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))?
        .collect::<Result<HashMap<_, _>, _>>()?;
    Ok(rows)
}
