use std::collections::BTreeMap;

use chrono::{Datelike, NaiveDate};
use serde::Serialize;

use crate::model::{AttendanceRecord, AttendanceStatus, Grade, SchoolClass};
use crate::text;

pub const QUARTERS: [&str; 4] = ["1º Bimestre", "2º Bimestre", "3º Bimestre", "4º Bimestre"];
pub const PASSING_GRADE: f64 = 6.0;
pub const EXCELLENCE_GRADE: f64 = 8.0;
pub const OTHER_AREA: &str = "Outros";

/// Month (0 = January) in which a new academic year starts.
pub const ACADEMIC_YEAR_START_MONTH: u32 = 1;

pub struct SubjectArea {
    pub name: &'static str,
    pub subjects: &'static [&'static str],
}

pub const SUBJECT_AREAS: &[SubjectArea] = &[
    SubjectArea {
        name: "Linguagens",
        subjects: &[
            "Língua Portuguesa",
            "Inglês",
            "Espanhol",
            "Educação Física",
            "Arte",
        ],
    },
    SubjectArea {
        name: "Ciências Humanas",
        subjects: &["História", "Geografia", "Filosofia", "Sociologia"],
    },
    SubjectArea {
        name: "Ciências da Natureza",
        subjects: &["Matemática", "Física", "Química", "Biologia"],
    },
];

/// Areas used by elementary (6º-9º ano) classes.
pub const FUNDAMENTAL_SUBJECT_AREAS: &[SubjectArea] = &[
    SubjectArea {
        name: "Linguagens",
        subjects: &["Língua Portuguesa", "Inglês", "Educação Física", "Arte"],
    },
    SubjectArea {
        name: "Matemática",
        subjects: &["Matemática"],
    },
    SubjectArea {
        name: "Ciências da Natureza",
        subjects: &["Ciências"],
    },
    SubjectArea {
        name: "Ciências Humanas",
        subjects: &["História", "Geografia", "Ensino Religioso"],
    },
];

pub fn all_subjects() -> Vec<&'static str> {
    SUBJECT_AREAS
        .iter()
        .flat_map(|a| a.subjects.iter().copied())
        .collect()
}

pub fn subject_area(subject: &str) -> &'static str {
    SUBJECT_AREAS
        .iter()
        .find(|a| a.subjects.contains(&subject))
        .map(|a| a.name)
        .unwrap_or(OTHER_AREA)
}

pub fn quarter_index(quarter: &str) -> Option<usize> {
    QUARTERS.iter().position(|q| *q == quarter)
}

pub fn is_valid_quarter(quarter: &str) -> bool {
    quarter_index(quarter).is_some()
}

/// Parses `YYYY-MM-DD`, also accepting a full RFC 3339 timestamp.
pub fn parse_date(value: &str) -> Option<NaiveDate> {
    let v = value.trim();
    let head = v.get(..10).unwrap_or(v);
    NaiveDate::parse_from_str(head, "%Y-%m-%d").ok()
}

fn valid_course_year(v: Option<u8>) -> Option<u8> {
    v.filter(|y| (1..=3).contains(y))
}

/// Calendar year in which the class started its first course year, from stored data only.
pub fn recorded_start_calendar_year(cls: &SchoolClass) -> Option<i32> {
    if let Some(y) = cls.start_calendar_year {
        return Some(y);
    }
    cls.start_year_date
        .as_deref()
        .and_then(parse_date)
        .map(|d| d.year())
}

/// Like [`recorded_start_calendar_year`], falling back to the class's current year.
pub fn start_calendar_year(cls: &SchoolClass, today: NaiveDate) -> Option<i32> {
    if let Some(y) = recorded_start_calendar_year(cls) {
        return Some(y);
    }
    valid_course_year(cls.current_year).map(|cy| today.year() - (i32::from(cy) - 1))
}

/// Course year (1..=3) the class is in during `target_year`, if any.
pub fn course_year_for_calendar_year(
    cls: &SchoolClass,
    target_year: i32,
    today: NaiveDate,
) -> Option<u8> {
    let start = start_calendar_year(cls, today)?;
    let course_year = target_year - start + 1;
    if (1..=3).contains(&course_year) {
        Some(course_year as u8)
    } else {
        None
    }
}

pub fn current_year_from_calendar(start_calendar_year: i32, today: NaiveDate) -> u8 {
    (today.year() - start_calendar_year + 1).clamp(1, 3) as u8
}

/// Course year reached by `today`, counting one step per academic year start
/// (`academic_start_month`, 0-based) after the class start date.
pub fn current_year_from_date(
    start_date: NaiveDate,
    start_year: u8,
    academic_start_month: u32,
    today: NaiveDate,
) -> u8 {
    if start_date > today {
        return start_year.clamp(1, 3);
    }
    let mut passed = today.year() - start_date.year();
    if passed > 0 && today.month0() < academic_start_month {
        passed -= 1;
    }
    (i32::from(start_year) + passed).clamp(1, 3) as u8
}

/// A class is archived once it has run through its last course year.
pub fn should_archive(start_date: NaiveDate, start_year: u8, today: NaiveDate) -> bool {
    if start_date > today {
        return false;
    }
    let years_diff = today.year() - start_date.year();
    let months_diff = today.month0() as i32 - start_date.month0() as i32;
    let years_to_complete = 4 - i32::from(start_year);
    years_diff > years_to_complete || (years_diff == years_to_complete && months_diff >= 2)
}

/// The calendar year of course year `course_year`, formatted as text.
pub fn academic_year_label(start_date: NaiveDate, course_year: u8) -> String {
    (start_date.year() + i32::from(course_year) - 1).to_string()
}

const COURSE_CODES: &[(&str, &str)] = &[
    ("redes de computadores", "RDC"),
    ("desenvolvimento de sistemas", "DS"),
    ("administracao financas", "ADF"),
    ("administracao e financas", "ADF"),
    ("administracao de financas", "ADF"),
    ("administracao financeira", "ADF"),
    ("comercio", "COM"),
    ("agronegocio", "AGR"),
    ("fruticultura", "FRU"),
];

pub fn course_code(course: &str) -> Option<&'static str> {
    let normalized = text::collapse_spaces(&text::normalize_key(course));
    COURSE_CODES
        .iter()
        .find(|(name, _)| *name == normalized)
        .map(|(_, code)| *code)
}

/// `"{first}-{last}-{CODE}"`, e.g. `2024-2026-DS` for a class starting in the first year.
pub fn class_number(course: Option<&str>, start_year_date: Option<&str>, start_year: Option<u8>) -> Option<String> {
    let course = course?;
    let start_date = parse_date(start_year_date?)?;
    let code = course_code(course)?;
    let start_year = start_year.unwrap_or(1);
    if !(1..=3).contains(&start_year) {
        return None;
    }
    let first = start_date.year();
    let last = first + (3 - i32::from(start_year));
    Some(format!("{}-{}-{}", first, last, code))
}

/// Final grade for one subject: the four quarters summed and divided by four,
/// missing quarters counting as zero. `None` when there is no quarter grade.
pub fn final_grade<'a>(grades: impl IntoIterator<Item = &'a Grade>, student_id: &str, subject: &str) -> Option<f64> {
    let mut by_quarter: [Option<f64>; 4] = [None; 4];
    for g in grades {
        if g.student_id != student_id || g.subject != subject {
            continue;
        }
        if let Some(i) = quarter_index(&g.quarter) {
            by_quarter[i] = Some(g.grade);
        }
    }
    if by_quarter.iter().all(Option::is_none) {
        return None;
    }
    Some(by_quarter.iter().map(|v| v.unwrap_or(0.0)).sum::<f64>() / 4.0)
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AcademicOutcome {
    Approved,
    Recovery,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StudentAcademicStatus {
    pub student_id: String,
    pub class_id: String,
    pub school_year: u8,
    pub status: AcademicOutcome,
    pub final_grades: BTreeMap<String, f64>,
    pub subjects_below_average: Vec<String>,
}

/// End-of-year outcome for one student in one class and course year.
/// Any failing subject sends the student to recovery.
pub fn student_academic_status(
    grades: &[Grade],
    student_id: &str,
    class_id: &str,
    school_year: u8,
) -> StudentAcademicStatus {
    let scoped: Vec<&Grade> = grades
        .iter()
        .filter(|g| g.student_id == student_id && g.class_id == class_id && g.school_year == school_year)
        .collect();

    let mut final_grades = BTreeMap::new();
    let mut below = Vec::new();
    let subjects: Vec<&str> = {
        let mut s: Vec<&str> = scoped.iter().map(|g| g.subject.as_str()).collect();
        s.sort_unstable();
        s.dedup();
        s
    };
    for subject in subjects {
        if let Some(fg) = final_grade(scoped.iter().copied(), student_id, subject) {
            final_grades.insert(subject.to_string(), fg);
            if fg < PASSING_GRADE {
                below.push(subject.to_string());
            }
        }
    }

    StudentAcademicStatus {
        student_id: student_id.to_string(),
        class_id: class_id.to_string(),
        school_year,
        status: if below.is_empty() {
            AcademicOutcome::Approved
        } else {
            AcademicOutcome::Recovery
        },
        final_grades,
        subjects_below_average: below,
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Classification {
    Critico,
    Atencao,
    Aprovado,
    Excelencia,
}

impl Classification {
    pub fn label(self) -> &'static str {
        match self {
            Self::Critico => "Crítico",
            Self::Atencao => "Atenção",
            Self::Aprovado => "Aprovado",
            Self::Excelencia => "Excelência",
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SubjectAverage {
    pub subject: String,
    pub average: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClassificationResult {
    pub classification: Classification,
    pub subjects_below6: Vec<SubjectAverage>,
    pub subjects_below6_count: usize,
    pub subject_averages: BTreeMap<String, f64>,
    pub average: f64,
    pub frequency: f64,
}

/// Present records over all records, as a percentage; 100 without records.
pub fn frequency<'a>(records: impl IntoIterator<Item = &'a AttendanceRecord>) -> f64 {
    let mut total = 0usize;
    let mut present = 0usize;
    for r in records {
        total += 1;
        if r.status == AttendanceStatus::Presente {
            present += 1;
        }
    }
    if total == 0 {
        100.0
    } else {
        present as f64 / total as f64 * 100.0
    }
}

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

pub fn classify_student(grades: &[&Grade], attendance: &[&AttendanceRecord]) -> ClassificationResult {
    let mut per_subject: BTreeMap<String, Vec<f64>> = BTreeMap::new();
    for g in grades {
        per_subject.entry(g.subject.clone()).or_default().push(g.grade);
    }
    let subject_averages: BTreeMap<String, f64> = per_subject
        .into_iter()
        .filter_map(|(s, v)| mean(&v).map(|m| (s, m)))
        .collect();

    let mut below: Vec<SubjectAverage> = subject_averages
        .iter()
        .filter(|(_, avg)| **avg < PASSING_GRADE)
        .map(|(s, avg)| SubjectAverage {
            subject: s.clone(),
            average: *avg,
        })
        .collect();
    below.sort_by(|a, b| a.average.total_cmp(&b.average));

    let all: Vec<f64> = grades.iter().map(|g| g.grade).collect();
    let average = mean(&all).unwrap_or(0.0);
    let frequency = frequency(attendance.iter().copied());

    let classification = if below.len() >= 3 {
        Classification::Critico
    } else if !below.is_empty() {
        Classification::Atencao
    } else if average >= EXCELLENCE_GRADE {
        Classification::Excelencia
    } else {
        Classification::Aprovado
    };

    ClassificationResult {
        classification,
        subjects_below6_count: below.len(),
        subjects_below6: below,
        subject_averages,
        average,
        frequency,
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Up,
    Down,
    Stable,
}

/// Per-quarter grade averages in quarter order, skipping quarters without grades.
pub fn quarter_averages<'a>(grades: impl IntoIterator<Item = &'a Grade>) -> Vec<f64> {
    let mut sums = [(0.0f64, 0usize); 4];
    for g in grades {
        if let Some(i) = quarter_index(&g.quarter) {
            sums[i].0 += g.grade;
            sums[i].1 += 1;
        }
    }
    sums.iter()
        .filter(|(_, n)| *n > 0)
        .map(|(s, n)| s / *n as f64)
        .filter(|v| *v > 0.0)
        .collect()
}

pub fn trend(averages: &[f64], threshold: f64) -> Trend {
    let [.., prev, last] = averages else {
        return Trend::Stable;
    };
    let diff = last - prev;
    if diff > threshold {
        Trend::Up
    } else if diff < -threshold {
        Trend::Down
    } else {
        Trend::Stable
    }
}

/// Change between the first and the last available quarter average.
pub fn growth(averages: &[f64]) -> Option<f64> {
    match averages {
        [first, .., last] => Some(last - first),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grade(student: &str, subject: &str, quarter: &str, value: f64) -> Grade {
        Grade {
            id: format!("{student}-{subject}-{quarter}"),
            student_id: student.to_string(),
            class_id: "c1".to_string(),
            subject: subject.to_string(),
            quarter: quarter.to_string(),
            school_year: 1,
            grade: value,
        }
    }

    fn date(s: &str) -> NaiveDate {
        parse_date(s).expect("date")
    }

    #[test]
    fn final_grade_counts_missing_quarters_as_zero() {
        let grades = vec![
            grade("s1", "Matemática", QUARTERS[0], 8.0),
            grade("s1", "Matemática", QUARTERS[1], 8.0),
        ];
        assert_eq!(final_grade(&grades, "s1", "Matemática"), Some(4.0));
        assert_eq!(final_grade(&grades, "s1", "Física"), None);
    }

    #[test]
    fn status_sends_any_failure_to_recovery() {
        let mut grades = Vec::new();
        for q in QUARTERS {
            grades.push(grade("s1", "Matemática", q, 7.0));
            grades.push(grade("s1", "Física", q, 5.0));
        }
        let status = student_academic_status(&grades, "s1", "c1", 1);
        assert_eq!(status.status, AcademicOutcome::Recovery);
        assert_eq!(status.subjects_below_average, vec!["Física".to_string()]);
        assert_eq!(status.final_grades.get("Matemática"), Some(&7.0));
    }

    #[test]
    fn classification_thresholds() {
        let g: Vec<Grade> = vec![
            grade("s1", "A", QUARTERS[0], 5.0),
            grade("s1", "B", QUARTERS[0], 5.5),
            grade("s1", "C", QUARTERS[0], 4.0),
        ];
        let refs: Vec<&Grade> = g.iter().collect();
        let r = classify_student(&refs, &[]);
        assert_eq!(r.classification, Classification::Critico);
        assert_eq!(r.subjects_below6[0].subject, "C");
        assert_eq!(r.frequency, 100.0);

        let g = vec![grade("s2", "A", QUARTERS[0], 9.0), grade("s2", "B", QUARTERS[0], 8.0)];
        let refs: Vec<&Grade> = g.iter().collect();
        assert_eq!(classify_student(&refs, &[]).classification, Classification::Excelencia);

        let g = vec![grade("s3", "A", QUARTERS[0], 5.9), grade("s3", "B", QUARTERS[0], 9.0)];
        let refs: Vec<&Grade> = g.iter().collect();
        assert_eq!(classify_student(&refs, &[]).classification, Classification::Atencao);
    }

    #[test]
    fn trend_uses_last_two_quarters() {
        assert_eq!(trend(&[6.0, 6.0, 6.5], 0.3), Trend::Up);
        assert_eq!(trend(&[6.0, 6.2], 0.3), Trend::Stable);
        assert_eq!(trend(&[7.0, 6.5], 0.2), Trend::Down);
        assert_eq!(trend(&[7.0], 0.2), Trend::Stable);
        assert_eq!(growth(&[5.0, 6.0, 7.5]), Some(2.5));
        assert_eq!(growth(&[5.0]), None);
    }

    #[test]
    fn class_year_calendar() {
        let today = date("2025-06-10");
        assert_eq!(current_year_from_calendar(2024, today), 2);
        assert_eq!(current_year_from_calendar(2020, today), 3);
        assert_eq!(current_year_from_calendar(2027, today), 1);

        let start = date("2024-02-05");
        assert_eq!(current_year_from_date(start, 1, ACADEMIC_YEAR_START_MONTH, date("2024-03-01")), 1);
        assert_eq!(current_year_from_date(start, 1, ACADEMIC_YEAR_START_MONTH, date("2025-01-20")), 1);
        assert_eq!(current_year_from_date(start, 1, ACADEMIC_YEAR_START_MONTH, date("2025-02-10")), 2);
        assert_eq!(current_year_from_date(start, 2, ACADEMIC_YEAR_START_MONTH, date("2026-03-01")), 3);
    }

    #[test]
    fn archive_after_last_course_year() {
        let start = date("2022-02-01");
        assert!(!should_archive(start, 1, date("2024-11-30")));
        assert!(!should_archive(start, 1, date("2025-03-01")));
        assert!(should_archive(start, 1, date("2025-04-01")));
        assert!(should_archive(start, 3, date("2023-05-01")));
    }

    #[test]
    fn class_numbers() {
        assert_eq!(
            class_number(Some("Desenvolvimento de Sistemas"), Some("2024-02-01"), Some(1)),
            Some("2024-2026-DS".to_string())
        );
        assert_eq!(
            class_number(Some("Administração  e Finanças"), Some("2025-02-01"), Some(2)),
            Some("2025-2026-ADF".to_string())
        );
        assert_eq!(class_number(Some("Enfermagem"), Some("2025-02-01"), None), None);
        assert_eq!(class_number(Some("Comércio"), None, None), None);
    }

    #[test]
    fn start_year_inference() {
        let today = date("2025-06-01");
        let mut cls = SchoolClass {
            id: "c1".into(),
            name: "1º A".into(),
            series: "1º ano".into(),
            letter: None,
            course: None,
            active: true,
            start_year: Some(1),
            current_year: Some(2),
            start_year_date: None,
            start_calendar_year: None,
            end_calendar_year: None,
            archived: false,
            archived_at: None,
            archived_reason: None,
            template_id: None,
            class_number: None,
        };
        assert_eq!(recorded_start_calendar_year(&cls), None);
        assert_eq!(start_calendar_year(&cls, today), Some(2024));
        cls.start_year_date = Some("2023-02-01".into());
        assert_eq!(start_calendar_year(&cls, today), Some(2023));
        assert_eq!(course_year_for_calendar_year(&cls, 2025, today), Some(3));
        assert_eq!(course_year_for_calendar_year(&cls, 2026, today), None);
    }
}
