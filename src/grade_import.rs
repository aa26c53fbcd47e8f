use serde::Serialize;
use thiserror::Error;

use crate::model::Student;
use crate::text;

pub const IMPORT_CHUNK_SIZE: usize = 50;
pub const MIN_MATCH_SIMILARITY: f64 = 0.7;
pub const AUTO_SELECT_SIMILARITY: f64 = 0.9;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ImportError {
    #[error("file is empty")]
    Empty,

    #[error("header row has no subject columns")]
    NoSubjectColumns,

    #[error("invalid quarter: {0}")]
    InvalidQuarter(String),

    #[error("schoolYear must be 1, 2 or 3 (got {0})")]
    InvalidSchoolYear(i64),
}

/// Upper-cased header text to canonical subject name.
const SUBJECT_ALIASES: &[(&str, &str)] = &[
    ("LNG", "Língua Portuguesa"),
    ("POR", "Língua Portuguesa"),
    ("PORTUGUÊS", "Língua Portuguesa"),
    ("LINGUA PORTUGUESA", "Língua Portuguesa"),
    ("LÍNGUA PORTUGUESA", "Língua Portuguesa"),
    ("MAT", "Matemática"),
    ("MATEMATICA", "Matemática"),
    ("MATEMÁTICA", "Matemática"),
    ("HIS", "História"),
    ("HISTÓRIA", "História"),
    ("HISTORIA", "História"),
    ("GEO", "Geografia"),
    ("GEOGRAFIA", "Geografia"),
    ("FIS", "Física"),
    ("FÍSICA", "Física"),
    ("FISICA", "Física"),
    ("QUI", "Química"),
    ("QUÍMICA", "Química"),
    ("QUIMICA", "Química"),
    ("BIO", "Biologia"),
    ("BIOLOGIA", "Biologia"),
    ("ING", "Inglês"),
    ("INGLÊS", "Inglês"),
    ("INGLES", "Inglês"),
    ("ESP", "Espanhol"),
    ("ESPANHOL", "Espanhol"),
    ("EDF", "Educação Física"),
    ("EDUCAÇÃO FÍSICA", "Educação Física"),
    ("EDUCACAO FISICA", "Educação Física"),
    ("ART", "Arte"),
    ("ARTE", "Arte"),
    ("FIL", "Filosofia"),
    ("FILOSOFIA", "Filosofia"),
    ("SOC", "Sociologia"),
    ("SOCIOLOGIA", "Sociologia"),
    ("RED", "Redação"),
    ("REDAÇÃO", "Redação"),
    ("REDACAO", "Redação"),
    ("LINGUA ESTRANGEIRA - INGLES", "Inglês"),
    ("LINGUA ESTRANGEIRA INGLES", "Inglês"),
    ("LINGUA ESTRANGEIRA - ESPANHOL", "Espanhol"),
    ("LINGUA ESTRANGEIRA ESPANHOL", "Espanhol"),
    ("INFORMATICA BASICA", "Informática"),
    ("INFORMÁTICA BÁSICA", "Informática"),
    ("INFORMATICA", "Informática"),
    ("LOGÍSTICA", "Logística"),
    ("LOGISTICA", "Logística"),
    ("ADMINISTRAÇÃO", "Administração"),
    ("ADMINISTRACAO", "Administração"),
    ("CONTABILIDADE", "Contabilidade"),
    ("ENFERMAGEM", "Enfermagem"),
];

fn header_words(s: &str) -> Vec<&str> {
    s.split(|c: char| !c.is_alphanumeric()).filter(|w| !w.is_empty()).collect()
}

/// Exact alias first, then the longest alias found as a run of whole words in
/// the header, so "MARKETING" never resolves through "ING".
pub fn normalize_subject_name(subject: &str) -> String {
    let upper = subject.trim().to_uppercase();
    if let Some((_, canonical)) = SUBJECT_ALIASES.iter().find(|(alias, _)| *alias == upper) {
        return canonical.to_string();
    }
    let words = header_words(&upper);
    let mut best: Option<(usize, &str)> = None;
    for (alias, canonical) in SUBJECT_ALIASES {
        let alias_words = header_words(alias);
        let n = alias_words.len();
        if n == 0 || n > words.len() || best.is_some_and(|(len, _)| len >= n) {
            continue;
        }
        if words.windows(n).any(|w| w == alias_words.as_slice()) {
            best = Some((n, *canonical));
        }
    }
    match best {
        Some((_, canonical)) => canonical.to_string(),
        None => subject.trim().to_string(),
    }
}

fn normalize_name(name: &str) -> String {
    text::collapse_spaces(&text::fold_accents(name).to_lowercase())
}

fn is_initial(word: &str) -> bool {
    let n = word.chars().count();
    n == 1 || (n == 2 && word.ends_with('.'))
}

fn words_match(w1: &str, w2: &str) -> bool {
    if w1 == w2 {
        return true;
    }
    if w1.chars().count() > 3 && w2.chars().count() > 3 && (w1.contains(w2) || w2.contains(w1)) {
        return true;
    }
    (is_initial(w1) || is_initial(w2)) && w1.chars().next() == w2.chars().next()
}

/// Similarity in `0.0..=1.0` between a name read from a file and a registered
/// student. Containment scores 0.9; otherwise it is the share of words (minus
/// connectives) that match exactly, by containment, or by initial.
pub fn name_similarity(a: &str, b: &str) -> f64 {
    let n1 = normalize_name(a);
    let n2 = normalize_name(b);
    if n1 == n2 {
        return 1.0;
    }
    if n1.contains(&n2) || n2.contains(&n1) {
        return 0.9;
    }

    const CONNECTIVES: [&str; 6] = ["de", "da", "do", "dos", "das", "e"];
    let words1: Vec<&str> = n1.split(' ').filter(|w| !CONNECTIVES.contains(w)).collect();
    let words2: Vec<&str> = n2.split(' ').filter(|w| !CONNECTIVES.contains(w)).collect();

    let matching = words1
        .iter()
        .filter(|w1| words2.iter().any(|w2| words_match(w1, w2)))
        .count();

    let total = words1.len().max(words2.len());
    if total == 0 {
        return 0.0;
    }
    matching as f64 / total as f64
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StudentMatch {
    pub student_id: String,
    pub student_name: String,
    pub similarity: f64,
}

/// Best registered student at or above [`MIN_MATCH_SIMILARITY`]; the first one
/// wins ties.
pub fn find_best_match(name: &str, students: &[Student]) -> Option<StudentMatch> {
    let mut best: Option<StudentMatch> = None;
    for student in students {
        let similarity = name_similarity(name, &student.name);
        if similarity >= MIN_MATCH_SIMILARITY
            && best.as_ref().map(|b| similarity > b.similarity).unwrap_or(true)
        {
            best = Some(StudentMatch {
                student_id: student.id.clone(),
                student_name: student.name.clone(),
                similarity,
            });
        }
    }
    best
}

/// The most frequent unquoted separator among tab, semicolon and comma.
fn detect_delimiter(header: &str) -> char {
    let mut in_quotes = false;
    let mut counts = [('\t', 0usize), (';', 0), (',', 0)];
    for c in header.chars() {
        if c == '"' {
            in_quotes = !in_quotes;
            continue;
        }
        if in_quotes {
            continue;
        }
        if let Some(entry) = counts.iter_mut().find(|(d, _)| *d == c) {
            entry.1 += 1;
        }
    }
    // Ties fall back to the comma.
    counts
        .iter()
        .filter(|(_, n)| *n > 0)
        .max_by_key(|(d, n)| (*n, *d == ','))
        .map(|(d, _)| *d)
        .unwrap_or(',')
}

fn split_record(line: &str, delimiter: char) -> Vec<String> {
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '"' if in_quotes && chars.peek() == Some(&'"') => {
                field.push('"');
                chars.next();
            }
            '"' => in_quotes = !in_quotes,
            c if c == delimiter && !in_quotes => fields.push(std::mem::take(&mut field)),
            c => field.push(c),
        }
    }
    fields.push(field);
    fields.into_iter().map(|f| f.trim().to_string()).collect()
}

/// Blank and `-` cells mean "no grade".
pub fn parse_grade_value(raw: &str) -> Result<Option<f64>, String> {
    let value = raw.trim();
    if value.is_empty() || value == "-" {
        return Ok(None);
    }
    let parsed: f64 = value
        .replace(',', ".")
        .parse()
        .map_err(|_| format!("not a number: {}", value))?;
    if !(0.0..=10.0).contains(&parsed) {
        return Err(format!("out of range 0-10: {}", value));
    }
    Ok(Some(parsed))
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedRow {
    pub line: usize,
    pub student_name: String,
    /// Subject and grade, blanks already skipped.
    pub grades: Vec<(String, f64)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedTable {
    pub subjects: Vec<String>,
    pub rows: Vec<ParsedRow>,
    pub warnings: Vec<String>,
}

fn is_name_header(cell: &str) -> bool {
    let key = text::normalize_key(cell);
    key.contains("nome") || key.contains("aluno") || key.contains("estudante")
}

/// Parses a delimited grade sheet: one header row naming the student column
/// and the subject columns after it, then one row per student.
pub fn parse_grade_table(input: &str) -> Result<ParsedTable, ImportError> {
    let input = input.strip_prefix('\u{feff}').unwrap_or(input);
    let mut lines = input
        .lines()
        .enumerate()
        .filter(|(_, l)| !l.trim().is_empty());
    let (_, header_line) = lines.next().ok_or(ImportError::Empty)?;
    let delimiter = detect_delimiter(header_line);
    let header = split_record(header_line, delimiter);

    let name_col = header.iter().position(|h| is_name_header(h)).unwrap_or(0);
    let columns: Vec<(usize, String)> = header
        .iter()
        .enumerate()
        .skip(name_col + 1)
        .filter(|(_, h)| !h.is_empty())
        .map(|(i, h)| (i, normalize_subject_name(h)))
        .collect();
    if columns.is_empty() {
        return Err(ImportError::NoSubjectColumns);
    }

    let mut subjects: Vec<String> = Vec::new();
    for (_, subject) in &columns {
        if !subjects.contains(subject) {
            subjects.push(subject.clone());
        }
    }

    let mut rows = Vec::new();
    let mut warnings = Vec::new();
    for (idx, line) in lines {
        let line_no = idx + 1;
        let cells = split_record(line, delimiter);
        let name = cells
            .get(name_col)
            .map(|n| text::collapse_spaces(n))
            .unwrap_or_default();
        if name.is_empty() {
            warnings.push(format!("line {}: missing student name", line_no));
            continue;
        }
        let mut grades = Vec::new();
        for (col, subject) in &columns {
            let raw = cells.get(*col).map(String::as_str).unwrap_or("");
            match parse_grade_value(raw) {
                Ok(Some(value)) => grades.push((subject.clone(), value)),
                Ok(None) => {}
                Err(reason) => warnings.push(format!("line {}: {} ({})", line_no, subject, reason)),
            }
        }
        rows.push(ParsedRow {
            line: line_no,
            student_name: name,
            grades,
        });
    }

    Ok(ParsedTable {
        subjects,
        rows,
        warnings,
    })
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ImportableGrade {
    pub student_id: String,
    pub student_name: String,
    pub extracted_name: String,
    pub similarity: f64,
    pub subject: String,
    pub grade: f64,
    pub selected: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ImportPreview {
    pub subjects: Vec<String>,
    pub grades: Vec<ImportableGrade>,
    pub unmatched_names: Vec<String>,
    pub warnings: Vec<String>,
}

/// Matches parsed rows against the class roster. Grades are pre-selected only
/// for high-confidence matches.
pub fn build_import_preview(table: ParsedTable, roster: &[Student]) -> ImportPreview {
    let mut grades = Vec::new();
    let mut unmatched_names = Vec::new();
    let mut warnings = table.warnings;
    let mut matched_ids: Vec<(String, String)> = Vec::new();

    for row in table.rows {
        let Some(found) = find_best_match(&row.student_name, roster) else {
            unmatched_names.push(row.student_name);
            continue;
        };
        if let Some((_, first)) = matched_ids.iter().find(|(id, _)| *id == found.student_id) {
            warnings.push(format!(
                "line {}: {} and {} both match {}",
                row.line, first, row.student_name, found.student_name
            ));
        } else {
            matched_ids.push((found.student_id.clone(), row.student_name.clone()));
        }
        for (subject, grade) in row.grades {
            grades.push(ImportableGrade {
                student_id: found.student_id.clone(),
                student_name: found.student_name.clone(),
                extracted_name: row.student_name.clone(),
                similarity: found.similarity,
                subject,
                grade,
                selected: found.similarity >= AUTO_SELECT_SIMILARITY,
            });
        }
    }

    ImportPreview {
        subjects: table.subjects,
        grades,
        unmatched_names,
        warnings,
    }
}

/// Quarter and course year every imported grade is written under.
pub fn check_import_target(quarter: &str, school_year: i64) -> Result<u8, ImportError> {
    if !crate::academic::is_valid_quarter(quarter) {
        return Err(ImportError::InvalidQuarter(quarter.to_string()));
    }
    u8::try_from(school_year)
        .ok()
        .filter(|y| (1..=3).contains(y))
        .ok_or(ImportError::InvalidSchoolYear(school_year))
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChunkReport {
    pub applied: usize,
    pub failed: usize,
    pub failed_chunks: usize,
    pub errors: Vec<String>,
}

/// Runs `apply` over `items` in chunks of [`IMPORT_CHUNK_SIZE`]. A failing chunk
/// is recorded and the remaining chunks still run.
pub fn apply_in_chunks<T, E, F>(items: &[T], mut apply: F) -> ChunkReport
where
    E: std::fmt::Display,
    F: FnMut(&[T]) -> Result<usize, E>,
{
    let mut report = ChunkReport::default();
    for (i, chunk) in items.chunks(IMPORT_CHUNK_SIZE).enumerate() {
        match apply(chunk) {
            Ok(n) => report.applied += n,
            Err(e) => {
                tracing::warn!(chunk = i, size = chunk.len(), error = %e, "grade import chunk failed");
                report.failed += chunk.len();
                report.failed_chunks += 1;
                report.errors.push(format!("chunk {}: {}", i + 1, e));
            }
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::StudentStatus;
    use pretty_assertions::assert_eq;

    fn student(id: &str, name: &str) -> Student {
        Student {
            id: id.into(),
            class_id: "c1".into(),
            name: name.into(),
            birth_date: None,
            gender: None,
            enrollment: None,
            census_id: None,
            status: StudentStatus::Active,
        }
    }

    #[test]
    fn subject_aliases_resolve() {
        assert_eq!(normalize_subject_name("lng"), "Língua Portuguesa");
        assert_eq!(normalize_subject_name(" Matemática "), "Matemática");
        assert_eq!(
            normalize_subject_name("LINGUA ESTRANGEIRA - INGLES (123)"),
            "Inglês"
        );
        assert_eq!(normalize_subject_name("Robótica"), "Robótica");
        assert_eq!(normalize_subject_name("MAT - 2º ano"), "Matemática");
    }

    #[test]
    fn subject_aliases_match_whole_words() {
        assert_eq!(normalize_subject_name("MARKETING"), "MARKETING");
        assert_eq!(normalize_subject_name("Redes de Computadores"), "Redes de Computadores");
        assert_eq!(normalize_subject_name("EDUCACAO FISICA II"), "Educação Física");
        assert_eq!(normalize_subject_name("Física Aplicada"), "Física");
    }

    #[test]
    fn similarity_heuristics() {
        assert_eq!(name_similarity("Ana Souza", "ANA  SOUZA"), 1.0);
        assert_eq!(name_similarity("Ana Souza", "Ana Souza Lima"), 0.9);
        assert_eq!(name_similarity("Maria B. Santos", "Maria Beatriz Santos"), 1.0);
        assert!(name_similarity("Pedro Alves", "Carlos Mendes") < MIN_MATCH_SIMILARITY);
    }

    #[test]
    fn parses_semicolon_sheet_with_comma_decimals() {
        let sheet = "\u{feff}Nº;NOME DO ALUNO;LNG;MAT;\"EDUCAÇÃO FÍSICA\"\n\
                     1;Ana Souza;8,5;7;\n\
                     2;João Lima;11;-;9\n\
                     \n\
                     3;;5;5;5\n";
        let table = parse_grade_table(sheet).expect("parse");
        assert_eq!(
            table.subjects,
            vec!["Língua Portuguesa", "Matemática", "Educação Física"]
        );
        assert_eq!(table.rows.len(), 2);
        assert_eq!(
            table.rows[0].grades,
            vec![
                ("Língua Portuguesa".to_string(), 8.5),
                ("Matemática".to_string(), 7.0)
            ]
        );
        assert_eq!(table.rows[1].grades, vec![("Educação Física".to_string(), 9.0)]);
        assert_eq!(table.warnings.len(), 2);
        assert!(table.warnings[0].starts_with("line 3: Língua Portuguesa"));
        assert_eq!(table.warnings[1], "line 5: missing student name");
    }

    #[test]
    fn comma_sheet_with_quoted_names() {
        let table = parse_grade_table("Aluno,Física\n\"Souza, Ana\",\"6,5\"\n").expect("parse");
        assert_eq!(table.rows[0].student_name, "Souza, Ana");
        assert_eq!(table.rows[0].grades, vec![("Física".to_string(), 6.5)]);
    }

    #[test]
    fn tab_separated_sheet() {
        let table = parse_grade_table("Nome\tMatemática\tRedes de Computadores\nAna Souza\t8,5\t7\n")
            .expect("parse");
        assert_eq!(
            table.subjects,
            vec!["Matemática".to_string(), "Redes de Computadores".to_string()]
        );
        assert_eq!(
            table.rows[0].grades,
            vec![
                ("Matemática".to_string(), 8.5),
                ("Redes de Computadores".to_string(), 7.0)
            ]
        );
    }

    #[test]
    fn header_without_subjects_is_rejected() {
        assert_eq!(parse_grade_table("Nome\nAna\n"), Err(ImportError::NoSubjectColumns));
        assert_eq!(parse_grade_table("  \n"), Err(ImportError::Empty));
    }

    #[test]
    fn preview_matches_roster() {
        let roster = vec![student("s1", "Ana Souza"), student("s2", "Maria Beatriz Santos")];
        let table = parse_grade_table(
            "Nome;MAT\nAna Souza;9\nMaria B Santos;7\nCarlos Mendes;5\n",
        )
        .expect("parse");
        let preview = build_import_preview(table, &roster);
        assert_eq!(preview.grades.len(), 2);
        assert!(preview.grades[0].selected);
        assert_eq!(preview.grades[1].student_id, "s2");
        assert_eq!(preview.unmatched_names, vec!["Carlos Mendes".to_string()]);
    }

    #[test]
    fn import_target_is_checked() {
        assert_eq!(check_import_target("2º Bimestre", 3), Ok(3));
        assert_eq!(
            check_import_target("5º Bimestre", 1),
            Err(ImportError::InvalidQuarter("5º Bimestre".into()))
        );
        assert_eq!(check_import_target("1º Bimestre", 0), Err(ImportError::InvalidSchoolYear(0)));
    }

    #[test]
    fn chunk_failures_do_not_stop_the_import() {
        let items: Vec<usize> = (0..120).collect();
        let mut calls = 0;
        let report = apply_in_chunks(&items, |chunk| {
            calls += 1;
            if chunk[0] == 50 {
                Err("constraint failed")
            } else {
                Ok(chunk.len())
            }
        });
        assert_eq!(calls, 3);
        assert_eq!(report.applied, 70);
        assert_eq!(report.failed, 50);
        assert_eq!(report.failed_chunks, 1);
        assert_eq!(report.errors, vec!["chunk 2: constraint failed".to_string()]);
    }
}
