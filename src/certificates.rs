use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::academic::{self, SubjectArea, FUNDAMENTAL_SUBJECT_AREAS, QUARTERS, SUBJECT_AREAS};
use crate::model::{Grade, SchoolClass, Student, SubjectTemplate};
use crate::text;

pub const MAX_VISIBLE_TEXT: usize = 520;
pub const TECHNICAL_AREA: &str = "Formação Técnica e Profissional";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CertificateType {
    Monitoria,
    Destaque,
    EventoParticipacao,
    EventoOrganizacao,
}

impl CertificateType {
    pub const ORDER: [CertificateType; 4] = [
        CertificateType::Monitoria,
        CertificateType::Destaque,
        CertificateType::EventoParticipacao,
        CertificateType::EventoOrganizacao,
    ];

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "monitoria" => Some(Self::Monitoria),
            "destaque" => Some(Self::Destaque),
            "evento_participacao" => Some(Self::EventoParticipacao),
            "evento_organizacao" => Some(Self::EventoOrganizacao),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Monitoria => "monitoria",
            Self::Destaque => "destaque",
            Self::EventoParticipacao => "evento_participacao",
            Self::EventoOrganizacao => "evento_organizacao",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Monitoria => "Monitoria",
            Self::Destaque => "Aluno Destaque",
            Self::EventoParticipacao => "Evento: Participação",
            Self::EventoOrganizacao => "Evento: Organização",
        }
    }

    pub fn is_event(self) -> bool {
        matches!(self, Self::EventoParticipacao | Self::EventoOrganizacao)
    }

    pub fn template(self) -> &'static str {
        match self {
            Self::Monitoria => "A {{escola}} certifica que o(a) aluno(a) {{aluno}}, da turma {{turma}}, atuou como monitor(a){{referencia}}, realizando {{atividade}} {{periodoMonitoria}}, totalizando {{cargaHoraria}} horas.",
            Self::Destaque => "A {{escola}} certifica que o(a) aluno(a) {{aluno}}, da turma {{turma}}, foi reconhecido(a) pelo excelente desempenho {{periodo}}{{referencia}}, demonstrando compromisso exemplar com os estudos.",
            Self::EventoParticipacao => "A {{escola}} certifica que o(a) aluno(a) {{aluno}}, da turma {{turma}}, participou do evento \"{{eventoNome}}\"{{eventoPapel}}{{referencia}}, realizado em {{eventoData}}, com carga horária de {{cargaHoraria}} horas.",
            Self::EventoOrganizacao => "A {{escola}} certifica que o(a) aluno(a) {{aluno}}, da turma {{turma}}, atuou na organização do evento \"{{eventoNome}}\"{{eventoPapel}}{{referencia}}, realizado em {{eventoData}}, com carga horária de {{cargaHoraria}} horas.",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PeriodMode {
    #[default]
    Quarters,
    Annual,
}

impl PeriodMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Quarters => "quarters",
            Self::Annual => "annual",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "quarters" => Some(Self::Quarters),
            "annual" => Some(Self::Annual),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SignatureMode {
    #[default]
    DigitalCursive,
    PhysicalPrint,
}

impl SignatureMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DigitalCursive => "digital_cursive",
            Self::PhysicalPrint => "physical_print",
        }
    }

    /// Anything other than `physical_print` signs digitally.
    pub fn parse_lenient(s: Option<&str>) -> Self {
        match s {
            Some("physical_print") => Self::PhysicalPrint,
            _ => Self::DigitalCursive,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ReferenceType {
    Subject,
    Area,
}

impl ReferenceType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Subject => "subject",
            Self::Area => "area",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "subject" => Some(Self::Subject),
            "area" => Some(Self::Area),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum VerificationStatus {
    #[default]
    Valid,
    Revoked,
}

impl VerificationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Valid => "valid",
            Self::Revoked => "revoked",
        }
    }

    /// Unknown or missing values count as valid.
    pub fn parse_lenient(s: Option<&str>) -> Self {
        match s {
            Some("revoked") => Self::Revoked,
            _ => Self::Valid,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HighlightStatus {
    Confirmed,
    Pending,
}

impl HighlightStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Confirmed => "confirmed",
            Self::Pending => "pending",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "confirmed" => Some(Self::Confirmed),
            "pending" => Some(Self::Pending),
            _ => None,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CertificateError {
    #[error("title is required")]
    MissingTitle,

    #[error("certificate text is required")]
    EmptyText,

    /// Course years run from 1 to 3.
    #[error("schoolYear must be 1, 2 or 3 (got {0})")]
    InvalidSchoolYear(i64),

    #[error("select at least one student")]
    NoStudents,

    #[error("student name must not be empty")]
    BlankStudentName,

    /// Quarter-based certificates need at least one valid quarter.
    #[error("select at least one quarter")]
    NoQuarters,

    #[error("verification code is empty")]
    EmptyVerificationCode,
}

// ---------------------------------------------------------------------------
// Period labels

pub fn resolve_certificate_quarters(mode: PeriodMode, selected: &[String]) -> Vec<String> {
    if mode == PeriodMode::Annual {
        return QUARTERS.iter().map(|q| q.to_string()).collect();
    }
    let mut seen = HashSet::new();
    selected
        .iter()
        .filter(|q| academic::is_valid_quarter(q))
        .filter(|q| seen.insert(q.as_str()))
        .cloned()
        .collect()
}

fn lower_quarter_label(q: &str) -> String {
    q.replace("Bimestre", "bimestre")
}

pub fn format_period_label(mode: PeriodMode, selected: &[String], year: i32) -> String {
    if mode == PeriodMode::Annual {
        return format!("1º ao 4º bimestre de {}", year);
    }
    let quarters = resolve_certificate_quarters(mode, selected);
    if quarters.is_empty() {
        return "bimestres não selecionados".to_string();
    }
    let labels: Vec<String> = quarters.iter().map(|q| lower_quarter_label(q)).collect();
    format!("{} de {}", text::join_with_and(&labels), year)
}

// ---------------------------------------------------------------------------
// Templates

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TemplateData {
    pub aluno: String,
    pub escola: String,
    pub turma: String,
    pub ano_turma: String,
    pub periodo: String,
    pub referencia: String,
    pub carga_horaria: String,
    pub atividade: String,
    pub periodo_monitoria: String,
    pub evento_nome: String,
    pub evento_data: String,
    pub evento_local: String,
    pub evento_papel: String,
}

/// Collapses runs of two or more whitespace characters into one space.
fn collapse_runs(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut run = String::new();
    for c in s.chars() {
        if c.is_whitespace() {
            run.push(c);
            continue;
        }
        flush_run(&mut out, &mut run);
        out.push(c);
    }
    flush_run(&mut out, &mut run);
    out
}

fn flush_run(out: &mut String, run: &mut String) {
    if run.chars().count() >= 2 {
        out.push(' ');
    } else {
        out.push_str(run);
    }
    run.clear();
}

fn template_fragment(s: &str) -> String {
    collapse_runs(s).trim_end().to_string()
}

/// Drops whitespace directly before each char in `marks`.
fn strip_space_before(s: &str, marks: &[char]) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if marks.contains(&c) {
            let kept = out.trim_end().len();
            out.truncate(kept);
        }
        out.push(c);
    }
    out
}

/// Replaces `first`, optional whitespace, `second` with `with`, left to right.
fn merge_pairs(s: &str, first: char, second: char, with: &str) -> String {
    let chars: Vec<char> = s.chars().collect();
    let mut out = String::with_capacity(s.len());
    let mut i = 0;
    while i < chars.len() {
        if chars[i] == first {
            let mut j = i + 1;
            while j < chars.len() && chars[j].is_whitespace() {
                j += 1;
            }
            if j < chars.len() && chars[j] == second {
                out.push_str(with);
                i = j + 1;
                continue;
            }
        }
        out.push(chars[i]);
        i += 1;
    }
    out
}

fn normalize_semicolons(s: &str) -> String {
    let chars: Vec<char> = s.chars().collect();
    let mut out = String::with_capacity(s.len());
    let mut i = 0;
    while i < chars.len() {
        if chars[i].is_whitespace() || chars[i] == ';' {
            let mut j = i;
            while j < chars.len() && chars[j].is_whitespace() {
                j += 1;
            }
            if j < chars.len() && chars[j] == ';' {
                j += 1;
                while j < chars.len() && chars[j].is_whitespace() {
                    j += 1;
                }
                out.push_str("; ");
                i = j;
                continue;
            }
        }
        out.push(chars[i]);
        i += 1;
    }
    out
}

/// Substitutes `{{placeholders}}` and tidies the punctuation left behind by empty
/// optional fields.
pub fn apply_template(template: &str, data: &TemplateData) -> String {
    let fields: [(&str, String); 13] = [
        ("aluno", data.aluno.trim().to_string()),
        ("escola", data.escola.trim().to_string()),
        ("turma", data.turma.trim().to_string()),
        ("anoTurma", data.ano_turma.trim().to_string()),
        ("periodo", data.periodo.trim().to_string()),
        ("referencia", template_fragment(&data.referencia)),
        ("cargaHoraria", data.carga_horaria.trim().to_string()),
        ("atividade", data.atividade.trim().to_string()),
        ("periodoMonitoria", data.periodo_monitoria.trim().to_string()),
        ("eventoNome", data.evento_nome.trim().to_string()),
        ("eventoData", data.evento_data.trim().to_string()),
        ("eventoLocal", data.evento_local.trim().to_string()),
        ("eventoPapel", template_fragment(&data.evento_papel)),
    ];
    let mut resolved = template.to_string();
    for (key, value) in &fields {
        resolved = resolved.replace(&format!("{{{{{}}}}}", key), value);
    }

    let resolved = collapse_runs(&resolved).trim().to_string();
    let resolved = strip_space_before(&resolved, &[',', '.']);
    let resolved = merge_pairs(&resolved, ',', ',', ", ");
    let resolved = merge_pairs(&resolved, '.', '.', ".");
    normalize_semicolons(&resolved)
}

// ---------------------------------------------------------------------------
// Certificate language

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MonitoriaMeta {
    pub workload_hours: f64,
    pub monitoria_period: String,
    pub activity: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EventMeta {
    pub event_name: String,
    pub event_date: String,
    #[serde(default)]
    pub event_date_start: Option<String>,
    #[serde(default)]
    pub event_date_end: Option<String>,
    #[serde(default)]
    pub location: String,
    pub workload_hours: f64,
    pub role: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReferenceKind {
    Disciplina,
    Area,
}

impl ReferenceKind {
    fn word(self) -> &'static str {
        match self {
            Self::Disciplina => "disciplina",
            Self::Area => "área",
        }
    }
}

/// Strips a case-insensitive `prefix` followed by optional spaces and a colon.
fn strip_labelled<'s>(raw: &'s str, prefixes: &[&str]) -> Option<&'s str> {
    let folded = text::fold_accents(raw).to_lowercase();
    for prefix in prefixes {
        if !folded.starts_with(prefix) {
            continue;
        }
        let prefix_chars = prefix.chars().count();
        let rest_start = raw.char_indices().nth(prefix_chars).map(|(i, _)| i).unwrap_or(raw.len());
        let rest = raw[rest_start..].trim_start();
        if let Some(value) = rest.strip_prefix(':') {
            let value = value.trim();
            if !value.is_empty() {
                return Some(value);
            }
        }
    }
    None
}

fn parse_reference_label(label: Option<&str>) -> Option<(ReferenceKind, String)> {
    let raw = label.map(str::trim).filter(|s| !s.is_empty())?;
    if let Some(value) = strip_labelled(raw, &["disciplina"]) {
        return Some((ReferenceKind::Disciplina, value.to_string()));
    }
    if let Some(value) = strip_labelled(raw, &["area"]) {
        return Some((ReferenceKind::Area, value.to_string()));
    }
    Some((ReferenceKind::Area, raw.to_string()))
}

pub fn reference_placeholder(ty: CertificateType, label: Option<&str>) -> String {
    let Some((kind, value)) = parse_reference_label(label) else {
        return String::new();
    };
    match ty {
        CertificateType::Monitoria | CertificateType::Destaque => {
            format!(", na {} de {}", kind.word(), value)
        }
        _ => format!(", com referência na {} de {}", kind.word(), value),
    }
}

fn starts_with_word_ci(s: &str, word: &str) -> bool {
    let lower = s.to_lowercase();
    match lower.strip_prefix(word) {
        Some(rest) => rest.chars().next().map(|c| !c.is_alphanumeric()).unwrap_or(true),
        None => false,
    }
}

pub fn event_role_placeholder(ty: CertificateType, role: Option<&str>) -> String {
    let Some(role) = role.map(str::trim).filter(|s| !s.is_empty()) else {
        return String::new();
    };
    let role = collapse_runs(role);
    let lower = role.to_lowercase();
    let contextualized = ["como", "na condição de", "atuando como"]
        .iter()
        .any(|p| starts_with_word_ci(&role, p));

    if ty == CertificateType::EventoParticipacao {
        if lower == "participante" {
            return String::new();
        }
        if contextualized {
            return format!(", {}", role);
        }
        return format!(", na condição de {}", role);
    }

    if lower == "comissão organizadora" || lower == "membro da comissão organizadora" {
        return String::new();
    }
    if contextualized {
        return format!(", {}", role);
    }
    format!(", como {}", role)
}

fn first_school_year_number(s: &str) -> Option<String> {
    let chars: Vec<char> = s.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        if !chars[i].is_ascii_digit() {
            i += 1;
            continue;
        }
        let start = i;
        while i < chars.len() && chars[i].is_ascii_digit() {
            i += 1;
        }
        let run: String = chars[start..i].iter().collect();
        let bounded_before = start == 0 || !chars[start - 1].is_alphanumeric();
        let bounded_after = i == chars.len() || !chars[i].is_alphanumeric();
        if run.len() == 4 && run.starts_with("20") && bounded_before && bounded_after {
            return Some(run);
        }
    }
    None
}

/// Quarter ordinals (`"1º"`, `"2º"`...) mentioned as `"Nº bimestre"`, deduplicated.
fn quarter_ordinals(s: &str) -> Vec<String> {
    let compact: Vec<char> = s.to_lowercase().chars().filter(|c| !c.is_whitespace()).collect();
    let needle: Vec<char> = "bimestre".chars().collect();
    let mut out: Vec<String> = Vec::new();
    for i in 0..compact.len() {
        if compact[i].is_ascii_digit()
            && compact.get(i + 1) == Some(&'º')
            && compact.get(i + 2..i + 2 + needle.len()) == Some(needle.as_slice())
        {
            let ordinal = format!("{}º", compact[i]);
            if !out.contains(&ordinal) {
                out.push(ordinal);
            }
        }
    }
    out
}

pub fn destaque_period_phrase(period_label: &str) -> String {
    let normalized = lower_quarter_label(&collapse_runs(period_label.trim())).replace("BIMESTRE", "bimestre");
    if normalized.is_empty() {
        return "no período letivo".to_string();
    }
    let year = first_school_year_number(&normalized);
    let compact: String = normalized
        .to_lowercase()
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    let annual_range = compact.contains("1ºao4ºbimestre") || compact.contains("1ºa4ºbimestre");
    let annual_word = text::normalize_tokens(&normalized).iter().any(|t| t == "anual");
    let whole_year = |year: &Option<String>| match year {
        Some(y) => format!("durante o ano letivo de {}", y),
        None => "durante o ano letivo".to_string(),
    };
    if annual_range || annual_word {
        return whole_year(&year);
    }

    let ordinals = quarter_ordinals(&normalized);
    match ordinals.len() {
        4 => whole_year(&year),
        n if n > 1 => {
            let joined = text::join_with_and(&ordinals);
            match year {
                Some(y) => format!("nos bimestres {} de {}", joined, y),
                None => format!("nos bimestres {}", joined),
            }
        }
        1 => match year {
            Some(y) => format!("no {} bimestre de {}", ordinals[0], y),
            None => format!("no {} bimestre", ordinals[0]),
        },
        _ => {
            if ["no", "nos", "durante"]
                .iter()
                .any(|w| starts_with_word_ci(&normalized, w) && normalized.len() > w.len())
            {
                normalized
            } else {
                format!("no período de {}", normalized)
            }
        }
    }
}

fn display_date(value: &str) -> String {
    match academic::parse_date(value) {
        Some(d) => d.format("%d/%m/%Y").to_string(),
        None => value.to_string(),
    }
}

pub fn event_date_label(meta: Option<&EventMeta>) -> String {
    let Some(meta) = meta else {
        return "-".to_string();
    };
    match (meta.event_date_start.as_deref(), meta.event_date_end.as_deref()) {
        (Some(start), Some(end)) if !start.is_empty() && !end.is_empty() => {
            format!("{} a {}", display_date(start), display_date(end))
        }
        _ => display_date(&meta.event_date),
    }
}

fn format_hours(hours: f64) -> String {
    if hours.fract() == 0.0 {
        format!("{}", hours as i64)
    } else {
        format!("{}", hours)
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CertificateTextInput {
    pub certificate_type: CertificateType,
    pub school_name: String,
    pub class_name: String,
    pub school_year: u8,
    pub period_label: String,
    #[serde(default)]
    pub reference_label: Option<String>,
    #[serde(default)]
    pub base_text: Option<String>,
    pub student_name: String,
    #[serde(default)]
    pub monitoria_meta: Option<MonitoriaMeta>,
    #[serde(default)]
    pub event_meta: Option<EventMeta>,
}

pub fn build_template_data(input: &CertificateTextInput) -> TemplateData {
    let ty = input.certificate_type;
    TemplateData {
        aluno: input.student_name.clone(),
        escola: input.school_name.clone(),
        turma: input.class_name.clone(),
        ano_turma: format!("{}º ano", input.school_year),
        periodo: if ty == CertificateType::Destaque {
            destaque_period_phrase(&input.period_label)
        } else {
            input.period_label.clone()
        },
        referencia: reference_placeholder(ty, input.reference_label.as_deref()),
        carga_horaria: match (&input.monitoria_meta, &input.event_meta) {
            (Some(m), _) => format_hours(m.workload_hours),
            (None, Some(e)) => format_hours(e.workload_hours),
            _ => String::new(),
        },
        atividade: input
            .monitoria_meta
            .as_ref()
            .map(|m| m.activity.to_lowercase())
            .unwrap_or_default(),
        periodo_monitoria: input
            .monitoria_meta
            .as_ref()
            .map(|m| m.monitoria_period.clone())
            .unwrap_or_default(),
        evento_nome: input
            .event_meta
            .as_ref()
            .map(|e| e.event_name.clone())
            .unwrap_or_default(),
        evento_data: event_date_label(input.event_meta.as_ref()),
        evento_local: input
            .event_meta
            .as_ref()
            .map(|e| e.location.clone())
            .unwrap_or_default(),
        evento_papel: event_role_placeholder(ty, input.event_meta.as_ref().map(|e| e.role.as_str())),
    }
}

/// Byte range of the first case-insensitive occurrence of `needle`.
fn find_ci(haystack: &str, needle: &str) -> Option<(usize, usize)> {
    let needle: Vec<char> = needle.chars().flat_map(char::to_lowercase).collect();
    if needle.is_empty() {
        return None;
    }
    let indices: Vec<(usize, char)> = haystack.char_indices().collect();
    'outer: for start in 0..indices.len() {
        let mut k = start;
        for wanted in &needle {
            match indices.get(k) {
                Some((_, c)) if c.to_lowercase().eq(std::iter::once(*wanted)) => k += 1,
                _ => continue 'outer,
            }
        }
        let end = indices.get(k).map(|(i, _)| *i).unwrap_or(haystack.len());
        return Some((indices[start].0, end));
    }
    None
}

fn replace_all_ci(s: &str, needle: &str, with: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some((a, b)) = find_ci(rest, needle) {
        out.push_str(&rest[..a]);
        out.push_str(with);
        rest = &rest[b..];
    }
    out.push_str(rest);
    out
}

fn normalize_certificate_text(raw: &str, ty: CertificateType, school: &str) -> String {
    let s = collapse_runs(raw);
    let s = strip_space_before(&s, &[',']);
    let s = merge_pairs(&s, ',', ',', ", ");
    let s = merge_pairs(&s, '.', '.', ".");
    let s = merge_pairs(&s, '.', ',', ". ");
    let s = merge_pairs(&s, ',', '.', ".");
    let mut s = s.trim().to_string();

    if let Some((0, end)) = find_ci(&s, "certificamos que") {
        let rest = s[end..].trim_start();
        s = format!("A {} certifica que o(a) aluno(a) {}", school, rest);
    }
    let spaced = format!("A {} , certifica", school);
    if let Some((0, end)) = find_ci(&s, &spaced).or_else(|| find_ci(&s, &format!("A {}, certifica", school))) {
        s = format!("A {} certifica{}", school, &s[end..]);
    }

    match ty {
        CertificateType::Monitoria => {
            for (from, to) in [
                ("exerceu atividades de monitoria", "atuou na monitoria"),
                ("monitoria acadêmica", "monitoria"),
                ("monitoria academica", "monitoria"),
                ("na monitoria de de ", "na monitoria de "),
                ("na função de monitor", "na monitoria"),
                ("atuou na monitoria", "atuou como monitor(a)"),
                ("atuou como monitor(a) na área de", "atuou como monitor(a), na área de"),
                ("atuou como monitor(a) na disciplina de", "atuou como monitor(a), na disciplina de"),
            ] {
                s = replace_all_ci(&s, from, to);
            }
        }
        CertificateType::EventoParticipacao => {
            s = replace_all_ci(&s, "na condição de participante", "como participante");
        }
        _ => {}
    }
    if ty.is_event() {
        s = replace_all_ci(&s, ", com vínculo em ", ", com referência em ");
    }
    s
}

pub fn clamp_text(value: &str) -> String {
    let trimmed = value.trim();
    if trimmed.chars().count() <= MAX_VISIBLE_TEXT {
        return trimmed.to_string();
    }
    let head: String = trimmed.chars().take(MAX_VISIBLE_TEXT - 1).collect();
    format!("{}…", head.trim_end())
}

/// Renders the certificate body for one student: template substitution,
/// phrasing cleanup, then clamping to the visible length.
pub fn render_certificate_text(input: &CertificateTextInput) -> String {
    let base = input
        .base_text
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| input.certificate_type.template());
    let data = build_template_data(input);
    let rendered = apply_template(base, &data);
    clamp_text(&normalize_certificate_text(
        &rendered,
        input.certificate_type,
        &input.school_name,
    ))
}

// ---------------------------------------------------------------------------
// References

pub fn is_fundamental_class(cls: Option<&SchoolClass>) -> bool {
    let Some(cls) = cls else {
        return false;
    };
    if cls.series.trim().is_empty() {
        return false;
    }
    let series = text::fold_accents(&cls.series).to_lowercase().replace('º', "o");
    ["6o", "7o", "8o", "9o"].iter().any(|t| series.contains(t)) || series.contains("fundamental")
}

pub fn default_school_year_for_class(cls: &SchoolClass, today: NaiveDate) -> u8 {
    if let Some(start) = cls.start_calendar_year {
        return academic::current_year_from_calendar(start, today);
    }
    cls.current_year.filter(|y| (1..=3).contains(y)).unwrap_or(1)
}

fn common_areas(cls: Option<&SchoolClass>) -> &'static [SubjectArea] {
    if is_fundamental_class(cls) {
        FUNDAMENTAL_SUBJECT_AREAS
    } else {
        SUBJECT_AREAS
    }
}

pub fn common_subjects_for_class(cls: Option<&SchoolClass>) -> Vec<String> {
    text::dedupe_sorted(
        common_areas(cls)
            .iter()
            .flat_map(|a| a.subjects.iter())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty()),
    )
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SubjectReference {
    pub value: String,
    pub label: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AreaReference {
    pub value: String,
    pub label: String,
    pub subjects: Vec<String>,
}

pub fn area_references_for_class(cls: Option<&SchoolClass>, technical: &[String]) -> Vec<AreaReference> {
    let mut out: Vec<AreaReference> = common_areas(cls)
        .iter()
        .map(|a| AreaReference {
            value: a.name.to_string(),
            label: a.name.to_string(),
            subjects: a.subjects.iter().map(|s| s.to_string()).collect(),
        })
        .collect();
    if !technical.is_empty() {
        out.push(AreaReference {
            value: TECHNICAL_AREA.to_string(),
            label: TECHNICAL_AREA.to_string(),
            subjects: technical.to_vec(),
        });
    }
    out
}

/// Professional subjects taught in `school_year`: the class template's subjects
/// for that year, plus manual subjects that the template or the year's grades
/// place in it.
pub fn technical_subjects_for_school_year(
    cls: Option<&SchoolClass>,
    school_year: u8,
    templates: &[SubjectTemplate],
    manual_subjects: &[String],
    grades: &[Grade],
) -> Vec<String> {
    let template = cls
        .and_then(|c| c.template_id.as_deref())
        .and_then(|id| templates.iter().find(|t| t.id == id));
    let template_subjects: Vec<String> = template
        .and_then(|t| t.subjects_by_year.iter().find(|y| y.year == school_year))
        .map(|y| y.subjects.clone())
        .unwrap_or_default();

    let graded: HashSet<String> = grades
        .iter()
        .filter(|g| g.school_year == school_year)
        .map(|g| text::normalize_key(&g.subject))
        .filter(|k| !k.is_empty())
        .collect();
    let template_keys: HashSet<String> = template_subjects.iter().map(|s| text::normalize_key(s)).collect();

    text::dedupe_sorted(
        template_subjects
            .iter()
            .chain(manual_subjects.iter())
            .filter(|s| !s.trim().is_empty())
            .filter(|s| {
                let key = text::normalize_key(s);
                template_keys.contains(&key) || graded.contains(&key)
            })
            .map(|s| s.trim().to_string()),
    )
}

pub fn subject_references_for_class(cls: Option<&SchoolClass>, technical: &[String]) -> Vec<SubjectReference> {
    text::dedupe_sorted(
        common_subjects_for_class(cls)
            .into_iter()
            .chain(technical.iter().cloned()),
    )
    .into_iter()
    .map(|s| SubjectReference {
        value: s.clone(),
        label: s,
    })
    .collect()
}

// ---------------------------------------------------------------------------
// Highlight suggestions

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HighlightSuggestion {
    pub student_id: String,
    pub student_name: String,
    pub average: Option<f64>,
    pub status: HighlightStatus,
    pub missing_subjects: Vec<String>,
    pub failing_subjects: Vec<String>,
}

/// Students eligible for an honour-roll certificate. A quarter average rounding
/// below 6 in any expected subject excludes the student; missing grades leave
/// the suggestion pending.
pub fn build_highlight_suggestions(
    students: &[Student],
    grades: &[Grade],
    school_year: u8,
    selected_quarters: &[String],
    expected_subjects: &[String],
) -> Vec<HighlightSuggestion> {
    let mut expected: Vec<(String, String)> = Vec::new();
    for subject in expected_subjects {
        let key = text::normalize_key(subject);
        if key.is_empty() {
            continue;
        }
        match expected.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = subject.clone(),
            None => expected.push((key, subject.clone())),
        }
    }

    let scoped: Vec<&Grade> = grades.iter().filter(|g| g.school_year == school_year).collect();

    let mut out: Vec<HighlightSuggestion> = students
        .iter()
        .filter_map(|student| {
            let mut by_quarter: HashMap<(String, &str), Vec<f64>> = HashMap::new();
            for g in scoped.iter().filter(|g| g.student_id == student.id) {
                let key = text::normalize_key(&g.subject);
                if key.is_empty() || !expected.iter().any(|(k, _)| *k == key) {
                    continue;
                }
                if !selected_quarters.iter().any(|q| *q == g.quarter) || !g.grade.is_finite() {
                    continue;
                }
                by_quarter.entry((key, g.quarter.as_str())).or_default().push(g.grade);
            }

            let mut averages = Vec::new();
            let mut failing: Vec<String> = Vec::new();
            let mut missing: Vec<String> = Vec::new();
            for (key, label) in &expected {
                for quarter in selected_quarters {
                    let values = by_quarter.get(&(key.clone(), quarter.as_str()));
                    let Some(avg) = values.and_then(|v| academic::mean(v)) else {
                        if !missing.contains(label) {
                            missing.push(label.clone());
                        }
                        continue;
                    };
                    averages.push(avg);
                    if (avg * 10.0).round() / 10.0 < academic::PASSING_GRADE && !failing.contains(label) {
                        failing.push(label.clone());
                    }
                }
            }
            if !failing.is_empty() {
                return None;
            }
            text::sort_pt(&mut missing);
            Some(HighlightSuggestion {
                student_id: student.id.clone(),
                student_name: student.name.clone(),
                average: academic::mean(&averages),
                status: if missing.is_empty() {
                    HighlightStatus::Confirmed
                } else {
                    HighlightStatus::Pending
                },
                missing_subjects: missing,
                failing_subjects: failing,
            })
        })
        .collect();

    out.sort_by(|a, b| {
        let rank = |s: HighlightStatus| if s == HighlightStatus::Confirmed { 0 } else { 1 };
        rank(a.status)
            .cmp(&rank(b.status))
            .then_with(|| {
                b.average
                    .unwrap_or(f64::NEG_INFINITY)
                    .total_cmp(&a.average.unwrap_or(f64::NEG_INFINITY))
            })
            .then_with(|| text::compare_pt(&a.student_name, &b.student_name))
    });
    out
}

// ---------------------------------------------------------------------------
// Saved certificate events

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CertificateEventStudent {
    pub id: String,
    pub certificate_event_id: String,
    pub student_id: Option<String>,
    pub student_name_snapshot: String,
    pub text_override: Option<String>,
    pub highlight_status: Option<HighlightStatus>,
    pub highlight_average: Option<f64>,
    pub verification_code: String,
    pub verification_status: VerificationStatus,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CertificateEvent {
    pub id: String,
    pub created_by_name: String,
    pub title: String,
    pub certificate_type: CertificateType,
    pub class_id: Option<String>,
    pub class_name_snapshot: String,
    pub school_year: u8,
    pub period_mode: PeriodMode,
    pub selected_quarters: Vec<String>,
    pub period_label: String,
    pub reference_type: Option<ReferenceType>,
    pub reference_value: Option<String>,
    pub reference_label: Option<String>,
    pub base_text: String,
    pub teacher_name: Option<String>,
    pub director_name: Option<String>,
    pub signature_mode: SignatureMode,
    pub type_meta: Value,
    pub students_count: usize,
    pub created_at: String,
    pub updated_at: String,
    pub students: Vec<CertificateEventStudent>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct EventStudentInput {
    pub student_id: Option<String>,
    pub student_name_snapshot: String,
    pub text_override: Option<String>,
    pub highlight_status: Option<HighlightStatus>,
    pub highlight_average: Option<f64>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CertificateEventDraft {
    pub title: String,
    pub certificate_type: CertificateType,
    #[serde(default)]
    pub class_id: Option<String>,
    #[serde(default)]
    pub class_name_snapshot: String,
    pub school_year: i64,
    #[serde(default)]
    pub period_mode: PeriodMode,
    #[serde(default)]
    pub selected_quarters: Vec<String>,
    #[serde(default)]
    pub period_label: Option<String>,
    #[serde(default)]
    pub reference_type: Option<ReferenceType>,
    #[serde(default)]
    pub reference_value: Option<String>,
    #[serde(default)]
    pub reference_label: Option<String>,
    #[serde(default)]
    pub base_text: String,
    #[serde(default)]
    pub teacher_name: Option<String>,
    #[serde(default)]
    pub director_name: Option<String>,
    #[serde(default)]
    pub signature_mode: SignatureMode,
    #[serde(default)]
    pub type_meta: Option<Value>,
    #[serde(default)]
    pub students: Vec<EventStudentInput>,
}

pub fn validate_event_draft(draft: &CertificateEventDraft) -> Result<u8, CertificateError> {
    if draft.title.trim().is_empty() {
        return Err(CertificateError::MissingTitle);
    }
    if draft.base_text.trim().is_empty() {
        return Err(CertificateError::EmptyText);
    }
    let school_year = u8::try_from(draft.school_year)
        .ok()
        .filter(|y| (1..=3).contains(y))
        .ok_or(CertificateError::InvalidSchoolYear(draft.school_year))?;
    if draft.period_mode == PeriodMode::Quarters
        && resolve_certificate_quarters(draft.period_mode, &draft.selected_quarters).is_empty()
    {
        return Err(CertificateError::NoQuarters);
    }
    if draft.students.is_empty() {
        return Err(CertificateError::NoStudents);
    }
    if draft.students.iter().any(|s| s.student_name_snapshot.trim().is_empty()) {
        return Err(CertificateError::BlankStudentName);
    }
    Ok(school_year)
}

fn non_blank(v: Option<&str>) -> Option<String> {
    v.map(str::trim).filter(|s| !s.is_empty()).map(str::to_string)
}

pub fn normalize_event_students(students: Vec<EventStudentInput>) -> Vec<EventStudentInput> {
    students
        .into_iter()
        .map(|s| EventStudentInput {
            student_id: non_blank(s.student_id.as_deref()),
            student_name_snapshot: s.student_name_snapshot.trim().to_string(),
            text_override: non_blank(s.text_override.as_deref()),
            highlight_status: s.highlight_status,
            highlight_average: s.highlight_average.filter(|v| v.is_finite()),
        })
        .collect()
}

/// 32 uppercase hex characters.
pub fn new_verification_code() -> String {
    Uuid::new_v4().simple().to_string().to_uppercase()
}

/// Keeps ASCII letters and digits, uppercased, so pasted codes with dashes or
/// spaces still match.
pub fn normalize_verification_code(raw: &str) -> Result<String, CertificateError> {
    let code = text::alnum_upper(raw);
    if code.is_empty() {
        Err(CertificateError::EmptyVerificationCode)
    } else {
        Ok(code)
    }
}

pub fn normalize_snapshot_name(name: &str) -> String {
    text::collapse_spaces(&text::fold_accents(name)).to_lowercase()
}

#[derive(Debug, Clone, PartialEq)]
pub struct EventStudentRow {
    pub student_id: Option<String>,
    pub student_name_snapshot: String,
    pub text_override: Option<String>,
    pub highlight_status: Option<HighlightStatus>,
    pub highlight_average: Option<f64>,
    pub verification_code: String,
    pub verification_status: VerificationStatus,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcilePlan {
    /// Existing row id and its new content.
    pub updates: Vec<(String, EventStudentRow)>,
    pub inserts: Vec<EventStudentRow>,
    pub deletes: Vec<String>,
}

/// Matches incoming students to the rows already saved for an event, by student
/// id first and then by normalized name, so re-saving an event keeps every
/// certificate's verification code and revocation.
pub fn reconcile_event_students(
    existing: &[CertificateEventStudent],
    incoming: Vec<EventStudentInput>,
) -> ReconcilePlan {
    let mut used: HashSet<&str> = HashSet::new();
    let mut by_student: BTreeMap<&str, Vec<&CertificateEventStudent>> = BTreeMap::new();
    let mut by_name: BTreeMap<String, Vec<&CertificateEventStudent>> = BTreeMap::new();
    for row in existing {
        if let Some(id) = row.student_id.as_deref() {
            by_student.entry(id).or_default().push(row);
        }
        by_name
            .entry(normalize_snapshot_name(&row.student_name_snapshot))
            .or_default()
            .push(row);
    }

    fn take<'r>(
        rows: Option<&Vec<&'r CertificateEventStudent>>,
        used: &mut HashSet<&'r str>,
    ) -> Option<&'r CertificateEventStudent> {
        let row = rows?.iter().copied().find(|r| !used.contains(r.id.as_str()))?;
        used.insert(row.id.as_str());
        Some(row)
    }

    let mut plan = ReconcilePlan::default();
    for student in normalize_event_students(incoming) {
        let mut matched = student
            .student_id
            .as_deref()
            .and_then(|id| take(by_student.get(id), &mut used));
        if matched.is_none() {
            matched = take(
                by_name.get(&normalize_snapshot_name(&student.student_name_snapshot)),
                &mut used,
            );
        }

        let row = EventStudentRow {
            verification_code: matched
                .map(|m| m.verification_code.trim().to_string())
                .filter(|c| !c.is_empty())
                .unwrap_or_else(new_verification_code),
            verification_status: matched
                .map(|m| m.verification_status)
                .unwrap_or_default(),
            student_id: student.student_id,
            student_name_snapshot: student.student_name_snapshot,
            text_override: student.text_override,
            highlight_status: student.highlight_status,
            highlight_average: student.highlight_average,
        };
        match matched {
            Some(m) => plan.updates.push((m.id.clone(), row)),
            None => plan.inserts.push(row),
        }
    }
    plan.deletes = existing
        .iter()
        .filter(|r| !used.contains(r.id.as_str()))
        .map(|r| r.id.clone())
        .collect();
    plan
}

// ---------------------------------------------------------------------------
// Export input

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HighlightMeta {
    pub status: HighlightStatus,
    pub average: Option<f64>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExportStudent {
    pub id: String,
    pub name: String,
    pub text_override: Option<String>,
    pub verification_code: Option<String>,
    pub verification_status: VerificationStatus,
    pub highlight: Option<HighlightMeta>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExportInput {
    pub event_id: String,
    pub title: String,
    pub certificate_type: CertificateType,
    pub class_id: Option<String>,
    pub class_name: String,
    pub school_year: u8,
    pub period_label: String,
    pub reference_label: Option<String>,
    pub base_text: String,
    pub students: Vec<ExportStudent>,
    pub teacher_name: Option<String>,
    pub director_name: Option<String>,
    pub signature_mode: SignatureMode,
    pub monitoria_meta: Option<MonitoriaMeta>,
    pub event_meta: Option<EventMeta>,
}

pub fn reference_label(event: &CertificateEvent) -> Option<String> {
    if let Some(label) = non_blank(event.reference_label.as_deref()) {
        return Some(label);
    }
    let (ty, value) = (event.reference_type?, non_blank(event.reference_value.as_deref())?);
    let prefix = match ty {
        ReferenceType::Subject => "Disciplina",
        ReferenceType::Area => "Área",
    };
    Some(format!("{}: {}", prefix, value))
}

fn meta_str(meta: &Value, key: &str) -> Option<String> {
    non_blank(meta.get(key).and_then(Value::as_str))
}

fn read_monitoria_meta(type_meta: &Value) -> Option<MonitoriaMeta> {
    let meta = type_meta.get("monitoriaMeta")?;
    Some(MonitoriaMeta {
        workload_hours: meta.get("workloadHours").and_then(Value::as_f64)?,
        monitoria_period: meta_str(meta, "monitoriaPeriod")?,
        activity: meta_str(meta, "activity")?,
    })
}

fn read_event_meta(type_meta: &Value) -> Option<EventMeta> {
    let meta = type_meta.get("eventMeta")?;
    Some(EventMeta {
        event_name: meta_str(meta, "eventName")?,
        event_date: meta_str(meta, "eventDate")?,
        event_date_start: meta_str(meta, "eventDateStart"),
        event_date_end: meta_str(meta, "eventDateEnd"),
        location: meta_str(meta, "location")?,
        workload_hours: meta.get("workloadHours").and_then(Value::as_f64)?,
        role: meta_str(meta, "role")?,
    })
}

fn highlight_from_meta(type_meta: &Value) -> HashMap<String, HighlightMeta> {
    let Some(map) = type_meta.get("highlightMetaByStudentId").and_then(Value::as_object) else {
        return HashMap::new();
    };
    map.iter()
        .filter_map(|(id, raw)| {
            let status = raw.get("status").and_then(Value::as_str).and_then(HighlightStatus::parse)?;
            Some((
                id.clone(),
                HighlightMeta {
                    status,
                    average: raw.get("average").and_then(Value::as_f64),
                },
            ))
        })
        .collect()
}

/// Everything needed to print an event's certificates; `subset` restricts the
/// export to some row ids (all rows when empty).
pub fn build_export_input(event: &CertificateEvent, subset: &[String]) -> ExportInput {
    let selected: Vec<&CertificateEventStudent> = if subset.is_empty() {
        event.students.iter().collect()
    } else {
        let chosen: Vec<&CertificateEventStudent> = event
            .students
            .iter()
            .filter(|s| subset.contains(&s.id) || s.student_id.as_ref().map(|id| subset.contains(id)).unwrap_or(false))
            .collect();
        if chosen.is_empty() {
            event.students.iter().collect()
        } else {
            chosen
        }
    };

    let is_destaque = event.certificate_type == CertificateType::Destaque;
    let meta_highlights = if is_destaque {
        highlight_from_meta(&event.type_meta)
    } else {
        HashMap::new()
    };

    let students = selected
        .into_iter()
        .map(|s| {
            let export_id = s.student_id.clone().unwrap_or_else(|| s.id.clone());
            let highlight = if is_destaque {
                match s.highlight_status {
                    Some(status) => Some(HighlightMeta {
                        status,
                        average: s.highlight_average,
                    }),
                    None => meta_highlights.get(&export_id).cloned(),
                }
            } else {
                None
            };
            ExportStudent {
                name: s.student_name_snapshot.clone(),
                text_override: non_blank(s.text_override.as_deref()),
                verification_code: non_blank(Some(&s.verification_code)),
                verification_status: s.verification_status,
                highlight,
                id: export_id,
            }
        })
        .collect();

    ExportInput {
        event_id: event.id.clone(),
        title: event.title.clone(),
        certificate_type: event.certificate_type,
        class_id: event.class_id.clone(),
        class_name: event.class_name_snapshot.clone(),
        school_year: event.school_year,
        period_label: event.period_label.clone(),
        reference_label: reference_label(event),
        base_text: event.base_text.clone(),
        students,
        teacher_name: event.teacher_name.clone(),
        director_name: event.director_name.clone(),
        signature_mode: event.signature_mode,
        monitoria_meta: if event.certificate_type == CertificateType::Monitoria {
            read_monitoria_meta(&event.type_meta)
        } else {
            None
        },
        event_meta: if event.certificate_type.is_event() {
            read_event_meta(&event.type_meta)
        } else {
            None
        },
    }
}

/// The text printed for one exported student: their override, or the event
/// text rendered for them.
pub fn render_for_student(input: &ExportInput, student: &ExportStudent, school_name: &str) -> String {
    if let Some(text) = student.text_override.as_deref() {
        return clamp_text(text);
    }
    render_certificate_text(&CertificateTextInput {
        certificate_type: input.certificate_type,
        school_name: school_name.to_string(),
        class_name: input.class_name.clone(),
        school_year: input.school_year,
        period_label: input.period_label.clone(),
        reference_label: input.reference_label.clone(),
        base_text: Some(input.base_text.clone()),
        student_name: student.name.clone(),
        monitoria_meta: input.monitoria_meta.clone(),
        event_meta: input.event_meta.clone(),
    })
}
