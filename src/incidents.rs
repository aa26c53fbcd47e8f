use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::academic;
use crate::model::{Grade, SchoolClass, Student};
use crate::text;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Leve,
    Intermediaria,
    Grave,
    Gravissima,
}

impl Severity {
    pub const ALL: [Severity; 4] = [
        Severity::Leve,
        Severity::Intermediaria,
        Severity::Grave,
        Severity::Gravissima,
    ];

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "leve" => Some(Self::Leve),
            "intermediaria" => Some(Self::Intermediaria),
            "grave" => Some(Self::Grave),
            "gravissima" => Some(Self::Gravissima),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Leve => "leve",
            Self::Intermediaria => "intermediaria",
            Self::Grave => "grave",
            Self::Gravissima => "gravissima",
        }
    }

    /// Display label; family follow-ups grade attention instead of gravity.
    pub fn label(self, incident_type: IncidentType) -> &'static str {
        match (incident_type, self) {
            (IncidentType::AcompanhamentoFamiliar, Self::Leve) => "Baixa",
            (IncidentType::AcompanhamentoFamiliar, Self::Intermediaria) => "Média",
            (IncidentType::AcompanhamentoFamiliar, Self::Grave) => "Alta",
            (IncidentType::AcompanhamentoFamiliar, Self::Gravissima) => "Crítica",
            (IncidentType::Disciplinar, Self::Leve) => "Leve",
            (IncidentType::Disciplinar, Self::Intermediaria) => "Intermediária",
            (IncidentType::Disciplinar, Self::Grave) => "Grave",
            (IncidentType::Disciplinar, Self::Gravissima) => "Gravíssima",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum IncidentStatus {
    Aberta,
    Acompanhamento,
    Resolvida,
}

impl IncidentStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "aberta" => Some(Self::Aberta),
            "acompanhamento" => Some(Self::Acompanhamento),
            "resolvida" => Some(Self::Resolvida),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Aberta => "aberta",
            Self::Acompanhamento => "acompanhamento",
            Self::Resolvida => "resolvida",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Aberta => "Aberta",
            Self::Acompanhamento => "Em Acompanhamento",
            Self::Resolvida => "Resolvida",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum IncidentType {
    #[default]
    Disciplinar,
    AcompanhamentoFamiliar,
}

impl IncidentType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "disciplinar" => Some(Self::Disciplinar),
            "acompanhamento_familiar" => Some(Self::AcompanhamentoFamiliar),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disciplinar => "disciplinar",
            Self::AcompanhamentoFamiliar => "acompanhamento_familiar",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Disciplinar => "Disciplinar",
            Self::AcompanhamentoFamiliar => "Acompanhamento Familiar",
        }
    }

    pub fn episodes(self) -> &'static [Episode] {
        match self {
            Self::Disciplinar => DISCIPLINARY_EPISODES,
            Self::AcompanhamentoFamiliar => FAMILY_EPISODES,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FollowUpType {
    ConversaIndividual,
    ConversaPais,
    SituacoesDiversas,
}

impl FollowUpType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "conversa_individual" => Some(Self::ConversaIndividual),
            "conversa_pais" => Some(Self::ConversaPais),
            "situacoes_diversas" => Some(Self::SituacoesDiversas),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ConversaIndividual => "conversa_individual",
            Self::ConversaPais => "conversa_pais",
            Self::SituacoesDiversas => "situacoes_diversas",
        }
    }

    fn is_conversation(self) -> bool {
        matches!(self, Self::ConversaIndividual | Self::ConversaPais)
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Episode {
    pub id: &'static str,
    pub description: &'static str,
    pub severity: Severity,
    pub category: &'static str,
}

const fn ep(id: &'static str, description: &'static str, severity: Severity, category: &'static str) -> Episode {
    Episode {
        id,
        description,
        severity,
        category,
    }
}

use Severity::{Grave, Gravissima, Intermediaria, Leve};

pub const DISCIPLINARY_EPISODES: &[Episode] = &[
    ep("leve-1", "Conversa paralela durante aula", Leve, "Disciplina"),
    ep("leve-2", "Atraso para aula", Leve, "Pontualidade"),
    ep("leve-3", "Esquecimento de material escolar", Leve, "Material"),
    ep("leve-4", "Não realização de tarefa", Leve, "Acadêmico"),
    ep("leve-5", "Uniforme incompleto", Leve, "Uniforme"),
    ep("inter-1", "Desrespeito a colegas", Intermediaria, "Disciplina"),
    ep("inter-2", "Uso de celular durante aula", Intermediaria, "Disciplina"),
    ep("inter-3", "Recusa em participar das atividades", Intermediaria, "Acadêmico"),
    ep("inter-4", "Linguagem inadequada", Intermediaria, "Disciplina"),
    ep("inter-5", "Saída da sala sem autorização", Intermediaria, "Disciplina"),
    ep("grave-1", "Agressão verbal a professor", Grave, "Disciplina"),
    ep("grave-2", "Dano ao patrimônio escolar", Grave, "Patrimônio"),
    ep("grave-3", "Desacato à autoridade", Grave, "Disciplina"),
    ep("grave-4", "Bullying comprovado", Grave, "Convivência"),
    ep("grave-5", "Falsificação de documento", Grave, "Conduta"),
    ep("gravissima-1", "Agressão física a colega", Gravissima, "Convivência"),
    ep("gravissima-2", "Agressão física a professor/funcionário", Gravissima, "Disciplina"),
    ep("gravissima-3", "Porte de substâncias ilícitas", Gravissima, "Conduta"),
    ep("gravissima-4", "Ameaças graves", Gravissima, "Convivência"),
    ep("gravissima-5", "Porte de arma branca", Gravissima, "Segurança"),
];

pub const FAMILY_EPISODES: &[Episode] = &[
    ep("fam-leve-1", "Baixo engajamento pontual nas atividades escolares", Leve, "Pedagógico"),
    ep("fam-leve-2", "Oscilação leve de organização de rotina de estudos", Leve, "Pedagógico"),
    ep("fam-leve-3", "Sinais iniciais de dificuldade de integração em sala", Leve, "Socioemocional"),
    ep("fam-leve-4", "Necessidade de aproximação inicial com responsáveis", Leve, "Familiar"),
    ep("fam-inter-1", "Queda recorrente de rendimento em múltiplas disciplinas", Intermediaria, "Pedagógico"),
    ep("fam-inter-2", "Frequência irregular com impacto no processo de aprendizagem", Intermediaria, "Pedagógico"),
    ep("fam-inter-3", "Relatos de ansiedade, tristeza ou desmotivação persistente", Intermediaria, "Socioemocional"),
    ep("fam-inter-4", "Baixa resposta da família às estratégias escolares propostas", Intermediaria, "Familiar"),
    ep("fam-grave-1", "Risco de abandono escolar identificado pela equipe", Grave, "Pedagógico"),
    ep("fam-grave-2", "Comprometimento acentuado da aprendizagem sem adesão ao plano", Grave, "Pedagógico"),
    ep("fam-grave-3", "Sofrimento emocional relevante com impacto no desempenho escolar", Grave, "Socioemocional"),
    ep("fam-grave-4", "Necessidade de articulação imediata com rede de apoio", Grave, "Rede de Proteção"),
    ep("fam-crit-1", "Situação familiar crítica com prejuízo severo ao vínculo escolar", Gravissima, "Familiar"),
    ep("fam-crit-2", "Risco psicossocial elevado exigindo intervenção urgente", Gravissima, "Rede de Proteção"),
    ep("fam-crit-3", "Indícios de vulnerabilidade intensa com necessidade de proteção", Gravissima, "Socioemocional"),
];

pub fn find_episode(catalog: &[Episode], id: &str) -> Option<Episode> {
    catalog.iter().find(|e| e.id == id).copied()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FollowUpRecord {
    pub id: String,
    pub incident_id: String,
    #[serde(rename = "type")]
    pub follow_up_type: FollowUpType,
    pub date: String,
    pub responsavel: String,
    pub motivo: Option<String>,
    pub providencias: Option<String>,
    pub assuntos_tratados: Option<String>,
    pub encaminhamentos: Option<String>,
    pub disciplina: Option<String>,
    pub tipo_situacao: Option<String>,
    pub descricao_situacao: Option<String>,
    pub nome_responsavel_pai: Option<String>,
    pub grau_parentesco: Option<String>,
    pub created_by: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    pub id: String,
    pub user_id: String,
    pub user_name: String,
    pub text: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Incident {
    pub id: String,
    pub class_id: String,
    pub date: String,
    pub incident_type: IncidentType,
    pub student_ids: Vec<String>,
    pub episodes: Vec<String>,
    pub calculated_severity: Severity,
    pub final_severity: Severity,
    pub severity_override_reason: Option<String>,
    pub description: String,
    pub actions: Option<String>,
    pub suggested_action: Option<String>,
    pub status: IncidentStatus,
    pub validated_by: Option<String>,
    pub validated_at: Option<String>,
    pub follow_ups: Vec<FollowUpRecord>,
    pub comments: Vec<Comment>,
    pub created_by: String,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IncidentRuleError {
    /// The incident is not tied to a class.
    #[error("classId is required")]
    MissingClass,

    /// Incidents must name at least one student.
    #[error("select at least one student")]
    NoStudents,

    /// Disciplinary incidents are built from catalogued episodes.
    #[error("select at least one episode")]
    NoEpisodes,

    #[error("unknown episode: {0}")]
    UnknownEpisode(String),

    /// Final severity differs from the calculated one without a justification.
    #[error("a reason is required when the final severity differs from the calculated severity")]
    MissingOverrideReason,

    #[error("follow-up field is required: {0}")]
    MissingFollowUpField(&'static str),

    #[error("cannot move incident from {from} to {to}")]
    InvalidTransition { from: &'static str, to: &'static str },

    #[error("comment text must not be empty")]
    EmptyComment,
}

/// Highest severity among the selected episodes; `Leve` when nothing matches.
pub fn calculate_severity(episode_ids: &[String], catalog: &[Episode]) -> Severity {
    episode_ids
        .iter()
        .filter_map(|id| find_episode(catalog, id))
        .map(|e| e.severity)
        .max()
        .unwrap_or(Severity::Leve)
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ActionLevel {
    ConversaRegistro,
    ComunicadoPais,
    SuspensaoUmDia,
    SuspensaoTresDias,
}

impl ActionLevel {
    pub fn text(self) -> &'static str {
        match self {
            Self::SuspensaoTresDias => "Conversa individual com o(s) estudante(s), registro da ocorrência e SUSPENSÃO DAS ATIVIDADES ESCOLARES POR TRÊS dias e retorno à escola somente com o responsável.",
            Self::SuspensaoUmDia => "Conversa individual com o(s) estudante(s), registro da ocorrência e SUSPENSÃO DAS ATIVIDADES ESCOLARES POR UM dia e retorno à escola somente com o responsável.",
            Self::ComunicadoPais => "Conversa individual com o(s) estudante(s), registro da ocorrência e ENCAMINHAMENTO DE COMUNICADO AOS PAIS E/OU RESPONSÁVEIS sobre o ocorrido.",
            Self::ConversaRegistro => "Conversa e registro.",
        }
    }
}

/// Past incidents per final severity, counting only incidents already handled
/// (anything not `aberta`).
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SeverityCounts {
    pub leve: usize,
    pub intermediaria: usize,
    pub grave: usize,
    pub gravissima: usize,
}

impl SeverityCounts {
    fn bump(&mut self, severity: Severity) {
        match severity {
            Severity::Leve => self.leve += 1,
            Severity::Intermediaria => self.intermediaria += 1,
            Severity::Grave => self.grave += 1,
            Severity::Gravissima => self.gravissima += 1,
        }
    }

    fn max(self, other: Self) -> Self {
        Self {
            leve: self.leve.max(other.leve),
            intermediaria: self.intermediaria.max(other.intermediaria),
            grave: self.grave.max(other.grave),
            gravissima: self.gravissima.max(other.gravissima),
        }
    }
}

pub fn student_history(student_id: &str, history: &[Incident]) -> SeverityCounts {
    let mut counts = SeverityCounts::default();
    for incident in history {
        if incident.status != IncidentStatus::Aberta && incident.student_ids.iter().any(|s| s == student_id) {
            counts.bump(incident.final_severity);
        }
    }
    counts
}

/// Worst history among the involved students.
pub fn worst_history(student_ids: &[String], history: &[Incident]) -> SeverityCounts {
    student_ids
        .iter()
        .map(|s| student_history(s, history))
        .fold(SeverityCounts::default(), SeverityCounts::max)
}

pub fn calculate_action_level(student_ids: &[String], final_severity: Severity, history: &[Incident]) -> ActionLevel {
    let worst = worst_history(student_ids, history);
    if final_severity == Severity::Gravissima {
        ActionLevel::SuspensaoTresDias
    } else if final_severity == Severity::Grave || worst.intermediaria >= 2 || worst.leve >= 3 {
        ActionLevel::SuspensaoUmDia
    } else if final_severity == Severity::Intermediaria || worst.leve >= 2 {
        ActionLevel::ComunicadoPais
    } else {
        ActionLevel::ConversaRegistro
    }
}

pub fn calculate_suggested_action(student_ids: &[String], final_severity: Severity, history: &[Incident]) -> &'static str {
    calculate_action_level(student_ids, final_severity, history).text()
}

pub fn suggest_follow_up_type(action: &str, severity: Option<Severity>) -> FollowUpType {
    if matches!(severity, Some(s) if s >= Severity::Intermediaria) {
        return FollowUpType::ConversaPais;
    }
    let action = text::normalize_key(action);
    let mentions_parents = ["suspensao", "suspenso", "comunicado aos pais", "responsaveis"]
        .iter()
        .any(|needle| action.contains(needle));
    if mentions_parents {
        FollowUpType::ConversaPais
    } else {
        FollowUpType::ConversaIndividual
    }
}

/// Default conversation reason pre-filled for low-severity incidents.
pub fn default_motivo(severity: Severity) -> Option<&'static str> {
    match severity {
        Severity::Leve => Some("1 - Comportamento inadequado"),
        Severity::Intermediaria => Some("2 - Conflitos/Relação interpessoal"),
        _ => None,
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IncidentDraft {
    pub class_id: String,
    pub date: Option<String>,
    pub incident_type: IncidentType,
    pub student_ids: Vec<String>,
    pub episodes: Vec<String>,
    pub final_severity: Option<Severity>,
    pub severity_override_reason: Option<String>,
    pub description: String,
    pub actions: Option<String>,
    pub suggested_action: Option<String>,
    pub created_by: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidatedSeverity {
    pub calculated: Severity,
    pub final_severity: Severity,
}

fn blank(v: &Option<String>) -> bool {
    v.as_deref().map(str::trim).unwrap_or("").is_empty()
}

pub fn validate_new_incident(draft: &IncidentDraft) -> Result<ValidatedSeverity, IncidentRuleError> {
    if draft.class_id.trim().is_empty() {
        return Err(IncidentRuleError::MissingClass);
    }
    if draft.student_ids.iter().all(|s| s.trim().is_empty()) {
        return Err(IncidentRuleError::NoStudents);
    }
    let catalog = draft.incident_type.episodes();
    if draft.incident_type == IncidentType::Disciplinar && draft.episodes.is_empty() {
        return Err(IncidentRuleError::NoEpisodes);
    }
    if let Some(unknown) = draft.episodes.iter().find(|id| find_episode(catalog, id).is_none()) {
        return Err(IncidentRuleError::UnknownEpisode(unknown.clone()));
    }

    let calculated = calculate_severity(&draft.episodes, catalog);
    let final_severity = draft.final_severity.unwrap_or(calculated);
    if final_severity != calculated && blank(&draft.severity_override_reason) {
        return Err(IncidentRuleError::MissingOverrideReason);
    }
    Ok(ValidatedSeverity {
        calculated,
        final_severity,
    })
}

/// Status after a validation decision. Only open incidents can be validated.
pub fn validation_outcome(current: IncidentStatus, approved: bool) -> Result<IncidentStatus, IncidentRuleError> {
    if current != IncidentStatus::Aberta {
        return Err(IncidentRuleError::InvalidTransition {
            from: current.as_str(),
            to: if approved { "acompanhamento" } else { "aberta" },
        });
    }
    Ok(if approved {
        IncidentStatus::Acompanhamento
    } else {
        IncidentStatus::Aberta
    })
}

pub fn validation_comment(approved: bool, notes: Option<&str>) -> String {
    let verdict = if approved { "Aprovada" } else { "Rejeitada" };
    match notes.map(str::trim).filter(|n| !n.is_empty()) {
        Some(n) => format!("Validação: {}. {}", verdict, n),
        None => format!("Validação: {}.", verdict),
    }
}

/// Manual status changes after validation: resolve, or reopen a resolved incident.
pub fn check_status_change(from: IncidentStatus, to: IncidentStatus) -> Result<(), IncidentRuleError> {
    match (from, to) {
        (IncidentStatus::Acompanhamento, IncidentStatus::Resolvida)
        | (IncidentStatus::Resolvida, IncidentStatus::Acompanhamento) => Ok(()),
        _ => Err(IncidentRuleError::InvalidTransition {
            from: from.as_str(),
            to: to.as_str(),
        }),
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct FollowUpDraft {
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub follow_up_type: Option<FollowUpType>,
    pub date: String,
    pub responsavel: String,
    pub motivo: Option<String>,
    pub providencias: Option<String>,
    pub assuntos_tratados: Option<String>,
    pub encaminhamentos: Option<String>,
    pub disciplina: Option<String>,
    pub tipo_situacao: Option<String>,
    pub descricao_situacao: Option<String>,
    pub nome_responsavel_pai: Option<String>,
    pub grau_parentesco: Option<String>,
    pub created_by: Option<String>,
}

fn trimmed(v: Option<String>) -> Option<String> {
    v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

/// Validates a follow-up and keeps only the fields that belong to its type.
/// Missing type and reason fall back to the suggestion for the incident.
pub fn normalize_follow_up(
    draft: FollowUpDraft,
    incident: &Incident,
) -> Result<FollowUpDraft, IncidentRuleError> {
    if draft.date.trim().is_empty() || academic::parse_date(&draft.date).is_none() {
        return Err(IncidentRuleError::MissingFollowUpField("date"));
    }
    if draft.responsavel.trim().is_empty() {
        return Err(IncidentRuleError::MissingFollowUpField("responsavel"));
    }
    let kind = draft.follow_up_type.unwrap_or_else(|| {
        suggest_follow_up_type(
            incident.suggested_action.as_deref().unwrap_or(""),
            Some(incident.final_severity),
        )
    });

    let mut out = FollowUpDraft {
        id: draft.id,
        follow_up_type: Some(kind),
        date: draft.date.trim().to_string(),
        responsavel: draft.responsavel.trim().to_string(),
        nome_responsavel_pai: trimmed(draft.nome_responsavel_pai),
        grau_parentesco: trimmed(draft.grau_parentesco),
        created_by: trimmed(draft.created_by),
        ..FollowUpDraft::default()
    };
    if kind.is_conversation() {
        out.motivo = trimmed(draft.motivo)
            .or_else(|| default_motivo(incident.final_severity).map(str::to_string));
        out.providencias = trimmed(draft.providencias);
        out.assuntos_tratados = trimmed(draft.assuntos_tratados);
        out.encaminhamentos = trimmed(draft.encaminhamentos);
    } else {
        out.disciplina = trimmed(draft.disciplina);
        out.tipo_situacao = trimmed(draft.tipo_situacao);
        out.descricao_situacao = trimmed(draft.descricao_situacao);
        if out.descricao_situacao.is_none() {
            return Err(IncidentRuleError::MissingFollowUpField("descricaoSituacao"));
        }
    }
    Ok(out)
}

/// Parents convened over low academic performance; these never carry a sanction.
pub fn is_performance_convocation(description: &str, suggested_action: Option<&str>) -> bool {
    let text = format!(
        "{} {}",
        text::fold_accents(description).to_lowercase(),
        text::fold_accents(suggested_action.unwrap_or("")).to_lowercase()
    );
    text.contains("convocacao de pais")
        && ["baixo rendimento", "3 ou mais disciplinas", "disciplinas abaixo da media"]
            .iter()
            .any(|needle| text.contains(needle))
}

pub const ACADEMIC_INCIDENT_ACTION: &str =
    "Chamar responsáveis para reunião para discutir o rendimento acadêmico do aluno.";

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedIncident {
    pub class_id: String,
    pub student_id: String,
    pub date: String,
    pub severity: Severity,
    pub description: String,
    pub suggested_action: String,
    pub subjects_below_average: Vec<String>,
}

fn mentions_academic_performance(incident: &Incident) -> bool {
    let needle = "rendimento academico";
    text::normalize_key(&incident.description).contains(needle)
        || incident
            .suggested_action
            .as_deref()
            .map(|a| text::normalize_key(a).contains(needle))
            .unwrap_or(false)
}

/// Proposes a parents' meeting for every student failing three or more subjects
/// in the class's current academic year, once per student, class and year.
pub fn generate_academic_incidents(
    grades: &[Grade],
    students: &[Student],
    classes: &[SchoolClass],
    existing: &[Incident],
    today: chrono::NaiveDate,
) -> Vec<GeneratedIncident> {
    let class_by_id: HashMap<&str, &SchoolClass> = classes.iter().map(|c| (c.id.as_str(), c)).collect();
    let mut out = Vec::new();

    for student in students {
        let Some(cls) = class_by_id.get(student.class_id.as_str()) else {
            continue;
        };
        let (Some(start), Some(current_year)) = (
            cls.start_year_date.as_deref().and_then(academic::parse_date),
            cls.current_year.filter(|y| (1..=3).contains(y)),
        ) else {
            continue;
        };
        let academic_year = academic::academic_year_label(start, current_year);

        let status = academic::student_academic_status(grades, &student.id, &cls.id, current_year);
        let failing = status.subjects_below_average;
        if failing.len() < 3 {
            continue;
        }

        let already = existing.iter().any(|i| {
            i.class_id == cls.id
                && i.student_ids.iter().any(|s| s == &student.id)
                && (i.date.starts_with(&academic_year) || i.created_at.starts_with(&academic_year))
                && mentions_academic_performance(i)
        });
        if already {
            continue;
        }

        let severity = if failing.len() >= 5 {
            Severity::Grave
        } else {
            Severity::Intermediaria
        };
        out.push(GeneratedIncident {
            class_id: cls.id.clone(),
            student_id: student.id.clone(),
            date: today.format("%Y-%m-%d").to_string(),
            severity,
            description: format!(
                "Aluno com média abaixo de 6,0 em {} disciplina(s): {}.",
                failing.len(),
                failing.join(", ")
            ),
            suggested_action: ACADEMIC_INCIDENT_ACTION.to_string(),
            subjects_below_average: failing,
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::academic::QUARTERS;
    use crate::model::StudentStatus;

    fn ids(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    fn past(student: &str, severity: Severity, status: IncidentStatus) -> Incident {
        Incident {
            id: format!("i-{student}-{}", severity.as_str()),
            class_id: "c1".into(),
            date: "2025-03-01".into(),
            incident_type: IncidentType::Disciplinar,
            student_ids: ids(&[student]),
            episodes: vec![],
            calculated_severity: severity,
            final_severity: severity,
            severity_override_reason: None,
            description: String::new(),
            actions: None,
            suggested_action: None,
            status,
            validated_by: None,
            validated_at: None,
            follow_ups: vec![],
            comments: vec![],
            created_by: "u1".into(),
            created_at: "2025-03-01T10:00:00Z".into(),
            updated_at: "2025-03-01T10:00:00Z".into(),
        }
    }

    #[test]
    fn severity_is_max_of_episodes() {
        assert_eq!(
            calculate_severity(&ids(&["leve-1", "grave-2", "inter-3"]), DISCIPLINARY_EPISODES),
            Severity::Grave
        );
        assert_eq!(calculate_severity(&[], DISCIPLINARY_EPISODES), Severity::Leve);
        assert_eq!(calculate_severity(&ids(&["nope"]), DISCIPLINARY_EPISODES), Severity::Leve);
        assert_eq!(
            calculate_severity(&ids(&["fam-crit-2"]), FAMILY_EPISODES),
            Severity::Gravissima
        );
    }

    #[test]
    fn first_leve_is_conversation_only() {
        let action = calculate_suggested_action(&ids(&["s1"]), Severity::Leve, &[]);
        assert_eq!(action, "Conversa e registro.");
    }

    #[test]
    fn two_handled_leve_incidents_escalate_to_parents_notice() {
        let history = vec![
            past("s1", Severity::Leve, IncidentStatus::Resolvida),
            past("s1", Severity::Leve, IncidentStatus::Acompanhamento),
        ];
        assert_eq!(
            calculate_action_level(&ids(&["s1"]), Severity::Leve, &history),
            ActionLevel::ComunicadoPais
        );
    }

    #[test]
    fn open_incidents_do_not_count_as_history() {
        let history = vec![
            past("s1", Severity::Leve, IncidentStatus::Aberta),
            past("s1", Severity::Leve, IncidentStatus::Aberta),
            past("s1", Severity::Leve, IncidentStatus::Aberta),
        ];
        assert_eq!(
            calculate_action_level(&ids(&["s1"]), Severity::Leve, &history),
            ActionLevel::ConversaRegistro
        );
    }

    #[test]
    fn performance_convocations_still_count_as_history() {
        let mut history = vec![
            past("s1", Severity::Intermediaria, IncidentStatus::Resolvida),
            past("s1", Severity::Intermediaria, IncidentStatus::Resolvida),
        ];
        for incident in &mut history {
            incident.description = "Convocação de pais por baixo rendimento".into();
        }
        assert!(is_performance_convocation(&history[0].description, None));
        assert_eq!(student_history("s1", &history).intermediaria, 2);
        assert_eq!(
            calculate_action_level(&ids(&["s1"]), Severity::Leve, &history),
            ActionLevel::SuspensaoUmDia
        );
    }

    #[test]
    fn worst_student_drives_the_action() {
        let history = vec![
            past("s2", Severity::Intermediaria, IncidentStatus::Resolvida),
            past("s2", Severity::Intermediaria, IncidentStatus::Resolvida),
        ];
        assert_eq!(
            calculate_action_level(&ids(&["s1", "s2"]), Severity::Leve, &history),
            ActionLevel::SuspensaoUmDia
        );
        let three_leve = vec![
            past("s1", Severity::Leve, IncidentStatus::Resolvida),
            past("s1", Severity::Leve, IncidentStatus::Resolvida),
            past("s1", Severity::Leve, IncidentStatus::Resolvida),
        ];
        assert_eq!(
            calculate_action_level(&ids(&["s1"]), Severity::Leve, &three_leve),
            ActionLevel::SuspensaoUmDia
        );
    }

    #[test]
    fn severity_alone_sets_the_floor() {
        assert_eq!(
            calculate_action_level(&ids(&["s1"]), Severity::Gravissima, &[]),
            ActionLevel::SuspensaoTresDias
        );
        assert_eq!(
            calculate_action_level(&ids(&["s1"]), Severity::Grave, &[]),
            ActionLevel::SuspensaoUmDia
        );
        assert_eq!(
            calculate_action_level(&ids(&["s1"]), Severity::Intermediaria, &[]),
            ActionLevel::ComunicadoPais
        );
    }

    #[test]
    fn follow_up_type_suggestion() {
        assert_eq!(
            suggest_follow_up_type("Conversa e registro.", Some(Severity::Leve)),
            FollowUpType::ConversaIndividual
        );
        assert_eq!(
            suggest_follow_up_type("Conversa e registro.", Some(Severity::Grave)),
            FollowUpType::ConversaPais
        );
        assert_eq!(
            suggest_follow_up_type(ActionLevel::SuspensaoUmDia.text(), None),
            FollowUpType::ConversaPais
        );
        assert_eq!(
            suggest_follow_up_type("Avisar os RESPONSÁVEIS", None),
            FollowUpType::ConversaPais
        );
    }

    #[test]
    fn draft_validation() {
        let mut draft = IncidentDraft {
            class_id: "c1".into(),
            student_ids: ids(&["s1"]),
            episodes: ids(&["leve-1"]),
            ..IncidentDraft::default()
        };
        assert_eq!(
            validate_new_incident(&draft),
            Ok(ValidatedSeverity {
                calculated: Severity::Leve,
                final_severity: Severity::Leve
            })
        );

        draft.final_severity = Some(Severity::Grave);
        assert_eq!(validate_new_incident(&draft), Err(IncidentRuleError::MissingOverrideReason));
        draft.severity_override_reason = Some("   ".into());
        assert_eq!(validate_new_incident(&draft), Err(IncidentRuleError::MissingOverrideReason));
        draft.severity_override_reason = Some("Reincidência no mesmo dia".into());
        assert!(validate_new_incident(&draft).is_ok());

        draft.student_ids.clear();
        assert_eq!(validate_new_incident(&draft), Err(IncidentRuleError::NoStudents));

        let family = IncidentDraft {
            class_id: "c1".into(),
            incident_type: IncidentType::AcompanhamentoFamiliar,
            student_ids: ids(&["s1"]),
            episodes: ids(&["leve-1"]),
            ..IncidentDraft::default()
        };
        assert_eq!(
            validate_new_incident(&family),
            Err(IncidentRuleError::UnknownEpisode("leve-1".into()))
        );
    }

    #[test]
    fn status_transitions() {
        assert_eq!(validation_outcome(IncidentStatus::Aberta, true), Ok(IncidentStatus::Acompanhamento));
        assert_eq!(validation_outcome(IncidentStatus::Aberta, false), Ok(IncidentStatus::Aberta));
        assert!(validation_outcome(IncidentStatus::Resolvida, true).is_err());
        assert!(check_status_change(IncidentStatus::Acompanhamento, IncidentStatus::Resolvida).is_ok());
        assert!(check_status_change(IncidentStatus::Resolvida, IncidentStatus::Acompanhamento).is_ok());
        assert!(check_status_change(IncidentStatus::Aberta, IncidentStatus::Resolvida).is_err());
        assert_eq!(validation_comment(true, Some(" ok ")), "Validação: Aprovada. ok");
        assert_eq!(validation_comment(false, None), "Validação: Rejeitada.");
    }

    #[test]
    fn follow_up_keeps_fields_of_its_type() {
        let mut incident = past("s1", Severity::Leve, IncidentStatus::Acompanhamento);
        incident.suggested_action = Some("Conversa e registro.".into());
        let draft = FollowUpDraft {
            date: "2025-03-02".into(),
            responsavel: " Coordenação ".into(),
            disciplina: Some("Matemática".into()),
            ..FollowUpDraft::default()
        };
        let out = normalize_follow_up(draft, &incident).expect("valid follow-up");
        assert_eq!(out.follow_up_type, Some(FollowUpType::ConversaIndividual));
        assert_eq!(out.responsavel, "Coordenação");
        assert_eq!(out.motivo.as_deref(), Some("1 - Comportamento inadequado"));
        assert_eq!(out.disciplina, None);

        let missing = FollowUpDraft {
            date: "2025-03-02".into(),
            responsavel: String::new(),
            ..FollowUpDraft::default()
        };
        assert_eq!(
            normalize_follow_up(missing, &incident),
            Err(IncidentRuleError::MissingFollowUpField("responsavel"))
        );
    }

    #[test]
    fn performance_convocation_detection() {
        assert!(is_performance_convocation(
            "Convocação de pais por baixo rendimento",
            None
        ));
        assert!(is_performance_convocation(
            "Aluno com 3 ou mais disciplinas",
            Some("Convocação de Pais")
        ));
        assert!(!is_performance_convocation("Convocação de pais", Some("Conversa")));
    }

    #[test]
    fn academic_incidents_generated_once() {
        let cls = SchoolClass {
            id: "c1".into(),
            name: "1º A".into(),
            series: "1º ano".into(),
            letter: None,
            course: None,
            active: true,
            start_year: Some(1),
            current_year: Some(1),
            start_year_date: Some("2025-02-01".into()),
            start_calendar_year: Some(2025),
            end_calendar_year: None,
            archived: false,
            archived_at: None,
            archived_reason: None,
            template_id: None,
            class_number: None,
        };
        let student = Student {
            id: "s1".into(),
            class_id: "c1".into(),
            name: "Ana".into(),
            birth_date: None,
            gender: None,
            enrollment: None,
            census_id: None,
            status: StudentStatus::Active,
        };
        let mut grades = Vec::new();
        for (n, subject) in ["Matemática", "Física", "Química"].iter().enumerate() {
            for q in QUARTERS {
                grades.push(Grade {
                    id: format!("g{n}{q}"),
                    student_id: "s1".into(),
                    class_id: "c1".into(),
                    subject: subject.to_string(),
                    quarter: q.to_string(),
                    school_year: 1,
                    grade: 4.0,
                });
            }
        }
        let today = academic::parse_date("2025-09-01").expect("date");
        let generated = generate_academic_incidents(&grades, &[student.clone()], &[cls.clone()], &[], today);
        assert_eq!(generated.len(), 1);
        assert_eq!(generated[0].severity, Severity::Intermediaria);
        assert_eq!(
            generated[0].description,
            "Aluno com média abaixo de 6,0 em 3 disciplina(s): Física, Matemática, Química."
        );

        let mut existing = past("s1", Severity::Intermediaria, IncidentStatus::Aberta);
        existing.suggested_action = Some(ACADEMIC_INCIDENT_ACTION.into());
        existing.created_at = "2025-08-01T09:00:00Z".into();
        let again = generate_academic_incidents(&grades, &[student], &[cls], &[existing], today);
        assert!(again.is_empty());
    }
}
