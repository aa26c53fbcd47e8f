use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SchoolClass {
    pub id: String,
    pub name: String,
    pub series: String,
    #[serde(default)]
    pub letter: Option<String>,
    #[serde(default)]
    pub course: Option<String>,
    #[serde(default = "default_true")]
    pub active: bool,
    /// Course year (1..=3) the class started in.
    #[serde(default)]
    pub start_year: Option<u8>,
    #[serde(default)]
    pub current_year: Option<u8>,
    /// ISO date of the first day of the first school year.
    #[serde(default)]
    pub start_year_date: Option<String>,
    #[serde(default)]
    pub start_calendar_year: Option<i32>,
    #[serde(default)]
    pub end_calendar_year: Option<i32>,
    #[serde(default)]
    pub archived: bool,
    #[serde(default)]
    pub archived_at: Option<String>,
    #[serde(default)]
    pub archived_reason: Option<String>,
    #[serde(default)]
    pub template_id: Option<String>,
    #[serde(default)]
    pub class_number: Option<String>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StudentStatus {
    Active,
    Inactive,
    Transferred,
    Approved,
    Recovery,
    Failed,
}

impl StudentStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "inactive" => Some(Self::Inactive),
            "transferred" => Some(Self::Transferred),
            "approved" => Some(Self::Approved),
            "recovery" => Some(Self::Recovery),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Transferred => "transferred",
            Self::Approved => "approved",
            Self::Recovery => "recovery",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Student {
    pub id: String,
    pub class_id: String,
    pub name: String,
    #[serde(default)]
    pub birth_date: Option<String>,
    #[serde(default)]
    pub gender: Option<String>,
    #[serde(default)]
    pub enrollment: Option<String>,
    #[serde(default)]
    pub census_id: Option<String>,
    pub status: StudentStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Grade {
    pub id: String,
    pub student_id: String,
    pub class_id: String,
    pub subject: String,
    pub quarter: String,
    /// Course year the grade belongs to; legacy rows without one count as year 1.
    pub school_year: u8,
    pub grade: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AttendanceStatus {
    Presente,
    Falta,
    FaltaJustificada,
    Atestado,
}

impl AttendanceStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "presente" => Some(Self::Presente),
            "falta" => Some(Self::Falta),
            "falta_justificada" => Some(Self::FaltaJustificada),
            "atestado" => Some(Self::Atestado),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Presente => "presente",
            Self::Falta => "falta",
            Self::FaltaJustificada => "falta_justificada",
            Self::Atestado => "atestado",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceRecord {
    pub id: String,
    pub student_id: String,
    pub class_id: String,
    pub date: String,
    pub status: AttendanceStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct YearSubjects {
    pub year: u8,
    pub subjects: Vec<String>,
}

/// Technical-course curriculum: the professional subjects taught in each course year.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SubjectTemplate {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub course: Option<String>,
    pub subjects_by_year: Vec<YearSubjects>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProfessionalSubject {
    pub id: String,
    pub class_id: String,
    pub subject: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ExternalAssessmentType {
    #[serde(rename = "SAEB")]
    Saeb,
    #[serde(rename = "SIGE")]
    Sige,
    #[serde(rename = "Diagnóstica")]
    Diagnostica,
    #[serde(rename = "Simulado")]
    Simulado,
    #[serde(rename = "Outro")]
    Outro,
}

impl ExternalAssessmentType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "SAEB" => Some(Self::Saeb),
            "SIGE" => Some(Self::Sige),
            "Diagnóstica" => Some(Self::Diagnostica),
            "Simulado" => Some(Self::Simulado),
            "Outro" => Some(Self::Outro),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Saeb => "SAEB",
            Self::Sige => "SIGE",
            Self::Diagnostica => "Diagnóstica",
            Self::Simulado => "Simulado",
            Self::Outro => "Outro",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SchoolLevel {
    Fundamental,
    Medio,
}

impl SchoolLevel {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "fundamental" => Some(Self::Fundamental),
            "medio" => Some(Self::Medio),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fundamental => "fundamental",
            Self::Medio => "medio",
        }
    }

    /// Grade years valid for the level: 6..=9 in fundamental, 1..=3 in médio.
    pub fn accepts_year(self, year: u8) -> bool {
        match self {
            Self::Fundamental => (6..=9).contains(&year),
            Self::Medio => (1..=3).contains(&year),
        }
    }
}

/// Score from an assessment applied outside the class gradebook (SAEB, simulados).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExternalAssessment {
    pub id: String,
    pub student_id: String,
    pub assessment_type: ExternalAssessmentType,
    pub assessment_name: String,
    /// `None` means a general score not tied to one subject.
    #[serde(default)]
    pub subject: Option<String>,
    pub score: f64,
    pub max_score: f64,
    #[serde(default)]
    pub proficiency_level: Option<String>,
    pub applied_date: String,
    pub school_level: SchoolLevel,
    pub grade_year: u8,
    #[serde(default)]
    pub quarter: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Grade a student earned before joining the school, usually in fundamental.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HistoricalGrade {
    pub id: String,
    pub student_id: String,
    pub school_level: SchoolLevel,
    pub grade_year: u8,
    pub subject: String,
    #[serde(default)]
    pub quarter: Option<String>,
    pub grade: f64,
    #[serde(default)]
    pub school_name: Option<String>,
    #[serde(default)]
    pub calendar_year: Option<i32>,
}
