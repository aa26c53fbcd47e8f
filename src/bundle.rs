use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::text;

const MANIFEST_ENTRY: &str = "manifest.json";
const VERIFICATION_ENTRY: &str = "verificacao.json";
const CERTIFICATES_DIR: &str = "certificados";
pub const BUNDLE_FORMAT_V1: &str = "escola-certificates-v1";

#[derive(Debug, Clone)]
pub struct BundleCertificate {
    pub student_name: String,
    pub text: String,
    pub verification_code: Option<String>,
    pub revoked: bool,
}

#[derive(Debug, Clone)]
pub struct BundleRequest {
    pub title: String,
    /// Machine key, e.g. `destaque`.
    pub certificate_type: String,
    pub certificate_type_label: String,
    pub class_name: String,
    pub period_label: String,
    pub teacher_name: Option<String>,
    pub director_name: Option<String>,
    pub physical_signature: bool,
    pub certificates: Vec<BundleCertificate>,
}

#[derive(Debug, Clone)]
pub struct ExportSummary {
    pub bundle_format: String,
    pub entry_count: usize,
    pub certificate_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BundleManifest {
    pub format: String,
    pub title: String,
    pub certificate_type: String,
    pub class_name: String,
    pub period_label: String,
    pub count: usize,
    pub exported_at: String,
}

fn text_sha256(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn signature_block(request: &BundleRequest, school_name: &str) -> String {
    let line = if request.physical_signature {
        "______________________________"
    } else {
        "(assinado digitalmente)"
    };
    let teacher = request
        .teacher_name
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or("Professor(a) responsável");
    let director = request
        .director_name
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or("Direção");
    format!(
        "{line}\n{teacher}\nProfessor(a) responsável\n\n{line}\n{director}\nDiretor(a) - {school}\n",
        line = line,
        teacher = teacher,
        director = director,
        school = school_name,
    )
}

fn certificate_entry_name(index: usize, student_name: &str) -> String {
    let token = text::sanitize_file_token(student_name);
    let token = if token.is_empty() { "aluno".to_string() } else { token };
    format!("{}/{:02}_{}.txt", CERTIFICATES_DIR, index + 1, token)
}

fn certificate_body(request: &BundleRequest, cert: &BundleCertificate, school_name: &str) -> String {
    let mut body = String::new();
    body.push_str(school_name);
    body.push('\n');
    body.push_str(&format!("CERTIFICADO - {}\n\n", request.certificate_type_label.to_uppercase()));
    body.push_str(cert.text.trim());
    body.push_str("\n\n");
    body.push_str(&signature_block(request, school_name));
    if let Some(code) = cert.verification_code.as_deref() {
        body.push_str(&format!("\nCódigo de verificação: {}\n", code));
    }
    if cert.revoked {
        body.push_str("Situação: REVOGADO\n");
    }
    body
}

/// Writes every certificate of `request` into a ZIP at `out_path`, with a
/// manifest and a verification index holding each text's SHA-256.
pub fn export_certificate_bundle(
    request: &BundleRequest,
    school_name: &str,
    out_path: &Path,
) -> anyhow::Result<ExportSummary> {
    if request.certificates.is_empty() {
        return Err(anyhow!("no certificates to export"));
    }

    if let Some(parent) = out_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.to_string_lossy()))?;
    }

    let out_file = File::create(out_path).with_context(|| {
        format!(
            "failed to create output file {}",
            out_path.to_string_lossy()
        )
    })?;
    let mut zip = ZipWriter::new(out_file);
    let opts = FileOptions::default().compression_method(CompressionMethod::Deflated);

    let manifest = BundleManifest {
        format: BUNDLE_FORMAT_V1.to_string(),
        title: request.title.clone(),
        certificate_type: request.certificate_type.clone(),
        class_name: request.class_name.clone(),
        period_label: request.period_label.clone(),
        count: request.certificates.len(),
        exported_at: chrono::Utc::now().to_rfc3339(),
    };
    zip.start_file(MANIFEST_ENTRY, opts)
        .context("failed to start manifest entry")?;
    zip.write_all(
        serde_json::to_string_pretty(&manifest)
            .context("failed to serialize manifest")?
            .as_bytes(),
    )
    .context("failed to write manifest entry")?;

    let mut index = Vec::with_capacity(request.certificates.len());
    for (i, cert) in request.certificates.iter().enumerate() {
        let entry = certificate_entry_name(i, &cert.student_name);
        zip.start_file(entry.as_str(), opts)
            .with_context(|| format!("failed to start entry {}", entry))?;
        zip.write_all(certificate_body(request, cert, school_name).as_bytes())
            .with_context(|| format!("failed to write entry {}", entry))?;
        index.push(json!({
            "file": entry,
            "studentName": cert.student_name,
            "verificationCode": cert.verification_code,
            "status": if cert.revoked { "revoked" } else { "valid" },
            "sha256": text_sha256(cert.text.trim()),
        }));
    }

    zip.start_file(VERIFICATION_ENTRY, opts)
        .context("failed to start verification entry")?;
    zip.write_all(
        serde_json::to_string_pretty(&index)
            .context("failed to serialize verification index")?
            .as_bytes(),
    )
    .context("failed to write verification entry")?;

    zip.finish().context("failed to finalize zip bundle")?;

    Ok(ExportSummary {
        bundle_format: BUNDLE_FORMAT_V1.to_string(),
        entry_count: request.certificates.len() + 2,
        certificate_count: request.certificates.len(),
    })
}

pub fn read_bundle_manifest(in_path: &Path) -> anyhow::Result<BundleManifest> {
    let in_file = File::open(in_path)
        .with_context(|| format!("failed to open bundle {}", in_path.to_string_lossy()))?;
    let mut archive = ZipArchive::new(in_file).context("invalid zip archive")?;

    let mut manifest_text = String::new();
    archive
        .by_name(MANIFEST_ENTRY)
        .context("bundle missing manifest.json")?
        .read_to_string(&mut manifest_text)
        .context("failed to read manifest.json")?;
    let manifest: BundleManifest =
        serde_json::from_str(&manifest_text).context("manifest.json is invalid")?;
    if manifest.format != BUNDLE_FORMAT_V1 {
        return Err(anyhow!("unsupported bundle format: {}", manifest.format));
    }
    Ok(manifest)
}
