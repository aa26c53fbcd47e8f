#[path = "../src/text.rs"]
mod text;

#[path = "../src/bundle.rs"]
mod bundle;

use std::fs::File;
use std::io::Read;

use sha2::{Digest, Sha256};

fn request() -> bundle::BundleRequest {
    bundle::BundleRequest {
        title: "Monitores 2025".into(),
        certificate_type: "monitoria".into(),
        certificate_type_label: "Monitoria".into(),
        class_name: "1º DS".into(),
        period_label: "1º bimestre de 2025".into(),
        teacher_name: Some("Marta Lima".into()),
        director_name: None,
        physical_signature: false,
        certificates: vec![
            bundle::BundleCertificate {
                student_name: "Ana Júlia Souza".into(),
                text: "A Escola certifica que o(a) aluno(a) Ana Júlia Souza atuou como monitor(a).".into(),
                verification_code: Some("ABC123".into()),
                revoked: false,
            },
            bundle::BundleCertificate {
                student_name: "João Lima".into(),
                text: "A Escola certifica que o(a) aluno(a) João Lima atuou como monitor(a).".into(),
                verification_code: Some("DEF456".into()),
                revoked: true,
            },
        ],
    }
}

fn read_entry(archive: &mut zip::ZipArchive<File>, name: &str) -> String {
    let mut out = String::new();
    archive
        .by_name(name)
        .expect("entry")
        .read_to_string(&mut out)
        .expect("read entry");
    out
}

#[test]
fn bundle_contains_manifest_certificates_and_digests() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("out").join("certificados.zip");
    let req = request();

    let summary = bundle::export_certificate_bundle(&req, "EEEP Modelo", &path).expect("export");
    assert_eq!(summary.bundle_format, bundle::BUNDLE_FORMAT_V1);
    assert_eq!(summary.entry_count, 4);
    assert_eq!(summary.certificate_count, 2);

    let manifest = bundle::read_bundle_manifest(&path).expect("manifest");
    assert_eq!(manifest.count, 2);
    assert_eq!(manifest.certificate_type, "monitoria");
    assert_eq!(manifest.class_name, "1º DS");

    let mut archive = zip::ZipArchive::new(File::open(&path).expect("open")).expect("zip");
    let first = read_entry(&mut archive, "certificados/01_ana_julia_souza.txt");
    assert!(first.starts_with("EEEP Modelo\nCERTIFICADO - MONITORIA"));
    assert!(first.contains("Marta Lima"));
    assert!(first.contains("Código de verificação: ABC123"));
    assert!(!first.contains("REVOGADO"));
    let second = read_entry(&mut archive, "certificados/02_joao_lima.txt");
    assert!(second.contains("Situação: REVOGADO"));

    let index: serde_json::Value =
        serde_json::from_str(&read_entry(&mut archive, "verificacao.json")).expect("json");
    let mut hasher = Sha256::new();
    hasher.update(req.certificates[0].text.as_bytes());
    let expected = format!("{:x}", hasher.finalize());
    assert_eq!(index[0]["sha256"].as_str(), Some(expected.as_str()));
    assert_eq!(index[1]["status"].as_str(), Some("revoked"));
    assert_eq!(index[1]["verificationCode"].as_str(), Some("DEF456"));
}

#[test]
fn empty_export_is_rejected() {
    let dir = tempfile::tempdir().expect("temp dir");
    let mut req = request();
    req.certificates.clear();
    let err = bundle::export_certificate_bundle(&req, "Escola", &dir.path().join("x.zip"))
        .expect_err("empty bundle");
    assert!(err.to_string().contains("no certificates"));
}

#[test]
fn foreign_zip_is_not_a_certificate_bundle() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("other.zip");
    let mut zip = zip::ZipWriter::new(File::create(&path).expect("create"));
    zip.start_file("manifest.json", zip::write::FileOptions::default())
        .expect("start");
    std::io::Write::write_all(
        &mut zip,
        br#"{"format":"other","title":"","certificateType":"","className":"","periodLabel":"","count":0,"exportedAt":""}"#,
    )
    .expect("write");
    zip.finish().expect("finish");

    let err = bundle::read_bundle_manifest(&path).expect_err("wrong format");
    assert!(err.to_string().contains("unsupported bundle format"));
}
