use std::cmp::Ordering;
use std::collections::BTreeSet;

/// Strips the diacritics used in Portuguese text, leaving the base letter.
/// Characters outside the folding table pass through untouched (`º` included).
pub fn fold_accents(s: &str) -> String {
    s.chars().map(fold_char).collect()
}

fn fold_char(c: char) -> char {
    match c {
        'à' | 'á' | 'â' | 'ã' | 'ä' | 'å' => 'a',
        'À' | 'Á' | 'Â' | 'Ã' | 'Ä' | 'Å' => 'A',
        'ç' => 'c',
        'Ç' => 'C',
        'è' | 'é' | 'ê' | 'ë' => 'e',
        'È' | 'É' | 'Ê' | 'Ë' => 'E',
        'ì' | 'í' | 'î' | 'ï' => 'i',
        'Ì' | 'Í' | 'Î' | 'Ï' => 'I',
        'ñ' => 'n',
        'Ñ' => 'N',
        'ò' | 'ó' | 'ô' | 'õ' | 'ö' => 'o',
        'Ò' | 'Ó' | 'Ô' | 'Õ' | 'Ö' => 'O',
        'ù' | 'ú' | 'û' | 'ü' => 'u',
        'Ù' | 'Ú' | 'Û' | 'Ü' => 'U',
        'ý' | 'ÿ' => 'y',
        'Ý' => 'Y',
        other => other,
    }
}

/// Accent-insensitive, case-insensitive comparison key.
pub fn normalize_key(s: &str) -> String {
    fold_accents(s).to_lowercase().trim().to_string()
}

/// Alphanumeric tokens of `normalize_key(s)` with at least three characters.
pub fn normalize_tokens(s: &str) -> Vec<String> {
    normalize_key(s)
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|t| t.chars().count() >= 3)
        .map(|t| t.to_string())
        .collect()
}

pub fn collapse_spaces(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Lowercase ASCII token suitable for file names.
pub fn sanitize_file_token(s: &str) -> String {
    let folded = fold_accents(s);
    let mut out = String::with_capacity(folded.len());
    let mut pending_sep = false;
    for c in folded.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_sep && !out.is_empty() {
                out.push('_');
            }
            pending_sep = false;
            out.push(c.to_ascii_lowercase());
        } else {
            pending_sep = true;
        }
    }
    out
}

/// Collation close to `pt-BR` locale ordering: accents and case only break ties.
pub fn compare_pt(a: &str, b: &str) -> Ordering {
    normalize_key(a)
        .cmp(&normalize_key(b))
        .then_with(|| a.cmp(b))
}

pub fn sort_pt(values: &mut [String]) {
    values.sort_by(|a, b| compare_pt(a, b));
}

/// Deduplicates exact values and sorts them with [`compare_pt`].
pub fn dedupe_sorted(values: impl IntoIterator<Item = String>) -> Vec<String> {
    let set: BTreeSet<String> = values.into_iter().collect();
    let mut out: Vec<String> = set.into_iter().collect();
    sort_pt(&mut out);
    out
}

/// Joins `["a", "b", "c"]` as `"a, b e c"`.
pub fn join_with_and(items: &[String]) -> String {
    match items {
        [] => String::new(),
        [one] => one.clone(),
        [first, second] => format!("{} e {}", first, second),
        [init @ .., last] => format!("{} e {}", init.join(", "), last),
    }
}

/// Keeps only ASCII letters and digits, uppercased.
pub fn alnum_upper(s: &str) -> String {
    s.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_uppercase())
        .collect()
}
