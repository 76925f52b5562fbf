//! Helpers for scraping the portal's server-rendered JSF pages and for
//! normalizing the user-facing names that become directory names.

use std::sync::OnceLock;

use chrono::Local;
use regex::Regex;

fn viewstate_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        #[allow(clippy::unwrap_used)]
        Regex::new(r#"name="javax\.faces\.ViewState"[^>]*value="([^"]*)""#).unwrap()
    })
}

/// Extract the JSF ViewState token that must be round-tripped on every POST.
pub fn extract_viewstate(html: &str) -> Option<String> {
    viewstate_re()
        .captures(html)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// Decode the HTML entities the portal emits in profile and queue names.
pub fn decode_html_entities(text: &str) -> String {
    const TABLE: &[(&str, &str)] = &[
        ("&ccedil;", "ç"),
        ("&Ccedil;", "Ç"),
        ("&atilde;", "ã"),
        ("&Atilde;", "Ã"),
        ("&aacute;", "á"),
        ("&Aacute;", "Á"),
        ("&eacute;", "é"),
        ("&Eacute;", "É"),
        ("&iacute;", "í"),
        ("&Iacute;", "Í"),
        ("&oacute;", "ó"),
        ("&Oacute;", "Ó"),
        ("&uacute;", "ú"),
        ("&Uacute;", "Ú"),
        ("&acirc;", "â"),
        ("&Acirc;", "Â"),
        ("&ecirc;", "ê"),
        ("&Ecirc;", "Ê"),
        ("&ocirc;", "ô"),
        ("&Ocirc;", "Ô"),
        ("&otilde;", "õ"),
        ("&Otilde;", "Õ"),
        ("&agrave;", "à"),
        ("&Agrave;", "À"),
        ("&ordf;", "ª"),
        ("&ordm;", "º"),
        ("&deg;", "°"),
        ("&amp;", "&"),
        ("&nbsp;", " "),
    ];
    let mut out = text.to_string();
    for (entity, ch) in TABLE {
        out = out.replace(entity, ch);
    }
    out.trim().to_string()
}

/// Map accented Latin characters to their base form.
fn strip_accent(c: char) -> char {
    match c {
        'á' | 'à' | 'â' | 'ã' | 'ä' => 'a',
        'Á' | 'À' | 'Â' | 'Ã' | 'Ä' => 'A',
        'é' | 'è' | 'ê' | 'ë' => 'e',
        'É' | 'È' | 'Ê' | 'Ë' => 'E',
        'í' | 'ì' | 'î' | 'ï' => 'i',
        'Í' | 'Ì' | 'Î' | 'Ï' => 'I',
        'ó' | 'ò' | 'ô' | 'õ' | 'ö' => 'o',
        'Ó' | 'Ò' | 'Ô' | 'Õ' | 'Ö' => 'O',
        'ú' | 'ù' | 'û' | 'ü' => 'u',
        'Ú' | 'Ù' | 'Û' | 'Ü' => 'U',
        'ç' => 'c',
        'Ç' => 'C',
        _ => c,
    }
}

/// Normalize a task/tag/subject name into a filesystem-safe directory name:
/// accents stripped, illegal characters replaced, whitespace collapsed.
pub fn sanitize_dir_name(name: &str) -> String {
    let stripped: String = name.chars().map(strip_accent).collect();
    let cleaned: String = stripped
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            c => c,
        })
        .collect();
    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Case- and accent-insensitive form used for queue/tag name comparison.
pub fn fold_for_match(text: &str) -> String {
    text.chars()
        .map(strip_accent)
        .collect::<String>()
        .to_lowercase()
        .trim()
        .to_string()
}

/// Similarity ratio in `0.0..=1.0` based on edit distance.
pub fn similarity(a: &str, b: &str) -> f64 {
    let a = fold_for_match(a);
    let b = fold_for_match(b);
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let max_len = a.len().max(b.len());
    if max_len == 0 {
        return 1.0;
    }
    1.0 - (levenshtein(&a, &b) as f64) / (max_len as f64)
}

fn levenshtein(a: &[char], b: &[char]) -> usize {
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0usize; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(curr[j] + 1);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

/// Find the best match for `needle` in `haystack`:
/// exact match, then substring, then similarity above `threshold`.
/// Returns the winning index.
pub fn find_best_match(needle: &str, haystack: &[String], threshold: f64) -> Option<usize> {
    let folded = fold_for_match(needle);

    for (i, item) in haystack.iter().enumerate() {
        if fold_for_match(item) == folded {
            return Some(i);
        }
    }
    for (i, item) in haystack.iter().enumerate() {
        if fold_for_match(item).contains(&folded) {
            return Some(i);
        }
    }

    let mut best: Option<(usize, f64)> = None;
    for (i, item) in haystack.iter().enumerate() {
        let score = similarity(needle, item);
        if score >= threshold && best.map_or(true, |(_, s)| score > s) {
            best = Some((i, score));
        }
    }
    best.map(|(i, _)| i)
}

/// Timestamp suffix for report files and per-run directories.
pub fn timestamp_str() -> String {
    Local::now().format("%Y%m%d_%H%M%S").to_string()
}

/// Current month/year in the `MM/YYYY` form the date filters default to.
pub fn current_month_year() -> String {
    Local::now().format("%m/%Y").to_string()
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn viewstate_extracted() {
        let html = r#"<input type="hidden" name="javax.faces.ViewState" id="javax.faces.ViewState" value="j_id42" />"#;
        assert_eq!(extract_viewstate(html).as_deref(), Some("j_id42"));
    }

    #[test]
    fn viewstate_missing() {
        assert!(extract_viewstate("<html><body>no state</body></html>").is_none());
    }

    #[test]
    fn entities_decoded() {
        assert_eq!(decode_html_entities("Vara C&iacute;vel &amp; Crime"), "Vara Cível & Crime");
        assert_eq!(decode_html_entities("  Certid&atilde;o  "), "Certidão");
    }

    #[test]
    fn dir_name_sanitized() {
        assert_eq!(sanitize_dir_name("Citação / Intimação"), "Citacao _ Intimacao");
        assert_eq!(sanitize_dir_name("Análise   de  Sentença"), "Analise de Sentenca");
    }

    #[test]
    fn similarity_bounds() {
        assert_eq!(similarity("abc", "abc"), 1.0);
        assert!(similarity("abc", "xyz") < 0.5);
        assert!(similarity("Minutar sentença", "minutar sentenca") > 0.9);
    }

    #[test]
    fn best_match_exact_wins() {
        let items = vec!["Minutar despacho".to_string(), "Minutar sentença".to_string()];
        assert_eq!(find_best_match("minutar sentenca", &items, 0.4), Some(1));
    }

    #[test]
    fn best_match_substring() {
        let items = vec!["Aguardando prazo".to_string(), "Assinar expediente".to_string()];
        assert_eq!(find_best_match("prazo", &items, 0.4), Some(0));
    }

    #[test]
    fn best_match_similarity_fallback() {
        let items = vec!["Conclusos para sentença".to_string()];
        assert_eq!(find_best_match("concluso para sentenca", &items, 0.4), Some(0));
        assert_eq!(find_best_match("zzzzzz", &items, 0.4), None);
    }

    #[test]
    fn month_year_shape() {
        let my = current_month_year();
        assert_eq!(my.len(), 7);
        assert_eq!(&my[2..3], "/");
    }
}
