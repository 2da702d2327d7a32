use regex::Regex;
use std::sync::OnceLock;

static PATTERNS: OnceLock<Vec<(Regex, String)>> = OnceLock::new();

/// Redacts credentials and personal data from text shown to hosts
pub struct LogSanitizer {
    patterns: Vec<(Regex, String)>,
}

impl LogSanitizer {
    pub fn new() -> Self {
        let patterns = PATTERNS.get_or_init(|| {
            vec![
                (
                    Regex::new(r"[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}").unwrap(),
                    "***@***.***".to_string(),
                ),
                (
                    Regex::new(r"(?i)(bearer\s+)[a-zA-Z0-9._~+/=-]+").unwrap(),
                    "$1***".to_string(),
                ),
                (
                    Regex::new(r#"("?token"?\s*[:=]\s*"?)[^"\s,}]+"#).unwrap(),
                    "$1***".to_string(),
                ),
                (
                    Regex::new(r"(sk|pk)-[a-zA-Z0-9]{20,}").unwrap(),
                    "$1-***".to_string(),
                ),
                (
                    Regex::new(r"\b(?:\d{1,3}\.){3}\d{1,3}\b").unwrap(),
                    "*.*.*.*".to_string(),
                ),
            ]
        });

        Self {
            patterns: patterns.clone(),
        }
    }

    pub fn sanitize(&self, message: &str) -> String {
        let mut result = message.to_string();
        for (pattern, replacement) in &self.patterns {
            result = pattern.replace_all(&result, replacement.as_str()).to_string();
        }
        result
    }
}

impl Default for LogSanitizer {
    fn default() -> Self {
        Self::new()
    }
}
