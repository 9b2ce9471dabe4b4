use crate::SymbolValidator;

/// Default ticker rules: alphanumerics plus `.`, `-` and `^`, bounded length, upper-cased.
#[derive(Debug, Clone)]
pub struct DefaultSymbolValidator {
    max_len: usize,
}

impl DefaultSymbolValidator {
    pub const DEFAULT_MAX_LEN: usize = 10;

    pub fn new(max_len: usize) -> Self {
        Self { max_len }
    }
}

impl Default for DefaultSymbolValidator {
    fn default() -> Self {
        Self::new(Self::DEFAULT_MAX_LEN)
    }
}

impl SymbolValidator for DefaultSymbolValidator {
    fn validate(&self, symbol: &str) -> Option<String> {
        let sanitized = symbol.trim().to_uppercase();
        if sanitized.is_empty() || sanitized.len() > self.max_len {
            return None;
        }
        if !sanitized
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '^'))
        {
            return None;
        }
        if !sanitized.chars().any(|c| c.is_ascii_alphanumeric()) {
            return None;
        }
        Some(sanitized)
    }
}
