use regex::Regex;

pub trait TextExtractor: Send + Sync {
    fn extract(&self, text: &str) -> Option<String>;
}

/// Regexes tried in order. Group 1 of the first match is the value.
pub struct PatternChain {
    patterns: Vec<Regex>,
}

impl PatternChain {
    /// Panics on an invalid pattern; chains are built from literals.
    pub fn new(patterns: &[&str]) -> Self {
        let patterns = patterns
            .iter()
            .map(|p| Regex::new(&format!("(?im){p}")).expect("valid extractor pattern"))
            .collect();
        Self { patterns }
    }

    /// Like [`TextExtractor::extract`] but keeps scanning matches until
    /// `parse` accepts one.
    pub fn extract_with<T>(&self, text: &str, parse: impl Fn(&str) -> Option<T>) -> Option<T> {
        self.patterns.iter().find_map(|re| {
            re.captures_iter(text)
                .filter_map(|caps| caps.get(1))
                .find_map(|m| parse(m.as_str().trim()))
        })
    }
}

impl TextExtractor for PatternChain {
    fn extract(&self, text: &str) -> Option<String> {
        self.extract_with(text, |raw| (!raw.is_empty()).then(|| raw.to_string()))
    }
}

pub fn first_match(extractors: &[&dyn TextExtractor], text: &str) -> Option<String> {
    extractors.iter().find_map(|e| e.extract(text))
}

pub fn parse_number(raw: &str) -> Option<f64> {
    raw.trim()
        .trim_start_matches('+')
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
}

pub fn leading_number(raw: &str) -> Option<f64> {
    let raw = raw.trim().trim_start_matches('+');
    let end = raw
        .char_indices()
        .find(|(_, c)| !(c.is_ascii_digit() || *c == '.' || *c == '-'))
        .map(|(i, _)| i)
        .unwrap_or(raw.len());
    parse_number(&raw[..end])
}
