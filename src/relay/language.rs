//! Response languages.

use serde::Serialize;

/// Supported response languages, by ISO 639-1 code.
pub const LANGUAGES: &[(&str, &str)] = &[
    ("en", "English"),
    ("hi", "Hindi"),
    ("ta", "Tamil"),
    ("te", "Telugu"),
    ("bn", "Bengali"),
    ("mr", "Marathi"),
    ("gu", "Gujarati"),
    ("kn", "Kannada"),
    ("ml", "Malayalam"),
    ("pa", "Punjabi"),
    ("or", "Odia"),
    ("as", "Assamese"),
];

const FALLBACK_NAME: &str = "English";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Language {
    pub code: String,
    pub name: String,
}

impl Language {
    /// Look up a code. Unknown codes keep their code (it is still what the
    /// user picked and what gets persisted) but are answered in English.
    pub fn from_code(code: &str) -> Self {
        let code = code.trim().to_ascii_lowercase();
        let name = LANGUAGES
            .iter()
            .find(|(c, _)| *c == code)
            .map(|(_, name)| *name)
            .unwrap_or(FALLBACK_NAME);

        Self {
            code,
            name: name.to_string(),
        }
    }

    pub fn is_known(&self) -> bool {
        LANGUAGES.iter().any(|(c, _)| *c == self.code)
    }
}

impl Default for Language {
    fn default() -> Self {
        Self::from_code("en")
    }
}
