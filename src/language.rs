//! Heuristic language detection.
//!
//! A lookup-table detector, nothing more: classify the dominant script
//! first, then fall back to counting common function words for Latin-script
//! languages. The result is a full language name like `"spanish"`, or
//! `"unknown"` when there is no clear signal. Detection is auxiliary: it
//! can never fail, and it never aborts the main flow.

/// Number of characters sampled from the head of the text. Sampling keeps
/// detection cheap on large documents.
const SAMPLE_LEN: usize = 1000;

/// Minimum word-table hits before we trust a Latin-script guess.
const MIN_WORD_HITS: usize = 2;

/// Common function words per Latin-script language. Order matters: on tied
/// scores, the earlier language wins.
const WORD_TABLE: &[(&str, &[&str])] = &[
    (
        "english",
        &["the", "and", "of", "to", "in", "is", "that", "for", "with", "was"],
    ),
    (
        "spanish",
        &["el", "la", "los", "las", "que", "una", "por", "con", "para", "como"],
    ),
    (
        "french",
        &["le", "les", "des", "une", "est", "dans", "pour", "pas", "sur", "aux"],
    ),
    (
        "german",
        &["der", "die", "das", "und", "ist", "nicht", "mit", "ein", "eine", "von"],
    ),
    (
        "italian",
        &["il", "di", "che", "per", "con", "del", "sono", "non", "della", "gli"],
    ),
    (
        "portuguese",
        &["que", "uma", "com", "para", "por", "mais", "como", "dos", "das", "são"],
    ),
    (
        "dutch",
        &["de", "het", "een", "van", "en", "niet", "met", "voor", "zijn", "dat"],
    ),
];

/// Detect the language of a text.
pub fn detect_language(text: &str) -> String {
    let sample: String = text.chars().take(SAMPLE_LEN).collect();

    let mut script = ScriptCounts::default();
    for c in sample.chars() {
        script.count(c);
    }
    if let Some(language) = script.dominant_language() {
        return language.to_owned();
    }
    if script.latin > 0
        && let Some(language) = detect_latin_language(&sample)
    {
        return language.to_owned();
    }
    "unknown".to_owned()
}

/// Character counts per script block.
#[derive(Debug, Default)]
struct ScriptCounts {
    latin: usize,
    han: usize,
    kana: usize,
    hangul: usize,
    cyrillic: usize,
    arabic: usize,
    greek: usize,
    hebrew: usize,
    devanagari: usize,
}

impl ScriptCounts {
    fn count(&mut self, c: char) {
        match c {
            '\u{4E00}'..='\u{9FFF}' => self.han += 1,
            '\u{3040}'..='\u{30FF}' => self.kana += 1,
            '\u{AC00}'..='\u{D7AF}' => self.hangul += 1,
            '\u{0400}'..='\u{04FF}' => self.cyrillic += 1,
            '\u{0600}'..='\u{06FF}' => self.arabic += 1,
            '\u{0370}'..='\u{03FF}' => self.greek += 1,
            '\u{0590}'..='\u{05FF}' => self.hebrew += 1,
            '\u{0900}'..='\u{097F}' => self.devanagari += 1,
            c if c.is_alphabetic() => self.latin += 1,
            _ => {}
        }
    }

    fn total(&self) -> usize {
        self.latin
            + self.han
            + self.kana
            + self.hangul
            + self.cyrillic
            + self.arabic
            + self.greek
            + self.hebrew
            + self.devanagari
    }

    /// The language of the dominant non-Latin script, if any script holds a
    /// majority of the letters.
    fn dominant_language(&self) -> Option<&'static str> {
        let total = self.total();
        if total == 0 {
            return None;
        }
        // Kana anywhere means Japanese, even when Han characters dominate.
        if self.kana > 0 && (self.kana + self.han) * 2 > total {
            return Some("japanese");
        }
        let candidates = [
            (self.han, "chinese"),
            (self.hangul, "korean"),
            (self.cyrillic, "russian"),
            (self.arabic, "arabic"),
            (self.greek, "greek"),
            (self.hebrew, "hebrew"),
            (self.devanagari, "hindi"),
        ];
        candidates
            .into_iter()
            .find(|&(count, _)| count * 2 > total)
            .map(|(_, language)| language)
    }
}

/// Score the sample against the per-language word tables.
fn detect_latin_language(sample: &str) -> Option<&'static str> {
    let words: Vec<String> = sample
        .split(|c: char| !c.is_alphabetic())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .collect();

    let mut best: Option<&'static str> = None;
    let mut best_score = 0;
    for &(language, table) in WORD_TABLE {
        let score = words
            .iter()
            .filter(|word| table.contains(&word.as_str()))
            .count();
        if score > best_score {
            best = Some(language);
            best_score = score;
        }
    }
    if best_score >= MIN_WORD_HITS { best } else { None }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_common_latin_languages() {
        assert_eq!(
            detect_language("The tenant shall pay the rent to the landlord in advance, and the lease is binding."),
            "english"
        );
        assert_eq!(
            detect_language("El arrendatario pagará la renta por adelantado y una copia para los registros."),
            "spanish"
        );
        assert_eq!(
            detect_language("Der Mieter zahlt die Miete im Voraus und die Kaution ist mit dem Vertrag fällig."),
            "german"
        );
    }

    #[test]
    fn detects_scripts_without_word_tables() {
        assert_eq!(detect_language("Арендатор оплачивает аренду заранее"), "russian");
        assert_eq!(detect_language("賃借人は家賃を前払いするものとします"), "japanese");
        assert_eq!(detect_language("임차인은 임대료를 선불로 지급한다"), "korean");
    }

    #[test]
    fn ambiguous_or_empty_text_is_unknown() {
        assert_eq!(detect_language(""), "unknown");
        assert_eq!(detect_language("12345 67890 ..."), "unknown");
        assert_eq!(detect_language("zzz qqq xxx"), "unknown");
    }

    #[test]
    fn only_the_leading_sample_is_considered() {
        // English head, long Spanish tail: the sample window sees the head.
        let mut text = String::new();
        for _ in 0..60 {
            text.push_str("the lease is binding and the rent is due ");
        }
        for _ in 0..500 {
            text.push_str("el arrendatario pagará la renta por adelantado ");
        }
        assert_eq!(detect_language(&text), "english");
    }
}
