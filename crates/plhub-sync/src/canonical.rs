use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::Serialize;
use strsim::normalized_levenshtein;
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

use crate::aliases::{alias_key, AliasTable, NameKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchVia {
    Alias,
    Exact,
    Fuzzy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Canonical {
    Resolved {
        name: String,
        score: u8,
        via: MatchVia,
    },
    /// No candidate reached the threshold; `best` is the closest one, for reporting.
    Unresolved {
        raw: String,
        best: Option<(String, u8)>,
    },
}

impl Canonical {
    pub fn name(&self) -> Option<&str> {
        match self {
            Canonical::Resolved { name, .. } => Some(name),
            Canonical::Unresolved { .. } => None,
        }
    }
}

/// Lower-cases, replaces non-alphanumerics with spaces and sorts the tokens.
fn token_sorted(input: &str) -> String {
    let cleaned: String = input
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    let mut tokens: Vec<&str> = cleaned.split_whitespace().collect();
    tokens.sort_unstable();
    tokens.join(" ")
}

/// Token-order-insensitive similarity on a 0-100 scale.
pub fn token_sort_ratio(a: &str, b: &str) -> u8 {
    let (a, b) = (token_sorted(a), token_sorted(b));
    if a.is_empty() && b.is_empty() {
        return 100;
    }
    (normalized_levenshtein(&a, &b) * 100.0).round().clamp(0.0, 100.0) as u8
}

/// Highest-scoring candidate. Candidates are visited in lexicographic order and
/// only a strictly higher score replaces the current best, so ties go to the
/// lexicographically first candidate.
pub fn best_match<'a, I>(query: &str, candidates: I) -> Option<(&'a str, u8)>
where
    I: IntoIterator<Item = &'a str>,
{
    let ordered: BTreeSet<&'a str> = candidates.into_iter().collect();
    let mut best: Option<(&'a str, u8)> = None;
    for candidate in ordered {
        let score = token_sort_ratio(query, candidate);
        if best.map_or(true, |(_, s)| score > s) {
            best = Some((candidate, score));
        }
    }
    best
}

/// Folds a person's name for comparison: diacritics stripped, case-folded,
/// punctuation dropped and whitespace collapsed. "Darwin Núñez" -> "darwin nunez".
pub fn normalize_person_name(raw: &str) -> String {
    let folded: String = raw
        .nfd()
        .filter(|c| !is_combining_mark(*c))
        .flat_map(char::to_lowercase)
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    folded.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// "centre BACK" -> "Centre Back".
pub fn title_case(raw: &str) -> String {
    raw.split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first
                    .to_uppercase()
                    .chain(chars.flat_map(char::to_lowercase))
                    .collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Alias table plus the canonical names already known to the store.
#[derive(Debug, Clone)]
pub struct Canonicalizer {
    aliases: Arc<AliasTable>,
    known: BTreeMap<NameKind, BTreeSet<String>>,
}

impl Canonicalizer {
    pub fn new(aliases: Arc<AliasTable>) -> Self {
        let mut known: BTreeMap<NameKind, BTreeSet<String>> = BTreeMap::new();
        for kind in [NameKind::Team, NameKind::Position, NameKind::Stadium] {
            known
                .entry(kind)
                .or_default()
                .extend(aliases.canonical_names(kind).map(str::to_string));
        }
        Self { aliases, known }
    }

    pub fn add_known_names<I, S>(&mut self, kind: NameKind, names: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let set = self.known.entry(kind).or_default();
        for name in names {
            let name: String = name.into();
            let trimmed = name.trim();
            if !trimmed.is_empty() {
                set.insert(trimmed.to_string());
            }
        }
    }

    pub fn candidates(&self, kind: NameKind) -> impl Iterator<Item = &str> {
        self.known
            .get(&kind)
            .into_iter()
            .flat_map(|set| set.iter().map(String::as_str))
    }

    /// Alias lookup first, then a case-insensitive exact hit on a known name,
    /// then the best fuzzy candidate if it reaches `threshold`.
    pub fn canonicalize(&self, kind: NameKind, raw: &str, threshold: u8) -> Canonical {
        let key = alias_key(raw);
        if key.is_empty() {
            return Canonical::Unresolved {
                raw: raw.to_string(),
                best: None,
            };
        }

        if let Some(name) = self.aliases.lookup(kind, &key) {
            let via = if alias_key(name) == key {
                MatchVia::Exact
            } else {
                MatchVia::Alias
            };
            return Canonical::Resolved {
                name: name.to_string(),
                score: 100,
                via,
            };
        }

        if let Some(name) = self.candidates(kind).find(|c| alias_key(c) == key) {
            return Canonical::Resolved {
                name: name.to_string(),
                score: 100,
                via: MatchVia::Exact,
            };
        }

        match best_match(&key, self.candidates(kind)) {
            Some((name, score)) if score >= threshold => Canonical::Resolved {
                name: name.to_string(),
                score,
                via: MatchVia::Fuzzy,
            },
            best => Canonical::Unresolved {
                raw: raw.trim().to_string(),
                best: best.map(|(name, score)| (name.to_string(), score)),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn canonicalizer() -> Canonicalizer {
        Canonicalizer::new(Arc::new(AliasTable::builtin().expect("aliases")))
    }

    #[test]
    fn aliases_resolve_with_full_score() {
        let result = canonicalizer().canonicalize(NameKind::Team, "Man Utd", 80);
        assert_eq!(
            result,
            Canonical::Resolved {
                name: "Manchester United".into(),
                score: 100,
                via: MatchVia::Alias
            }
        );
    }

    #[test]
    fn identical_names_resolve_to_themselves() {
        let result = canonicalizer().canonicalize(NameKind::Team, "Arsenal", 80);
        assert_eq!(result.name(), Some("Arsenal"));
        assert!(matches!(result, Canonical::Resolved { via: MatchVia::Exact, score: 100, .. }));
    }

    #[test]
    fn bare_afc_is_not_guessed() {
        let result = canonicalizer().canonicalize(NameKind::Team, "AFC", 80);
        assert_ne!(result.name(), Some("Arsenal"));
        assert!(matches!(result, Canonical::Unresolved { .. }));
        assert_eq!(
            canonicalizer()
                .canonicalize(NameKind::Team, "AFC Bournemouth", 80)
                .name(),
            Some("AFC Bournemouth")
        );
    }

    #[test]
    fn gibberish_is_unresolved() {
        let result = canonicalizer().canonicalize(NameKind::Team, "xyzzy123", 80);
        assert!(matches!(result, Canonical::Unresolved { .. }));
    }

    #[test]
    fn near_misses_resolve_fuzzily() {
        let result = canonicalizer().canonicalize(NameKind::Team, "Hotspur Tottenham", 80);
        assert_eq!(result.name(), Some("Tottenham Hotspur"));

        let result = canonicalizer().canonicalize(NameKind::Team, "Crystal Pallace", 80);
        assert!(matches!(result, Canonical::Resolved { via: MatchVia::Fuzzy, .. }));
        assert_eq!(result.name(), Some("Crystal Palace"));
    }

    #[test]
    fn store_names_join_the_candidate_set() {
        let mut c = canonicalizer();
        assert!(c.canonicalize(NameKind::Team, "Ipswich Town", 80).name().is_none());
        c.add_known_names(NameKind::Team, ["Ipswich Town"]);
        assert_eq!(c.canonicalize(NameKind::Team, "ipswich town", 80).name(), Some("Ipswich Town"));
    }

    #[test]
    fn ties_go_to_the_lexicographically_first_candidate() {
        let (name, score) = best_match("ab", ["b", "a"]).expect("candidates");
        assert_eq!(score, token_sort_ratio("ab", "b"));
        assert_eq!(name, "a");
    }

    #[test]
    fn token_order_is_ignored() {
        assert_eq!(token_sort_ratio("United Manchester", "manchester united"), 100);
    }

    #[test]
    fn person_names_fold_diacritics() {
        assert_eq!(normalize_person_name("Darwin Núñez"), "darwin nunez");
        assert_eq!(normalize_person_name("  Martin  Ødegaard "), "martin ødegaard");
        assert_eq!(normalize_person_name("Kai Havertz"), normalize_person_name("KAI   HAVERTZ"));
    }

    #[test]
    fn title_case_fallback() {
        assert_eq!(title_case("centre BACK"), "Centre Back");
    }
}
