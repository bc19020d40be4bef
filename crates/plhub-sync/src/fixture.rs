//! Free-text fixture parsing ("Arsenal vs Liverpool", "Arsenal at Liverpool").

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixtureSides {
    pub home: String,
    pub away: String,
}

/// Separators in precedence order. `reversed` separators read "Away at Home".
const SEPARATORS: [(&str, bool); 5] = [
    (" at ", true),
    (" vs ", false),
    (" - ", false),
    (" v ", false),
    (" @ ", true),
];

/// Splits a fixture on the highest-precedence separator present (matched
/// case-insensitively). Returns `None` when no separator is found or either
/// side is empty.
pub fn parse_fixture(text: &str) -> Option<FixtureSides> {
    let lowered = text.to_ascii_lowercase();
    let (separator, reversed) = SEPARATORS
        .iter()
        .find(|(sep, _)| lowered.contains(sep))?;
    let at = lowered.find(separator)?;

    let left = text[..at].trim();
    let right = text[at + separator.len()..].trim();
    if left.is_empty() || right.is_empty() {
        return None;
    }

    let (home, away) = if *reversed { (right, left) } else { (left, right) };
    Some(FixtureSides {
        home: home.to_string(),
        away: away.to_string(),
    })
}
