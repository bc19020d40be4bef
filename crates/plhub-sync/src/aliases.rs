use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Alias table shipped with the binary, used when no override is configured.
pub const BUILTIN_ALIASES: &str = include_str!("../../../config/aliases.yaml");

const SUPPORTED_VERSION: u32 = 1;

/// Kind of free-text name being canonicalized. Each kind has its own alias scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NameKind {
    Team,
    Position,
    Stadium,
}

impl NameKind {
    pub fn label(self) -> &'static str {
        match self {
            NameKind::Team => "team",
            NameKind::Position => "position",
            NameKind::Stadium => "stadium",
        }
    }
}

impl std::fmt::Display for NameKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Error)]
pub enum AliasError {
    #[error("reading alias table {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing alias table {origin}: {source}")]
    Parse {
        origin: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("alias table {origin} has version {found}; only version 1 is supported")]
    Version { origin: String, found: u32 },
    #[error("{kind} alias `{alias}` maps to both `{first}` and `{second}`")]
    Conflict {
        kind: NameKind,
        alias: String,
        first: String,
        second: String,
    },
}

#[derive(Debug, Deserialize)]
struct AliasFile {
    version: u32,
    #[serde(default)]
    teams: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    positions: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    stadiums: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Default)]
struct AliasScope {
    aliases: BTreeMap<String, String>,
    canonical: BTreeSet<String>,
}

/// Immutable raw-spelling -> canonical-name table, loaded once per run.
#[derive(Debug, Clone, Default)]
pub struct AliasTable {
    version: u32,
    scopes: BTreeMap<NameKind, AliasScope>,
}

/// Lookup key for an alias: lower-cased with whitespace collapsed.
pub fn alias_key(raw: &str) -> String {
    raw.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

impl AliasTable {
    pub fn builtin() -> Result<Self, AliasError> {
        Self::from_yaml_str("built-in aliases", BUILTIN_ALIASES)
    }

    pub fn from_path(path: &Path) -> Result<Self, AliasError> {
        let text = std::fs::read_to_string(path).map_err(|source| AliasError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml_str(&path.display().to_string(), &text)
    }

    pub fn from_yaml_str(origin: &str, text: &str) -> Result<Self, AliasError> {
        let file: AliasFile = serde_yaml::from_str(text).map_err(|source| AliasError::Parse {
            origin: origin.to_string(),
            source,
        })?;
        if file.version != SUPPORTED_VERSION {
            return Err(AliasError::Version {
                origin: origin.to_string(),
                found: file.version,
            });
        }

        let mut table = AliasTable {
            version: file.version,
            scopes: BTreeMap::new(),
        };
        table.load_scope(NameKind::Team, file.teams)?;
        table.load_scope(NameKind::Position, file.positions)?;
        table.load_scope(NameKind::Stadium, file.stadiums)?;
        Ok(table)
    }

    fn load_scope(
        &mut self,
        kind: NameKind,
        entries: BTreeMap<String, Vec<String>>,
    ) -> Result<(), AliasError> {
        let scope = self.scopes.entry(kind).or_default();
        for (canonical, aliases) in entries {
            let canonical = canonical.trim().to_string();
            scope.canonical.insert(canonical.clone());
            for spelling in std::iter::once(canonical.as_str()).chain(aliases.iter().map(String::as_str)) {
                let key = alias_key(spelling);
                if key.is_empty() {
                    continue;
                }
                match scope.aliases.get(&key) {
                    Some(existing) if *existing != canonical => {
                        return Err(AliasError::Conflict {
                            kind,
                            alias: key,
                            first: existing.clone(),
                            second: canonical,
                        });
                    }
                    Some(_) => {}
                    None => {
                        scope.aliases.insert(key, canonical.clone());
                    }
                }
            }
        }
        Ok(())
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// Canonical name for an exact (case-folded) spelling.
    pub fn lookup(&self, kind: NameKind, raw: &str) -> Option<&str> {
        self.scopes
            .get(&kind)?
            .aliases
            .get(&alias_key(raw))
            .map(String::as_str)
    }

    pub fn canonical_names(&self, kind: NameKind) -> impl Iterator<Item = &str> {
        self.scopes
            .get(&kind)
            .into_iter()
            .flat_map(|scope| scope.canonical.iter().map(String::as_str))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_table_loads() {
        let table = AliasTable::builtin().expect("built-in aliases parse");
        assert_eq!(table.version(), 1);
        assert_eq!(table.lookup(NameKind::Team, "Man Utd"), Some("Manchester United"));
        assert_eq!(table.lookup(NameKind::Team, "  SPURS "), Some("Tottenham Hotspur"));
        assert_eq!(table.lookup(NameKind::Team, "arsenal"), Some("Arsenal"));
        assert_eq!(table.lookup(NameKind::Position, "gk"), Some("Goalkeeper"));
        assert_eq!(table.canonical_names(NameKind::Team).count(), 20);
    }

    #[test]
    fn ambiguous_aliases_are_rejected() {
        let yaml = "version: 1\nteams:\n  Brentford: [bfc]\n  Burnley: [bfc]\n";
        let err = AliasTable::from_yaml_str("inline", yaml).expect_err("conflict");
        assert!(matches!(err, AliasError::Conflict { ref alias, .. } if alias == "bfc"));
    }

    #[test]
    fn scopes_are_separate() {
        let yaml = "version: 1\nteams:\n  Forest Green: [fg]\npositions:\n  Forward: [fg]\n";
        let table = AliasTable::from_yaml_str("inline", yaml).expect("no cross-scope conflict");
        assert_eq!(table.lookup(NameKind::Team, "fg"), Some("Forest Green"));
        assert_eq!(table.lookup(NameKind::Position, "fg"), Some("Forward"));
    }

    #[test]
    fn unknown_versions_are_rejected() {
        let err = AliasTable::from_yaml_str("inline", "version: 2\n").expect_err("version");
        assert!(matches!(err, AliasError::Version { found: 2, .. }));
    }
}
