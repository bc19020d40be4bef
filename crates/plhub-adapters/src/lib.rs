//! Tabular data sources: CSV and JSON row exports, discovered by file name in a data directory.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use plhub_core::{normalize_column_name, RawValue, SourceRow};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "plhub-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("CSV error in {path}: {source}")]
    Csv {
        path: String,
        #[source]
        source: csv::Error,
    },
    #[error("JSON error in {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("{0}")]
    Message(String),
}

/// Logical export kinds, in the order they must be loaded so references resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dataset {
    Stadiums,
    Teams,
    Players,
    Matches,
    TeamMatchStats,
    Lineups,
}

impl Dataset {
    pub const LOAD_ORDER: [Dataset; 6] = [
        Dataset::Stadiums,
        Dataset::Teams,
        Dataset::Players,
        Dataset::Matches,
        Dataset::TeamMatchStats,
        Dataset::Lineups,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Dataset::Stadiums => "stadiums",
            Dataset::Teams => "teams",
            Dataset::Players => "players",
            Dataset::Matches => "matches",
            Dataset::TeamMatchStats => "team_match_stats",
            Dataset::Lineups => "lineups",
        }
    }

    /// Accepted file stems, after column-style normalization.
    pub fn file_stems(self) -> &'static [&'static str] {
        match self {
            Dataset::Stadiums => &["stadiums", "stadium", "venues"],
            Dataset::Teams => &["teams", "team", "clubs", "club"],
            Dataset::Players => &["players", "player", "squads"],
            Dataset::Matches => &["matches", "match", "fixtures", "results"],
            Dataset::TeamMatchStats => &["team_match_stats", "team_stats", "match_stats"],
            Dataset::Lineups => &["lineups", "lineup", "player_performance", "player_match_stats"],
        }
    }

    pub fn from_file_stem(stem: &str) -> Option<Dataset> {
        let stem = normalize_column_name(stem);
        Self::LOAD_ORDER
            .into_iter()
            .find(|d| d.file_stems().contains(&stem.as_str()))
    }
}

/// Content fingerprint of one source file, recorded in the run ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFingerprint {
    pub file_name: String,
    pub sha256: String,
    pub bytes: usize,
}

impl SourceFingerprint {
    pub fn of(file_name: impl Into<String>, bytes: &[u8]) -> Self {
        Self {
            file_name: file_name.into(),
            sha256: sha256_hex(bytes),
            bytes: bytes.len(),
        }
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, Default)]
pub struct LoadedTable {
    pub rows: Vec<SourceRow>,
    pub fingerprint: Option<SourceFingerprint>,
}

#[async_trait]
pub trait TabularSource: Send + Sync {
    fn label(&self) -> String;

    /// Reads every row. Column names come back normalized; malformed rows are
    /// skipped with a warning rather than failing the table.
    async fn read_rows(&self) -> Result<LoadedTable, AdapterError>;
}

#[derive(Debug, Clone)]
pub struct CsvFileSource {
    path: PathBuf,
}

impl CsvFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl TabularSource for CsvFileSource {
    fn label(&self) -> String {
        file_name(&self.path)
    }

    async fn read_rows(&self) -> Result<LoadedTable, AdapterError> {
        let bytes = read_file(&self.path).await?;
        let rows = parse_csv(&bytes).map_err(|source| AdapterError::Csv {
            path: self.path.display().to_string(),
            source,
        })?;
        debug!(file = %self.path.display(), rows = rows.len(), "read csv source");
        Ok(LoadedTable {
            rows,
            fingerprint: Some(SourceFingerprint::of(self.label(), &bytes)),
        })
    }
}

/// JSON file holding an array of flat objects, one per row.
#[derive(Debug, Clone)]
pub struct JsonFileSource {
    path: PathBuf,
}

impl JsonFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl TabularSource for JsonFileSource {
    fn label(&self) -> String {
        file_name(&self.path)
    }

    async fn read_rows(&self) -> Result<LoadedTable, AdapterError> {
        let bytes = read_file(&self.path).await?;
        let path = self.path.display().to_string();
        let value: JsonValue = serde_json::from_slice(&bytes).map_err(|source| AdapterError::Json {
            path: path.clone(),
            source,
        })?;
        let rows = json_rows(&path, value)?;
        debug!(file = %path, rows = rows.len(), "read json source");
        Ok(LoadedTable {
            rows,
            fingerprint: Some(SourceFingerprint::of(self.label(), &bytes)),
        })
    }
}

/// Rows supplied directly, without a backing file.
#[derive(Debug, Clone, Default)]
pub struct InMemorySource {
    label: String,
    rows: Vec<SourceRow>,
}

impl InMemorySource {
    pub fn new(label: impl Into<String>, rows: Vec<SourceRow>) -> Self {
        Self {
            label: label.into(),
            rows,
        }
    }
}

#[async_trait]
impl TabularSource for InMemorySource {
    fn label(&self) -> String {
        self.label.clone()
    }

    async fn read_rows(&self) -> Result<LoadedTable, AdapterError> {
        Ok(LoadedTable {
            rows: self.rows.clone(),
            fingerprint: None,
        })
    }
}

pub fn source_for_path(path: &Path) -> Option<Box<dyn TabularSource>> {
    match extension(path).as_deref() {
        Some("csv") => Some(Box::new(CsvFileSource::new(path))),
        Some("json") => Some(Box::new(JsonFileSource::new(path))),
        _ => None,
    }
}

/// Finds one source file per dataset in `dir`, returned in load order.
///
/// Spreadsheet exports are reported and skipped. When several files map to the
/// same dataset the first by file name wins.
pub async fn discover_datasets(dir: &Path) -> Result<Vec<(Dataset, PathBuf)>, AdapterError> {
    let mut entries = tokio::fs::read_dir(dir).await.map_err(|source| AdapterError::Io {
        path: dir.display().to_string(),
        source,
    })?;

    let mut paths = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(|source| AdapterError::Io {
        path: dir.display().to_string(),
        source,
    })? {
        let file_type = entry.file_type().await.map_err(|source| AdapterError::Io {
            path: entry.path().display().to_string(),
            source,
        })?;
        if file_type.is_file() {
            paths.push(entry.path());
        }
    }
    paths.sort();

    let mut found: Vec<(Dataset, PathBuf)> = Vec::new();
    for path in paths {
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let Some(dataset) = Dataset::from_file_stem(stem) else {
            debug!(file = %path.display(), "ignoring file with unrecognised name");
            continue;
        };
        match extension(&path).as_deref() {
            Some("csv") | Some("json") => {}
            Some("xlsx") | Some("xls") => {
                warn!(file = %path.display(), dataset = dataset.label(), "spreadsheet exports are not read; export the sheet as CSV");
                continue;
            }
            _ => continue,
        }
        if let Some((_, kept)) = found.iter().find(|(d, _)| *d == dataset) {
            warn!(
                dataset = dataset.label(),
                kept = %kept.display(),
                skipped = %path.display(),
                "more than one file for dataset"
            );
            continue;
        }
        found.push((dataset, path));
    }

    found.sort_by_key(|(dataset, _)| *dataset);
    Ok(found)
}

async fn read_file(path: &Path) -> Result<Vec<u8>, AdapterError> {
    tokio::fs::read(path).await.map_err(|source| AdapterError::Io {
        path: path.display().to_string(),
        source,
    })
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

fn parse_csv(bytes: &[u8]) -> Result<Vec<SourceRow>, csv::Error> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(bytes);
    let headers: Vec<String> = reader
        .headers()?
        .iter()
        .map(|h| h.trim_start_matches('\u{feff}').to_string())
        .collect();

    let mut rows = Vec::new();
    for (index, record) in reader.records().enumerate() {
        let line = index + 1;
        let record = match record {
            Ok(record) => record,
            Err(err) => {
                warn!(line, error = %err, "skipping malformed csv row");
                continue;
            }
        };
        let mut row = SourceRow::new(line);
        for (header, cell) in headers.iter().zip(record.iter()) {
            if header.trim().is_empty() {
                continue;
            }
            let value = if cell.is_empty() {
                RawValue::Empty
            } else {
                RawValue::Text(cell.to_string())
            };
            row.insert(header, value);
        }
        rows.push(row);
    }
    Ok(rows)
}

fn json_rows(path: &str, value: JsonValue) -> Result<Vec<SourceRow>, AdapterError> {
    let JsonValue::Array(items) = value else {
        return Err(AdapterError::Message(format!(
            "{path}: expected a top-level array of row objects"
        )));
    };

    let mut rows = Vec::with_capacity(items.len());
    for (index, item) in items.into_iter().enumerate() {
        let line = index + 1;
        let JsonValue::Object(object) = item else {
            warn!(file = path, line, "skipping non-object json row");
            continue;
        };
        let mut row = SourceRow::new(line);
        for (column, value) in object {
            let raw = match value {
                JsonValue::Null => RawValue::Empty,
                JsonValue::String(s) => RawValue::Text(s),
                JsonValue::Number(n) => n.as_f64().map(RawValue::Number).unwrap_or(RawValue::Empty),
                JsonValue::Bool(b) => RawValue::Text(b.to_string()),
                other => RawValue::Text(other.to_string()),
            };
            row.insert(&column, raw);
        }
        rows.push(row);
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_hashing_is_stable() {
        let fingerprint = SourceFingerprint::of("teams.csv", b"hello world");
        assert_eq!(
            fingerprint.sha256,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
        assert_eq!(fingerprint.bytes, 11);
    }

    #[test]
    fn csv_headers_are_normalized_and_blank_cells_are_empty() {
        let csv = "Home Team,Away-Team,Date,Home Goals\nMan City , Spurs,2023-08-19,\n";
        let rows = parse_csv(csv.as_bytes()).expect("parse");
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.line, 1);
        assert_eq!(row.text_of(&["home_team"]).as_deref(), Some("Man City"));
        assert_eq!(row.text_of(&["away_team"]).as_deref(), Some("Spurs"));
        assert_eq!(row.fields.get("home_goals"), Some(&RawValue::Empty));
    }

    #[test]
    fn short_csv_rows_keep_the_columns_they_have() {
        let csv = "name,city,capacity\nAnfield,Liverpool\n";
        let rows = parse_csv(csv.as_bytes()).expect("parse");
        assert_eq!(rows[0].text_of(&["city"]).as_deref(), Some("Liverpool"));
        assert!(!rows[0].has_any(&["capacity"]));
    }

    #[test]
    fn json_rows_keep_numbers_numeric() {
        let value: JsonValue = serde_json::from_str(
            r#"[{"Name": "Emirates Stadium", "Capacity": 60704, "city": null}, 5]"#,
        )
        .expect("json");
        let rows = json_rows("stadiums.json", value).expect("rows");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].fields.get("capacity"), Some(&RawValue::Number(60704.0)));
        assert_eq!(rows[0].fields.get("city"), Some(&RawValue::Empty));
    }

    #[test]
    fn json_top_level_must_be_an_array() {
        let err = json_rows("x.json", serde_json::json!({"rows": []})).expect_err("object");
        assert!(matches!(err, AdapterError::Message(_)));
    }

    #[test]
    fn file_stems_map_to_datasets() {
        assert_eq!(Dataset::from_file_stem("Clubs"), Some(Dataset::Teams));
        assert_eq!(Dataset::from_file_stem("player-performance"), Some(Dataset::Lineups));
        assert_eq!(Dataset::from_file_stem("notes"), None);
    }
}
