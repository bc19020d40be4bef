use plhub_adapters::{discover_datasets, source_for_path, Dataset};
use tempfile::tempdir;

#[tokio::test]
async fn discovery_returns_datasets_in_load_order() {
    let dir = tempdir().expect("tempdir");
    std::fs::write(dir.path().join("matches.csv"), "home,away,date\n").expect("write");
    std::fs::write(dir.path().join("Clubs.csv"), "name\n").expect("write");
    std::fs::write(dir.path().join("stadiums.json"), "[]").expect("write");
    std::fs::write(dir.path().join("players.xlsx"), [0u8; 4]).expect("write");
    std::fs::write(dir.path().join("README.md"), "notes").expect("write");

    let found = discover_datasets(dir.path()).await.expect("discover");
    let datasets: Vec<Dataset> = found.iter().map(|(d, _)| *d).collect();
    assert_eq!(
        datasets,
        vec![Dataset::Stadiums, Dataset::Teams, Dataset::Matches]
    );
}

#[tokio::test]
async fn first_file_wins_when_a_dataset_is_duplicated() {
    let dir = tempdir().expect("tempdir");
    std::fs::write(dir.path().join("clubs.csv"), "name\nArsenal\n").expect("write");
    std::fs::write(dir.path().join("teams.csv"), "name\nChelsea\n").expect("write");

    let found = discover_datasets(dir.path()).await.expect("discover");
    assert_eq!(found.len(), 1);
    assert!(found[0].1.ends_with("clubs.csv"));
}

#[tokio::test]
async fn csv_source_reads_rows_with_fingerprint() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("stadiums.csv");
    std::fs::write(&path, "Name,City,Capacity\nAnfield,Liverpool,\"53,394\"\n").expect("write");

    let source = source_for_path(&path).expect("csv is supported");
    let table = source.read_rows().await.expect("read");
    assert_eq!(table.rows.len(), 1);
    assert_eq!(table.rows[0].text_of(&["capacity"]).as_deref(), Some("53,394"));

    let fingerprint = table.fingerprint.expect("file sources are fingerprinted");
    assert_eq!(fingerprint.file_name, "stadiums.csv");
    assert_eq!(fingerprint.sha256.len(), 64);
}

#[tokio::test]
async fn missing_files_are_io_errors() {
    let dir = tempdir().expect("tempdir");
    let source = source_for_path(&dir.path().join("teams.csv")).expect("csv");
    let err = source.read_rows().await.expect_err("missing");
    assert!(err.to_string().contains("teams.csv"));
}
