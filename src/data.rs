use crate::config::InputConfig;
use crate::types::{Record, RecordSet};
use csv::ReaderBuilder;
use serde_json::{Number, Value};
use std::fs::File;
use std::path::PathBuf;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("Failed to open input file {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to read delimited input")]
    Csv(#[from] csv::Error),
    #[error("Required column '{0}' not found in input header")]
    MissingColumn(String),
}

/// Reads the configured CSV into a `RecordSet`, preserving row order.
///
/// Verifies that every configured column exists in the header. Cell values
/// are not judged here: coordinate validity belongs to the resolver.
pub fn load_records(config: &InputConfig) -> Result<RecordSet, LoadError> {
    let file = File::open(&config.data_csv).map_err(|source| LoadError::Io {
        path: config.data_csv.clone(),
        source,
    })?;
    let mut rdr = ReaderBuilder::new().from_reader(file);
    let headers = rdr.headers()?.clone();

    let mut required: Vec<&str> = vec![config.id_column.as_str()];
    if let Some((lat, lon)) = config.coordinate_columns() {
        required.push(lat);
        required.push(lon);
    }
    if let Some(place) = &config.place_column {
        required.push(place.as_str());
    }
    for column in required {
        if !headers.iter().any(|h| h == column) {
            return Err(LoadError::MissingColumn(column.to_string()));
        }
    }

    let schema: Vec<String> = headers.iter().map(|h| h.to_string()).collect();
    let mut set = RecordSet::new(schema);

    for (index, result) in rdr.records().enumerate() {
        let row = result?;
        let values = row.iter().map(parse_value).collect();
        set.push(Record { index, values });
    }

    info!(rows = set.len(), path = ?config.data_csv, "loaded records");
    Ok(set)
}

/// Empty cells are null, numeric cells are numbers (integers stay
/// integers), everything else stays a string.
fn parse_value(cell: &str) -> Value {
    let trimmed = cell.trim();
    if trimmed.is_empty() {
        return Value::Null;
    }
    if let Ok(int) = trimmed.parse::<i64>() {
        return Value::Number(int.into());
    }
    if let Ok(num) = trimmed.parse::<f64>() {
        if let Some(n) = Number::from_f64(num) {
            return Value::Number(n);
        }
    }
    Value::String(trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn input_for(file: &NamedTempFile) -> InputConfig {
        InputConfig {
            data_csv: file.path().to_path_buf(),
            id_column: "id".to_string(),
            latitude_column: Some("lat".to_string()),
            longitude_column: Some("lon".to_string()),
            place_column: None,
        }
    }

    fn write_csv(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn loads_rows_in_source_order() {
        let file = write_csv("id,lat,lon,name\n3,10.5,20.25,first\n1,,,second\n2,-5,7,third\n");
        let set = load_records(&input_for(&file)).unwrap();

        assert_eq!(set.len(), 3);
        assert_eq!(set.records[0].index, 0);
        assert_eq!(set.get_str(&set.records[0], "name"), Some("first"));
        assert_eq!(set.get_f64(&set.records[0], "lat"), Some(10.5));
        // Empty cells become nulls, not zeroes.
        assert_eq!(set.get(&set.records[1], "lat"), Some(&Value::Null));
        assert_eq!(set.get_str(&set.records[2], "name"), Some("third"));
    }

    #[test]
    fn missing_required_column_is_fatal() {
        let file = write_csv("id,lat\n1,10\n");
        let err = load_records(&input_for(&file)).unwrap_err();
        match err {
            LoadError::MissingColumn(column) => assert_eq!(column, "lon"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn unreadable_file_is_fatal() {
        let config = InputConfig {
            data_csv: PathBuf::from("/nonexistent/records.csv"),
            id_column: "id".to_string(),
            latitude_column: None,
            longitude_column: None,
            place_column: Some("place".to_string()),
        };
        assert!(matches!(load_records(&config), Err(LoadError::Io { .. })));
    }
}
