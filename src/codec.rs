//! Chunk codecs.
//!
//! Raw artifacts are CSV files as published by the provider, either a
//! plain headered table or a composite report bundle where every record
//! is tagged `C` (comment), `I` (section header), or `D` (data) and one
//! file can carry several sections. Cache artifacts are Parquet files
//! written through Arrow.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use csv::ReaderBuilder;
use flate2::read::GzDecoder;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;

use crate::batch::{batch_from_string_rows, RowBatch};
use crate::error::{Error, Result};
use crate::fetch::tmp_path_for;

/// Typed read/write of a cache artifact. Writes fully overwrite and are
/// idempotent; they never append.
pub trait ChunkCodec: Send + Sync {
    fn read(&self, cache_path: &Path, columns: Option<&[String]>) -> Result<RowBatch>;
    fn write(&self, batch: &RowBatch, cache_path: &Path) -> Result<()>;
    /// Column names available in the artifact, without reading row data.
    fn columns(&self, cache_path: &Path) -> Result<Vec<String>>;
}

pub struct ParquetCodec;

impl ChunkCodec for ParquetCodec {
    fn read(&self, cache_path: &Path, columns: Option<&[String]>) -> Result<RowBatch> {
        let file = File::open(cache_path)?;
        let builder = ParquetRecordBatchReaderBuilder::try_new(file)
            .map_err(|err| Error::Codec(format!("{}: {err}", cache_path.display())))?;

        let builder = match columns {
            Some(names) => {
                let mask = parquet::arrow::ProjectionMask::columns(
                    builder.parquet_schema(),
                    names.iter().map(|s| s.as_str()),
                );
                builder.with_projection(mask)
            }
            None => builder,
        };

        let reader = builder
            .build()
            .map_err(|err| Error::Codec(format!("{}: {err}", cache_path.display())))?;
        let mut batches = Vec::new();
        for batch in reader {
            batches.push(batch.map_err(|err| Error::Codec(err.to_string()))?);
        }
        RowBatch::from_record_batches(&batches)
    }

    fn write(&self, batch: &RowBatch, cache_path: &Path) -> Result<()> {
        if let Some(parent) = cache_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = tmp_path_for(cache_path)?;
        let _ = std::fs::remove_file(&tmp);

        let record = batch.to_record_batch()?;
        let file = File::create(&tmp)?;
        let mut writer = ArrowWriter::try_new(file, record.schema(), None)
            .map_err(|err| Error::Codec(err.to_string()))?;
        writer
            .write(&record)
            .map_err(|err| Error::Codec(err.to_string()))?;
        writer
            .close()
            .map_err(|err| Error::Codec(err.to_string()))?;

        std::fs::rename(&tmp, cache_path)?;
        Ok(())
    }

    fn columns(&self, cache_path: &Path) -> Result<Vec<String>> {
        let file = File::open(cache_path)?;
        let builder = ParquetRecordBatchReaderBuilder::try_new(file)
            .map_err(|err| Error::Codec(format!("{}: {err}", cache_path.display())))?;
        Ok(builder
            .schema()
            .fields()
            .iter()
            .map(|f| f.name().clone())
            .collect())
    }
}

/// Read a raw CSV artifact into a typed batch.
///
/// Detects the composite `C`/`I`/`D` bundle layout and extracts the
/// section belonging to `table`; anything else is read as a plain
/// headered CSV. Transparently gunzips `.gz` inputs.
pub fn read_raw_csv(path: &Path, table: &str) -> Result<RowBatch> {
    let file = File::open(path)?;
    let mut text = String::new();
    if path.extension().map(|ext| ext == "gz").unwrap_or(false) {
        GzDecoder::new(file)
            .read_to_string(&mut text)
            .map_err(|err| Error::DataFormat(format!("gunzip {}: {err}", path.display())))?;
    } else {
        let mut file = file;
        file.read_to_string(&mut text)?;
    }

    let mut reader = ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(text.as_bytes());

    let mut records: Vec<Vec<String>> = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|err| Error::DataFormat(format!("csv parse: {err}")))?;
        records.push(record.iter().map(|cell| cell.to_string()).collect());
    }
    let Some(first) = records.first() else {
        return Err(Error::DataFormat(format!("{} is empty", path.display())));
    };

    let composite = matches!(first.first().map(|s| s.as_str()), Some("C") | Some("I") | Some("D"));
    if composite {
        read_composite_section(&records, table, path)
    } else {
        let headers = records[0].clone();
        batch_from_string_rows(&headers, &records[1..])
    }
}

fn read_composite_section(records: &[Vec<String>], table: &str, path: &Path) -> Result<RowBatch> {
    let mut headers: Option<Vec<String>> = None;
    let mut section: Option<(String, String)> = None;
    let mut rows: Vec<Vec<String>> = Vec::new();

    for record in records {
        match record.first().map(|s| s.as_str()) {
            Some("C") => continue,
            Some("I") => {
                if record.len() < 5 {
                    return Err(Error::DataFormat(format!(
                        "short section header in {}",
                        path.display()
                    )));
                }
                if section_matches(table, &record[1], &record[2]) {
                    headers = Some(record[4..].to_vec());
                    section = Some((record[1].clone(), record[2].clone()));
                } else if headers.is_some() {
                    // Finished collecting the wanted section.
                    break;
                }
            }
            Some("D") => {
                let Some(header) = &headers else { continue };
                let Some((report, sub)) = &section else { continue };
                if record.len() < 4 || &record[1] != report || &record[2] != sub {
                    continue;
                }
                if record.len() - 4 != header.len() {
                    return Err(Error::DataFormat(format!(
                        "record width {} does not match section header width {} in {}",
                        record.len() - 4,
                        header.len(),
                        path.display()
                    )));
                }
                rows.push(record[4..].to_vec());
            }
            _ => {
                return Err(Error::DataFormat(format!(
                    "unexpected record tag in composite file {}",
                    path.display()
                )))
            }
        }
    }

    let Some(headers) = headers else {
        return Err(Error::DataFormat(format!(
            "no section for table {table} in {}",
            path.display()
        )));
    };
    batch_from_string_rows(&headers, &rows)
}

fn section_matches(table: &str, report: &str, sub: &str) -> bool {
    sub == table
        || format!("{report}{sub}") == table
        || format!("{report}_{sub}") == table
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_plain_csv_round_trips_through_parquet() {
        let dir = tempdir().expect("tempdir");
        let csv_path = dir.path().join("chunk.csv");
        std::fs::write(
            &csv_path,
            "SETTLEMENTDATE,REGIONID,RRP\n\
             2024/01/01 00:05:00,R1,42.5\n\
             2024/01/01 00:10:00,R2,43.0\n",
        )
        .unwrap();

        let batch = read_raw_csv(&csv_path, "DISPATCHPRICE").unwrap();
        assert_eq!(batch.num_rows(), 2);

        let codec = ParquetCodec;
        let cache_path = dir.path().join("chunk.parquet");
        codec.write(&batch, &cache_path).unwrap();

        assert_eq!(
            codec.columns(&cache_path).unwrap(),
            vec!["SETTLEMENTDATE", "REGIONID", "RRP"]
        );

        let projected = codec
            .read(&cache_path, Some(&["RRP".to_string()]))
            .unwrap();
        assert_eq!(projected.num_columns(), 1);
        assert_eq!(projected.num_rows(), 2);
    }

    #[test]
    fn test_composite_section_extraction() {
        let dir = tempdir().expect("tempdir");
        let csv_path = dir.path().join("bundle.csv");
        std::fs::write(
            &csv_path,
            "C,REPORT,START\n\
             I,DISPATCH,PRICE,1,SETTLEMENTDATE,REGIONID,RRP\n\
             D,DISPATCH,PRICE,1,2024/01/01 00:05:00,R1,42.5\n\
             I,DISPATCH,LOAD,1,SETTLEMENTDATE,DUID,INITIALMW\n\
             D,DISPATCH,LOAD,1,2024/01/01 00:05:00,U1,300\n\
             C,REPORT,END\n",
        )
        .unwrap();

        let batch = read_raw_csv(&csv_path, "DISPATCHPRICE").unwrap();
        assert_eq!(batch.num_rows(), 1);
        assert_eq!(batch.column_names(), vec!["SETTLEMENTDATE", "REGIONID", "RRP"]);
    }

    #[test]
    fn test_composite_width_mismatch_is_data_format_error() {
        let dir = tempdir().expect("tempdir");
        let csv_path = dir.path().join("bundle.csv");
        std::fs::write(
            &csv_path,
            "I,DISPATCH,PRICE,1,SETTLEMENTDATE,REGIONID,RRP\n\
             D,DISPATCH,PRICE,1,2024/01/01 00:05:00,R1\n",
        )
        .unwrap();

        let err = read_raw_csv(&csv_path, "DISPATCHPRICE").unwrap_err();
        assert!(matches!(err, Error::DataFormat(_)));
    }

    #[test]
    fn test_composite_missing_section_is_data_format_error() {
        let dir = tempdir().expect("tempdir");
        let csv_path = dir.path().join("bundle.csv");
        std::fs::write(
            &csv_path,
            "I,DISPATCH,LOAD,1,SETTLEMENTDATE,DUID,INITIALMW\n\
             D,DISPATCH,LOAD,1,2024/01/01 00:05:00,U1,300\n",
        )
        .unwrap();

        let err = read_raw_csv(&csv_path, "DISPATCHPRICE").unwrap_err();
        assert!(matches!(err, Error::DataFormat(_)));
    }
}
