//! # Point File Input and Score Output
//!
//! Point files are delimited text with one point per row and one coordinate
//! per column. Files ending in `.csv` are comma separated; everything else is
//! read as TSV. Lines starting with `#` are skipped, there is no header row.
//! The loaded matrix is transposed to the `D x N` column layout used by the
//! estimator.

use csv::{ReaderBuilder, WriterBuilder};
use ndarray::{Array2, ArrayView1, ArrayView2};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DataError {
    #[error("Error from the underlying CSV library: {0}")]
    CsvError(#[from] csv::Error),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("The input file contains no points.")]
    EmptyFile,
    #[error("Line {line} has {found} columns, but the first point has {expected}.")]
    RaggedRow {
        line: u64,
        found: usize,
        expected: usize,
    },
    #[error("Line {line}, column {column}: '{value}' is not a number.")]
    NotANumber {
        line: u64,
        column: usize,
        value: String,
    },
    #[error("Line {line}, column {column}: non-finite value {value}. All coordinates must be finite.")]
    NonFiniteValue { line: u64, column: usize, value: f64 },
    #[error("Got {log_pdfs} log densities but {gradients} gradients.")]
    ScoreCountMismatch { log_pdfs: usize, gradients: usize },
}

fn delimiter_for(path: &Path) -> u8 {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("csv") => b',',
        _ => b'\t',
    }
}

/// Reads a point file into a `D x N` matrix.
pub fn load_points(path: &Path) -> Result<Array2<f64>, DataError> {
    let mut reader = ReaderBuilder::new()
        .has_headers(false)
        .delimiter(delimiter_for(path))
        .comment(Some(b'#'))
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(path)?;

    let mut values = Vec::new();
    let mut dims = None;
    let mut num_points = 0;
    for record in reader.records() {
        let record = record?;
        let line = record.position().map_or(0, |pos| pos.line());
        let expected = *dims.get_or_insert(record.len());
        if record.len() != expected {
            return Err(DataError::RaggedRow {
                line,
                found: record.len(),
                expected,
            });
        }

        for (column, field) in record.iter().enumerate() {
            let value: f64 = field.parse().map_err(|_| DataError::NotANumber {
                line,
                column: column + 1,
                value: field.to_string(),
            })?;
            if !value.is_finite() {
                return Err(DataError::NonFiniteValue {
                    line,
                    column: column + 1,
                    value,
                });
            }
            values.push(value);
        }
        num_points += 1;
    }

    let dims = match dims {
        Some(dims) if num_points > 0 && dims > 0 => dims,
        _ => return Err(DataError::EmptyFile),
    };
    log::info!("Loaded {} points of dimension {} from '{}'.", num_points, dims, path.display());

    let rows = Array2::from_shape_vec((num_points, dims), values)
        .map_err(|_| DataError::EmptyFile)?;
    Ok(rows.reversed_axes().as_standard_layout().into_owned())
}

/// Writes one TSV row per point: the log density followed by its gradient.
///
/// `gradients` is `D x N`, one column per point.
pub fn write_scores(
    path: &Path,
    log_pdfs: ArrayView1<f64>,
    gradients: ArrayView2<f64>,
) -> Result<(), DataError> {
    if log_pdfs.len() != gradients.ncols() {
        return Err(DataError::ScoreCountMismatch {
            log_pdfs: log_pdfs.len(),
            gradients: gradients.ncols(),
        });
    }

    let mut writer = WriterBuilder::new().delimiter(b'\t').from_path(path)?;
    let mut header = vec!["log_pdf".to_string()];
    header.extend((0..gradients.nrows()).map(|i| format!("grad_{}", i + 1)));
    writer.write_record(&header)?;

    for (log_pdf, grad) in log_pdfs.iter().zip(gradients.columns()) {
        let row = std::iter::once(log_pdf)
            .chain(grad.iter())
            .map(|value| format!("{:.12}", value));
        writer.write_record(row)?;
    }
    writer.flush()?;
    Ok(())
}
