//! CSV record parsing
//!
//! Turns the rows of a staged source file into typed [`Row`]s following a
//! dataset's column schema. Header columns are matched by name, so the file
//! may list them in any order, but it must carry exactly the declared set.
//! Missing-value markers become [`Value::Null`].

use std::io::Read;

use chrono::{NaiveDate, NaiveDateTime};
use csv::{ByteRecord, ReaderBuilder, StringRecord};

use crate::catalog::{ColumnSpec, ColumnType, DatasetDescriptor};
use crate::error::{LoadError, Result};

/// Tokens read as missing values, matching the usual dataframe defaults
pub const NULL_TOKENS: &[&str] = &[
    "", "#N/A", "#N/A N/A", "#NA", "-1.#IND", "-1.#QNAN", "-NaN", "-nan", "1.#IND", "1.#QNAN",
    "<NA>", "N/A", "NA", "NULL", "NaN", "None", "n/a", "nan", "null",
];

const TIMESTAMP_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];
const DATE_FORMAT: &str = "%Y-%m-%d";

/// A single typed cell
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Text(String),
    Integer(i64),
    Float(f64),
    Timestamp(NaiveDateTime),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

/// One record, ordered like the dataset's declared columns
pub type Row = Vec<Value>;

pub fn is_null_token(raw: &str) -> bool {
    NULL_TOKENS.contains(&raw)
}

/// Parse one raw field into a value of `column`'s type
pub fn parse_value(column: &ColumnSpec, raw: &str) -> std::result::Result<Value, String> {
    if is_null_token(raw) {
        return Ok(Value::Null);
    }

    match column.column_type {
        ColumnType::Text => Ok(Value::Text(raw.to_string())),
        ColumnType::Integer => parse_integer(raw.trim()).map(Value::Integer),
        ColumnType::Float => raw
            .trim()
            .parse::<f64>()
            .map(Value::Float)
            .map_err(|_| format!("'{}' is not a number", raw)),
        ColumnType::Timestamp => parse_timestamp(raw.trim()).map(Value::Timestamp),
    }
}

fn parse_integer(raw: &str) -> std::result::Result<i64, String> {
    if let Ok(value) = raw.parse::<i64>() {
        return Ok(value);
    }
    // integral floats such as "3.0" appear in re-exported files
    match raw.parse::<f64>() {
        Ok(value) if value.fract() == 0.0 && value.abs() < i64::MAX as f64 => Ok(value as i64),
        _ => Err(format!("'{}' is not an integer", raw)),
    }
}

fn parse_timestamp(raw: &str) -> std::result::Result<NaiveDateTime, String> {
    for format in TIMESTAMP_FORMATS {
        if let Ok(ts) = NaiveDateTime::parse_from_str(raw, format) {
            return Ok(ts);
        }
    }
    NaiveDate::parse_from_str(raw, DATE_FORMAT)
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .ok_or_else(|| format!("'{}' is not a timestamp", raw))
}

/// Streaming reader producing typed rows for one dataset
pub struct RecordReader<R: Read> {
    dataset: String,
    columns: Vec<ColumnSpec>,
    /// Header position of each declared column
    positions: Vec<usize>,
    field_count: usize,
    reader: csv::Reader<R>,
    record: StringRecord,
}

impl<R: Read> std::fmt::Debug for RecordReader<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordReader")
            .field("dataset", &self.dataset)
            .field("positions", &self.positions)
            .finish()
    }
}

impl<R: Read> RecordReader<R> {
    /// Read and validate the header
    pub fn new(dataset: &DatasetDescriptor, input: R) -> Result<Self> {
        let mut reader = ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(input);

        let header = reader
            .headers()
            .map_err(|e| csv_error(&dataset.name, e))?
            .clone();
        let header: Vec<String> = header
            .iter()
            .enumerate()
            .map(|(idx, name)| {
                let name = if idx == 0 { name.trim_start_matches('\u{feff}') } else { name };
                name.trim().to_string()
            })
            .collect();

        if header.iter().all(|h| h.is_empty()) {
            return Err(LoadError::malformed(&dataset.name, 1, None, "missing header row"));
        }

        for (idx, name) in header.iter().enumerate() {
            if header[..idx].contains(name) {
                return Err(LoadError::malformed(
                    &dataset.name,
                    1,
                    Some(name),
                    "column appears more than once in the header",
                ));
            }
            if dataset.column(name).is_none() {
                return Err(LoadError::malformed(
                    &dataset.name,
                    1,
                    Some(name),
                    format!("unexpected column for table {}", dataset.table),
                ));
            }
        }

        let mut positions = Vec::with_capacity(dataset.columns.len());
        for column in &dataset.columns {
            let position = header.iter().position(|h| h == &column.name).ok_or_else(|| {
                LoadError::malformed(&dataset.name, 1, Some(&column.name), "column missing from header")
            })?;
            positions.push(position);
        }

        Ok(Self {
            dataset: dataset.name.clone(),
            columns: dataset.columns.clone(),
            positions,
            field_count: header.len(),
            reader,
            record: StringRecord::new(),
        })
    }

    /// Next typed row, or `None` at end of input
    pub fn next_row(&mut self) -> Result<Option<Row>> {
        let more = self
            .reader
            .read_record(&mut self.record)
            .map_err(|e| csv_error(&self.dataset, e))?;
        if !more {
            return Ok(None);
        }

        let line = self.record.position().map(|p| p.line()).unwrap_or(0);
        if self.record.len() != self.field_count {
            return Err(LoadError::malformed(
                &self.dataset,
                line,
                None,
                format!(
                    "expected {} fields, found {}",
                    self.field_count,
                    self.record.len()
                ),
            ));
        }

        let mut row = Vec::with_capacity(self.columns.len());
        for (column, &position) in self.columns.iter().zip(&self.positions) {
            let raw = self.record.get(position).unwrap_or("");
            let value = parse_value(column, raw)
                .map_err(|reason| LoadError::malformed(&self.dataset, line, Some(&column.name), reason))?;
            row.push(value);
        }
        Ok(Some(row))
    }

    /// Fill up to `limit` rows; an empty chunk means end of input
    pub fn next_chunk(&mut self, limit: usize) -> Result<Vec<Row>> {
        let mut chunk = Vec::with_capacity(limit);
        while chunk.len() < limit {
            match self.next_row()? {
                Some(row) => chunk.push(row),
                None => break,
            }
        }
        Ok(chunk)
    }
}

impl<R: Read> Iterator for RecordReader<R> {
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_row().transpose()
    }
}

/// Count data records without materializing them
///
/// The header is not counted. Quoted fields spanning several lines count once.
pub fn count_records<R: Read>(dataset: &str, input: R) -> Result<u64> {
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(input);
    let mut record = ByteRecord::new();
    let mut count = 0u64;
    while reader
        .read_byte_record(&mut record)
        .map_err(|e| csv_error(dataset, e))?
    {
        count += 1;
    }
    Ok(count)
}

fn csv_error(dataset: &str, err: csv::Error) -> LoadError {
    let line = err.position().map(|p| p.line()).unwrap_or(0);
    match err.into_kind() {
        csv::ErrorKind::Io(io) => LoadError::Io(io),
        csv::ErrorKind::Utf8 { err, .. } => {
            LoadError::malformed(dataset, line, None, format!("invalid UTF-8: {}", err))
        },
        other => LoadError::malformed(dataset, line, None, format!("{:?}", other)),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::catalog::DatasetDescriptor;

    fn orders() -> DatasetDescriptor {
        DatasetDescriptor::new("orders", "orders.csv", "orders_raw")
            .with_columns(vec![
                ColumnSpec::text("order_id"),
                ColumnSpec::integer("items"),
                ColumnSpec::float("total"),
                ColumnSpec::timestamp("placed_at"),
            ])
            .with_primary_key(&["order_id"])
    }

    fn read_all(csv: &str) -> Result<Vec<Row>> {
        RecordReader::new(&orders(), csv.as_bytes())?.collect()
    }

    #[test]
    fn test_typed_values() {
        let rows = read_all(
            "order_id,items,total,placed_at\n\
             a1,2,10.5,2017-10-02 10:56:33\n",
        )
        .unwrap();

        let placed = NaiveDate::from_ymd_opt(2017, 10, 2)
            .unwrap()
            .and_hms_opt(10, 56, 33)
            .unwrap();
        assert_eq!(
            rows,
            vec![vec![
                Value::Text("a1".into()),
                Value::Integer(2),
                Value::Float(10.5),
                Value::Timestamp(placed),
            ]]
        );
    }

    #[test]
    fn test_null_normalization() {
        let rows = read_all(
            "order_id,items,total,placed_at\n\
             a1,,NaN,\n\
             a2,NA,null,N/A\n",
        )
        .unwrap();

        for row in &rows {
            assert!(row[1..].iter().all(Value::is_null), "{:?}", row);
        }
    }

    #[test]
    fn test_header_order_is_irrelevant() {
        let rows = read_all("placed_at,total,order_id,items\n2018-01-01,1.0,x,3\n").unwrap();
        assert_eq!(rows[0][0], Value::Text("x".into()));
        assert_eq!(rows[0][1], Value::Integer(3));
        assert!(matches!(rows[0][3], Value::Timestamp(_)));
    }

    #[test]
    fn test_byte_order_mark_is_ignored() {
        let rows = read_all("\u{feff}order_id,items,total,placed_at\nx,1,1,\n").unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn test_missing_header_column_is_malformed() {
        let err = read_all("order_id,items,total\nx,1,1\n").unwrap_err();
        match err {
            LoadError::MalformedRecord { line, column, .. } => {
                assert_eq!(line, 1);
                assert_eq!(column.as_deref(), Some("placed_at"));
            },
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_unexpected_header_column_is_malformed() {
        let err = read_all("order_id,items,total,placed_at,extra\nx,1,1,,y\n").unwrap_err();
        assert!(err.to_string().contains("extra"));
    }

    #[test]
    fn test_wrong_field_count_reports_line() {
        let err = read_all("order_id,items,total,placed_at\nx,1,1,\ny,2\n").unwrap_err();
        match err {
            LoadError::MalformedRecord { line, reason, .. } => {
                assert_eq!(line, 3);
                assert!(reason.contains("expected 4 fields, found 2"));
            },
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_unparsable_values_name_the_column() {
        let err = read_all("order_id,items,total,placed_at\nx,many,1,\n").unwrap_err();
        assert!(matches!(
            err,
            LoadError::MalformedRecord { ref column, .. } if column.as_deref() == Some("items")
        ));

        let err = read_all("order_id,items,total,placed_at\nx,1,1,yesterday\n").unwrap_err();
        assert!(err.to_string().contains("placed_at"));
    }

    #[test]
    fn test_integral_float_is_accepted_as_integer() {
        let rows = read_all("order_id,items,total,placed_at\nx,3.0,1,\n").unwrap();
        assert_eq!(rows[0][1], Value::Integer(3));
        assert!(read_all("order_id,items,total,placed_at\nx,3.5,1,\n").is_err());
    }

    #[test]
    fn test_text_keeps_surrounding_whitespace() {
        let column = ColumnSpec::text("city");
        assert_eq!(parse_value(&column, " sao paulo").unwrap(), Value::Text(" sao paulo".into()));
    }

    #[test]
    fn test_next_chunk() {
        let mut reader = RecordReader::new(
            &orders(),
            "order_id,items,total,placed_at\na,1,1,\nb,1,1,\nc,1,1,\n".as_bytes(),
        )
        .unwrap();
        assert_eq!(reader.next_chunk(2).unwrap().len(), 2);
        assert_eq!(reader.next_chunk(2).unwrap().len(), 1);
        assert!(reader.next_chunk(2).unwrap().is_empty());
    }

    #[test]
    fn test_count_records() {
        let csv = "review_id,comment\nr1,\"multi\nline\"\nr2,plain\n";
        assert_eq!(count_records("reviews", csv.as_bytes()).unwrap(), 2);
        assert_eq!(count_records("reviews", "review_id,comment\n".as_bytes()).unwrap(), 0);
        assert_eq!(count_records("reviews", "".as_bytes()).unwrap(), 0);
    }
}
