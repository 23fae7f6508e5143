//! Typed readers producing rows.

pub mod csv;

pub use self::csv::{parse_field, read_csv, read_csv_range, CsvOptions};
