//! Row writers.

pub mod csv;
pub mod jsonl;

pub use self::csv::{csv_field, part_name, write_csv_bytes};
pub use self::jsonl::{scalar_to_json, JsonlWriter};
