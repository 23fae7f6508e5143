//! CSV part files. Output is readable back by [`crate::readers::csv`] with
//! the same schema.

use rowforge_core::schema::Schema;
use rowforge_core::types::{format_float, Scalar};

use crate::error::{Error, Result};

/// File name of the `index`-th output partition.
pub fn part_name(index: usize) -> String {
    format!("part-{index:05}.csv")
}

/// Text form of a value in a CSV cell; null is the empty cell.
pub fn csv_field(v: &Scalar) -> String {
    match v {
        Scalar::Null => String::new(),
        Scalar::Bool(b) => b.to_string(),
        Scalar::I64(i) => i.to_string(),
        Scalar::F64(f) => format_float(*f),
        Scalar::Str(s) => s.clone(),
    }
}

pub fn write_csv_bytes<'a>(
    schema: &Schema,
    rows: impl IntoIterator<Item = &'a Vec<Scalar>>,
    header: bool,
    delimiter: u8,
) -> Result<Vec<u8>> {
    let mut w = csv::WriterBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .from_writer(Vec::new());
    if header {
        w.write_record(schema.fields.iter().map(|f| f.name.as_str()))?;
    }
    for row in rows {
        w.write_record(row.iter().map(csv_field))?;
    }
    w.into_inner().map_err(|e| Error::Io(e.into_error()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::readers::csv::read_csv;
    use rowforge_core::schema::{DataType, Field};

    #[test]
    fn writes_header_quotes_and_nulls() {
        let schema = Schema::new(vec![
            Field::new("a", DataType::Int64, true),
            Field::new("s", DataType::Utf8, true),
        ]);
        let rows = vec![
            vec![Scalar::I64(1), Scalar::from("x,y")],
            vec![Scalar::Null, Scalar::from("z")],
        ];
        let bytes = write_csv_bytes(&schema, &rows, true, b',').unwrap();
        assert_eq!(String::from_utf8(bytes.clone()).unwrap(), "a,s\n1,\"x,y\"\n,z\n");
        assert_eq!(read_csv(&bytes, &schema, true, b',').unwrap(), rows);
    }

    #[test]
    fn part_names_sort_by_index() {
        assert_eq!(part_name(3), "part-00003.csv");
        assert!(part_name(9) < part_name(10));
    }
}
