//! Hash join build/probe.
//!
//! Output layout: every left column (non-key columns renamed with the left
//! prefix/suffix), then the right non-key columns (renamed with the right
//! prefix/suffix). Null keys never match.

use std::collections::HashMap;

use rowforge_core::dag::{JoinSpec, JoinType};
use rowforge_core::exception::ExceptionCode;
use rowforge_core::schema::{Field, Schema};
use rowforge_core::types::{Row, Scalar, ScalarKey};

use crate::traits::{OpError, OpOutput};

#[derive(Debug, Clone, Default)]
pub struct JoinTable {
    buckets: HashMap<ScalarKey, Vec<Row>>,
    /// Number of right columns carried into the output (key excluded).
    width: usize,
    rows: usize,
}

impl JoinTable {
    /// Build from the right side's rows. Rows with a null or missing key are skipped.
    pub fn build(
        schema: &Schema,
        key: &str,
        rows: impl IntoIterator<Item = Row>,
    ) -> Result<JoinTable, OpError> {
        let key_idx = schema.index_of(key).ok_or_else(|| OpError::UnknownColumn {
            column: key.to_string(),
        })?;
        let mut table = JoinTable {
            buckets: HashMap::new(),
            width: schema.len().saturating_sub(1),
            rows: 0,
        };
        for mut row in rows {
            if key_idx >= row.len() || row[key_idx].is_null() {
                continue;
            }
            let k = row.remove(key_idx).key();
            row.resize(table.width, Scalar::Null);
            table.buckets.entry(k).or_default().push(row);
            table.rows += 1;
        }
        Ok(table)
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn len(&self) -> usize {
        self.rows
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    pub fn matches(&self, key: &Scalar) -> &[Row] {
        if key.is_null() {
            return &[];
        }
        self.buckets
            .get(&key.key())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

/// Probe `table` with the key at `key_idx` of a left row.
pub fn probe_row(
    table: &JoinTable,
    join_type: JoinType,
    row: &Row,
    key_idx: usize,
) -> Result<OpOutput, ExceptionCode> {
    let key = row.get(key_idx).ok_or(ExceptionCode::IndexError)?;
    let hits = table.matches(key);
    let concat = |right: &Row| {
        let mut out = Vec::with_capacity(row.len() + right.len());
        out.extend_from_slice(row);
        out.extend_from_slice(right);
        out
    };
    match (hits, join_type) {
        ([], JoinType::Left) => {
            let mut out = row.clone();
            out.resize(row.len() + table.width(), Scalar::Null);
            Ok(OpOutput::Row(out))
        }
        ([], _) => Ok(OpOutput::Drop),
        ([one], _) => Ok(OpOutput::Row(concat(one))),
        (many, _) => Ok(OpOutput::Rows(many.iter().map(concat).collect())),
    }
}

fn renamed(field: &Field, prefix: &str, suffix: &str, nullable: bool) -> Field {
    Field::new(
        format!("{prefix}{}{suffix}", field.name),
        field.data_type,
        field.nullable || nullable,
    )
}

pub fn join_output_schema(
    left: &Schema,
    right: &Schema,
    spec: &JoinSpec,
) -> Result<Schema, OpError> {
    match spec.join_type {
        JoinType::Inner | JoinType::Left => {}
        other => {
            return Err(OpError::Unsupported(format!("{other:?} join")));
        }
    }
    for (schema, key) in [(left, &spec.left_key), (right, &spec.right_key)] {
        if schema.index_of(key).is_none() {
            return Err(OpError::UnknownColumn {
                column: key.clone(),
            });
        }
    }

    let mut fields: Vec<Field> = left
        .fields
        .iter()
        .map(|f| {
            if f.name == spec.left_key {
                f.clone()
            } else {
                renamed(f, &spec.left_prefix, &spec.left_suffix, false)
            }
        })
        .collect();
    let right_nullable = spec.join_type == JoinType::Left;
    for f in right.fields.iter().filter(|f| f.name != spec.right_key) {
        let f = renamed(f, &spec.right_prefix, &spec.right_suffix, right_nullable);
        if fields.iter().any(|g| g.name == f.name) {
            return Err(OpError::DuplicateColumn(f.name));
        }
        fields.push(f);
    }
    Ok(Schema::new(fields))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rowforge_core::schema::DataType;

    fn right_schema() -> Schema {
        Schema::new(vec![
            Field::new("id", DataType::Int64, true),
            Field::new("city", DataType::Utf8, false),
        ])
    }

    fn table() -> JoinTable {
        JoinTable::build(
            &right_schema(),
            "id",
            vec![
                vec![Scalar::I64(1), Scalar::from("Oslo")],
                vec![Scalar::I64(2), Scalar::from("Rome")],
                vec![Scalar::I64(2), Scalar::from("Milan")],
                vec![Scalar::Null, Scalar::from("Nowhere")],
            ],
        )
        .unwrap()
    }

    #[test]
    fn build_skips_null_keys() {
        let t = table();
        assert_eq!(t.len(), 3);
        assert_eq!(t.width(), 1);
        assert!(t.matches(&Scalar::Null).is_empty());
        assert_eq!(t.matches(&Scalar::F64(2.0)).len(), 2);
    }

    #[test]
    fn probe_inner_and_left() {
        let t = table();
        let row = vec![Scalar::from("ann"), Scalar::I64(1)];
        assert_eq!(
            probe_row(&t, JoinType::Inner, &row, 1),
            Ok(OpOutput::Row(vec![
                Scalar::from("ann"),
                Scalar::I64(1),
                Scalar::from("Oslo")
            ]))
        );

        let row = vec![Scalar::from("bob"), Scalar::I64(2)];
        match probe_row(&t, JoinType::Inner, &row, 1) {
            Ok(OpOutput::Rows(rows)) => assert_eq!(rows.len(), 2),
            other => panic!("unexpected {other:?}"),
        }

        let row = vec![Scalar::from("cy"), Scalar::Null];
        assert_eq!(probe_row(&t, JoinType::Inner, &row, 1), Ok(OpOutput::Drop));
        assert_eq!(
            probe_row(&t, JoinType::Left, &row, 1),
            Ok(OpOutput::Row(vec![Scalar::from("cy"), Scalar::Null, Scalar::Null]))
        );
    }

    #[test]
    fn output_schema_renames_and_rejects_clashes() {
        let left = Schema::new(vec![
            Field::new("name", DataType::Utf8, false),
            Field::new("id", DataType::Int64, false),
        ]);
        let mut spec = JoinSpec::new("id", "id", JoinType::Left);
        spec.right_prefix = "r_".into();
        let s = join_output_schema(&left, &right_schema(), &spec).unwrap();
        assert_eq!(s.names(), vec!["name", "id", "r_city"]);
        assert!(s.fields[2].nullable);

        let clash = Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("city", DataType::Utf8, false),
        ]);
        let spec = JoinSpec::new("id", "id", JoinType::Inner);
        assert!(matches!(
            join_output_schema(&clash, &right_schema(), &spec),
            Err(OpError::DuplicateColumn(_))
        ));

        let spec = JoinSpec::new("id", "id", JoinType::Full);
        assert!(matches!(
            join_output_schema(&left, &right_schema(), &spec),
            Err(OpError::Unsupported(_))
        ));
    }
}
