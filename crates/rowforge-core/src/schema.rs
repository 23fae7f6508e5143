//! Logical schema types. Pure data.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};

/// Column types known to the compiler. `Any` means the type could not be decided
/// at planning time; compiled code falls back to dynamic evaluation for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    Boolean,
    Int64,
    Float64,
    Utf8,
    Any,
}

impl DataType {
    pub fn is_numeric(self) -> bool {
        matches!(self, DataType::Boolean | DataType::Int64 | DataType::Float64)
    }

    /// Common supertype used when two branches meet (e.g. `coalesce`).
    pub fn unify(self, other: DataType) -> DataType {
        match (self, other) {
            (a, b) if a == b => a,
            (DataType::Int64, DataType::Float64) | (DataType::Float64, DataType::Int64) => {
                DataType::Float64
            }
            _ => DataType::Any,
        }
    }

    pub fn parse(s: &str) -> Result<DataType> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bool" | "boolean" => Ok(DataType::Boolean),
            "int" | "int64" | "i64" | "integer" => Ok(DataType::Int64),
            "float" | "float64" | "f64" | "double" => Ok(DataType::Float64),
            "str" | "string" | "utf8" | "text" => Ok(DataType::Utf8),
            "any" => Ok(DataType::Any),
            other => Err(Error::Schema(format!("unknown data type '{other}'"))),
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DataType::Boolean => "bool",
            DataType::Int64 => "int64",
            DataType::Float64 => "float64",
            DataType::Utf8 => "utf8",
            DataType::Any => "any",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub data_type: DataType,
    pub nullable: bool,
}

impl Field {
    pub fn new(name: impl Into<String>, data_type: DataType, nullable: bool) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    pub fields: Vec<Field>,
}

impl Schema {
    pub fn new(fields: Vec<Field>) -> Self {
        Self { fields }
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn field(&self, idx: usize) -> Option<&Field> {
        self.fields.get(idx)
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    pub fn field_by_name(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn names(&self) -> Vec<String> {
        self.fields.iter().map(|f| f.name.clone()).collect()
    }

    /// Index of `name`, or a schema error naming the available columns.
    pub fn require(&self, name: &str) -> Result<usize> {
        self.index_of(name).ok_or_else(|| {
            Error::Schema(format!(
                "unknown column '{}' (available: {})",
                name,
                self.names().join(", ")
            ))
        })
    }

    /// Replace the field with the same name or append a new one.
    pub fn with_field(&self, field: Field) -> Schema {
        let mut out = self.clone();
        match out.index_of(&field.name) {
            Some(i) => out.fields[i] = field,
            None => out.fields.push(field),
        }
        out
    }

    pub fn project(&self, columns: &[String]) -> Result<Schema> {
        let fields = columns
            .iter()
            .map(|c| self.require(c).map(|i| self.fields[i].clone()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Schema::new(fields))
    }

    pub fn rename(&self, old: &str, new: &str) -> Result<Schema> {
        let idx = self.require(old)?;
        let mut out = self.clone();
        out.fields[idx].name = new.to_string();
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn people() -> Schema {
        Schema::new(vec![
            Field::new("name", DataType::Utf8, false),
            Field::new("age", DataType::Int64, true),
        ])
    }

    #[test]
    fn with_field_replaces_in_place() {
        let s = people().with_field(Field::new("age", DataType::Float64, false));
        assert_eq!(s.len(), 2);
        assert_eq!(s.fields[1].data_type, DataType::Float64);

        let s = people().with_field(Field::new("city", DataType::Utf8, true));
        assert_eq!(s.names(), vec!["name", "age", "city"]);
    }

    #[test]
    fn project_and_rename() {
        let s = people().project(&["age".to_string()]).unwrap();
        assert_eq!(s.names(), vec!["age"]);
        assert!(people().project(&["zip".to_string()]).is_err());

        let s = people().rename("name", "who").unwrap();
        assert_eq!(s.names(), vec!["who", "age"]);
    }

    #[test]
    fn parse_types() {
        assert_eq!(DataType::parse("INT").unwrap(), DataType::Int64);
        assert_eq!(DataType::parse("string").unwrap(), DataType::Utf8);
        assert!(DataType::parse("decimal").is_err());
        assert_eq!(DataType::Int64.unify(DataType::Float64), DataType::Float64);
        assert_eq!(DataType::Utf8.unify(DataType::Int64), DataType::Any);
    }
}
