//! Partition-local aggregation states with a commutative, associative merge.
//!
//! Integer sums accumulate in `i128` so merging partitions in any order gives
//! the same exact result. Min/max use the total scalar order, so they never
//! depend on which partition saw which value first. User folds
//! ([`Aggregation::Udf`]) run on the interpreter; partitions are merged in
//! partition order, so a `combine` that is not commutative still gives the
//! same answer on every run.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use rowforge_core::dag::Aggregation;
use rowforge_core::exception::ExceptionCode;
use rowforge_core::expr::Expr;
use rowforge_core::id::OpId;
use rowforge_core::schema::{DataType, Field, Schema};
use rowforge_core::types::{scalar_cmp, Row, Scalar, ScalarKey};

use crate::infer::infer_expr;
use crate::interp::eval_expr;
use crate::traits::OpError;

/// Name the accumulator goes by in `update` and `combine`.
pub const ACC: &str = "acc";
/// The second accumulator in `combine`.
pub const OTHER: &str = "other";

/// A compiled user fold.
#[derive(Debug, PartialEq)]
struct Fold {
    init: Scalar,
    update: Expr,
    /// Input columns followed by `acc`.
    update_schema: Schema,
    combine: Expr,
    combine_schema: Schema,
}

impl Fold {
    fn new(agg: &Aggregation, input: &Schema) -> Result<Option<Fold>, OpError> {
        let Aggregation::Udf {
            name,
            init,
            update,
            combine,
        } = agg
        else {
            return Ok(None);
        };
        let init = Expr::parse(init)?;
        let init_type = infer_expr(&init, &Schema::new(Vec::new()))?;
        let init = eval_expr(&init, &Vec::new(), &Schema::new(Vec::new())).map_err(|code| {
            OpError::Unsupported(format!("initial value of aggregate '{name}' raised {code}"))
        })?;

        if input.index_of(ACC).is_some() {
            return Err(OpError::DuplicateColumn(ACC.to_string()));
        }
        let mut fields = input.fields.clone();
        fields.push(Field::new(ACC, init_type.data_type, true));
        let update_schema = Schema::new(fields);
        let update = Expr::parse(update)?;
        infer_expr(&update, &update_schema)?;

        let combine_schema = Schema::new(vec![
            Field::new(ACC, init_type.data_type, true),
            Field::new(OTHER, init_type.data_type, true),
        ]);
        let combine = Expr::parse(combine)?;
        infer_expr(&combine, &combine_schema)?;

        Ok(Some(Fold {
            init,
            update,
            update_schema,
            combine,
            combine_schema,
        }))
    }

    /// Static type of the folded value: the initial value's type when
    /// `update` keeps it, `Any` otherwise.
    fn data_type(&self) -> DataType {
        let init = self.update_schema.fields.last().map_or(DataType::Any, |f| f.data_type);
        match infer_expr(&self.update, &self.update_schema) {
            Ok(t) if t.data_type == init => init,
            _ => DataType::Any,
        }
    }

    fn update(&self, acc: &Scalar, row: &Row) -> Result<Scalar, ExceptionCode> {
        let mut extended = Vec::with_capacity(row.len() + 1);
        extended.extend_from_slice(row);
        extended.resize(self.update_schema.len() - 1, Scalar::Null);
        extended.push(acc.clone());
        eval_expr(&self.update, &extended, &self.update_schema)
    }

    fn combine(&self, acc: Scalar, other: Scalar) -> Result<Scalar, ExceptionCode> {
        eval_expr(&self.combine, &vec![acc, other], &self.combine_schema)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateSpec {
    pub op: OpId,
    pub group_by: Vec<String>,
    pub aggs: Vec<Aggregation>,
}

impl AggregateSpec {
    /// `unique()`: group by every column, no aggregates.
    pub fn unique(op: OpId, input: &Schema) -> Self {
        Self {
            op,
            group_by: input.names(),
            aggs: Vec::new(),
        }
    }

    pub fn is_global(&self) -> bool {
        self.group_by.is_empty()
    }

    pub fn output_schema(&self, input: &Schema) -> Result<Schema, OpError> {
        let mut fields = Vec::new();
        for g in &self.group_by {
            let f = input.field_by_name(g).ok_or_else(|| OpError::UnknownColumn {
                column: g.clone(),
            })?;
            fields.push(f.clone());
        }
        for agg in &self.aggs {
            let source = match agg.column() {
                Some(c) => Some(input.field_by_name(c).ok_or_else(|| OpError::UnknownColumn {
                    column: c.to_string(),
                })?),
                None => None,
            };
            let dt = match (agg, source) {
                (Aggregation::Udf { .. }, _) => match Fold::new(agg, input)? {
                    Some(fold) => fold.data_type(),
                    None => DataType::Any,
                },
                (Aggregation::Count, _) => DataType::Int64,
                (Aggregation::Avg(_), _) => DataType::Float64,
                (Aggregation::Sum(_), Some(f)) => match f.data_type {
                    DataType::Boolean | DataType::Int64 => DataType::Int64,
                    DataType::Float64 => DataType::Float64,
                    _ => DataType::Any,
                },
                (_, Some(f)) => f.data_type,
                (_, None) => DataType::Any,
            };
            let name = agg.output_name();
            if fields.iter().any(|f: &Field| f.name == name) {
                return Err(OpError::DuplicateColumn(name));
            }
            fields.push(Field::new(name, dt, !matches!(agg, Aggregation::Count)));
        }
        Ok(Schema::new(fields))
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Acc {
    Count(u64),
    Sum { int: i128, float: f64, floats: bool, seen: bool },
    Avg { int: i128, float: f64, n: u64 },
    Min(Option<Scalar>),
    Max(Option<Scalar>),
    Fold { acc: Scalar, fold: Arc<Fold> },
}

impl Acc {
    fn fresh(agg: &Aggregation, fold: Option<&Arc<Fold>>) -> Acc {
        if let Some(fold) = fold {
            return Acc::Fold {
                acc: fold.init.clone(),
                fold: Arc::clone(fold),
            };
        }
        match agg {
            Aggregation::Count => Acc::Count(0),
            Aggregation::Sum(_) => Acc::Sum {
                int: 0,
                float: 0.0,
                floats: false,
                seen: false,
            },
            Aggregation::Avg(_) => Acc::Avg {
                int: 0,
                float: 0.0,
                n: 0,
            },
            Aggregation::Min(_) => Acc::Min(None),
            Aggregation::Max(_) => Acc::Max(None),
            // not reached: AggState::new compiles a fold for every user aggregate
            Aggregation::Udf { .. } => Acc::Max(None),
        }
    }

    fn update(&mut self, v: Option<&Scalar>, row: &Row) -> Result<(), ExceptionCode> {
        match self {
            Acc::Count(n) => *n += 1,
            Acc::Sum {
                int,
                float,
                floats,
                seen,
            } => match v {
                None | Some(Scalar::Null) => {}
                Some(Scalar::F64(f)) => {
                    *float += f;
                    *floats = true;
                    *seen = true;
                }
                Some(other) => {
                    *int += i128::from(other.as_i64().ok_or(ExceptionCode::TypeError)?);
                    *seen = true;
                }
            },
            Acc::Avg { int, float, n } => match v {
                None | Some(Scalar::Null) => {}
                Some(Scalar::F64(f)) => {
                    *float += f;
                    *n += 1;
                }
                Some(other) => {
                    *int += i128::from(other.as_i64().ok_or(ExceptionCode::TypeError)?);
                    *n += 1;
                }
            },
            Acc::Min(cur) => keep_extreme(cur, v, Ordering::Less),
            Acc::Max(cur) => keep_extreme(cur, v, Ordering::Greater),
            Acc::Fold { acc, fold } => *acc = fold.update(acc, row)?,
        }
        Ok(())
    }

    fn merge(&mut self, other: Acc) -> Result<(), ExceptionCode> {
        match (self, other) {
            (Acc::Count(a), Acc::Count(b)) => *a += b,
            (
                Acc::Sum {
                    int,
                    float,
                    floats,
                    seen,
                },
                Acc::Sum {
                    int: i2,
                    float: f2,
                    floats: fl2,
                    seen: s2,
                },
            ) => {
                *int += i2;
                *float += f2;
                *floats |= fl2;
                *seen |= s2;
            }
            (Acc::Avg { int, float, n }, Acc::Avg { int: i2, float: f2, n: n2 }) => {
                *int += i2;
                *float += f2;
                *n += n2;
            }
            (Acc::Min(cur), Acc::Min(v)) => keep_extreme(cur, v.as_ref(), Ordering::Less),
            (Acc::Max(cur), Acc::Max(v)) => keep_extreme(cur, v.as_ref(), Ordering::Greater),
            (Acc::Fold { acc, fold }, Acc::Fold { acc: other, .. }) => {
                let mine = std::mem::replace(acc, Scalar::Null);
                *acc = fold.combine(mine, other)?;
            }
            _ => {}
        }
        Ok(())
    }

    fn finish(self) -> Scalar {
        match self {
            Acc::Count(n) => Scalar::I64(n as i64),
            Acc::Sum { seen: false, .. } => Scalar::Null,
            Acc::Sum {
                int,
                float,
                floats: true,
                ..
            } => Scalar::F64(int as f64 + float),
            Acc::Sum { int, .. } => match i64::try_from(int) {
                Ok(v) => Scalar::I64(v),
                Err(_) => Scalar::F64(int as f64),
            },
            Acc::Avg { n: 0, .. } => Scalar::Null,
            Acc::Avg { int, float, n } => Scalar::F64((int as f64 + float) / n as f64),
            Acc::Min(v) | Acc::Max(v) => v.unwrap_or(Scalar::Null),
            Acc::Fold { acc, .. } => acc,
        }
    }
}

fn keep_extreme(cur: &mut Option<Scalar>, v: Option<&Scalar>, want: Ordering) {
    let Some(v) = v.filter(|v| !v.is_null()) else {
        return;
    };
    match cur {
        Some(c) if scalar_cmp(v, c) != want => {}
        _ => *cur = Some(v.clone()),
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Group {
    key: Row,
    accs: Vec<Acc>,
}

/// Aggregation state of one partition (or of several, once merged).
#[derive(Debug, Clone)]
pub struct AggState {
    spec: AggregateSpec,
    key_idx: Vec<usize>,
    input_idx: Vec<Option<usize>>,
    folds: Vec<Option<Arc<Fold>>>,
    groups: BTreeMap<Vec<ScalarKey>, Group>,
}

impl AggState {
    pub fn new(spec: AggregateSpec, input: &Schema) -> Result<Self, OpError> {
        let lookup = |c: &str| {
            input.index_of(c).ok_or_else(|| OpError::UnknownColumn {
                column: c.to_string(),
            })
        };
        let key_idx = spec
            .group_by
            .iter()
            .map(|g| lookup(g))
            .collect::<Result<Vec<_>, _>>()?;
        let input_idx = spec
            .aggs
            .iter()
            .map(|a| a.column().map(|c| lookup(c)).transpose())
            .collect::<Result<Vec<_>, _>>()?;
        let folds = spec
            .aggs
            .iter()
            .map(|a| Fold::new(a, input).map(|f| f.map(Arc::new)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            spec,
            key_idx,
            input_idx,
            folds,
            groups: BTreeMap::new(),
        })
    }

    fn fresh_accs(&self) -> Vec<Acc> {
        self.spec
            .aggs
            .iter()
            .zip(&self.folds)
            .map(|(a, f)| Acc::fresh(a, f.as_ref()))
            .collect()
    }

    pub fn spec(&self) -> &AggregateSpec {
        &self.spec
    }

    pub fn groups(&self) -> usize {
        self.groups.len()
    }

    /// Fold one row in. On error the state is unchanged.
    pub fn update(&mut self, row: &Row) -> Result<(), ExceptionCode> {
        let key_row: Row = self
            .key_idx
            .iter()
            .map(|&i| row.get(i).cloned().ok_or(ExceptionCode::IndexError))
            .collect::<Result<_, _>>()?;
        let key: Vec<ScalarKey> = key_row.iter().map(Scalar::key).collect();

        let mut accs = match self.groups.get(&key) {
            Some(g) => g.accs.clone(),
            None => self.fresh_accs(),
        };
        for (acc, idx) in accs.iter_mut().zip(&self.input_idx) {
            acc.update(idx.and_then(|i| row.get(i)), row)?;
        }
        self.groups
            .entry(key)
            .or_insert_with(|| Group {
                key: key_row,
                accs: Vec::new(),
            })
            .accs = accs;
        Ok(())
    }

    /// Fold `other` (a later partition) into this state. Only a user
    /// `combine` can raise.
    pub fn merge(&mut self, other: AggState) -> Result<(), ExceptionCode> {
        for (key, group) in other.groups {
            match self.groups.get_mut(&key) {
                Some(mine) => {
                    for (a, b) in mine.accs.iter_mut().zip(group.accs) {
                        a.merge(b)?;
                    }
                }
                None => {
                    self.groups.insert(key, group);
                }
            }
        }
        Ok(())
    }

    /// Final rows sorted by group key. A global aggregate over no rows yields
    /// one row: counts are 0, user folds their initial value, everything else
    /// null.
    pub fn finish(self) -> Vec<Row> {
        if self.groups.is_empty() && self.spec.is_global() && !self.spec.aggs.is_empty() {
            let row = self.fresh_accs().into_iter().map(Acc::finish).collect();
            return vec![row];
        }
        self.groups
            .into_values()
            .map(|g| {
                let mut row = g.key;
                row.extend(g.accs.into_iter().map(Acc::finish));
                row
            })
            .collect()
    }
}
