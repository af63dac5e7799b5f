//! Row selections and their lowering to SQL.
//!
//! The host ORM hands the engine an opaque selection per job. Two concrete
//! shapes are understood natively: structured [`Predicate`]s, which can be
//! evaluated both as SQL and against file rows, and raw SQL predicates, which
//! only relational sources can apply. Anything more elaborate goes through a
//! custom [`QueryLowering`] implementation.

use serde::{Deserialize, Serialize};

use crate::core::identifier::{qualify_pg, quote_literal, quote_pg, validate_raw_predicate};
use crate::core::value::Row;
use crate::error::{Result, SliceError};

use super::PlannedJob;

/// Which rows of an entity a job transfers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Selection {
    /// Every row.
    #[default]
    All,
    /// Structured filter.
    Filter(Predicate),
    /// SQL predicate produced by the host ORM.
    Raw(String),
}

impl Selection {
    pub fn is_all(&self) -> bool {
        matches!(self, Selection::All)
    }
}

/// Structured row filter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Predicate {
    /// `column = value`, or `column IS NULL` when value is null.
    Eq {
        column: String,
        value: Option<String>,
    },
    /// `column IN (values)`.
    In { column: String, values: Vec<String> },
    /// All inner predicates hold.
    And(Vec<Predicate>),
}

impl Predicate {
    pub fn eq(column: impl Into<String>, value: impl Into<String>) -> Self {
        Predicate::Eq {
            column: column.into(),
            value: Some(value.into()),
        }
    }

    pub fn is_null(column: impl Into<String>) -> Self {
        Predicate::Eq {
            column: column.into(),
            value: None,
        }
    }

    pub fn one_of<I, S>(column: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Predicate::In {
            column: column.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    /// Column names referenced by this predicate.
    pub fn columns(&self) -> Vec<&str> {
        match self {
            Predicate::Eq { column, .. } | Predicate::In { column, .. } => vec![column.as_str()],
            Predicate::And(inner) => inner.iter().flat_map(|p| p.columns()).collect(),
        }
    }

    /// Render as a SQL boolean expression. Values compare as text.
    pub fn to_sql(&self) -> Result<String> {
        Ok(match self {
            Predicate::Eq {
                column,
                value: Some(v),
            } => format!("{}::text = {}", quote_pg(column)?, quote_literal(v)),
            Predicate::Eq { column, value: None } => format!("{} IS NULL", quote_pg(column)?),
            Predicate::In { values, .. } if values.is_empty() => "FALSE".to_string(),
            Predicate::In { column, values } => {
                let list: Vec<String> = values.iter().map(|v| quote_literal(v)).collect();
                format!("{}::text IN ({})", quote_pg(column)?, list.join(", "))
            }
            Predicate::And(inner) if inner.is_empty() => "TRUE".to_string(),
            Predicate::And(inner) => {
                let parts = inner
                    .iter()
                    .map(|p| p.to_sql().map(|s| format!("({s})")))
                    .collect::<Result<Vec<_>>>()?;
                parts.join(" AND ")
            }
        })
    }

    /// Evaluate against a row described by `header`.
    pub fn matches(&self, header: &[String], row: &Row) -> std::result::Result<bool, String> {
        match self {
            Predicate::Eq { column, value } => Ok(cell(header, row, column)? == value.as_deref()),
            Predicate::In { column, values } => Ok(matches!(
                cell(header, row, column)?,
                Some(v) if values.iter().any(|x| x == v)
            )),
            Predicate::And(inner) => {
                for p in inner {
                    if !p.matches(header, row)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
        }
    }
}

fn cell<'r>(
    header: &[String],
    row: &'r Row,
    column: &str,
) -> std::result::Result<Option<&'r str>, String> {
    let idx = header
        .iter()
        .position(|h| h == column)
        .ok_or_else(|| format!("column '{column}' not present"))?;
    Ok(row.get(idx).and_then(|v| v.as_deref()))
}

/// Lowers a job's selection to a row-source query.
///
/// This is the seam to the host ORM: an implementation may translate its own
/// query objects into SQL. The default [`SqlLowering`] understands
/// [`Selection`] directly.
pub trait QueryLowering: Send + Sync {
    fn lower(&self, job: &PlannedJob) -> Result<String>;
}

/// Default lowering: `SELECT <columns> FROM <schema>.<table> [WHERE ...]`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SqlLowering;

impl QueryLowering for SqlLowering {
    fn lower(&self, job: &PlannedJob) -> Result<String> {
        let descriptor = job.descriptor();
        let columns = job
            .columns()
            .iter()
            .map(|c| quote_pg(c))
            .collect::<Result<Vec<_>>>()?;
        let table = qualify_pg(&descriptor.schema, descriptor.output_name())?;

        let mut sql = format!("SELECT {} FROM {}", columns.join(", "), table);
        match job.selection() {
            Selection::All => {}
            Selection::Filter(predicate) => {
                for column in predicate.columns() {
                    if !descriptor.has_field(column) {
                        return Err(SliceError::selection(
                            job.entity(),
                            format!("filter column '{column}' is not a field"),
                        ));
                    }
                }
                sql.push_str(" WHERE ");
                sql.push_str(&predicate.to_sql()?);
            }
            Selection::Raw(predicate) => {
                validate_raw_predicate(predicate)
                    .map_err(|e| SliceError::selection(job.entity(), e.to_string()))?;
                sql.push_str(" WHERE ");
                sql.push_str(predicate);
            }
        }
        Ok(sql)
    }
}
