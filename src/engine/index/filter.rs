// Tahlil Engine — Retrieval Filter DSL
//
// Structured filters over the vector collection's metadata columns:
// equality, value sets, numeric ranges, combined with top-level AND.
// Compiled to a parameterised SQL WHERE clause; values are always bound,
// never interpolated.

use rusqlite::types::Value as SqlValue;

/// Metadata fields a filter may constrain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    UploadId,
    UserId,
    Kind,
    Category,
    DateTs,
    Amount,
}

impl Field {
    fn column(&self) -> &'static str {
        match self {
            Field::UploadId => "upload_id",
            Field::UserId => "user_id",
            Field::Kind => "kind",
            Field::Category => "category",
            Field::DateTs => "date_ts",
            Field::Amount => "amount",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Clause {
    /// Equality on a text field.
    Eq(Field, String),
    /// Membership in a value set ($in).
    In(Field, Vec<String>),
    /// Numeric lower bound ($gte), for DateTs and Amount.
    Gte(Field, f64),
    /// Numeric upper bound ($lte).
    Lte(Field, f64),
}

/// A conjunction of clauses. An empty filter matches everything, which is
/// why the workspace retriever, not the caller, owns the upload clause.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    pub(crate) clauses: Vec<Clause>,
}

impl Filter {
    pub fn new() -> Self {
        Filter::default()
    }

    /// The mandatory workspace scope.
    pub fn upload(upload_id: impl Into<String>) -> Self {
        Filter::new().eq(Field::UploadId, upload_id)
    }

    pub fn eq(mut self, field: Field, value: impl Into<String>) -> Self {
        self.clauses.push(Clause::Eq(field, value.into()));
        self
    }

    pub fn any_of(mut self, field: Field, values: Vec<String>) -> Self {
        self.clauses.push(Clause::In(field, values));
        self
    }

    pub fn gte(mut self, field: Field, value: f64) -> Self {
        self.clauses.push(Clause::Gte(field, value));
        self
    }

    pub fn lte(mut self, field: Field, value: f64) -> Self {
        self.clauses.push(Clause::Lte(field, value));
        self
    }

    pub fn date_between(self, from_ts: Option<i64>, to_ts: Option<i64>) -> Self {
        let mut f = self;
        if let Some(from) = from_ts {
            f = f.gte(Field::DateTs, from as f64);
        }
        if let Some(to) = to_ts {
            f = f.lte(Field::DateTs, to as f64);
        }
        f
    }

    pub fn amount_between(self, min: Option<f64>, max: Option<f64>) -> Self {
        let mut f = self;
        if let Some(min) = min {
            f = f.gte(Field::Amount, min);
        }
        if let Some(max) = max {
            f = f.lte(Field::Amount, max);
        }
        f
    }

    /// Top-level AND of two filters.
    pub fn and(mut self, other: Filter) -> Self {
        self.clauses.extend(other.clauses);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    pub fn constrains(&self, field: Field) -> bool {
        self.clauses.iter().any(|c| match c {
            Clause::Eq(f, _) | Clause::In(f, _) | Clause::Gte(f, _) | Clause::Lte(f, _) => {
                *f == field
            }
        })
    }

    /// Drop every clause on `field`. Used by the workspace retriever to
    /// make its own scope clause authoritative.
    pub fn without(mut self, field: Field) -> Self {
        self.clauses.retain(|c| match c {
            Clause::Eq(f, _) | Clause::In(f, _) | Clause::Gte(f, _) | Clause::Lte(f, _) => {
                *f != field
            }
        });
        self
    }

    /// Compile to a WHERE body and its bound parameters. The body is always
    /// a valid boolean expression ("1=1" for the empty filter).
    pub(crate) fn to_sql(&self) -> (String, Vec<SqlValue>) {
        if self.clauses.is_empty() {
            return ("1=1".to_string(), Vec::new());
        }

        let mut parts = Vec::with_capacity(self.clauses.len());
        let mut params: Vec<SqlValue> = Vec::new();

        for clause in &self.clauses {
            match clause {
                Clause::Eq(field, value) => {
                    params.push(SqlValue::Text(value.clone()));
                    parts.push(format!("{} = ?{}", field.column(), params.len()));
                }
                Clause::In(field, values) => {
                    if values.is_empty() {
                        // An empty $in matches nothing, by definition.
                        parts.push("0=1".to_string());
                        continue;
                    }
                    let mut placeholders = Vec::with_capacity(values.len());
                    for value in values {
                        params.push(SqlValue::Text(value.clone()));
                        placeholders.push(format!("?{}", params.len()));
                    }
                    parts.push(format!("{} IN ({})", field.column(), placeholders.join(", ")));
                }
                Clause::Gte(field, value) => {
                    params.push(SqlValue::Real(*value));
                    parts.push(format!("{} >= ?{}", field.column(), params.len()));
                }
                Clause::Lte(field, value) => {
                    params.push(SqlValue::Real(*value));
                    parts.push(format!("{} <= ?{}", field.column(), params.len()));
                }
            }
        }

        (parts.join(" AND "), params)
    }
}
