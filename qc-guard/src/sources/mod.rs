//! Dataset handles the QC engine runs batch queries against.
//!
//! The engine only needs parameterized query execution, so any store the host
//! can expose through DataFusion works. [`SessionDataset`] wraps a
//! `SessionContext` with one registered table; [`SessionDataset::from_records`]
//! builds that table in memory.
//!
//! Column encoding: numbers are `Float64`, dates `Int64` day numbers (days
//! since 1970-01-01), text `Utf8` and booleans `Boolean`. Key columns are
//! `Utf8`.

use crate::core::{FieldSchema, FieldType, Record, Value};
use crate::error::{QcError, Result};
use crate::security::SqlSecurity;
use arrow::array::{ArrayRef, BooleanArray, Float64Array, Int64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use datafusion::datasource::MemTable;
use datafusion::prelude::SessionContext;
use datafusion::scalar::ScalarValue;
use datafusion::sql::TableReference;
use std::fmt::Debug;
use std::sync::Arc;
use tracing::{debug, instrument};

/// A dataset that can execute parameterized queries.
///
/// # Examples
///
/// ```rust
/// use qc_guard::core::{FieldSchema, FieldType, Record};
/// use qc_guard::sources::{Dataset, SessionDataset};
///
/// # #[tokio::main]
/// # async fn main() -> qc_guard::error::Result<()> {
/// let schema = FieldSchema::new().field("heart_rate", FieldType::Number);
/// let records = vec![Record::new().with("record_id", "r1").with("heart_rate", 72)];
/// let dataset = SessionDataset::from_records("trial-7", "data", &schema, &records).await?;
///
/// assert_eq!(dataset.row_count().await?, 1);
/// # Ok(())
/// # }
/// ```
#[async_trait]
pub trait Dataset: Debug + Send + Sync {
    /// Stable name of the dataset; batch runs are exclusive per name.
    fn name(&self) -> &str;

    /// Table the generated queries should read.
    fn table_name(&self) -> &str;

    /// Runs a query with `$n` placeholders bound to `params`.
    async fn query(&self, sql: &str, params: Vec<ScalarValue>) -> Result<Vec<RecordBatch>>;

    /// Number of rows in the table.
    async fn row_count(&self) -> Result<usize>;
}

/// A dataset backed by a DataFusion `SessionContext`.
#[derive(Clone)]
pub struct SessionDataset {
    name: String,
    table_name: String,
    ctx: SessionContext,
}

impl Debug for SessionDataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionDataset")
            .field("name", &self.name)
            .field("table_name", &self.table_name)
            .finish()
    }
}

impl SessionDataset {
    /// Wraps a context in which `table_name` is already registered.
    ///
    /// Generated queries quote the name, so it must be registered with its
    /// exact case, e.g. through `TableReference::bare`.
    pub fn new(
        name: impl Into<String>,
        ctx: SessionContext,
        table_name: impl Into<String>,
    ) -> Result<Self> {
        let table_name = table_name.into();
        SqlSecurity::validate_identifier(&table_name)?;
        Ok(Self {
            name: name.into(),
            table_name,
            ctx,
        })
    }

    /// Builds an in-memory table from records.
    ///
    /// Columns are the schema's key columns followed by its declared fields.
    /// Missing values and blank text become nulls; text is coerced to the
    /// declared type and a value that cannot be coerced is a configuration
    /// error.
    #[instrument(skip_all, fields(dataset.name = %name.as_ref(), table = table_name, rows = records.len()))]
    pub async fn from_records(
        name: impl AsRef<str>,
        table_name: &str,
        schema: &FieldSchema,
        records: &[Record],
    ) -> Result<Self> {
        let columns = columns(schema);
        let mut fields = Vec::with_capacity(columns.len());
        let mut arrays: Vec<ArrayRef> = Vec::with_capacity(columns.len());
        for (column, ty) in &columns {
            SqlSecurity::validate_identifier(column)?;
            let values = records
                .iter()
                .map(|record| cell(record, column, *ty))
                .collect::<Result<Vec<_>>>()?;
            let (data_type, array) = build_array(*ty, values);
            fields.push(Field::new(column.as_str(), data_type, true));
            arrays.push(array);
        }
        let arrow_schema = Arc::new(Schema::new(fields));
        let batch = RecordBatch::try_new(arrow_schema.clone(), arrays)?;
        let table = MemTable::try_new(arrow_schema, vec![vec![batch]])?;

        let ctx = SessionContext::new();
        ctx.register_table(TableReference::bare(table_name), Arc::new(table))?;
        debug!(table = table_name, "Registered in-memory dataset");
        Self::new(name.as_ref(), ctx, table_name)
    }

    pub fn context(&self) -> &SessionContext {
        &self.ctx
    }
}

/// Key columns as text, then the declared fields; `None` marks a key column.
fn columns(schema: &FieldSchema) -> Vec<(String, Option<FieldType>)> {
    let mut columns: Vec<(String, Option<FieldType>)> = Vec::new();
    for key in [schema.record_key(), schema.subject_key(), schema.visit_key()] {
        if !schema.contains(key) && !columns.iter().any(|(c, _)| c == key) {
            columns.push((key.to_string(), None));
        }
    }
    columns.extend(schema.fields().map(|(name, ty)| (name.to_string(), Some(ty))));
    columns
}

fn cell(record: &Record, column: &str, ty: Option<FieldType>) -> Result<Value> {
    let Some(value) = record.get(column).filter(|v| !v.is_missing()) else {
        return Ok(Value::Null);
    };
    match ty {
        None => Ok(match value {
            Value::Text(s) => Value::Text(s.clone()),
            other => Value::Text(other.to_string()),
        }),
        Some(ty) => ty
            .coerce(value)
            .map_err(|diagnostic| QcError::Configuration(format!("column '{column}': {diagnostic}"))),
    }
}

fn build_array(ty: Option<FieldType>, values: Vec<Value>) -> (DataType, ArrayRef) {
    match ty {
        Some(FieldType::Number) => {
            let array: Float64Array = values
                .iter()
                .map(|v| match v {
                    Value::Number(n) => Some(*n),
                    _ => None,
                })
                .collect();
            (DataType::Float64, Arc::new(array))
        }
        Some(FieldType::Date) => {
            let array: Int64Array = values
                .iter()
                .map(|v| match v {
                    Value::Date(d) => Some(Value::day_number(*d)),
                    _ => None,
                })
                .collect();
            (DataType::Int64, Arc::new(array))
        }
        Some(FieldType::Boolean) => {
            let array: BooleanArray = values
                .iter()
                .map(|v| match v {
                    Value::Bool(b) => Some(*b),
                    _ => None,
                })
                .collect();
            (DataType::Boolean, Arc::new(array))
        }
        Some(FieldType::Text) | None => {
            let array: StringArray = values
                .iter()
                .map(|v| match v {
                    Value::Text(s) => Some(s.as_str()),
                    _ => None,
                })
                .collect();
            (DataType::Utf8, Arc::new(array))
        }
    }
}

#[async_trait]
impl Dataset for SessionDataset {
    fn name(&self) -> &str {
        &self.name
    }

    fn table_name(&self) -> &str {
        &self.table_name
    }

    async fn query(&self, sql: &str, params: Vec<ScalarValue>) -> Result<Vec<RecordBatch>> {
        let df = self.ctx.sql(sql).await?;
        let df = if params.is_empty() {
            df
        } else {
            df.with_param_values(params)?
        };
        Ok(df.collect().await?)
    }

    async fn row_count(&self) -> Result<usize> {
        let df = self
            .ctx
            .table(TableReference::bare(self.table_name.as_str()))
            .await?;
        Ok(df.count().await?)
    }
}
