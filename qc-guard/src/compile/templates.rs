//! Batch query templates for checks the expression walker cannot express.
//!
//! Each template produces the same [`QueryFragment`] shape as an expression
//! rule, so the engine runs every rule kind the same way.

use super::batch::{quote, BoundParam, FragmentKind, ParamList, QueryFragment, RECORD_ID_COLUMN, RELATED_ID_COLUMN};
use crate::core::{CrossVisitCheck, FieldSchema, FieldType, MissingDataCheck, OutlierCheck};
use crate::error::CompileError;
use crate::security::InputValidator;
use datafusion::scalar::ScalarValue;

const CROSS_VISIT: &str = "cross_visit";
const OUTLIER: &str = "outlier";
const MISSING_DATA: &str = "missing_data";

fn field_of_type(
    schema: &FieldSchema,
    template: &'static str,
    field: &str,
    allowed: &[FieldType],
) -> Result<String, CompileError> {
    match schema.field_type(field) {
        Some(ty) if allowed.contains(&ty) => quote(field),
        Some(ty) => Err(CompileError::template(
            template,
            format!("field '{field}' is {ty}, expected one of {allowed:?}"),
        )),
        None => Err(CompileError::UnknownColumn {
            field: field.to_string(),
            reason: "not in the field schema".to_string(),
        }),
    }
}

/// Self-join pairing each record with later visits of the same subject.
///
/// Every pair of visits is compared, not only consecutive ones, so a drift that
/// accumulates slowly is still reported once it exceeds the tolerance.
pub fn cross_visit(
    check: &CrossVisitCheck,
    schema: &FieldSchema,
) -> Result<QueryFragment, CompileError> {
    InputValidator::validate_non_negative(check.tolerance, "tolerance")
        .map_err(|e| CompileError::template(CROSS_VISIT, e.to_string()))?;
    let field = field_of_type(
        schema,
        CROSS_VISIT,
        &check.field,
        &[FieldType::Number, FieldType::Date],
    )?;
    let record = quote(schema.record_key())?;
    let subject = quote(schema.subject_key())?;
    let visit = quote(schema.visit_key())?;

    let mut params = ParamList::default();
    let tolerance = params.bind(
        BoundParam::Value(ScalarValue::Float64(Some(check.tolerance))),
        "DOUBLE",
    );

    Ok(QueryFragment {
        kind: FragmentKind::CrossVisit,
        select_list: format!(
            "CAST(a.{record} AS VARCHAR) AS {RECORD_ID_COLUMN}, \
             CAST(b.{record} AS VARCHAR) AS {RELATED_ID_COLUMN}"
        ),
        from: format!(
            "{{table}} AS a JOIN {{table}} AS b \
             ON a.{subject} = b.{subject} AND a.{visit} < b.{visit}"
        ),
        where_clause: format!(
            "a.{field} IS NOT NULL AND b.{field} IS NOT NULL \
             AND ABS(b.{field} - a.{field}) > {tolerance}"
        ),
        params: params.into_inner(),
        explanation: format!(
            "Pairs of visits of one subject where {} changes by more than {}",
            check.field, check.tolerance
        ),
    })
}

/// Window query flagging values more than `k` standard deviations from the
/// mean of their partition.
pub fn outlier(check: &OutlierCheck, schema: &FieldSchema) -> Result<QueryFragment, CompileError> {
    InputValidator::validate_non_negative(check.k, "k")
        .map_err(|e| CompileError::template(OUTLIER, e.to_string()))?;
    let field = field_of_type(schema, OUTLIER, &check.field, &[FieldType::Number])?;
    let record = quote(schema.record_key())?;
    let window = match &check.partition_by {
        Some(column) if schema.contains(column) || column == schema.visit_key() => {
            format!("(PARTITION BY {})", quote(column)?)
        }
        Some(column) => {
            return Err(CompileError::UnknownColumn {
                field: column.clone(),
                reason: "partition column is not in the field schema".to_string(),
            })
        }
        None => "()".to_string(),
    };

    let mut params = ParamList::default();
    let k = params.bind(BoundParam::Value(ScalarValue::Float64(Some(check.k))), "DOUBLE");

    let scope = match &check.partition_by {
        Some(column) => format!(" within each {column}"),
        None => String::new(),
    };
    Ok(QueryFragment {
        kind: FragmentKind::Outlier,
        select_list: format!("CAST(s.{record} AS VARCHAR) AS {RECORD_ID_COLUMN}"),
        from: format!(
            "(SELECT {record}, {field} AS qc_value, \
             AVG({field}) OVER {window} AS qc_mean, \
             STDDEV({field}) OVER {window} AS qc_sd \
             FROM {{table}}) AS s"
        ),
        where_clause: format!(
            "s.qc_value IS NOT NULL AND s.qc_sd IS NOT NULL \
             AND ABS(s.qc_value - s.qc_mean) > {k} * s.qc_sd"
        ),
        params: params.into_inner(),
        explanation: format!(
            "Records whose {} lies more than {} standard deviations from the mean{scope}",
            check.field, check.k
        ),
    })
}

/// Anti-join of subject × required visit against submitted records.
///
/// Reported ids are `subject:visit`, since no record exists to name.
pub fn missing_data(
    check: &MissingDataCheck,
    schema: &FieldSchema,
) -> Result<QueryFragment, CompileError> {
    if check.required_visits.is_empty() {
        return Err(CompileError::template(
            MISSING_DATA,
            "at least one required visit must be listed",
        ));
    }
    let visit_key = schema.visit_key();
    if let Some(ty) = schema.field_type(visit_key) {
        if ty != FieldType::Text {
            return Err(CompileError::template(
                MISSING_DATA,
                format!("visit column '{visit_key}' is {ty}, expected Text"),
            ));
        }
    }
    let record = quote(schema.record_key())?;
    let subject = quote(schema.subject_key())?;
    let visit = quote(visit_key)?;

    let mut params = ParamList::default();
    let mut visits: Vec<&String> = Vec::new();
    for v in &check.required_visits {
        if !visits.contains(&v) {
            visits.push(v);
        }
    }
    let expected_visits = visits
        .into_iter()
        .map(|v| {
            let placeholder = params.bind(
                BoundParam::Value(ScalarValue::Utf8(Some(v.clone()))),
                "VARCHAR",
            );
            format!("SELECT {placeholder} AS qc_visit")
        })
        .collect::<Vec<_>>()
        .join(" UNION ALL ");

    Ok(QueryFragment {
        kind: FragmentKind::MissingData,
        select_list: format!(
            "CONCAT(CAST(e.qc_subject AS VARCHAR), ':', e.qc_visit) AS {RECORD_ID_COLUMN}"
        ),
        from: format!(
            "(SELECT DISTINCT s.{subject} AS qc_subject, v.qc_visit \
             FROM {{table}} AS s CROSS JOIN ({expected_visits}) AS v \
             WHERE s.{subject} IS NOT NULL) AS e \
             LEFT JOIN {{table}} AS t \
             ON t.{subject} = e.qc_subject AND t.{visit} = e.qc_visit"
        ),
        where_clause: format!("t.{record} IS NULL"),
        params: params.into_inner(),
        explanation: format!(
            "Subjects with no record for visit(s) {}",
            check.required_visits.join(", ")
        ),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> FieldSchema {
        FieldSchema::new()
            .field("weight", FieldType::Number)
            .field("visit_date", FieldType::Date)
            .field("site", FieldType::Text)
    }

    #[test]
    fn test_cross_visit_shape() {
        let fragment = cross_visit(
            &CrossVisitCheck {
                field: "weight".into(),
                tolerance: 5.0,
            },
            &schema(),
        )
        .unwrap();
        let sql = fragment.render("visits").unwrap();
        assert!(sql.contains("FROM \"visits\" AS a JOIN \"visits\" AS b"));
        assert!(sql.contains("a.\"subject_id\" = b.\"subject_id\""));
        assert!(fragment.has_related_id());
        assert_eq!(fragment.params.len(), 1);
    }

    #[test]
    fn test_cross_visit_rejects_text_and_negative_tolerance() {
        let text = CrossVisitCheck {
            field: "site".into(),
            tolerance: 1.0,
        };
        assert!(matches!(
            cross_visit(&text, &schema()),
            Err(CompileError::Template { .. })
        ));
        let negative = CrossVisitCheck {
            field: "weight".into(),
            tolerance: -1.0,
        };
        assert!(cross_visit(&negative, &schema()).is_err());
    }

    #[test]
    fn test_outlier_partitioning() {
        let mut check = OutlierCheck {
            field: "weight".into(),
            k: 3.0,
            partition_by: None,
        };
        let global = outlier(&check, &schema()).unwrap();
        assert!(global.from.contains("OVER ()"));

        check.partition_by = Some("site".into());
        let per_site = outlier(&check, &schema()).unwrap();
        assert!(per_site.from.contains("OVER (PARTITION BY \"site\")"));
        assert!(per_site.explanation.ends_with("within each site"));

        check.partition_by = Some("nope".into());
        assert!(matches!(
            outlier(&check, &schema()),
            Err(CompileError::UnknownColumn { .. })
        ));
    }

    #[test]
    fn test_missing_data_binds_each_visit_once() {
        let fragment = missing_data(
            &MissingDataCheck {
                required_visits: vec!["V1".into(), "V2".into(), "V1".into()],
            },
            &schema(),
        )
        .unwrap();
        assert_eq!(fragment.params.len(), 2);
        assert!(fragment.from.contains("UNION ALL"));
        assert_eq!(fragment.where_clause, "t.\"record_id\" IS NULL");
    }

    #[test]
    fn test_missing_data_requires_visits_and_text_visit_key() {
        let empty = MissingDataCheck {
            required_visits: vec![],
        };
        assert!(missing_data(&empty, &schema()).is_err());

        let numeric_visits = schema().field("visit", FieldType::Number);
        let check = MissingDataCheck {
            required_visits: vec!["1".into()],
        };
        assert!(matches!(
            missing_data(&check, &numeric_visits),
            Err(CompileError::Template { .. })
        ));
    }
}
