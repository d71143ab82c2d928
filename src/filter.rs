use crate::types::{value_as_f64, Record, RecordSet};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A predicate tree over record fields. Predicates are plain data so layer
/// filters can live in the config file; evaluation is side-effect free and
/// deterministic for a fixed tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Predicate {
    Equals { field: String, value: Value },
    IsNull { field: String },
    NotNull { field: String },
    All { preds: Vec<Predicate> },
    Any { preds: Vec<Predicate> },
    Not { pred: Box<Predicate> },
}

impl Predicate {
    pub fn matches(&self, set: &RecordSet, record: &Record) -> bool {
        match self {
            // Null fields (and missing columns) never satisfy equality,
            // even against a null right-hand side. Null is only matched by
            // the explicit null test.
            Predicate::Equals { field, value } => match set.get(record, field) {
                Some(Value::Null) | None => false,
                Some(actual) => values_equal(actual, value),
            },
            Predicate::IsNull { field } => {
                matches!(set.get(record, field), Some(Value::Null) | None)
            }
            Predicate::NotNull { field } => {
                !matches!(set.get(record, field), Some(Value::Null) | None)
            }
            Predicate::All { preds } => preds.iter().all(|p| p.matches(set, record)),
            Predicate::Any { preds } => preds.iter().any(|p| p.matches(set, record)),
            Predicate::Not { pred } => !pred.matches(set, record),
        }
    }
}

/// Numbers compare numerically so `3` matches `3.0`; everything else is
/// strict equality.
fn values_equal(a: &Value, b: &Value) -> bool {
    if let (Some(x), Some(y)) = (number_of(a), number_of(b)) {
        return x == y;
    }
    a == b
}

fn number_of(value: &Value) -> Option<f64> {
    match value {
        Value::Number(_) => value_as_f64(value),
        _ => None,
    }
}

/// New set holding only the matching records, in their original relative
/// order. The source set is untouched.
pub fn apply(pred: &Predicate, set: &RecordSet) -> RecordSet {
    let mut subset = set.like();
    for record in &set.records {
        if pred.matches(set, record) {
            subset.push(record.clone());
        }
    }
    subset
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn category_set() -> RecordSet {
        let mut set = RecordSet::new(vec!["id".to_string(), "category".to_string()]);
        let rows = [
            json!("march"),
            json!("strike"),
            Value::Null,
            json!("strike"),
            json!("riot"),
        ];
        for (i, category) in rows.into_iter().enumerate() {
            set.push(Record {
                index: i,
                values: vec![json!(i as i64), category],
            });
        }
        set
    }

    #[test]
    fn equality_subset_preserves_relative_order() {
        let set = category_set();
        let pred = Predicate::Equals {
            field: "category".to_string(),
            value: json!("strike"),
        };
        let subset = apply(&pred, &set);
        assert_eq!(subset.len(), 2);
        assert_eq!(subset.records[0].index, 1);
        assert_eq!(subset.records[1].index, 3);
        // Source untouched.
        assert_eq!(set.len(), 5);
    }

    #[test]
    fn null_fields_never_match_equality() {
        let set = category_set();
        let pred = Predicate::Equals {
            field: "category".to_string(),
            value: Value::Null,
        };
        assert_eq!(apply(&pred, &set).len(), 0);

        let missing = Predicate::Equals {
            field: "no_such_field".to_string(),
            value: json!("strike"),
        };
        assert_eq!(apply(&missing, &set).len(), 0);
    }

    #[test]
    fn explicit_null_test_matches_nulls() {
        let set = category_set();
        let pred = Predicate::IsNull {
            field: "category".to_string(),
        };
        let subset = apply(&pred, &set);
        assert_eq!(subset.len(), 1);
        assert_eq!(subset.records[0].index, 2);
    }

    #[test]
    fn combinators_compose() {
        let set = category_set();
        let pred = Predicate::All {
            preds: vec![
                Predicate::NotNull {
                    field: "category".to_string(),
                },
                Predicate::Not {
                    pred: Box::new(Predicate::Any {
                        preds: vec![
                            Predicate::Equals {
                                field: "category".to_string(),
                                value: json!("strike"),
                            },
                            Predicate::Equals {
                                field: "category".to_string(),
                                value: json!("riot"),
                            },
                        ],
                    }),
                },
            ],
        };
        let subset = apply(&pred, &set);
        assert_eq!(subset.len(), 1);
        assert_eq!(subset.records[0].index, 0);
    }

    #[test]
    fn numeric_equality_ignores_representation() {
        let mut set = RecordSet::new(vec!["count".to_string()]);
        set.push(Record {
            index: 0,
            values: vec![json!(3.0)],
        });
        let pred = Predicate::Equals {
            field: "count".to_string(),
            value: json!(3),
        };
        assert_eq!(apply(&pred, &set).len(), 1);
    }

    #[test]
    fn predicates_deserialize_from_config_syntax() {
        let toml_text = r#"
            kind = "all"

            [[preds]]
            kind = "equals"
            field = "category"
            value = "strike"

            [[preds]]
            kind = "not_null"
            field = "latitude"
        "#;
        let pred: Predicate = toml::from_str(toml_text).unwrap();
        match pred {
            Predicate::All { preds } => assert_eq!(preds.len(), 2),
            other => panic!("unexpected predicate: {other:?}"),
        }
    }
}
