//! Whole-batch transformations applied between geometry normalization and the sink write.

use anyhow::Result;
use odi_core::Batch;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// Receives the prepared batch by reference and returns a new one; the input is never mutated.
pub trait BatchTransform: Send + Sync {
    fn apply(&self, batch: &Batch) -> Result<Batch>;
}

impl<F> BatchTransform for F
where
    F: Fn(&Batch) -> Result<Batch> + Send + Sync,
{
    fn apply(&self, batch: &Batch) -> Result<Batch> {
        self(batch)
    }
}

/// Declarative column operation. Rules naming an absent source column are no-ops,
/// since the API omits keys whose values are null across an entire page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ColumnRule {
    Rename { from: String, to: String },
    FillNull { column: String, from: String },
    Drop { column: String },
    Constant { column: String, value: Value },
    Copy { from: String, to: String },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuleTransform {
    rules: Vec<ColumnRule>,
}

impl RuleTransform {
    pub fn new(rules: Vec<ColumnRule>) -> Self {
        Self { rules }
    }

    fn apply_rule(rule: &ColumnRule, batch: &mut Batch) -> Result<()> {
        match rule {
            ColumnRule::Rename { from, to } => {
                if !batch.rename_column(from, to.clone()) {
                    debug!(column = %from, "rename source absent");
                }
            }
            ColumnRule::FillNull { column, from } => {
                let Some(fallback) = batch.column(from).map(<[Value]>::to_vec) else {
                    debug!(column = %from, "fill_null fallback absent");
                    return Ok(());
                };
                match batch.column_mut(column) {
                    Some(values) => {
                        for (value, replacement) in values.iter_mut().zip(fallback) {
                            if value.is_null() {
                                *value = replacement;
                            }
                        }
                    }
                    None => {
                        batch.insert_column(column.clone(), fallback)?;
                    }
                }
            }
            ColumnRule::Drop { column } => {
                batch.remove_column(column);
            }
            ColumnRule::Constant { column, value } => {
                let values = vec![value.clone(); batch.num_rows()];
                batch.insert_column(column.clone(), values)?;
            }
            ColumnRule::Copy { from, to } => {
                let values = batch
                    .column(from)
                    .map(<[Value]>::to_vec)
                    .unwrap_or_else(|| vec![Value::Null; batch.num_rows()]);
                batch.insert_column(to.clone(), values)?;
            }
        }
        Ok(())
    }
}

impl BatchTransform for RuleTransform {
    fn apply(&self, batch: &Batch) -> Result<Batch> {
        let mut out = batch.clone();
        for rule in &self.rules {
            Self::apply_rule(rule, &mut out)?;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use odi_core::Record;
    use serde_json::json;

    fn batch(values: Vec<Value>) -> Batch {
        let records: Vec<Record> = values
            .into_iter()
            .map(|v| v.as_object().cloned().expect("object"))
            .collect();
        Batch::from_records(&records)
    }

    fn wifi_rules() -> RuleTransform {
        RuleTransform::new(vec![
            ColumnRule::FillNull {
                column: "station_name".into(),
                from: "station_complex".into(),
            },
            ColumnRule::Rename {
                from: "at_t".into(),
                to: "att".into(),
            },
        ])
    }

    #[test]
    fn wifi_rules_backfill_station_name_and_rename_att() {
        let input = batch(vec![
            json!({"station_name": null, "station_complex": "Times Sq-42 St", "at_t": "Yes"}),
            json!({"station_name": "Fulton St", "station_complex": "Fulton St Complex", "at_t": "No"}),
        ]);
        let out = wifi_rules().apply(&input).expect("transform");

        assert_eq!(
            out.column("station_name").expect("station_name"),
            &[json!("Times Sq-42 St"), json!("Fulton St")]
        );
        assert!(!out.has_column("at_t"));
        assert_eq!(out.column("att").expect("att"), &[json!("Yes"), json!("No")]);
    }

    #[test]
    fn transform_leaves_input_untouched() {
        let input = batch(vec![json!({"station_name": null, "station_complex": "A", "at_t": "Yes"})]);
        let snapshot = input.clone();
        let _ = wifi_rules().apply(&input).expect("transform");
        assert_eq!(input, snapshot);
    }

    #[test]
    fn absent_sources_are_noops() {
        let input = batch(vec![json!({"id": "1"})]);
        let out = wifi_rules().apply(&input).expect("transform");
        assert_eq!(out, input);
    }

    #[test]
    fn constant_and_copy_derive_columns() {
        let input = batch(vec![json!({"id": "1"}), json!({"id": "2"})]);
        let rules = RuleTransform::new(vec![
            ColumnRule::Constant {
                column: "source".into(),
                value: json!("mta"),
            },
            ColumnRule::Copy {
                from: "id".into(),
                to: "legacy_id".into(),
            },
            ColumnRule::Drop {
                column: "id".into(),
            },
        ]);
        let out = rules.apply(&input).expect("transform");
        assert_eq!(out.column("source").expect("source"), &[json!("mta"), json!("mta")]);
        assert_eq!(out.column("legacy_id").expect("legacy"), &[json!("1"), json!("2")]);
        assert!(!out.has_column("id"));
    }

    #[test]
    fn rules_deserialize_from_tagged_maps() {
        let rules: Vec<ColumnRule> = serde_json::from_value(json!([
            {"op": "fill_null", "column": "station_name", "from": "station_complex"},
            {"op": "rename", "from": "at_t", "to": "att"}
        ]))
        .expect("rules");
        assert_eq!(RuleTransform::new(rules), wifi_rules());
    }

    #[test]
    fn closures_are_transforms() {
        let upper = |b: &Batch| -> Result<Batch> {
            let mut out = b.clone();
            out.rename_column("id", "ID");
            Ok(out)
        };
        let out = upper.apply(&batch(vec![json!({"id": "1"})])).expect("closure");
        assert!(out.has_column("ID"));
    }
}
