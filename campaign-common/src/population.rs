use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::customer::CustomerIdentifier;

/// Attribute carrying the secondary surrogate id of a customer.
pub const SECONDARY_ID_COLUMN: &str = "P_SID";

/// Attribute written by the aggregation stage.
pub const AGGREGATE_COLUMN: &str = "aggregate";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Bool(bool),
    Number(f64),
    Text(String),
    Null,
}

impl AttributeValue {
    /// Numeric view of the value. Text is parsed leniently, flags count as 0 or 1, nulls and
    /// garbage have none.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            AttributeValue::Bool(flag) => Some(if *flag { 1.0 } else { 0.0 }),
            AttributeValue::Number(n) if n.is_finite() => Some(*n),
            AttributeValue::Number(_) => None,
            AttributeValue::Text(s) => s.trim().parse::<f64>().ok().filter(|n| n.is_finite()),
            AttributeValue::Null => None,
        }
    }
}

/// One customer and its named attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PopulationRow {
    #[serde(rename = "IIN")]
    pub customer: CustomerIdentifier,
    #[serde(flatten)]
    pub attributes: BTreeMap<String, AttributeValue>,
}

impl PopulationRow {
    pub fn new(customer: CustomerIdentifier) -> Self {
        Self {
            customer,
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, name: &str, value: AttributeValue) -> Self {
        self.attributes.insert(name.to_owned(), value);
        self
    }

    pub fn attribute(&self, name: &str) -> Option<&AttributeValue> {
        self.attributes.get(name)
    }

    /// The secondary surrogate id, defaulting to the integer form of the customer identifier
    /// when the row does not carry one.
    pub fn secondary_id(&self) -> i64 {
        self.attribute(SECONDARY_ID_COLUMN)
            .and_then(AttributeValue::as_number)
            .filter(|n| n.fract() == 0.0 && *n >= i64::MIN as f64 && *n <= i64::MAX as f64)
            .map(|n| n as i64)
            .unwrap_or_else(|| self.customer.as_i64())
    }
}

/// An ordered collection of customer rows with a known set of columns.
///
/// Batches are never mutated in place by the pipeline: every narrowing or derivation
/// returns a new batch.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PopulationBatch {
    columns: Vec<String>,
    rows: Vec<PopulationRow>,
}

impl PopulationBatch {
    /// Build a batch from rows, taking the union of their attribute names as the columns.
    ///
    /// A batch is keyed by customer: when several rows normalise to the same identifier only the
    /// first is kept.
    pub fn from_rows(rows: Vec<PopulationRow>) -> Self {
        let mut seen = HashSet::with_capacity(rows.len());
        let rows: Vec<PopulationRow> = rows
            .into_iter()
            .filter(|row| seen.insert(row.customer))
            .collect();

        let mut columns: Vec<String> = Vec::new();
        for row in &rows {
            for name in row.attributes.keys() {
                if !columns.iter().any(|c| c == name) {
                    columns.push(name.clone());
                }
            }
        }
        Self { columns, rows }
    }

    /// Build a batch of bare customer identifiers, as received from an id-only upload.
    pub fn from_customers<I>(customers: I) -> Self
    where
        I: IntoIterator<Item = CustomerIdentifier>,
    {
        Self::from_rows(customers.into_iter().map(PopulationRow::new).collect())
    }

    pub fn with_columns(columns: Vec<String>, rows: Vec<PopulationRow>) -> Self {
        let mut batch = Self::from_rows(rows);
        for column in columns.into_iter().rev() {
            if !batch.columns.contains(&column) {
                batch.columns.insert(0, column);
            }
        }
        batch
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c == name)
    }

    pub fn rows(&self) -> &[PopulationRow] {
        &self.rows
    }

    pub fn customers(&self) -> impl Iterator<Item = &CustomerIdentifier> {
        self.rows.iter().map(|row| &row.customer)
    }

    /// A new batch holding only the rows accepted by `keep`.
    pub fn narrow<F>(&self, mut keep: F) -> Self
    where
        F: FnMut(&PopulationRow) -> bool,
    {
        Self {
            columns: self.columns.clone(),
            rows: self.rows.iter().filter(|row| keep(row)).cloned().collect(),
        }
    }

    /// Keep rows whose customer is a member of `set`.
    pub fn retain_members(&self, set: &HashSet<CustomerIdentifier>) -> Self {
        self.narrow(|row| set.contains(&row.customer))
    }

    /// Drop rows whose customer is a member of `set`.
    pub fn remove_members(&self, set: &HashSet<CustomerIdentifier>) -> Self {
        self.narrow(|row| !set.contains(&row.customer))
    }

    /// A new batch with `column` derived per row by `derive`.
    pub fn derive_column<F>(&self, column: &str, mut derive: F) -> Self
    where
        F: FnMut(&PopulationRow) -> AttributeValue,
    {
        let mut columns = self.columns.clone();
        if !columns.iter().any(|c| c == column) {
            columns.push(column.to_owned());
        }
        let rows = self
            .rows
            .iter()
            .map(|row| {
                let value = derive(row);
                row.clone().with_attribute(column, value)
            })
            .collect();
        Self { columns, rows }
    }
}

impl Serialize for PopulationBatch {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(&self.rows)
    }
}

impl<'de> Deserialize<'de> for PopulationBatch {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let rows = Vec::<PopulationRow>::deserialize(deserializer)?;
        Ok(PopulationBatch::from_rows(rows))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn customer(n: u64) -> CustomerIdentifier {
        CustomerIdentifier::new(n).unwrap()
    }

    #[test]
    fn test_columns_are_union_of_row_attributes() {
        let batch = PopulationBatch::from_rows(vec![
            PopulationRow::new(customer(1)).with_attribute("A", AttributeValue::Number(1.0)),
            PopulationRow::new(customer(2)).with_attribute("B", AttributeValue::Null),
        ]);

        assert!(batch.has_column("A"));
        assert!(batch.has_column("B"));
        assert!(!batch.has_column("C"));
    }

    #[test]
    fn test_secondary_id_defaults_to_customer() {
        let bare = PopulationRow::new(customer(77));
        assert_eq!(bare.secondary_id(), 77);

        let with_sid = PopulationRow::new(customer(77))
            .with_attribute(SECONDARY_ID_COLUMN, AttributeValue::Text("1234".to_owned()));
        assert_eq!(with_sid.secondary_id(), 1234);

        let junk_sid = PopulationRow::new(customer(77))
            .with_attribute(SECONDARY_ID_COLUMN, AttributeValue::Text("n/a".to_owned()));
        assert_eq!(junk_sid.secondary_id(), 77);
    }

    #[test]
    fn test_narrowing_does_not_touch_source() {
        let batch = PopulationBatch::from_customers((1..=4).map(customer));
        let set: HashSet<_> = [customer(1), customer(3)].into_iter().collect();

        let kept = batch.retain_members(&set);
        let dropped = batch.remove_members(&set);

        assert_eq!(batch.len(), 4);
        assert_eq!(kept.len(), 2);
        assert_eq!(dropped.customers().copied().collect::<Vec<_>>(), vec![customer(2), customer(4)]);
    }

    #[test]
    fn test_deserialize_rows() {
        let batch: PopulationBatch =
            serde_json::from_str(r#"[{"IIN": "000000000005", "A": 5, "B": null, "NAME": "x"}]"#)
                .unwrap();

        let row = &batch.rows()[0];
        assert_eq!(row.customer, customer(5));
        assert_eq!(row.attribute("A"), Some(&AttributeValue::Number(5.0)));
        assert_eq!(row.attribute("B"), Some(&AttributeValue::Null));
        assert_eq!(row.attribute("NAME"), Some(&AttributeValue::Text("x".to_owned())));
    }

    #[test]
    fn test_repeated_customers_keep_first_row() {
        let batch: PopulationBatch = serde_json::from_str(
            r#"[{"IIN": "7", "P_SID": 1}, {"IIN": 7, "P_SID": 2}, {"IIN": "000000000007"}, {"IIN": 8}]"#,
        )
        .unwrap();

        assert_eq!(batch.len(), 2);
        assert_eq!(
            batch.customers().copied().collect::<Vec<_>>(),
            vec![customer(7), customer(8)]
        );
        assert_eq!(batch.rows()[0].secondary_id(), 1);
    }

    #[test]
    fn test_boolean_attributes() {
        let batch: PopulationBatch =
            serde_json::from_str(r#"[{"IIN": 1, "IS_MAU": true}, {"IIN": 2, "IS_MAU": false}]"#)
                .unwrap();

        let flags: Vec<_> = batch
            .rows()
            .iter()
            .map(|row| row.attribute("IS_MAU").and_then(AttributeValue::as_number))
            .collect();
        assert_eq!(flags, vec![Some(1.0), Some(0.0)]);
        assert_eq!(
            serde_json::to_value(&batch).unwrap()[0]["IS_MAU"],
            serde_json::json!(true)
        );
    }
}
