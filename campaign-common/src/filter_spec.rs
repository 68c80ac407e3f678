use serde::{Deserialize, Serialize};

/// Which filter stages to run over a population, and with what inputs.
///
/// A missing field and an empty list both mean the stage does not run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterSpecification {
    /// Exclusion list sources; their union is removed from the population.
    #[serde(default, alias = "blacklist_tables")]
    pub exclusion_sources: Option<Vec<String>>,
    /// Device names; only customers seen on one of them are kept.
    #[serde(default)]
    pub devices: Option<Vec<String>>,
    /// Channel/stream names; customers who opted out of any of them are removed.
    #[serde(default, alias = "push_streams")]
    pub channels: Option<Vec<String>>,
    /// Keep only monthly active users.
    #[serde(default, alias = "mau_only")]
    pub active_users_only: bool,
    /// Product names; only customers owning one of them are kept.
    #[serde(default)]
    pub products: Option<Vec<String>>,
    /// Numeric columns summed into the `aggregate` attribute.
    #[serde(default)]
    pub sum_columns: Option<Vec<String>>,
    /// Rows with an aggregate below this value are dropped.
    #[serde(default, alias = "min_sum")]
    pub minimum_sum: Option<f64>,
}

fn non_empty(list: &Option<Vec<String>>) -> Option<&[String]> {
    list.as_deref().filter(|values| !values.is_empty())
}

impl FilterSpecification {
    pub fn exclusion_sources(&self) -> Option<&[String]> {
        non_empty(&self.exclusion_sources)
    }

    pub fn devices(&self) -> Option<&[String]> {
        non_empty(&self.devices)
    }

    pub fn channels(&self) -> Option<&[String]> {
        non_empty(&self.channels)
    }

    pub fn products(&self) -> Option<&[String]> {
        non_empty(&self.products)
    }

    pub fn sum_columns(&self) -> Option<&[String]> {
        non_empty(&self.sum_columns)
    }

    pub fn has_aggregation(&self) -> bool {
        self.sum_columns().is_some()
    }

    pub fn has_reference_stages(&self) -> bool {
        self.exclusion_sources().is_some()
            || self.devices().is_some()
            || self.channels().is_some()
            || self.active_users_only
            || self.products().is_some()
    }

    pub fn is_empty(&self) -> bool {
        !self.has_aggregation() && !self.has_reference_stages()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_lists_count_as_absent() {
        let spec = FilterSpecification {
            exclusion_sources: Some(vec![]),
            devices: None,
            products: Some(vec![]),
            ..Default::default()
        };

        assert_eq!(spec.exclusion_sources(), None);
        assert_eq!(spec.products(), None);
        assert!(spec.is_empty());
    }

    #[test]
    fn test_accepts_legacy_field_names() {
        let spec: FilterSpecification = serde_json::from_str(
            r#"{"blacklist_tables": ["BL_No_worker"], "push_streams": ["Promo"], "mau_only": true, "min_sum": 10}"#,
        )
        .unwrap();

        assert_eq!(spec.exclusion_sources(), Some(&["BL_No_worker".to_owned()][..]));
        assert_eq!(spec.channels(), Some(&["Promo".to_owned()][..]));
        assert!(spec.active_users_only);
        assert_eq!(spec.minimum_sum, Some(10.0));
        assert!(spec.has_reference_stages());
        assert!(!spec.has_aggregation());
    }
}
