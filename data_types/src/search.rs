//! Search predicates evaluated against per-trace attribute rollups.

use crate::TraceAttributes;

/// A tag / duration search over one tenant's traces.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SearchQuery {
    /// `key=value` predicates. A trace matches when, for every pair, it has
    /// a tag whose key equals `key` case-insensitively and whose value
    /// contains `value` case-insensitively. Root service and span name are
    /// matched under the pseudo-keys `service.name` and `name` as well.
    pub tags: Vec<(String, String)>,

    /// Minimum trace duration, if bounded.
    pub min_duration_ms: Option<u64>,

    /// Maximum trace duration, if bounded.
    pub max_duration_ms: Option<u64>,

    /// Maximum number of results the caller wants.
    pub limit: usize,
}

impl SearchQuery {
    /// Evaluate the query against one trace's rollup.
    pub fn matches(&self, attrs: &TraceAttributes) -> bool {
        let duration = attrs.duration_ms();
        if let Some(min) = self.min_duration_ms {
            if duration < min {
                return false;
            }
        }
        if let Some(max) = self.max_duration_ms {
            if duration > max {
                return false;
            }
        }

        self.tags.iter().all(|(key, value)| {
            let value_lower = value.to_lowercase();
            let direct = attrs.tags.iter().any(|(k, v)| {
                k.eq_ignore_ascii_case(key) && v.to_lowercase().contains(&value_lower)
            });
            let service = key.eq_ignore_ascii_case("service.name")
                && attrs
                    .root_service_name
                    .to_lowercase()
                    .contains(&value_lower);
            let name = key.eq_ignore_ascii_case("name")
                && attrs.root_span_name.to_lowercase().contains(&value_lower);
            direct || service || name
        })
    }

    /// Canonical form used as a response cache key: tags sorted, everything
    /// lowercased, bounds and limit embedded.
    pub fn normalized(&self) -> String {
        let mut tags: Vec<String> = self
            .tags
            .iter()
            .map(|(k, v)| format!("{}={}", k.to_lowercase(), v.to_lowercase()))
            .collect();
        tags.sort();
        format!(
            "tags[{}]min[{:?}]max[{:?}]limit[{}]",
            tags.join(","),
            self.min_duration_ms,
            self.max_duration_ms,
            self.limit
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs() -> TraceAttributes {
        TraceAttributes {
            root_service_name: "Cart".into(),
            root_span_name: "checkout".into(),
            start_unix_nanos: 1_000_000_000,
            end_unix_nanos: 1_700_000_000,
            error: false,
            tags: vec![("cluster".into(), "eu-west".into())],
        }
    }

    fn query(tags: &[(&str, &str)], min: Option<u64>, max: Option<u64>) -> SearchQuery {
        SearchQuery {
            tags: tags
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            min_duration_ms: min,
            max_duration_ms: max,
            limit: 10,
        }
    }

    #[test]
    fn tag_matching_is_case_insensitive_substring() {
        assert!(query(&[("cluster", "west")], None, None).matches(&attrs()));
        assert!(query(&[("CLUSTER", "EU")], None, None).matches(&attrs()));
        assert!(query(&[("service.name", "cart")], None, None).matches(&attrs()));
        assert!(!query(&[("cluster", "us")], None, None).matches(&attrs()));
        assert!(!query(&[("missing", "x")], None, None).matches(&attrs()));
    }

    #[test]
    fn duration_bounds() {
        // 700ms duration.
        assert!(query(&[], Some(500), None).matches(&attrs()));
        assert!(!query(&[], Some(701), None).matches(&attrs()));
        assert!(query(&[], None, Some(700)).matches(&attrs()));
        assert!(!query(&[], None, Some(699)).matches(&attrs()));
    }

    #[test]
    fn normalized_is_order_insensitive() {
        let a = query(&[("b", "2"), ("a", "1")], Some(1), None);
        let b = query(&[("A", "1"), ("B", "2")], Some(1), None);
        assert_eq!(a.normalized(), b.normalized());
    }
}
