use crate::labels::add_labels;
use crate::{LabelSet, MetricFamilySet};

/// Runs before two sets are merged, and may modify either of them
pub trait MergeHook {
    fn apply(&self, left: &mut MetricFamilySet, right: &mut MetricFamilySet);
}

/// Tags every series of the left set with `name=left` and every series of the
/// right set with `name=right`, so that sources exposing the same series
/// remain distinguishable after merging.
#[derive(Clone, Debug)]
pub struct IdentifierLabel {
    pub name: String,
    pub left: String,
    pub right: String,
}

impl IdentifierLabel {
    pub fn new(name: impl Into<String>, left: impl Into<String>, right: impl Into<String>) -> Self {
        IdentifierLabel {
            name: name.into(),
            left: left.into(),
            right: right.into(),
        }
    }
}

impl MergeHook for IdentifierLabel {
    fn apply(&self, left: &mut MetricFamilySet, right: &mut MetricFamilySet) {
        let mut labels = LabelSet::new();
        labels.insert(self.name.clone(), self.left.clone());
        add_labels(left, &labels);
        labels.insert(self.name.clone(), self.right.clone());
        add_labels(right, &labels);
    }
}

/// Merges two sets of metric families, grouping families by name.
///
/// Series of families with the same name are concatenated. The help text and
/// type of a merged family come from whichever input provided it first; both
/// inputs are expected to agree. Identical label sets are not deduplicated,
/// use an [`IdentifierLabel`] hook when sources may expose the same series.
pub fn merge(left: MetricFamilySet, right: MetricFamilySet) -> MetricFamilySet {
    merge_with(left, right, &[])
}

/// Like [`merge`], but runs `hooks` on both inputs first
pub fn merge_with(
    mut left: MetricFamilySet,
    mut right: MetricFamilySet,
    hooks: &[&dyn MergeHook],
) -> MetricFamilySet {
    for hook in hooks {
        hook.apply(&mut left, &mut right);
    }

    let mut merged = left;
    for family in right {
        match merged.get_mut(&family.name) {
            Some(existing) => existing.series.extend(family.series),
            None => {
                merged.insert(family);
            }
        }
    }
    merged
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{MetricFamily, MetricKind, Series, Value};
    use prometheus::Encoder;

    const COUNTER_METRIC_NAME: &str = "dummy_counter_metric";
    const GAUGE_METRIC_NAME: &str = "dummy_gauge_metric";

    fn counter_fixture(name: &str) -> MetricFamily {
        MetricFamily::new(name, "Dummy text.", MetricKind::Counter)
            .with_series(Series::new(Vec::new(), Value::Scalar(123456.0)))
    }

    fn gauge_fixture(name: &str) -> MetricFamily {
        MetricFamily::new(name, "Dummy text.", MetricKind::Gauge)
            .with_series(Series::new(Vec::new(), Value::Scalar(123.456)))
    }

    fn single(name: &str, shard: &str) -> MetricFamilySet {
        vec![MetricFamily::new(name, "Dummy text.", MetricKind::Gauge).with_series(
            Series::new(
                vec![("shard".to_string(), shard.to_string())],
                Value::Scalar(1.0),
            ),
        )]
        .into_iter()
        .collect()
    }

    fn shards(set: &MetricFamilySet, name: &str) -> Vec<String> {
        let mut shards = set
            .get(name)
            .unwrap()
            .series
            .iter()
            .map(|s| s.label("shard").unwrap().to_string())
            .collect::<Vec<_>>();
        shards.sort();
        shards
    }

    #[test]
    fn merges_with_identifier_labels() {
        // The two are the same metric.
        let left = vec![
            counter_fixture(COUNTER_METRIC_NAME),
            gauge_fixture(GAUGE_METRIC_NAME),
        ]
        .into_iter()
        .collect::<MetricFamilySet>();
        let right = left.clone();

        let hook = IdentifierLabel::new("cluster_name", "foo", "bar");
        let merged = merge_with(left, right, &[&hook]);
        assert_eq!(merged.len(), 2);

        let families = merged
            .sorted()
            .iter()
            .map(|family| crate::convert::family_to_proto(family).unwrap())
            .collect::<Vec<_>>();
        let mut out = Vec::new();
        prometheus::TextEncoder::new()
            .encode(&families, &mut out)
            .unwrap();

        let want = r#"# HELP dummy_counter_metric Dummy text.
# TYPE dummy_counter_metric counter
dummy_counter_metric{cluster_name="bar"} 123456
dummy_counter_metric{cluster_name="foo"} 123456
# HELP dummy_gauge_metric Dummy text.
# TYPE dummy_gauge_metric gauge
dummy_gauge_metric{cluster_name="bar"} 123.456
dummy_gauge_metric{cluster_name="foo"} 123.456
"#;
        assert_eq!(String::from_utf8(out).unwrap(), want);
    }

    #[test]
    fn merge_is_commutative_and_associative_by_name() {
        let ab_c = merge(merge(single("a", "1"), single("a", "2")), single("a", "3"));
        let ba_c = merge(merge(single("a", "2"), single("a", "1")), single("a", "3"));
        let a_bc = merge(single("a", "1"), merge(single("a", "2"), single("a", "3")));

        for merged in &[ab_c, ba_c, a_bc] {
            assert_eq!(merged.len(), 1);
            assert_eq!(shards(merged, "a"), vec!["1", "2", "3"]);
        }
    }

    #[test]
    fn passes_through_disjoint_families() {
        let merged = merge(single("a", "1"), single("b", "2"));
        assert_eq!(merged.len(), 2);
        assert_eq!(shards(&merged, "a"), vec!["1"]);
        assert_eq!(shards(&merged, "b"), vec!["2"]);

        let merged = merge(MetricFamilySet::new(), single("b", "2"));
        assert_eq!(merged, single("b", "2"));
    }

    #[test]
    fn does_not_deduplicate_series() {
        let merged = merge(single("a", "1"), single("a", "1"));
        assert_eq!(merged.get("a").unwrap().series.len(), 2);
    }

    #[test]
    fn identifier_labels_keep_empty_label_sets_apart() {
        let left = vec![counter_fixture("requests")]
            .into_iter()
            .collect::<MetricFamilySet>();
        let right = left.clone();

        let hook = IdentifierLabel::new("cluster", "foo", "bar");
        let merged = merge_with(left, right, &[&hook]);

        let family = &merged.sorted()[0];
        assert_eq!(family.series.len(), 2);
        assert_eq!(family.series[0].label("cluster"), Some("bar"));
        assert_eq!(family.series[1].label("cluster"), Some("foo"));
    }
}
