use crate::{LabelSet, MetricFamilySet};

/// Adds the given label set to every series of every family in `families`.
///
/// On a name collision the value from `labels` wins. The resulting label
/// pairs are sorted by name, which is the order the `prometheus` crate
/// expects and keeps the rendered output deterministic.
pub fn add_labels(families: &mut MetricFamilySet, labels: &LabelSet) {
    for family in families.iter_mut() {
        for series in &mut family.series {
            let mut merged = series.labels.drain(..).collect::<LabelSet>();
            for (name, value) in labels {
                merged.insert(name.clone(), value.clone());
            }
            series.labels = merged.into_iter().collect();
        }
    }
}
