pub mod collector;
pub mod convert;
pub mod debug;
pub mod error;
pub mod labels;
pub mod merge;
pub mod parser;
pub mod scrape;

use indexmap::IndexMap; // hash table w/ fast iter preserving insertion order
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::str::FromStr;

/// A set of label names and values; iterates in lexicographic order by name.
pub type LabelSet = BTreeMap<String, String>;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MetricKind {
    Counter,
    Gauge,
    Untyped,
    Histogram,
    Summary,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
            MetricKind::Untyped => "untyped",
            MetricKind::Histogram => "histogram",
            MetricKind::Summary => "summary",
        }
    }
}

impl FromStr for MetricKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "counter" => Ok(MetricKind::Counter),
            "gauge" => Ok(MetricKind::Gauge),
            "untyped" => Ok(MetricKind::Untyped),
            "histogram" => Ok(MetricKind::Histogram),
            "summary" => Ok(MetricKind::Summary),
            _ => Err(()),
        }
    }
}

/// A cumulative histogram bucket
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Bucket {
    pub upper_bound: f64,
    pub cumulative_count: u64,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Quantile {
    pub quantile: f64,
    pub value: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    /// The value of a counter, gauge, or untyped series
    Scalar(f64),
    Histogram {
        buckets: Vec<Bucket>,
        sum: f64,
        count: u64,
    },
    Summary {
        quantiles: Vec<Quantile>,
        sum: f64,
        count: u64,
    },
}

/// One time-series within a family, identified by its labels
#[derive(Clone, Debug, PartialEq)]
pub struct Series {
    pub labels: Vec<(String, String)>,
    pub value: Value,
    pub timestamp_ms: Option<i64>,
}

impl Series {
    pub fn new(labels: Vec<(String, String)>, value: Value) -> Self {
        Series {
            labels,
            value,
            timestamp_ms: None,
        }
    }

    pub fn label(&self, name: &str) -> Option<&str> {
        self.labels
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct MetricFamily {
    pub name: String,
    pub help: String,
    pub kind: MetricKind,
    pub series: Vec<Series>,
}

impl MetricFamily {
    pub fn new(name: impl Into<String>, help: impl Into<String>, kind: MetricKind) -> Self {
        MetricFamily {
            name: name.into(),
            help: help.into(),
            kind,
            series: Vec::new(),
        }
    }

    pub fn with_series(mut self, series: Series) -> Self {
        self.series.push(series);
        self
    }
}

/// The metric families produced by one scrape (or by merging several),
/// keyed by family name.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MetricFamilySet {
    families: IndexMap<String, MetricFamily>,
}

impl MetricFamilySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.families.is_empty()
    }

    pub fn len(&self) -> usize {
        self.families.len()
    }

    /// The total number of series across all families
    pub fn series_count(&self) -> usize {
        self.families.values().map(|f| f.series.len()).sum()
    }

    pub fn get(&self, name: &str) -> Option<&MetricFamily> {
        self.families.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut MetricFamily> {
        self.families.get_mut(name)
    }

    /// Inserts a family, replacing (and returning) any family with the same name.
    pub fn insert(&mut self, family: MetricFamily) -> Option<MetricFamily> {
        self.families.insert(family.name.clone(), family)
    }

    pub fn iter(&self) -> impl Iterator<Item = &MetricFamily> {
        self.families.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut MetricFamily> {
        self.families.values_mut()
    }

    /// Returns the families ordered by name, with each family's series ordered
    /// by their label values.
    ///
    /// Neither the order of families nor the order of series is stable across
    /// merges, so compare the sorted form.
    pub fn sorted(&self) -> Vec<MetricFamily> {
        let mut families = self.families.values().cloned().collect::<Vec<_>>();
        families.sort_by(|a, b| a.name.cmp(&b.name));
        for family in &mut families {
            family.series.sort_by(|a, b| compare_labels(&a.labels, &b.labels));
        }
        families
    }
}

impl IntoIterator for MetricFamilySet {
    type Item = MetricFamily;
    type IntoIter = indexmap::map::IntoValues<String, MetricFamily>;

    fn into_iter(self) -> Self::IntoIter {
        self.families.into_values()
    }
}

impl std::iter::FromIterator<MetricFamily> for MetricFamilySet {
    fn from_iter<I: IntoIterator<Item = MetricFamily>>(iter: I) -> Self {
        let mut set = MetricFamilySet::new();
        for family in iter {
            set.insert(family);
        }
        set
    }
}

// Same ordering `prometheus::Registry::gather` applies to series
fn compare_labels(a: &[(String, String)], b: &[(String, String)]) -> Ordering {
    if a.len() != b.len() {
        return a.len().cmp(&b.len());
    }
    for ((_, va), (_, vb)) in a.iter().zip(b.iter()) {
        if va != vb {
            return va.cmp(vb);
        }
    }
    Ordering::Equal
}
