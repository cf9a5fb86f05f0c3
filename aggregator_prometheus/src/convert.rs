//! Conversion of scraped metric families into the descriptors and samples
//! the `prometheus` crate registers and exposes.
//!
//! Samples are served without the timestamps their targets exposed; the
//! aggregated result is always as fresh as the latest refresh. Untyped
//! families are served as gauges, since `TextEncoder` can't render untyped
//! samples.

use prometheus::core::Desc;
use prometheus::proto;
use std::collections::HashMap;
use thiserror::Error;

use crate::{MetricFamily, MetricKind, Series, Value};

#[derive(Error, Debug)]
pub enum ConvertError {
    #[error("metric {name} has no series")]
    Empty { name: String },
    #[error("metric {name} of type {kind} has a series with an unsupported value")]
    UnsupportedType { name: String, kind: &'static str },
    #[error("metric {name} has a series with labels {found:?}, expected {expected:?}")]
    InconsistentLabels {
        name: String,
        expected: Vec<String>,
        found: Vec<String>,
    },
    #[error("invalid descriptor for metric {name}: {source}")]
    Descriptor {
        name: String,
        #[source]
        source: prometheus::Error,
    },
}

/// Returns the label names of the family's first series, sorted.
///
/// Every other series of the family must carry the same label names.
fn label_names(family: &MetricFamily) -> Result<Vec<String>, ConvertError> {
    let first = family.series.first().ok_or_else(|| ConvertError::Empty {
        name: family.name.clone(),
    })?;
    Ok(sorted_names(first))
}

fn sorted_names(series: &Series) -> Vec<String> {
    let mut names = series
        .labels
        .iter()
        .map(|(name, _)| name.clone())
        .collect::<Vec<_>>();
    names.sort();
    names
}

/// Builds the descriptor for a family.
pub fn family_to_desc(family: &MetricFamily) -> Result<Desc, ConvertError> {
    let names = label_names(family)?;

    // Descriptors require a help string, even if the target didn't send one
    let help = if family.help.is_empty() {
        family.name.clone()
    } else {
        family.help.clone()
    };
    Desc::new(family.name.clone(), help, names, HashMap::new()).map_err(|source| {
        ConvertError::Descriptor {
            name: family.name.clone(),
            source,
        }
    })
}

/// Builds one sample per series of the family.
pub fn family_to_samples(family: &MetricFamily) -> Result<Vec<proto::Metric>, ConvertError> {
    let names = label_names(family)?;
    family
        .series
        .iter()
        .map(|series| convert_series(family, &names, series))
        .collect()
}

/// Builds the complete family, as returned from `Collector::collect`.
pub fn family_to_proto(family: &MetricFamily) -> Result<proto::MetricFamily, ConvertError> {
    let samples = family_to_samples(family)?;
    let mut out = proto::MetricFamily::default();
    out.set_name(family.name.clone());
    out.set_help(family.help.clone());
    out.set_field_type(match family.kind {
        MetricKind::Counter => proto::MetricType::COUNTER,
        MetricKind::Gauge | MetricKind::Untyped => proto::MetricType::GAUGE,
        MetricKind::Histogram => proto::MetricType::HISTOGRAM,
        MetricKind::Summary => proto::MetricType::SUMMARY,
    });
    for sample in samples {
        out.mut_metric().push(sample);
    }
    Ok(out)
}

fn convert_series(
    family: &MetricFamily,
    names: &[String],
    series: &Series,
) -> Result<proto::Metric, ConvertError> {
    let found = sorted_names(series);
    if found != names {
        return Err(ConvertError::InconsistentLabels {
            name: family.name.clone(),
            expected: names.to_vec(),
            found,
        });
    }

    let mut metric = proto::Metric::default();
    for name in names {
        let mut pair = proto::LabelPair::default();
        pair.set_name(name.clone());
        pair.set_value(series.label(name).unwrap_or_default().to_string());
        metric.mut_label().push(pair);
    }

    match (family.kind, &series.value) {
        (MetricKind::Counter, Value::Scalar(value)) => {
            let mut counter = proto::Counter::default();
            counter.set_value(*value);
            metric.set_counter(counter);
        }
        (MetricKind::Gauge, Value::Scalar(value)) | (MetricKind::Untyped, Value::Scalar(value)) => {
            let mut gauge = proto::Gauge::default();
            gauge.set_value(*value);
            metric.set_gauge(gauge);
        }
        (
            MetricKind::Histogram,
            Value::Histogram {
                buckets,
                sum,
                count,
            },
        ) => {
            let mut histogram = proto::Histogram::default();
            histogram.set_sample_count(*count);
            histogram.set_sample_sum(*sum);
            // The encoder derives the +Inf bucket from the sample count
            for bucket in buckets.iter().filter(|b| b.upper_bound != f64::INFINITY) {
                let mut out = proto::Bucket::default();
                out.set_upper_bound(bucket.upper_bound);
                out.set_cumulative_count(bucket.cumulative_count);
                histogram.mut_bucket().push(out);
            }
            metric.set_histogram(histogram);
        }
        (
            MetricKind::Summary,
            Value::Summary {
                quantiles,
                sum,
                count,
            },
        ) => {
            let mut summary = proto::Summary::default();
            summary.set_sample_count(*count);
            summary.set_sample_sum(*sum);
            for quantile in quantiles {
                let mut out = proto::Quantile::default();
                out.set_quantile(quantile.quantile);
                out.set_value(quantile.value);
                summary.mut_quantile().push(out);
            }
            metric.set_summary(summary);
        }
        (kind, _) => {
            return Err(ConvertError::UnsupportedType {
                name: family.name.clone(),
                kind: kind.as_str(),
            })
        }
    }
    Ok(metric)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::parser;
    use crate::{Bucket, Quantile};
    use prometheus::{Encoder, TextEncoder};

    const METRICS_TEXT: &str = r#"# HELP dummy_counter_metric Dummy text.
# TYPE dummy_counter_metric counter
dummy_counter_metric{name="foo"} 123456
# HELP dummy_gauge_metric Dummy text.
# TYPE dummy_gauge_metric gauge
dummy_gauge_metric{name="foo"} 123.456
# HELP dummy_histogram_metric Dummy text.
# TYPE dummy_histogram_metric histogram
dummy_histogram_metric_bucket{name="foo",le="0.001"} 0
dummy_histogram_metric_bucket{name="foo",le="0.01"} 0
dummy_histogram_metric_bucket{name="foo",le="0.1"} 180
dummy_histogram_metric_bucket{name="foo",le="1"} 184
dummy_histogram_metric_bucket{name="foo",le="10"} 184
dummy_histogram_metric_bucket{name="foo",le="+Inf"} 184
dummy_histogram_metric_sum{name="foo"} 10.544979995999995
dummy_histogram_metric_count{name="foo"} 184
# HELP dummy_summary_metric Dummy text.
# TYPE dummy_summary_metric summary
dummy_summary_metric{quantile="0"} 4.4276e-05
dummy_summary_metric{quantile="0.25"} 5.2031e-05
dummy_summary_metric{quantile="0.5"} 7.3375e-05
dummy_summary_metric{quantile="0.75"} 8.3761e-05
dummy_summary_metric{quantile="1"} 0.002849601
dummy_summary_metric_sum 0.042124416
dummy_summary_metric_count 461
"#;

    #[test]
    fn builds_desc_from_first_series() {
        let families = parser::parse(
            r#"# HELP dummy_counter_metric Dummy text.
# TYPE dummy_counter_metric counter
dummy_counter_metric{name="foo",instance="a"} 123456
dummy_counter_metric{instance="b",name="bar"} 123456
"#,
        )
        .unwrap();

        let desc = family_to_desc(families.get("dummy_counter_metric").unwrap()).unwrap();
        assert_eq!(desc.fq_name, "dummy_counter_metric");
        assert_eq!(desc.help, "Dummy text.");
        assert_eq!(desc.variable_labels, vec!["instance", "name"]);
    }

    #[test]
    fn orders_label_values_by_label_name() {
        let families = parser::parse("requests{method=\"GET\",code=\"200\"} 1\n").unwrap();
        let samples = family_to_samples(families.get("requests").unwrap()).unwrap();
        let labels = samples[0].get_label();
        assert_eq!(labels[0].get_name(), "code");
        assert_eq!(labels[0].get_value(), "200");
        assert_eq!(labels[1].get_name(), "method");
        assert_eq!(labels[1].get_value(), "GET");
        assert_eq!(samples[0].get_gauge().get_value(), 1.0);
    }

    #[test]
    fn converts_scalars() {
        let families = parser::parse(METRICS_TEXT).unwrap();

        let counter = family_to_proto(families.get("dummy_counter_metric").unwrap()).unwrap();
        assert_eq!(counter.get_field_type(), proto::MetricType::COUNTER);
        assert_eq!(counter.get_metric()[0].get_counter().get_value(), 123456.0);

        let gauge = family_to_proto(families.get("dummy_gauge_metric").unwrap()).unwrap();
        assert_eq!(gauge.get_field_type(), proto::MetricType::GAUGE);
        assert_eq!(gauge.get_metric()[0].get_gauge().get_value(), 123.456);
    }

    #[test]
    fn preserves_histogram_buckets() {
        let families = parser::parse(METRICS_TEXT).unwrap();
        let family = families.get("dummy_histogram_metric").unwrap();

        let samples = family_to_samples(family).unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].get_label()[0].get_value(), "foo");

        let histogram = samples[0].get_histogram();
        assert_eq!(histogram.get_sample_count(), 184);
        assert_eq!(histogram.get_sample_sum(), 10.544979995999995);
        let buckets = histogram
            .get_bucket()
            .iter()
            .map(|b| (b.get_upper_bound(), b.get_cumulative_count()))
            .collect::<Vec<_>>();
        assert_eq!(
            buckets,
            vec![
                (0.001, 0),
                (0.01, 0),
                (0.1, 180),
                (1.0, 184),
                (10.0, 184),
            ]
        );
    }

    #[test]
    fn renders_the_infinite_bucket() {
        let families = parser::parse(
            "# TYPE h histogram\nh_bucket{le=\"1\"} 1\nh_bucket{le=\"+Inf\"} 2\nh_sum 3\nh_count 2\n",
        )
        .unwrap();
        let family = family_to_proto(families.get("h").unwrap()).unwrap();

        let mut out = Vec::new();
        TextEncoder::new().encode(&[family], &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();

        assert_eq!(
            text,
            "# TYPE h histogram\n\
             h_bucket{le=\"1\"} 1\n\
             h_bucket{le=\"+Inf\"} 2\n\
             h_sum 3\n\
             h_count 2\n"
        );
    }

    #[test]
    fn drops_exposed_timestamps() {
        let families = parser::parse("# TYPE g gauge\ng 1 1395066363000\n").unwrap();
        let family = family_to_proto(families.get("g").unwrap()).unwrap();
        assert_eq!(family.get_metric()[0].get_timestamp_ms(), 0);

        let mut out = Vec::new();
        TextEncoder::new().encode(&[family], &mut out).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "# TYPE g gauge\ng 1\n");
    }

    #[test]
    fn preserves_summary_quantiles() {
        let families = parser::parse(METRICS_TEXT).unwrap();
        let family = families.get("dummy_summary_metric").unwrap();

        let samples = family_to_samples(family).unwrap();
        assert_eq!(samples.len(), 1);
        assert!(samples[0].get_label().is_empty());

        let summary = samples[0].get_summary();
        assert_eq!(summary.get_sample_count(), 461);
        assert_eq!(summary.get_sample_sum(), 0.042124416);
        let quantiles = summary
            .get_quantile()
            .iter()
            .map(|q| (q.get_quantile(), q.get_value()))
            .collect::<Vec<_>>();
        assert_eq!(
            quantiles,
            vec![
                (0.0, 4.4276e-05),
                (0.25, 5.2031e-05),
                (0.5, 7.3375e-05),
                (0.75, 8.3761e-05),
                (1.0, 0.002849601),
            ]
        );
    }

    #[test]
    fn converts_values_verbatim() {
        let family = MetricFamily::new("latency", "Latency.", MetricKind::Histogram).with_series(
            Series::new(
                Vec::new(),
                Value::Histogram {
                    buckets: vec![Bucket {
                        upper_bound: 0.1 + 0.2,
                        cumulative_count: u64::MAX,
                    }],
                    sum: 1e-300,
                    count: u64::MAX,
                },
            ),
        );
        let histogram = family_to_samples(&family).unwrap()[0].get_histogram().clone();
        assert_eq!(histogram.get_bucket()[0].get_upper_bound(), 0.1 + 0.2);
        assert_eq!(histogram.get_bucket()[0].get_cumulative_count(), u64::MAX);
        assert_eq!(histogram.get_sample_sum(), 1e-300);

        let family = MetricFamily::new("rpc", "RPC.", MetricKind::Summary).with_series(Series::new(
            Vec::new(),
            Value::Summary {
                quantiles: vec![Quantile {
                    quantile: 0.999,
                    value: f64::MIN_POSITIVE,
                }],
                sum: 0.0,
                count: 0,
            },
        ));
        let summary = family_to_samples(&family).unwrap()[0].get_summary().clone();
        assert_eq!(summary.get_quantile()[0].get_quantile(), 0.999);
        assert_eq!(summary.get_quantile()[0].get_value(), f64::MIN_POSITIVE);
    }

    #[test]
    fn rejects_inconsistent_label_names() {
        let families = parser::parse("requests{code=\"200\"} 1\nrequests{method=\"GET\"} 1\n").unwrap();
        let err = family_to_samples(families.get("requests").unwrap()).unwrap_err();
        match err {
            ConvertError::InconsistentLabels {
                expected, found, ..
            } => {
                assert_eq!(expected, vec!["code"]);
                assert_eq!(found, vec!["method"]);
            }
            err => panic!("unexpected error: {}", err),
        }
    }

    #[test]
    fn rejects_mismatched_values() {
        let family = MetricFamily::new("broken", "Broken.", MetricKind::Counter).with_series(
            Series::new(
                Vec::new(),
                Value::Summary {
                    quantiles: Vec::new(),
                    sum: 0.0,
                    count: 0,
                },
            ),
        );
        assert!(matches!(
            family_to_samples(&family),
            Err(ConvertError::UnsupportedType { kind: "counter", .. })
        ));
    }

    #[test]
    fn rejects_empty_families() {
        let family = MetricFamily::new("empty", "Empty.", MetricKind::Gauge);
        assert!(matches!(
            family_to_desc(&family),
            Err(ConvertError::Empty { .. })
        ));
    }

    #[test]
    fn falls_back_to_name_for_missing_help() {
        let families = parser::parse("untyped_thing 3\n").unwrap();
        let family = families.get("untyped_thing").unwrap();

        let desc = family_to_desc(family).unwrap();
        assert_eq!(desc.help, "untyped_thing");

        let out = family_to_proto(family).unwrap();
        assert_eq!(out.get_help(), "");
        assert_eq!(out.get_field_type(), proto::MetricType::GAUGE);
    }

    #[test]
    fn renders_untyped_families_as_gauges() {
        let families = parser::parse("something_weird{problem=\"division by zero\"} 7\n").unwrap();
        let family = family_to_proto(families.get("something_weird").unwrap()).unwrap();

        let mut out = Vec::new();
        TextEncoder::new().encode(&[family], &mut out).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "# TYPE something_weird gauge\nsomething_weird{problem=\"division by zero\"} 7\n"
        );
    }
}
