use indexmap::IndexMap;
use std::collections::HashMap;
use thiserror::Error;

use crate::{Bucket, MetricFamily, MetricFamilySet, MetricKind, Quantile, Series, Value};

#[derive(Error, Debug, Clone, PartialEq)]
#[error("line {line}: {reason}")]
pub struct ParseError {
    /// The 1-based line of the input where parsing failed
    pub line: usize,
    pub reason: String,
}

/// A parser for Prometheus's text exposition format.
///
/// Families that only appear in `# HELP` or `# TYPE` lines, without any
/// samples, are left out of the result.
pub fn parse(input: &str) -> Result<MetricFamilySet, ParseError> {
    let mut builder = Builder::default();
    for (i, line) in input.lines().enumerate() {
        builder.line(line).map_err(|reason| ParseError {
            line: i + 1,
            reason,
        })?;
    }
    Ok(builder.finish())
}

/// A single measurement line, before it is assigned to a family
struct Sample<'a> {
    name: &'a str,
    labels: Vec<(String, String)>,
    value: f64,
    timestamp: Option<i64>,
}

/// How a sample line contributes to its family
#[derive(Copy, Clone)]
enum Role {
    Scalar,
    Bucket,
    Quantile,
    Sum,
    Count,
}

struct FamilyState {
    family: MetricFamily,
    typed: bool,

    /// Maps the (sorted) identifying labels of a series to its index,
    /// used to group histogram and summary lines into one series.
    index: HashMap<Vec<(String, String)>, usize>,
}

#[derive(Default)]
struct Builder {
    families: IndexMap<String, FamilyState>,
}

impl Builder {
    fn line(&mut self, line: &str) -> Result<(), String> {
        let line = line.trim();

        // The line is empty
        if line.is_empty() {
            Ok(())
        }
        // The line is a comment, or defines a metric's help text or type
        else if let Some(comment) = line.strip_prefix('#') {
            let (keyword, rest) = split_token(comment);
            match keyword {
                "HELP" => {
                    let (name, help) = split_token(rest);
                    self.help(name, help)
                }
                "TYPE" => {
                    let (name, type_str) = split_token(rest);
                    self.kind(name, type_str)
                }
                _ => Ok(()),
            }
        }
        // The line contains data
        else {
            let sample = parse_sample(line)?;
            self.sample(sample)
        }
    }

    fn entry(&mut self, name: &str) -> &mut FamilyState {
        self.families
            .entry(name.to_string())
            .or_insert_with(|| FamilyState {
                family: MetricFamily::new(name, "", MetricKind::Untyped),
                typed: false,
                index: HashMap::new(),
            })
    }

    fn help(&mut self, name: &str, help: &str) -> Result<(), String> {
        if !is_valid_metric_name(name) {
            return Err(format!("invalid metric name {:?} in HELP line", name));
        }
        self.entry(name).family.help = unescape_help(help);
        Ok(())
    }

    fn kind(&mut self, name: &str, type_str: &str) -> Result<(), String> {
        if !is_valid_metric_name(name) {
            return Err(format!("invalid metric name {:?} in TYPE line", name));
        }
        let kind = type_str
            .trim()
            .parse::<MetricKind>()
            .map_err(|()| format!("unsupported metric type {:?}", type_str))?;
        let state = self.entry(name);
        if state.typed {
            return Err(format!("second TYPE line for metric {}", name));
        }
        if !state.family.series.is_empty() {
            return Err(format!("TYPE line for metric {} after its samples", name));
        }
        state.family.kind = kind;
        state.typed = true;
        Ok(())
    }

    /// Finds the family a sample belongs to, and how it contributes to it
    fn resolve<'a>(&self, name: &'a str) -> Result<(&'a str, Role), String> {
        if let Some(state) = self.families.get(name) {
            return match state.family.kind {
                MetricKind::Counter | MetricKind::Gauge | MetricKind::Untyped => {
                    Ok((name, Role::Scalar))
                }
                MetricKind::Summary => Ok((name, Role::Quantile)),
                MetricKind::Histogram => Err(format!(
                    "sample {} of a histogram must use a _bucket, _sum or _count suffix",
                    name
                )),
            };
        }
        let suffixes: [(&str, Role); 3] = [
            ("_bucket", Role::Bucket),
            ("_sum", Role::Sum),
            ("_count", Role::Count),
        ];
        for &(suffix, role) in suffixes.iter() {
            let base = match name.strip_suffix(suffix) {
                Some(base) => base,
                None => continue,
            };
            let kind = match self.families.get(base) {
                Some(state) => state.family.kind,
                None => continue,
            };
            match (kind, role) {
                (MetricKind::Histogram, _) | (MetricKind::Summary, Role::Sum | Role::Count) => {
                    return Ok((base, role))
                }
                _ => (),
            }
        }
        Ok((name, Role::Scalar))
    }

    fn sample(&mut self, sample: Sample<'_>) -> Result<(), String> {
        let (family_name, role) = self.resolve(sample.name)?;
        let Sample {
            mut labels,
            value,
            timestamp,
            ..
        } = sample;

        // Histogram buckets and summary quantiles carry their bound in a label
        let bound = match role {
            Role::Bucket => Some(take_label(&mut labels, "le")?),
            Role::Quantile => Some(take_label(&mut labels, "quantile")?),
            _ => None,
        };

        let state = self.entry(family_name);
        let series = match role {
            Role::Scalar => {
                let mut series = Series::new(labels, Value::Scalar(value));
                series.timestamp_ms = timestamp;
                state.family.series.push(series);
                return Ok(());
            }
            _ => state.series_for(labels),
        };
        if timestamp.is_some() {
            series.timestamp_ms = timestamp;
        }

        match (&mut series.value, role) {
            (Value::Histogram { buckets, .. }, Role::Bucket) => buckets.push(Bucket {
                upper_bound: bound.unwrap_or(f64::INFINITY),
                cumulative_count: value as u64,
            }),
            (Value::Summary { quantiles, .. }, Role::Quantile) => quantiles.push(Quantile {
                quantile: bound.unwrap_or(f64::NAN),
                value,
            }),
            (Value::Histogram { sum, .. }, Role::Sum) | (Value::Summary { sum, .. }, Role::Sum) => {
                *sum = value
            }
            (Value::Histogram { count, .. }, Role::Count)
            | (Value::Summary { count, .. }, Role::Count) => *count = value as u64,
            _ => return Err(format!("unexpected sample for metric {}", family_name)),
        }
        Ok(())
    }

    fn finish(self) -> MetricFamilySet {
        self.families
            .into_iter()
            .map(|(_, state)| state.family)
            .filter(|family| !family.series.is_empty())
            .collect()
    }
}

impl FamilyState {
    /// Returns the histogram or summary series with the given labels, creating it if needed
    fn series_for(&mut self, labels: Vec<(String, String)>) -> &mut Series {
        let mut key = labels.clone();
        key.sort();
        let index = match self.index.get(&key) {
            Some(index) => *index,
            None => {
                let value = match self.family.kind {
                    MetricKind::Summary => Value::Summary {
                        quantiles: Vec::new(),
                        sum: 0.0,
                        count: 0,
                    },
                    _ => Value::Histogram {
                        buckets: Vec::new(),
                        sum: 0.0,
                        count: 0,
                    },
                };
                self.family.series.push(Series::new(labels, value));
                let index = self.family.series.len() - 1;
                self.index.insert(key, index);
                index
            }
        };
        &mut self.family.series[index]
    }
}

fn take_label(labels: &mut Vec<(String, String)>, name: &str) -> Result<f64, String> {
    let pos = labels
        .iter()
        .position(|(n, _)| n == name)
        .ok_or_else(|| format!("missing {:?} label", name))?;
    let (_, value) = labels.remove(pos);
    parse_float(&value).ok_or_else(|| format!("invalid {:?} label value {:?}", name, value))
}

/// Splits `input` into its first whitespace-delimited token and the remainder
fn split_token(input: &str) -> (&str, &str) {
    let input = input.trim_start();
    match input.find(char::is_whitespace) {
        Some(i) => (&input[..i], input[i..].trim_start()),
        None => (input, ""),
    }
}

fn parse_sample(line: &str) -> Result<Sample<'_>, String> {
    // Split `metric_name{labels} value timestamp` into parts
    let name_end = line
        .find(|ch: char| ch == '{' || ch.is_whitespace())
        .ok_or_else(|| format!("missing value for sample {:?}", line))?;
    let name = &line[..name_end];
    if !is_valid_metric_name(name) {
        return Err(format!("invalid metric name {:?}", name));
    }
    let (labels, rest) = match line[name_end..].trim_start().strip_prefix('{') {
        Some(labels_str) => parse_labels(labels_str)?,
        None => (Vec::new(), &line[name_end..]),
    };

    let mut parts = rest.split_whitespace();
    let value_str = parts
        .next()
        .ok_or_else(|| format!("missing value for metric {}", name))?;
    let value = parse_float(value_str)
        .ok_or_else(|| format!("invalid value {:?} for metric {}", value_str, name))?;
    let timestamp = match parts.next() {
        Some(unix_str) => Some(
            unix_str
                .parse::<i64>()
                .map_err(|_| format!("invalid timestamp {:?} for metric {}", unix_str, name))?,
        ),
        None => None,
    };
    if let Some(extra) = parts.next() {
        return Err(format!("unexpected {:?} after sample of metric {}", extra, name));
    }

    Ok(Sample {
        name,
        labels,
        value,
        timestamp,
    })
}

/// Parses `label1="value1",label2="value2"}` and returns the labels along with
/// the input following the closing brace.
fn parse_labels(input: &str) -> Result<(Vec<(String, String)>, &str), String> {
    let mut labels: Vec<(String, String)> = Vec::new();
    let mut tail = input;
    loop {
        tail = tail.trim_start();
        if let Some(rest) = tail.strip_prefix('}') {
            return Ok((labels, rest));
        }

        // Split first label
        let eq = tail
            .find('=')
            .ok_or_else(|| "expected '=' after label name".to_string())?;
        let name = tail[..eq].trim();
        if !is_valid_label_name(name) {
            return Err(format!("invalid label name {:?}", name));
        }
        tail = tail[eq + 1..]
            .trim_start()
            .strip_prefix('"')
            .ok_or_else(|| format!("expected '\"' to open value of label {}", name))?;

        // Parse the label
        let (value, rest) = parse_label_value(tail)?;
        if labels.iter().any(|(n, _)| n == name) {
            return Err(format!("duplicate label {}", name));
        }
        labels.push((name.to_string(), value));

        // Advance to next label
        tail = rest.trim_start();
        if let Some(rest) = tail.strip_prefix(',') {
            tail = rest;
        } else if !tail.starts_with('}') {
            return Err(format!("expected ',' or '}}' after value of label {}", name));
        }
    }
}

/// Unescapes a label value, starting just after its opening quote
fn parse_label_value(input: &str) -> Result<(String, &str), String> {
    let mut esc = String::new();
    let mut chars = input.char_indices();
    while let Some((i, ch)) = chars.next() {
        match ch {
            '\\' => match chars.next() {
                Some((_, 'n')) => esc.push('\n'),
                Some((_, ch @ '\\')) | Some((_, ch @ '"')) => esc.push(ch),
                Some((_, ch)) => return Err(format!("invalid escape sequence \\{}", ch)),
                None => break,
            },
            '"' => return Ok((esc, &input[i + 1..])),
            _ => esc.push(ch),
        }
    }
    Err("unterminated label value".to_string())
}

fn unescape_help(help: &str) -> String {
    let mut out = String::with_capacity(help.len());
    let mut chars = help.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('\\') => out.push('\\'),
            Some(ch) => {
                out.push('\\');
                out.push(ch);
            }
            None => out.push('\\'),
        }
    }
    out
}

fn parse_float(input: &str) -> Option<f64> {
    match input {
        "+Inf" | "Inf" => Some(f64::INFINITY),
        "-Inf" => Some(f64::NEG_INFINITY),
        "NaN" => Some(f64::NAN),
        _ => input.parse().ok(),
    }
}

fn is_valid_metric_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(ch) if ch.is_ascii_alphabetic() || ch == '_' || ch == ':' => (),
        _ => return false,
    }
    chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == ':')
}

fn is_valid_label_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(ch) if ch.is_ascii_alphabetic() || ch == '_' => (),
        _ => return false,
    }
    chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
}
