//! Training and inference data loaded from raw string tables
//!
//! A raw table is a header row followed by one row per sample. The first
//! schema column is the sample identifier; feature columns are looked up by
//! name so a party's table may carry extra columns.

use fedgb_core::{Error, FeatureId, Features, Result, SampleId};
use std::collections::{HashMap, HashSet};

/// Split aligned uids into (train, test) by test position
pub fn split_uids(uids: &[String], test_index: &[usize]) -> (Vec<String>, Vec<String>) {
    let test: HashSet<usize> = test_index.iter().copied().collect();
    let (test_uids, train_uids): (Vec<_>, Vec<_>) = uids
        .iter()
        .enumerate()
        .partition(|(i, _)| test.contains(i));
    (
        train_uids.into_iter().map(|(_, u)| u.clone()).collect(),
        test_uids.into_iter().map(|(_, u)| u.clone()).collect(),
    )
}

fn header_index(header: &[String], name: &str) -> Result<usize> {
    header
        .iter()
        .position(|h| h == name)
        .ok_or_else(|| Error::InvalidData {
            message: format!("column {name} not found in header"),
        })
}

fn parse_value(raw: &str, column: &str, uid: &str) -> Result<f64> {
    raw.trim().parse::<f64>().map_err(|_| Error::InvalidData {
        message: format!("column {column} of sample {uid} is not numeric: {raw:?}"),
    })
}

/// Column positions of the identifier, features and label in a raw header
struct ColumnLayout {
    uid: usize,
    features: Vec<(String, usize)>,
    label: Option<usize>,
}

impl ColumnLayout {
    fn resolve(raw: &[Vec<String>], features: &Features, with_label: bool) -> Result<Self> {
        let header = raw.first().ok_or_else(|| Error::InvalidData {
            message: "raw table has no header row".to_string(),
        })?;
        let uid_name = features.uid_name().ok_or_else(|| Error::InvalidData {
            message: "feature schema is empty".to_string(),
        })?;

        let uid = header_index(header, uid_name)?;
        let features_idx = features
            .feature_columns()
            .into_iter()
            .map(|f| Ok((f.name.clone(), header_index(header, &f.name)?)))
            .collect::<Result<Vec<_>>>()?;
        let label = match (&features.label, with_label) {
            (Some(name), true) => Some(header_index(header, name)?),
            _ => None,
        };

        Ok(Self {
            uid,
            features: features_idx,
            label,
        })
    }

    fn cell<'a>(&self, row: &'a [String], idx: usize) -> Result<&'a str> {
        row.get(idx).map(String::as_str).ok_or_else(|| Error::InvalidData {
            message: format!("row is shorter than column {idx}"),
        })
    }
}

/// Column-major training data of one party, ordered by the aligned uids
#[derive(Debug, Clone)]
pub struct BoostTrainData {
    uids: Vec<String>,
    feature_names: Vec<String>,
    /// columns[col - 1][sample]
    columns: Vec<Vec<f64>>,
    label: Option<Vec<f64>>,
}

impl BoostTrainData {
    /// Load the rows of `uids` (in that order) from a raw table
    pub fn new(raw: &[Vec<String>], uids: &[String], features: &Features) -> Result<Self> {
        let layout = ColumnLayout::resolve(raw, features, true)?;

        let mut rows: HashMap<&str, &Vec<String>> = HashMap::with_capacity(raw.len());
        for row in raw.iter().skip(1) {
            rows.insert(layout.cell(row, layout.uid)?, row);
        }

        let mut columns = vec![Vec::with_capacity(uids.len()); layout.features.len()];
        let mut label = layout.label.map(|_| Vec::with_capacity(uids.len()));

        for uid in uids {
            let row = rows.get(uid.as_str()).ok_or_else(|| Error::InvalidData {
                message: format!("sample {uid} missing from raw table"),
            })?;
            for ((name, idx), column) in layout.features.iter().zip(columns.iter_mut()) {
                column.push(parse_value(layout.cell(row, *idx)?, name, uid)?);
            }
            if let (Some(idx), Some(label)) = (layout.label, label.as_mut()) {
                label.push(parse_value(layout.cell(row, idx)?, "label", uid)?);
            }
        }

        Ok(Self {
            uids: uids.to_vec(),
            feature_names: layout.features.into_iter().map(|(n, _)| n).collect(),
            columns,
            label,
        })
    }

    pub fn dataset_size(&self) -> usize {
        self.uids.len()
    }

    /// Number of feature columns, excluding identifier and label
    pub fn feature_dim(&self) -> usize {
        self.columns.len()
    }

    pub fn uids(&self) -> &[String] {
        &self.uids
    }

    pub fn feature_names(&self) -> &[String] {
        &self.feature_names
    }

    pub fn label(&self) -> Option<&[f64]> {
        self.label.as_deref()
    }

    /// (sample id, value) pairs of a 1-based column restricted to an instance space
    pub fn feature(&self, instance_space: &[SampleId], col: FeatureId) -> Result<Vec<(SampleId, f64)>> {
        let column = col
            .checked_sub(1)
            .and_then(|c| self.columns.get(c))
            .ok_or_else(|| Error::InvalidData {
                message: format!("feature column {col} out of range"),
            })?;

        instance_space
            .iter()
            .map(|&id| {
                column
                    .get(id)
                    .map(|v| (id, *v))
                    .ok_or_else(|| Error::InvalidData {
                        message: format!("sample {id} out of range"),
                    })
            })
            .collect()
    }
}

/// Row-major inference data of one party
#[derive(Debug, Clone)]
pub struct InferenceData {
    uids: Vec<String>,
    /// samples[row][col - 1]
    samples: Vec<Vec<f64>>,
}

impl InferenceData {
    /// Load every row of a raw table; the label column is not required
    pub fn new(raw: &[Vec<String>], features: &Features) -> Result<Self> {
        let layout = ColumnLayout::resolve(raw, features, false)?;

        let mut uids = Vec::with_capacity(raw.len().saturating_sub(1));
        let mut samples = Vec::with_capacity(raw.len().saturating_sub(1));
        for row in raw.iter().skip(1) {
            let uid = layout.cell(row, layout.uid)?;
            let values = layout
                .features
                .iter()
                .map(|(name, idx)| parse_value(layout.cell(row, *idx)?, name, uid))
                .collect::<Result<Vec<_>>>()?;
            uids.push(uid.to_string());
            samples.push(values);
        }

        Ok(Self { uids, samples })
    }

    pub fn uids(&self) -> &[String] {
        &self.uids
    }

    pub fn len(&self) -> usize {
        self.uids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.uids.is_empty()
    }

    /// Re-order rows to the coordinator's uid list
    ///
    /// Uids absent locally get a row of NaN, which routes left at every
    /// split. Returns the absent uids.
    pub fn filter_other_uid(&mut self, uids: &[String]) -> Vec<String> {
        let width = self.samples.first().map_or(0, Vec::len);
        let mut by_uid: HashMap<String, Vec<f64>> = self
            .uids
            .drain(..)
            .zip(self.samples.drain(..))
            .collect();

        let mut missing = Vec::new();
        for uid in uids {
            let row = by_uid.remove(uid).unwrap_or_else(|| {
                missing.push(uid.clone());
                vec![f64::NAN; width]
            });
            self.uids.push(uid.clone());
            self.samples.push(row);
        }
        missing
    }

    /// Value of a 1-based feature column for a sample row
    pub fn value(&self, sample: SampleId, feature: FeatureId) -> Option<f64> {
        feature
            .checked_sub(1)
            .and_then(|f| self.samples.get(sample)?.get(f))
            .copied()
    }
}

/// Uids from `requested` that are absent from a party's raw table
pub fn inference_init(requested: &[String], raw: &[Vec<String>], features: &Features) -> Result<Vec<usize>> {
    let layout = ColumnLayout::resolve(raw, features, false)?;
    let present = raw
        .iter()
        .skip(1)
        .map(|row| layout.cell(row, layout.uid))
        .collect::<Result<HashSet<_>>>()?;

    Ok(requested
        .iter()
        .enumerate()
        .filter(|(_, uid)| !present.contains(uid.as_str()))
        .map(|(i, _)| i)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(rows: &[&[&str]]) -> Vec<Vec<String>> {
        rows.iter()
            .map(|r| r.iter().map(|c| c.to_string()).collect())
            .collect()
    }

    fn uids(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_split_uids() {
        let (train, test) = split_uids(&uids(&["a", "b", "c", "d"]), &[1, 3]);
        assert_eq!(train, uids(&["a", "c"]));
        assert_eq!(test, uids(&["b", "d"]));
    }

    #[test]
    fn test_train_data_follows_uid_order() {
        let raw = table(&[
            &["uid", "x1", "x2", "y"],
            &["a", "1.0", "10", "0"],
            &["b", "2.0", "20", "1"],
            &["c", "3.0", "30", "1"],
        ]);
        let features = Features::from_names("uid", &["x2", "x1"], Some("y"));
        let data = BoostTrainData::new(&raw, &uids(&["c", "a"]), &features).unwrap();

        assert_eq!(data.dataset_size(), 2);
        assert_eq!(data.feature_dim(), 2);
        assert_eq!(data.feature_names(), &["x2".to_string(), "x1".to_string()]);
        assert_eq!(data.label(), Some(&[1.0, 0.0][..]));
        assert_eq!(data.feature(&[0, 1], 1).unwrap(), vec![(0, 30.0), (1, 10.0)]);
        assert_eq!(data.feature(&[1], 2).unwrap(), vec![(1, 1.0)]);
        assert!(data.feature(&[0], 3).is_err());
        assert!(data.feature(&[5], 1).is_err());
    }

    #[test]
    fn test_train_data_errors() {
        let raw = table(&[&["uid", "x1"], &["a", "oops"]]);
        let features = Features::from_names("uid", &["x1"], None);
        assert!(matches!(
            BoostTrainData::new(&raw, &uids(&["a"]), &features),
            Err(Error::InvalidData { .. })
        ));
        assert!(BoostTrainData::new(&raw, &uids(&["zz"]), &features).is_err());

        let missing_column = Features::from_names("uid", &["x9"], None);
        assert!(BoostTrainData::new(&raw, &uids(&["a"]), &missing_column).is_err());
    }

    #[test]
    fn test_inference_filter() {
        let raw = table(&[&["uid", "x1"], &["a", "1"], &["b", "2"]]);
        let features = Features::from_names("uid", &["x1"], Some("y"));
        let mut data = InferenceData::new(&raw, &features).unwrap();

        let missing = data.filter_other_uid(&uids(&["b", "z", "a"]));
        assert_eq!(missing, uids(&["z"]));
        assert_eq!(data.uids(), &uids(&["b", "z", "a"])[..]);
        assert_eq!(data.value(0, 1), Some(2.0));
        assert!(data.value(1, 1).unwrap().is_nan());
        assert_eq!(data.value(2, 1), Some(1.0));
        assert_eq!(data.value(2, 0), None);

        let absent = inference_init(&uids(&["a", "q"]), &raw, &features).unwrap();
        assert_eq!(absent, vec![1]);
    }
}
