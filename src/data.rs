//! CSV data partitions and the light preprocessing the test supports before
//! fitting: value replacement, binarization and feature/target selection.

use crate::circularity::CircularityError;
use crate::config::{BinarizeSpec, CircularityConfig, ReplaceSpec};
use csv::{ReaderBuilder, StringRecord};
use ndarray::{Array1, Array2, Axis};
use std::collections::HashSet;
use std::io::Read;
use std::path::Path;

/// A numeric table with named columns.
#[derive(Clone, Debug)]
pub struct Dataset {
    pub headers: Vec<String>,
    pub values: Array2<f64>,
}

/// Feature matrix and response of one partition, columns in feature order.
#[derive(Clone, Debug)]
pub struct Partition {
    pub x: Array2<f64>,
    pub y: Array1<f64>,
}

#[derive(Clone, Debug)]
pub struct TrainTestData {
    /// Sorted feature names; column `j` of every `x` holds `features[j]`.
    pub features: Vec<String>,
    pub train: Partition,
    pub test: Option<Partition>,
}

impl Dataset {
    pub fn from_csv_path(
        path: &Path,
        preprocess: Option<&ReplaceSpec>,
    ) -> Result<Self, CircularityError> {
        let rdr = ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_path(path)
            .map_err(|e| {
                CircularityError::InvalidInput(format!(
                    "failed to open csv '{}': {e}",
                    path.display()
                ))
            })?;
        Self::from_csv_reader(rdr, preprocess)
    }

    pub fn from_csv_str(raw: &str, preprocess: Option<&ReplaceSpec>) -> Result<Self, CircularityError> {
        let rdr = ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_reader(raw.as_bytes());
        Self::from_csv_reader(rdr, preprocess)
    }

    fn from_csv_reader<R: Read>(
        mut rdr: csv::Reader<R>,
        preprocess: Option<&ReplaceSpec>,
    ) -> Result<Self, CircularityError> {
        let headers = rdr
            .headers()?
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>();
        if headers.is_empty() {
            return Err(CircularityError::InvalidInput("csv has no headers".to_string()));
        }

        let replaced: HashSet<usize> = match preprocess {
            Some(spec) => spec
                .columns
                .iter()
                .map(|c| header_pos(&headers, c))
                .collect::<Result<_, _>>()?,
            None => HashSet::new(),
        };

        let mut records = Vec::<StringRecord>::new();
        for rec in rdr.records() {
            let record = rec?;
            if record.len() != headers.len() {
                return Err(CircularityError::InvalidInput(format!(
                    "csv row width mismatch: got {} fields, expected {}",
                    record.len(),
                    headers.len()
                )));
            }
            records.push(record);
        }
        if records.is_empty() {
            return Err(CircularityError::InvalidInput("csv has no rows".to_string()));
        }

        let mut values = Array2::<f64>::zeros((records.len(), headers.len()));
        for (i, rec) in records.iter().enumerate() {
            for (j, raw) in rec.iter().enumerate() {
                let replacement = preprocess
                    .filter(|_| replaced.contains(&j))
                    .and_then(|spec| spec.replace.get(raw).copied());
                let val = match replacement {
                    Some(v) => v,
                    None => raw.parse::<f64>().map_err(|_| {
                        CircularityError::InvalidInput(format!(
                            "non-numeric value '{raw}' at row {}, column '{}'",
                            i + 1,
                            headers[j]
                        ))
                    })?,
                };
                if !val.is_finite() {
                    return Err(CircularityError::InvalidInput(format!(
                        "non-finite value at row {}, column '{}'",
                        i + 1,
                        headers[j]
                    )));
                }
                values[[i, j]] = val;
            }
        }

        Ok(Self { headers, values })
    }

    pub fn nrows(&self) -> usize {
        self.values.nrows()
    }

    pub fn column_index(&self, name: &str) -> Result<usize, CircularityError> {
        header_pos(&self.headers, name)
    }

    /// Combines (sums) columns into a new one if requested, then maps every
    /// listed column to `0.0` where it is zero and `1.0` elsewhere.
    pub fn binarize(&mut self, spec: &BinarizeSpec) -> Result<(), CircularityError> {
        if let Some(combine) = &spec.combine {
            let idx = combine
                .columns
                .iter()
                .map(|c| self.column_index(c))
                .collect::<Result<Vec<_>, _>>()?;
            let mut combined = Array1::<f64>::zeros(self.nrows());
            for &j in &idx {
                combined += &self.values.column(j);
            }
            match self.headers.iter().position(|h| *h == combine.name) {
                Some(j) => self.values.column_mut(j).assign(&combined),
                None => {
                    self.values
                        .push_column(combined.view())
                        .map_err(|e| CircularityError::InvalidInput(e.to_string()))?;
                    self.headers.push(combine.name.clone());
                }
            }
        }
        for name in &spec.columns {
            let j = self.column_index(name)?;
            self.values
                .column_mut(j)
                .mapv_inplace(|v| if v == 0.0 { 0.0 } else { 1.0 });
        }
        Ok(())
    }

    /// All columns except the target, sorted by name.
    pub fn infer_features(&self, target: &str) -> Vec<String> {
        let mut features: Vec<String> = self
            .headers
            .iter()
            .filter(|h| h.as_str() != target)
            .cloned()
            .collect();
        features.sort();
        features
    }

    pub fn select(&self, features: &[String], target: &str) -> Result<Partition, CircularityError> {
        let idx = features
            .iter()
            .map(|f| self.column_index(f))
            .collect::<Result<Vec<_>, _>>()?;
        let y_idx = self.column_index(target)?;
        let x = self.values.select(Axis(1), &idx);
        let y = self.values.column(y_idx).to_owned();
        Ok(Partition { x, y })
    }
}

fn header_pos(headers: &[String], name: &str) -> Result<usize, CircularityError> {
    headers
        .iter()
        .position(|h| h == name)
        .ok_or_else(|| CircularityError::InvalidInput(format!("column '{name}' not found in data header")))
}

fn prepare(dataset: &mut Dataset, config: &CircularityConfig) -> Result<(), CircularityError> {
    if let Some(spec) = &config.data.binarize {
        dataset.binarize(spec)?;
    }
    Ok(())
}

/// Loads the train (and optional test) partitions named by the configuration.
pub fn load_data(config: &CircularityConfig) -> Result<TrainTestData, CircularityError> {
    let target = config.target.column()?;
    let train_path = config.data.train.as_ref().ok_or_else(|| {
        CircularityError::InvalidInput("a training data path is required under data.train".to_string())
    })?;

    let mut train = Dataset::from_csv_path(train_path, config.data.preprocess.as_ref())?;
    prepare(&mut train, config)?;
    let features = match config.declared_features() {
        Some(features) => features,
        None => train.infer_features(target),
    };
    if features.is_empty() {
        return Err(CircularityError::InvalidInput("the feature set is empty".to_string()));
    }
    let train_part = train.select(&features, target)?;
    log::info!(
        "loaded training data: {} rows, {} features",
        train_part.x.nrows(),
        features.len()
    );

    let test_part = match &config.data.test {
        Some(path) => {
            let mut test = Dataset::from_csv_path(path, config.data.preprocess.as_ref())?;
            prepare(&mut test, config)?;
            Some(test.select(&features, target)?)
        }
        None => None,
    };

    Ok(TrainTestData {
        features,
        train: train_part,
        test: test_part,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CombineSpec;
    use std::collections::BTreeMap;

    const CSV: &str = "b,a,cited,y\n1.0,2.0,yes,0\n3.0,4.0,no,1\n0.0,0.5,yes,1\n";

    fn replace_spec() -> ReplaceSpec {
        let mut replace = BTreeMap::new();
        replace.insert("yes".to_string(), 1.0);
        replace.insert("no".to_string(), 0.0);
        ReplaceSpec {
            columns: vec!["cited".to_string()],
            replace,
        }
    }

    #[test]
    fn replacement_maps_categorical_cells() {
        let ds = Dataset::from_csv_str(CSV, Some(&replace_spec())).expect("dataset");
        assert_eq!(ds.headers, vec!["b", "a", "cited", "y"]);
        let cited = ds.values.column(2).to_vec();
        assert_eq!(cited, vec![1.0, 0.0, 1.0]);
    }

    #[test]
    fn non_numeric_cells_without_replacement_fail() {
        let err = Dataset::from_csv_str(CSV, None).expect_err("must fail");
        assert!(matches!(err, CircularityError::InvalidInput(_)));
    }

    #[test]
    fn inferred_features_are_sorted_and_exclude_target() {
        let ds = Dataset::from_csv_str(CSV, Some(&replace_spec())).expect("dataset");
        assert_eq!(ds.infer_features("y"), vec!["a", "b", "cited"]);
    }

    #[test]
    fn selection_follows_feature_order() {
        let ds = Dataset::from_csv_str(CSV, Some(&replace_spec())).expect("dataset");
        let part = ds
            .select(&["a".to_string(), "b".to_string()], "y")
            .expect("select");
        assert_eq!(part.x.row(0).to_vec(), vec![2.0, 1.0]);
        assert_eq!(part.y.to_vec(), vec![0.0, 1.0, 1.0]);
        assert!(ds.select(&["missing".to_string()], "y").is_err());
    }

    #[test]
    fn binarize_combines_then_thresholds() {
        let mut ds = Dataset::from_csv_str(CSV, Some(&replace_spec())).expect("dataset");
        ds.binarize(&BinarizeSpec {
            columns: vec!["b".to_string(), "ab".to_string()],
            combine: Some(CombineSpec {
                columns: vec!["a".to_string(), "b".to_string()],
                name: "ab".to_string(),
            }),
        })
        .expect("binarize");
        let ab = ds.column_index("ab").expect("combined column");
        assert_eq!(ds.values.column(ab).to_vec(), vec![1.0, 1.0, 1.0]);
        let b = ds.column_index("b").expect("b");
        assert_eq!(ds.values.column(b).to_vec(), vec![1.0, 1.0, 0.0]);
    }
}
