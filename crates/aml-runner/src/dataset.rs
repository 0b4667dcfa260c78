use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};
use crate::platform::Platform;
use crate::workspace::Workspace;

/// Client-side handle to a registered remote tabular dataset.
///
/// Projections produce new values; the stored dataset is never touched. The
/// platform applies `dropped_columns` when the handle is used as training
/// data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabularDataset {
    pub id: String,
    pub name: String,
    pub version: String,
    pub columns: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_count: Option<u64>,
    #[serde(default)]
    pub dropped_columns: Vec<String>,
}

impl TabularDataset {
    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c == name)
    }

    /// Same rows, without `names`. Every name must be in the current schema;
    /// otherwise nothing is dropped and all missing names are reported.
    pub fn drop_columns<S: AsRef<str>>(&self, names: &[S]) -> Result<TabularDataset> {
        let names: Vec<&str> = names.iter().map(AsRef::<str>::as_ref).collect();
        let missing: Vec<String> = names
            .iter()
            .filter(|n| !self.has_column(n))
            .map(|n| n.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(Error::schema_mismatch(
                format!("drop_columns on dataset '{}'", self.name),
                missing,
            ));
        }

        let mut projected = self.clone();
        projected.columns.retain(|c| !names.contains(&c.as_str()));
        for name in names {
            if !projected.dropped_columns.iter().any(|d| d == name) {
                projected.dropped_columns.push(name.to_string());
            }
        }
        Ok(projected)
    }
}

/// Fetches a dataset by name and applies the requested projection.
pub fn load_dataset(
    platform: &dyn Platform,
    workspace: &Workspace,
    name: &str,
    version: Option<&str>,
    drop: &[String],
) -> Result<TabularDataset> {
    let dataset = platform.get_dataset(workspace, name, version)?;
    info!(
        dataset = %dataset.name,
        version = %dataset.version,
        columns = dataset.columns.len(),
        "loaded dataset"
    );
    if drop.is_empty() {
        return Ok(dataset);
    }
    let projected = dataset.drop_columns(drop)?;
    info!(
        dataset = %projected.name,
        dropped = ?drop,
        remaining = projected.columns.len(),
        "projected dataset columns"
    );
    Ok(projected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{sample_dataset, test_workspace, FakePlatform};

    #[test]
    fn dropping_sha_and_title_leaves_cluster_and_vectors() {
        let ds = sample_dataset();
        let projected = ds.drop_columns(&["sha", "title"]).expect("projection");

        let mut expected = vec!["cluster".to_string()];
        expected.extend((1..=10).map(|i| format!("vec{}", i)));
        assert_eq!(projected.columns, expected);
        assert_eq!(projected.row_count, ds.row_count);
        assert_eq!(projected.dropped_columns, vec!["sha", "title"]);
    }

    #[test]
    fn projection_leaves_source_untouched() {
        let ds = sample_dataset();
        let before = ds.clone();
        let _ = ds.drop_columns(&["sha"]).expect("projection");
        assert_eq!(ds, before);
    }

    #[test]
    fn missing_column_fails_and_lists_every_absent_name() {
        let ds = sample_dataset();
        let err = ds
            .drop_columns(&["sha", "author", "year"])
            .expect_err("absent columns");
        match err {
            Error::SchemaMismatch { missing, .. } => assert_eq!(missing, vec!["author", "year"]),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn chained_projections_accumulate_dropped_columns() {
        let ds = sample_dataset();
        let once = ds.drop_columns(&["sha"]).expect("first");
        let twice = once.drop_columns(&["title"]).expect("second");
        assert_eq!(twice.dropped_columns, vec!["sha", "title"]);
        assert!(once.drop_columns(&["sha"]).is_err());
    }

    #[test]
    fn load_dataset_applies_projection() {
        let platform = FakePlatform::new().with_dataset(sample_dataset());
        let ds = load_dataset(
            &platform,
            &test_workspace(),
            "papers",
            None,
            &["sha".to_string(), "title".to_string()],
        )
        .expect("load");
        assert!(!ds.has_column("sha"));
        assert!(ds.has_column("cluster"));
    }

    #[test]
    fn load_dataset_reports_unknown_name() {
        let platform = FakePlatform::new();
        let err = load_dataset(&platform, &test_workspace(), "nope", None, &[])
            .expect_err("unknown dataset");
        assert!(matches!(err, Error::NotFound { kind: "dataset", .. }));
    }
}
