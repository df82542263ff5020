use anyhow::{Context, Result, bail};
use rand::Rng;
use rand::seq::SliceRandom;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use crate::config::SampleLimit;
use crate::types::{ImageRef, Indicator, RawLabels, Task};

const LABELS_FILE: &str = "L2_Labels_Predict.txt";
const SAMPLE_ID_COLUMN: &str = "SID";

/// Cell values the label export uses for "no value", matched exactly.
const NA_TOKENS: [&str; 19] = [
    "", "#N/A", "#N/A N/A", "#NA", "-1.#IND", "-1.#QNAN", "-NaN", "-nan", "1.#IND", "1.#QNAN",
    "<NA>", "N/A", "NA", "NULL", "NaN", "None", "n/a", "nan", "null",
];

#[derive(Debug, Clone, PartialEq)]
pub struct GroundTruthRow {
    pub sample_id: String,
    pub labels: RawLabels,
}

/// Ground-truth rows plus the image index of a dataset directory.
#[derive(Debug)]
pub struct Dataset {
    rows: Vec<GroundTruthRow>,
    images: HashMap<String, PathBuf>,
}

impl Dataset {
    /// Load `<root>/Phenotypes/L2_Labels_Predict.txt` and index
    /// `<root>/TongueImage/Raw/*` by file stem.
    #[tracing::instrument(skip(root), fields(root = %root.display()))]
    pub fn load(root: &Path) -> Result<Self> {
        let phenotypes_dir = root.join("Phenotypes");
        let images_dir = root.join("TongueImage").join("Raw");
        for dir in [root, phenotypes_dir.as_path(), images_dir.as_path()] {
            if !dir.is_dir() {
                bail!("Data directory does not exist: {}", dir.display());
            }
        }

        let labels_path = phenotypes_dir.join(LABELS_FILE);
        let contents = std::fs::read_to_string(&labels_path)
            .with_context(|| format!("Failed to read labels file {}", labels_path.display()))?;
        let rows = parse_ground_truth(&contents)
            .with_context(|| format!("Failed to parse labels file {}", labels_path.display()))?;
        tracing::info!(rows = rows.len(), "Loaded ground-truth labels");

        let images = index_images(&images_dir)?;
        tracing::info!(images = images.len(), "Indexed image files");

        let dataset = Self { rows, images };
        let missing = dataset
            .rows
            .iter()
            .filter(|row| !dataset.images.contains_key(&row.sample_id))
            .inspect(|row| tracing::warn!(sample_id = %row.sample_id, "No image found for sample"))
            .count();
        if missing > 0 {
            tracing::warn!(missing, "Some samples have no image");
        }
        Ok(dataset)
    }

    pub fn from_parts(rows: Vec<GroundTruthRow>, images: HashMap<String, PathBuf>) -> Self {
        Self { rows, images }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Build tasks for the whole dataset or a random subset without replacement.
    pub fn tasks(&self, limit: SampleLimit) -> Vec<Task> {
        self.tasks_with_rng(limit, &mut rand::thread_rng())
    }

    pub fn tasks_with_rng<R: Rng + ?Sized>(&self, limit: SampleLimit, rng: &mut R) -> Vec<Task> {
        let selected: Vec<&GroundTruthRow> = match limit {
            SampleLimit::Count(n) if n < self.rows.len() => {
                tracing::info!(samples = n, "Using random samples for evaluation");
                self.rows.choose_multiple(rng, n).collect()
            }
            _ => {
                tracing::info!(samples = self.rows.len(), "Using all samples for evaluation");
                self.rows.iter().collect()
            }
        };

        selected
            .into_iter()
            .map(|row| Task {
                sample_id: row.sample_id.clone(),
                image: self
                    .images
                    .get(&row.sample_id)
                    .map_or(ImageRef::Unresolved, |path| ImageRef::Path(path.clone())),
                ground_truth: row.labels.clone(),
            })
            .collect()
    }
}

/// Parse the tab-separated label table. Empty cells and the usual NA
/// spellings (`NA`, `N/A`, `#N/A`, `NULL`, ...) are absent labels;
/// duplicate sample IDs keep their first row.
pub fn parse_ground_truth(contents: &str) -> Result<Vec<GroundTruthRow>> {
    let mut lines = contents.lines().filter(|line| !line.trim().is_empty());
    let header: Vec<&str> = lines
        .next()
        .context("Labels file is empty")?
        .split('\t')
        .map(str::trim)
        .collect();

    let sid_column = header
        .iter()
        .position(|&name| name == SAMPLE_ID_COLUMN)
        .with_context(|| format!("Labels file has no {SAMPLE_ID_COLUMN} column"))?;
    let indicator_columns = Indicator::ALL
        .into_iter()
        .map(|indicator| {
            header
                .iter()
                .position(|&name| name == indicator.key())
                .map(|column| (indicator, column))
                .with_context(|| format!("Labels file has no {indicator} column"))
        })
        .collect::<Result<Vec<_>>>()?;

    let mut seen = HashSet::new();
    let mut rows = Vec::new();
    for (line_number, line) in lines.enumerate() {
        let cells: Vec<&str> = line.split('\t').map(str::trim).collect();
        let Some(sample_id) = cells.get(sid_column).filter(|id| !id.is_empty()) else {
            tracing::warn!(line = line_number + 2, "Skipping row without a sample ID");
            continue;
        };
        if !seen.insert(sample_id.to_string()) {
            tracing::warn!(sample_id = %sample_id, "Skipping duplicate sample ID");
            continue;
        }

        let labels = indicator_columns
            .iter()
            .map(|&(indicator, column)| {
                let cell = cells
                    .get(column)
                    .filter(|cell| !NA_TOKENS.contains(*cell))
                    .map(|cell| cell.to_string());
                (indicator, cell)
            })
            .collect();
        rows.push(GroundTruthRow {
            sample_id: sample_id.to_string(),
            labels,
        });
    }
    Ok(rows)
}

fn index_images(dir: &Path) -> Result<HashMap<String, PathBuf>> {
    let mut images = HashMap::new();
    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("Failed to list images in {}", dir.display()))?;
    for entry in entries {
        let path = entry?.path();
        if !path.is_file() || path.extension().is_none() {
            continue;
        }
        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
            images.insert(stem.to_string(), path.clone());
        }
    }
    Ok(images)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::label::{MISSING_LABEL, normalize};
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::fs;

    const TABLE: &str = "SID\tcoating_label\ttai_label\tzhi_label\tfissure_label\ttooth_mk_label\textra\n\
S001\tgreasy\twhite\tregular\t\tlight\tx\n\
S002\tnon_greasy\tyellow\tdark\tsevere\tnan\ty\n\
S002\tgreasy\twhite\tregular\t\t\tz\n\
\n\
S003\tgreasy_thick\tlight_yellow\tlight\tlight\n";

    #[test]
    fn parses_rows_and_blank_cells() {
        let rows = parse_ground_truth(TABLE).unwrap();
        assert_eq!(rows.len(), 3);

        assert_eq!(rows[0].sample_id, "S001");
        assert_eq!(rows[0].labels[&Indicator::FissureLabel], None);
        assert_eq!(rows[0].labels[&Indicator::ToothMkLabel].as_deref(), Some("light"));

        // Duplicate S002 keeps the first row.
        assert_eq!(rows[1].labels[&Indicator::CoatingLabel].as_deref(), Some("non_greasy"));
        assert_eq!(rows[1].labels[&Indicator::ToothMkLabel], None);

        // Short row: trailing cell is absent.
        assert_eq!(rows[2].labels[&Indicator::ToothMkLabel], None);
    }

    #[test]
    fn na_spellings_are_absent_labels() {
        let table = "SID\tcoating_label\ttai_label\tzhi_label\tfissure_label\ttooth_mk_label\n\
S001\tNA\tN/A\t#N/A\t<NA>\tNULL\n\
S002\tn/a\t-nan\tNone\tNA \tnA\n";
        let rows = parse_ground_truth(table).unwrap();

        for indicator in Indicator::ALL {
            assert_eq!(rows[0].labels[&indicator], None, "{indicator}");
            assert_eq!(normalize(rows[0].labels[&indicator].as_deref()), MISSING_LABEL);
        }
        assert_eq!(rows[1].labels[&Indicator::CoatingLabel], None);
        assert_eq!(rows[1].labels[&Indicator::TaiLabel], None);
        assert_eq!(rows[1].labels[&Indicator::ZhiLabel], None);
        // Cells are trimmed before matching; other casings are kept as labels.
        assert_eq!(rows[1].labels[&Indicator::FissureLabel], None);
        assert_eq!(rows[1].labels[&Indicator::ToothMkLabel].as_deref(), Some("nA"));
    }

    #[test]
    fn missing_columns_are_fatal() {
        assert!(parse_ground_truth("").is_err());
        assert!(parse_ground_truth("ID\tcoating_label\n1\tgreasy\n").is_err());
        let err = parse_ground_truth("SID\tcoating_label\nS1\tgreasy\n").unwrap_err();
        assert!(err.to_string().contains("tai_label"));
    }

    fn write_dataset() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let phenotypes = dir.path().join("Phenotypes");
        let images = dir.path().join("TongueImage").join("Raw");
        fs::create_dir_all(&phenotypes).unwrap();
        fs::create_dir_all(&images).unwrap();
        fs::write(phenotypes.join(LABELS_FILE), TABLE).unwrap();
        fs::write(images.join("S001.jpg"), b"one").unwrap();
        fs::write(images.join("S003.png"), b"three").unwrap();
        dir
    }

    #[test]
    fn load_links_images_by_stem() {
        let dir = write_dataset();
        let dataset = Dataset::load(dir.path()).unwrap();
        assert_eq!(dataset.len(), 3);

        let tasks = dataset.tasks(SampleLimit::All);
        let image_of = |id: &str| {
            tasks
                .iter()
                .find(|t| t.sample_id == id)
                .map(|t| t.image.clone())
                .unwrap()
        };
        assert!(matches!(image_of("S001"), ImageRef::Path(p) if p.ends_with("S001.jpg")));
        assert_eq!(image_of("S002"), ImageRef::Unresolved);
        assert!(matches!(image_of("S003"), ImageRef::Path(_)));
    }

    #[test]
    fn load_requires_directories() {
        let dir = tempfile::tempdir().unwrap();
        let err = Dataset::load(dir.path()).unwrap_err();
        assert!(err.to_string().contains("Phenotypes"));
    }

    #[test]
    fn sample_limit_picks_distinct_rows() {
        let rows = (0..50)
            .map(|i| GroundTruthRow {
                sample_id: format!("S{i:03}"),
                labels: RawLabels::new(),
            })
            .collect();
        let dataset = Dataset::from_parts(rows, HashMap::new());
        let mut rng = StdRng::seed_from_u64(7);

        let tasks = dataset.tasks_with_rng(SampleLimit::Count(10), &mut rng);
        assert_eq!(tasks.len(), 10);
        let unique: HashSet<_> = tasks.iter().map(|t| t.sample_id.clone()).collect();
        assert_eq!(unique.len(), 10);

        assert_eq!(dataset.tasks_with_rng(SampleLimit::Count(80), &mut rng).len(), 50);
        assert_eq!(dataset.tasks_with_rng(SampleLimit::All, &mut rng).len(), 50);
    }
}
