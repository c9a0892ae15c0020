use std::path::{Path, PathBuf};

use image::imageops::FilterType;
use log::{info, warn};
use ndarray::Array2;
use walkdir::WalkDir;

use crate::{Result, TrainErr};

/// A single labeled sample, `x` flattened.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub x: Vec<f32>,
    pub label: usize,
}

/// A batch of samples, one row each, with one-hot targets.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub x: Array2<f32>,
    pub y: Array2<f32>,
}

impl Batch {
    #[inline]
    pub fn len(&self) -> usize {
        self.x.nrows()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Random access to labeled samples.
pub trait Dataset: Send + Sync {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Width of every sample's `x`.
    fn n_features(&self) -> usize;

    fn n_classes(&self) -> usize;

    fn get(&self, idx: usize) -> Result<Sample>;
}

/// A dataset held entirely in memory.
#[derive(Debug, Clone)]
pub struct InMemoryDataset {
    xs: Vec<f32>,
    labels: Vec<usize>,
    n_features: usize,
    n_classes: usize,
}

impl InMemoryDataset {
    /// Creates a new dataset from owned buffers.
    ///
    /// # Arguments
    /// * `xs` - Row-major samples, `n_features` values each.
    /// * `labels` - The class of every sample.
    /// * `n_features` - Width of a sample.
    /// * `n_classes` - Amount of classes, every label must be below it.
    pub fn new(xs: Vec<f32>, labels: Vec<usize>, n_features: usize, n_classes: usize) -> Result<Self> {
        if n_features == 0 || xs.len() != labels.len() * n_features {
            return Err(TrainErr::Dataset(format!(
                "{} values don't make {} samples of {n_features} features",
                xs.len(),
                labels.len()
            )));
        }

        if let Some(bad) = labels.iter().find(|&&label| label >= n_classes) {
            return Err(TrainErr::Dataset(format!(
                "label {bad} out of range for {n_classes} classes"
            )));
        }

        Ok(Self {
            xs,
            labels,
            n_features,
            n_classes,
        })
    }
}

impl Dataset for InMemoryDataset {
    fn len(&self) -> usize {
        self.labels.len()
    }

    fn n_features(&self) -> usize {
        self.n_features
    }

    fn n_classes(&self) -> usize {
        self.n_classes
    }

    fn get(&self, idx: usize) -> Result<Sample> {
        let label = *self
            .labels
            .get(idx)
            .ok_or_else(|| TrainErr::Dataset(format!("sample {idx} out of range")))?;

        let start = idx * self.n_features;
        Ok(Sample {
            x: self.xs[start..start + self.n_features].to_vec(),
            label,
        })
    }
}

/// JPEG images laid out as `<root>/**/<class>/<file>.jpeg`, labeled by the name of
/// their parent directory.
#[derive(Debug, Clone)]
pub struct ImageFolder {
    files: Vec<(PathBuf, usize)>,
    image_size: u32,
    n_classes: usize,
}

impl ImageFolder {
    /// Discovers every image under `root`.
    ///
    /// # Arguments
    /// * `root` - The directory to search recursively.
    /// * `classes` - The known class names, a file's label is its parent's index in it.
    /// * `image_size` - The side images are resized to.
    ///
    /// # Returns
    /// The dataset, or an error if the directory can't be walked.
    pub fn open(root: impl AsRef<Path>, classes: &[String], image_size: u32) -> Result<Self> {
        let root = root.as_ref();
        let mut files = Vec::new();

        for entry in WalkDir::new(root).sort_by_file_name() {
            let entry = entry.map_err(|e| TrainErr::Dataset(e.to_string()))?;
            let path = entry.path();

            let is_jpeg = path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext.eq_ignore_ascii_case("jpeg") || ext.eq_ignore_ascii_case("jpg"));
            if !entry.file_type().is_file() || !is_jpeg {
                continue;
            }

            let class = path
                .parent()
                .and_then(|p| p.file_name())
                .and_then(|name| name.to_str());

            match class.and_then(|c| classes.iter().position(|known| known == c)) {
                Some(label) => files.push((path.to_path_buf(), label)),
                None => warn!("skipping {}, not under a known class", path.display()),
            }
        }

        info!(images = files.len(); "discovered dataset under {}", root.display());
        Ok(Self {
            files,
            image_size,
            n_classes: classes.len(),
        })
    }
}

impl Dataset for ImageFolder {
    fn len(&self) -> usize {
        self.files.len()
    }

    fn n_features(&self) -> usize {
        let side = self.image_size as usize;
        3 * side * side
    }

    fn n_classes(&self) -> usize {
        self.n_classes
    }

    /// Decodes, resizes and scales an image to `[0, 1]`, channels first.
    fn get(&self, idx: usize) -> Result<Sample> {
        let (path, label) = self
            .files
            .get(idx)
            .ok_or_else(|| TrainErr::Dataset(format!("sample {idx} out of range")))?;

        let side = self.image_size;
        let img = image::open(path)?
            .resize_exact(side, side, FilterType::Triangle)
            .to_rgb8();

        let plane = (side * side) as usize;
        let mut x = vec![0.0; 3 * plane];
        for (i, pixel) in img.pixels().enumerate() {
            for (c, &v) in pixel.0.iter().enumerate() {
                x[c * plane + i] = f32::from(v) / 255.0;
            }
        }

        Ok(Sample { x, label: *label })
    }
}
