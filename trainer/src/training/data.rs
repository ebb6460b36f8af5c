use crate::collective::Tensor;
use crate::errors::{Result, TrainerError};

/// One mini-batch; the leading dimension of both tensors is the sample count.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub inputs: Tensor,
    pub labels: Tensor,
}

impl Batch {
    pub fn samples(&self) -> usize {
        self.inputs.shape.first().copied().unwrap_or(0)
    }
}

/// Source of training batches.
///
/// `batches()` restarts from the beginning on every call, so it can be used
/// once per epoch.
pub trait Dataset: Send + Sync {
    fn batches(&self) -> Box<dyn Iterator<Item = Batch> + Send + '_>;

    /// Number of samples
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Switch to a new batch size for the following epochs.
    fn rebatch(&mut self, batch_size: usize) -> Result<()> {
        Err(TrainerError::Config(format!(
            "Dataset cannot change its batch size to {}",
            batch_size
        )))
    }
}

/// Row-major samples held in memory, split into fixed-size batches.
#[derive(Debug, Clone)]
pub struct InMemoryDataset {
    inputs: Tensor,
    labels: Tensor,
    batch_size: usize,
}

impl InMemoryDataset {
    /// `inputs` and `labels` must be at least 2-D with the same number of rows.
    pub fn new(inputs: Tensor, labels: Tensor, batch_size: usize) -> Result<Self> {
        if batch_size == 0 {
            return Err(TrainerError::Config("batch_size must be at least 1".into()));
        }
        if inputs.shape.len() < 2 || labels.shape.len() < 2 {
            return Err(TrainerError::Config(format!(
                "Dataset tensors need a sample dimension, got inputs {:?} and labels {:?}",
                inputs.shape, labels.shape
            )));
        }
        if inputs.shape[0] != labels.shape[0] {
            return Err(TrainerError::Config(format!(
                "Dataset has {} inputs but {} labels",
                inputs.shape[0], labels.shape[0]
            )));
        }
        Ok(Self {
            inputs,
            labels,
            batch_size,
        })
    }

    /// Deterministic regression data: `labels = inputs * factor + offset`.
    pub fn synthetic(
        samples: usize,
        features: usize,
        factor: f32,
        offset: f32,
        batch_size: usize,
    ) -> Result<Self> {
        let data: Vec<f32> = (0..samples * features)
            .map(|i| ((i * 7919) % 101) as f32 / 50.0 - 1.0)
            .collect();
        let labels = data.iter().map(|x| x * factor + offset).collect();

        Self::new(
            Tensor::try_new(data, vec![samples, features])?,
            Tensor::try_new(labels, vec![samples, features])?,
            batch_size,
        )
    }

    /// The contiguous slice of samples owned by `rank` out of `size`.
    ///
    /// Every shard gets `len / size` samples so all ranks run the same number
    /// of batches; the remainder is dropped.
    pub fn shard(&self, rank: usize, size: usize) -> Result<Self> {
        if size == 0 || rank >= size {
            return Err(TrainerError::Config(format!(
                "Invalid shard {} of {}",
                rank, size
            )));
        }
        let per_rank = self.len() / size;
        let start = rank * per_rank;
        let end = start + per_rank;

        Self::new(
            rows_of(&self.inputs, start, end),
            rows_of(&self.labels, start, end),
            self.batch_size,
        )
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }
}

fn row_width(tensor: &Tensor) -> usize {
    tensor.shape[1..].iter().product()
}

fn rows_of(tensor: &Tensor, start: usize, end: usize) -> Tensor {
    let width = row_width(tensor);
    let mut shape = tensor.shape.clone();
    shape[0] = end - start;
    Tensor {
        data: tensor.data[start * width..end * width].to_vec(),
        shape,
    }
}

impl Dataset for InMemoryDataset {
    fn batches(&self) -> Box<dyn Iterator<Item = Batch> + Send + '_> {
        let rows = self.len();
        Box::new((0..rows).step_by(self.batch_size).map(move |start| {
            let end = (start + self.batch_size).min(rows);
            Batch {
                inputs: rows_of(&self.inputs, start, end),
                labels: rows_of(&self.labels, start, end),
            }
        }))
    }

    fn len(&self) -> usize {
        self.inputs.shape[0]
    }

    fn rebatch(&mut self, batch_size: usize) -> Result<()> {
        if batch_size == 0 {
            return Err(TrainerError::Config("batch_size must be at least 1".into()));
        }
        self.batch_size = batch_size;
        Ok(())
    }
}
