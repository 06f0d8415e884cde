//! Append-only chain output.
//!
//! The sampler appends one [`ChainRecord`] per step: the free-parameter
//! vector in PTA registry order, the log-likelihood and log-prior, the
//! kernel that proposed the step and whether it was accepted. Downstream
//! posterior analysis consumes these records; this crate only writes them.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::proposal::KernelKind;

/// One chain row, borrowed from the sampler's state.
#[derive(Debug, Clone, Copy)]
pub struct ChainRecord<'a> {
    pub position: &'a [f64],
    pub lnlike: f64,
    pub lnprior: f64,
    pub kernel: KernelKind,
    pub accepted: bool,
}

/// An append-only sink for chain records.
pub trait ChainStorage {
    fn append(&mut self, record: &ChainRecord<'_>) -> Result<()>;

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// An owned chain row, as stored by [`MemoryChain`].
#[derive(Debug, Clone)]
pub struct ChainRow {
    pub position: Vec<f64>,
    pub lnlike: f64,
    pub lnprior: f64,
    pub kernel: KernelKind,
    pub accepted: bool,
}

/// In-memory chain, mostly for tests and small runs.
#[derive(Debug, Default)]
pub struct MemoryChain {
    rows: Vec<ChainRow>,
}

impl MemoryChain {
    pub fn new() -> Self {
        MemoryChain::default()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> &[ChainRow] {
        &self.rows
    }

    /// All stored values of one coordinate.
    pub fn param_column(&self, idx: usize) -> Vec<f64> {
        self.rows.iter().map(|r| r.position[idx]).collect()
    }

    pub fn param_mean(&self, idx: usize) -> f64 {
        let col = self.param_column(idx);
        col.iter().sum::<f64>() / col.len() as f64
    }
}

impl ChainStorage for MemoryChain {
    fn append(&mut self, record: &ChainRecord<'_>) -> Result<()> {
        self.rows.push(ChainRow {
            position: record.position.to_vec(),
            lnlike: record.lnlike,
            lnprior: record.lnprior,
            kernel: record.kernel,
            accepted: record.accepted,
        });
        Ok(())
    }
}

/// Whitespace-delimited text chain file, one row per step:
/// parameter values, log-likelihood, log-prior, kernel id, accept flag.
///
/// The file is opened in append mode so an interrupted run can continue
/// into the same chain after resuming from a snapshot.
pub struct TextChain {
    path: PathBuf,
    writer: BufWriter<File>,
    precision: usize,
    flush_every: usize,
    pending: usize,
}

impl TextChain {
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)
                    .with_context(|| format!("creating chain directory {}", dir.display()))?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening chain file {}", path.display()))?;
        Ok(TextChain {
            path,
            writer: BufWriter::new(file),
            precision: 10,
            flush_every: 100,
            pending: 0,
        })
    }

    /// Number of significant digits written per value.
    pub fn with_precision(mut self, precision: usize) -> Self {
        self.precision = precision;
        self
    }

    /// Flush to disk every this many rows.
    pub fn with_flush_every(mut self, flush_every: usize) -> Self {
        self.flush_every = flush_every.max(1);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ChainStorage for TextChain {
    fn append(&mut self, record: &ChainRecord<'_>) -> Result<()> {
        for v in record.position {
            write!(self.writer, "{:.prec$e} ", v, prec = self.precision)
                .context("writing chain row")?;
        }
        writeln!(
            self.writer,
            "{:.prec$e} {:.prec$e} {} {}",
            record.lnlike,
            record.lnprior,
            record.kernel.id(),
            record.accepted as u8,
            prec = self.precision,
        )
        .context("writing chain row")?;
        self.pending += 1;
        if self.pending >= self.flush_every {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush().context("flushing chain file")?;
        self.pending = 0;
        Ok(())
    }
}
