//! Shared file-level training and prediction loops.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use tracing::info;

use sparsed_config::MiniConfig;

use super::Error;
use crate::reader::{new_instance_reader, MiniBatch};
use crate::tensor::Float;

/// One runner per trainer flavor: local, in-process sharded, or
/// distributed. The context drives it file by file.
pub trait BatchRunner {
    /// Run one training batch; returns the batch loss.
    fn train_batch(
        &mut self,
        batch: &MiniBatch,
    ) -> impl std::future::Future<Output = Result<f64, Error>> + Send;

    /// Run one prediction batch; returns per-instance probabilities.
    fn predict_batch(
        &mut self,
        batch: &MiniBatch,
    ) -> impl std::future::Future<Output = Result<Vec<Float>, Error>> + Send;
}

pub struct TrainerContext {
    instance_reader: String,
    reader_config: MiniConfig,
    batch: usize,
    verbose: u32,
}

// Progress logging period, in batches.
const VERBOSE_BATCH: usize = 1000;

impl TrainerContext {
    pub fn new(
        instance_reader: &str,
        reader_config: &str,
        batch: usize,
        verbose: u32,
    ) -> Result<Self, Error> {
        Ok(Self {
            instance_reader: instance_reader.into(),
            reader_config: MiniConfig::parse(reader_config)?,
            batch,
            verbose,
        })
    }

    /// Train one file; returns `(file_loss, file_loss_weight)` where
    /// the weight counts processed batches.
    pub async fn train_file(
        &self,
        runner: &mut impl BatchRunner,
        file: &Path,
    ) -> Result<(f64, f64), Error> {
        let mut reader = new_instance_reader(&self.instance_reader, &self.reader_config, self.batch)?;
        reader.open(file)?;

        let mut file_loss = 0.0;
        let mut file_loss_weight = 0.0;
        let mut processed = 0usize;
        let mut instances = 0usize;
        let begin = Instant::now();

        while let Some(batch) = reader.next_batch()? {
            let loss = runner.train_batch(&batch).await?;
            file_loss += loss;
            file_loss_weight += 1.0;
            processed += 1;
            instances += batch.batch();

            if self.verbose > 0 && processed % VERBOSE_BATCH == 0 {
                self.dump_speed(file, instances, begin, Some(file_loss / file_loss_weight));
            }
        }

        if self.verbose > 0 {
            self.dump_speed(file, instances, begin, Some(file_loss / file_loss_weight.max(1.0)));
        }
        Ok((file_loss, file_loss_weight))
    }

    /// Predict one file, writing one `label probability` line per
    /// instance.
    pub async fn predict_file(
        &self,
        runner: &mut impl BatchRunner,
        file: &Path,
        out_file: &Path,
    ) -> Result<(), Error> {
        let mut reader = new_instance_reader(&self.instance_reader, &self.reader_config, self.batch)?;
        reader.open(file)?;

        let out = File::create(out_file).map_err(|e| Error::Io {
            path: out_file.to_path_buf(),
            source: e,
        })?;
        let mut out = BufWriter::new(out);

        let mut instances = 0usize;
        let begin = Instant::now();

        while let Some(batch) = reader.next_batch()? {
            let probs = runner.predict_batch(&batch).await?;
            for (i, p) in probs.iter().enumerate() {
                writeln!(out, "{} {}", batch.labels[i], p).map_err(|e| Error::Io {
                    path: out_file.to_path_buf(),
                    source: e,
                })?;
            }
            instances += batch.batch();
        }
        out.flush().map_err(|e| Error::Io {
            path: out_file.to_path_buf(),
            source: e,
        })?;

        if self.verbose > 0 {
            self.dump_speed(file, instances, begin, None);
        }
        Ok(())
    }

    fn dump_speed(&self, file: &Path, instances: usize, begin: Instant, loss: Option<f64>) {
        let elapsed = begin.elapsed().as_secs_f64().max(1e-9);
        let instances_per_sec = instances as f64 / elapsed;
        match loss {
            Some(loss) => info!(
                file = %file.display(),
                instances_per_sec,
                loss,
                "training"
            ),
            None => info!(
                file = %file.display(),
                instances_per_sec,
                "predicting"
            ),
        }
    }
}

/// Per-input-file prediction output path under the output directory.
pub fn output_predict_file(out_dir: &Path, input: &Path) -> PathBuf {
    let name = input
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "out".into());
    out_dir.join(format!("{}.predict", name))
}

#[cfg(test)]
mod test {
    use super::*;

    struct CountingRunner {
        batches: usize,
    }

    impl BatchRunner for CountingRunner {
        async fn train_batch(&mut self, _batch: &MiniBatch) -> Result<f64, Error> {
            self.batches += 1;
            Ok(0.5)
        }

        async fn predict_batch(&mut self, batch: &MiniBatch) -> Result<Vec<Float>, Error> {
            Ok(vec![0.25; batch.batch()])
        }
    }

    #[tokio::test]
    async fn test_train_file_counts_batches() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("in.libsvm");
        let mut content = String::new();
        for i in 0..25 {
            content.push_str(&format!("{} {}:1\n", i % 2, i + 1));
        }
        std::fs::write(&file, content).unwrap();

        let context = TrainerContext::new("libsvm", "", 10, 0).unwrap();
        let mut runner = CountingRunner { batches: 0 };
        let (loss, weight) = context.train_file(&mut runner, &file).await.unwrap();
        // 25 instances at batch 10: three batches, the last short.
        assert_eq!(runner.batches, 3);
        assert_eq!(weight, 3.0);
        assert!((loss - 1.5).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_predict_file_writes_lines() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("in.libsvm");
        std::fs::write(&file, "1 1:1\n0 2:1\n").unwrap();
        let out = dir.path().join("out.predict");

        let context = TrainerContext::new("libsvm", "", 10, 0).unwrap();
        let mut runner = CountingRunner { batches: 0 };
        context
            .predict_file(&mut runner, &file, &out)
            .await
            .unwrap();

        let written = std::fs::read_to_string(&out).unwrap();
        let lines: Vec<&str> = written.lines().collect();
        assert_eq!(lines, vec!["1 0.25", "0 0.25"]);
    }

    #[test]
    fn test_output_predict_file() {
        assert_eq!(
            output_predict_file(Path::new("/out"), Path::new("/data/part-1")),
            Path::new("/out/part-1.predict")
        );
    }
}
