//! libsvm-style text reader.
//!
//! One instance per line: `label id:value id:value …`. Labels `-1`,
//! `0` and `1` are accepted; `-1` maps to `0`.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use sparsed_config::MiniConfig;

use super::{Error, InstanceReader, MiniBatch};
use crate::tensor::Float;

pub struct LibsvmReader {
    batch: usize,
    file: String,
    line_no: usize,
    lines: Option<std::io::Lines<BufReader<File>>>,
}

impl LibsvmReader {
    pub fn new(config: &MiniConfig, batch: usize) -> Result<Self, Error> {
        let batch = config
            .get_parsed::<usize>("batch", "instance_reader_config")?
            .unwrap_or(batch);
        Ok(Self {
            batch,
            file: String::new(),
            line_no: 0,
            lines: None,
        })
    }

    fn parse_line(&self, line: &str) -> Result<(Float, Vec<(u64, Float)>), Error> {
        let err = |message: String| Error::Parse {
            file: self.file.clone(),
            line: self.line_no,
            message,
        };

        let mut parts = line.split_ascii_whitespace();
        let label_str = parts.next().ok_or_else(|| err("empty line".into()))?;
        let label: Float = label_str
            .parse()
            .map_err(|_| err(format!("bad label: {}", label_str)))?;
        let label = if label < 0 as Float { 0 as Float } else { label };

        let mut features = Vec::new();
        for part in parts {
            let (id, value) = part
                .split_once(':')
                .ok_or_else(|| err(format!("bad feature: {}", part)))?;
            let id: u64 = id.parse().map_err(|_| err(format!("bad id: {}", id)))?;
            let value: Float = value
                .parse()
                .map_err(|_| err(format!("bad value: {}", value)))?;
            features.push((id, value));
        }
        Ok((label, features))
    }
}

impl InstanceReader for LibsvmReader {
    fn open(&mut self, path: &Path) -> Result<(), Error> {
        self.file = path.display().to_string();
        self.line_no = 0;
        self.lines = Some(BufReader::new(File::open(path)?).lines());
        Ok(())
    }

    fn next_batch(&mut self) -> Result<Option<MiniBatch>, Error> {
        let mut lines = match self.lines.take() {
            Some(lines) => lines,
            None => return Ok(None),
        };

        let mut batch = MiniBatch::default();
        while batch.batch() < self.batch {
            match lines.next() {
                Some(line) => {
                    self.line_no += 1;
                    let line = line?;
                    if line.trim().is_empty() {
                        continue;
                    }
                    let (label, features) = self.parse_line(&line)?;
                    batch.labels.push(label);
                    batch.rows.push(features);
                }
                None => {
                    break;
                }
            }
        }
        self.lines = Some(lines);

        if batch.is_empty() {
            Ok(None)
        } else {
            Ok(Some(batch))
        }
    }
}
