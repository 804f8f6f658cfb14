//! Job configuration.
//!
//! One `JobConfig` describes a whole training or prediction job and is
//! shared by every role. It is built from the command line (or a TOML
//! file) and validated once, before any network startup.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::error::Error;
use super::kv::MiniConfig;
use super::stores::{FreqConfig, TsConfig};
use super::FEATURE_KV_PROTOCOL_VERSIONS;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SubCommand {
    #[default]
    Train,
    Predict,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    Ps,
    Wk,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct JobConfig {
    #[serde(default)]
    pub sub_command: SubCommand,

    #[serde(default)]
    pub role: Role,

    /// Coordinator server address.
    #[serde(default = "JobConfig::cs_addr")]
    pub cs_addr: String,

    /// Param server addresses; their count is the shard count.
    #[serde(default = "JobConfig::ps_addrs")]
    pub ps_addrs: Vec<String>,

    /// Index of this param server in `ps_addrs`.
    #[serde(default)]
    pub ps_id: usize,

    /// Tokio worker threads on the param server.
    #[serde(default = "JobConfig::ps_thread")]
    pub ps_thread: usize,

    #[serde(default = "JobConfig::instance_reader")]
    pub instance_reader: String,

    #[serde(default)]
    pub instance_reader_config: String,

    #[serde(default = "JobConfig::model")]
    pub model: String,

    #[serde(default)]
    pub model_config: String,

    #[serde(default = "JobConfig::optimizer")]
    pub optimizer: String,

    #[serde(default)]
    pub optimizer_config: String,

    #[serde(default = "JobConfig::epoch")]
    pub epoch: usize,

    #[serde(default = "JobConfig::batch")]
    pub batch: usize,

    /// Input file or directory of training/testing data.
    #[serde(default)]
    pub input: PathBuf,

    #[serde(default)]
    pub reverse_in: bool,

    #[serde(default = "JobConfig::shuffle_in")]
    pub shuffle_in: bool,

    #[serde(default)]
    pub in_model: Option<PathBuf>,

    #[serde(default)]
    pub warmup_model: Option<PathBuf>,

    #[serde(default)]
    pub out_model: Option<PathBuf>,

    #[serde(default)]
    pub out_text_model: Option<PathBuf>,

    #[serde(default)]
    pub out_feature_kv_model: Option<PathBuf>,

    #[serde(default = "JobConfig::out_feature_kv_protocol_version")]
    pub out_feature_kv_protocol_version: u32,

    #[serde(default)]
    pub out_predict: Option<PathBuf>,

    #[serde(default)]
    pub out_model_remove_zeros: bool,

    /// Verbose level: 0-10.
    #[serde(default = "JobConfig::verbose")]
    pub verbose: u32,

    /// Seed of the random engine.
    #[serde(default = "JobConfig::seed")]
    pub seed: u64,

    #[serde(default)]
    pub ts: TsConfig,

    #[serde(default)]
    pub freq: FreqConfig,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            sub_command: SubCommand::default(),
            role: Role::default(),
            cs_addr: Self::cs_addr(),
            ps_addrs: Self::ps_addrs(),
            ps_id: 0,
            ps_thread: Self::ps_thread(),
            instance_reader: Self::instance_reader(),
            instance_reader_config: String::new(),
            model: Self::model(),
            model_config: String::new(),
            optimizer: Self::optimizer(),
            optimizer_config: String::new(),
            epoch: Self::epoch(),
            batch: Self::batch(),
            input: PathBuf::new(),
            reverse_in: false,
            shuffle_in: Self::shuffle_in(),
            in_model: None,
            warmup_model: None,
            out_model: None,
            out_text_model: None,
            out_feature_kv_model: None,
            out_feature_kv_protocol_version: Self::out_feature_kv_protocol_version(),
            out_predict: None,
            out_model_remove_zeros: false,
            verbose: Self::verbose(),
            seed: Self::seed(),
            ts: TsConfig::default(),
            freq: FreqConfig::default(),
        }
    }
}

impl JobConfig {
    fn cs_addr() -> String {
        "127.0.0.1:61000".into()
    }

    fn ps_addrs() -> Vec<String> {
        vec!["127.0.0.1:60000".into()]
    }

    fn ps_thread() -> usize {
        1
    }

    fn instance_reader() -> String {
        "libsvm".into()
    }

    fn model() -> String {
        "lr".into()
    }

    fn optimizer() -> String {
        "adagrad".into()
    }

    fn epoch() -> usize {
        1
    }

    fn batch() -> usize {
        32
    }

    fn shuffle_in() -> bool {
        true
    }

    fn out_feature_kv_protocol_version() -> u32 {
        2
    }

    fn verbose() -> u32 {
        1
    }

    fn seed() -> u64 {
        9527
    }

    pub fn is_train(&self) -> bool {
        self.sub_command == SubCommand::Train
    }

    pub fn shard_size(&self) -> usize {
        self.ps_addrs.len()
    }

    /// Load from a TOML file.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let s = fs::read_to_string(path).map_err(|e| Error::Io(path.to_path_buf(), e))?;
        Ok(toml::from_str(&s)?)
    }

    /// Check every option and option combination. Side effects: the
    /// `batch` override from the instance-reader config is applied,
    /// `out_predict` defaults to `<input>.predict`, output directories
    /// are created. Runs before any network startup.
    pub fn validate(&mut self) -> Result<(), Error> {
        if self.ps_addrs.is_empty() {
            return Err(Error::Missing("ps_addrs"));
        }
        if self.ps_id >= self.ps_addrs.len() {
            return Err(Error::invalid("ps_id", self.ps_id));
        }
        if self.ps_thread == 0 {
            return Err(Error::invalid("ps_thread", self.ps_thread));
        }

        if self.instance_reader.is_empty() {
            return Err(Error::Missing("instance_reader"));
        }
        let reader_config = MiniConfig::parse(&self.instance_reader_config)?;
        if let Some(batch) = reader_config.get_parsed::<usize>("batch", "instance_reader_config")? {
            if batch != self.batch {
                self.batch = batch;
            }
        }
        if self.batch == 0 {
            return Err(Error::invalid("batch", self.batch));
        }

        if self.is_train() {
            if self.epoch == 0 {
                return Err(Error::invalid("epoch", self.epoch));
            }
            if self.in_model.is_none() {
                if self.model.is_empty() {
                    return Err(Error::Missing("model"));
                }
                if self.optimizer.is_empty() {
                    return Err(Error::Missing("optimizer"));
                }
            }
            MiniConfig::parse(&self.model_config)?;
            MiniConfig::parse(&self.optimizer_config)?;
        }

        if self.input.as_os_str().is_empty() {
            return Err(Error::Missing("in"));
        }
        check_readable(&self.input)?;

        if let Some(in_model) = &self.in_model {
            check_readable(in_model)?;
        } else if !self.is_train() {
            return Err(Error::Missing("in_model"));
        }
        if let Some(warmup) = &self.warmup_model {
            check_readable(warmup)?;
        }

        if self.is_train() {
            let out_model = self.out_model.as_ref().ok_or(Error::Missing("out_model"))?;
            make_dir(out_model)?;
            if let Some(dir) = &self.out_text_model {
                make_dir(dir)?;
            }
            if let Some(dir) = &self.out_feature_kv_model {
                make_dir(dir)?;
                if !FEATURE_KV_PROTOCOL_VERSIONS.contains(&self.out_feature_kv_protocol_version) {
                    return Err(Error::invalid(
                        "out_feature_kv_protocol_version",
                        self.out_feature_kv_protocol_version,
                    ));
                }
            }
        } else {
            if self.out_predict.is_none() {
                let mut p = self.input.as_os_str().to_os_string();
                p.push(".predict");
                self.out_predict = Some(PathBuf::from(p));
            }
            make_dir(self.out_predict.as_ref().unwrap())?;
        }

        if self.verbose > 10 {
            return Err(Error::invalid("verbose", self.verbose));
        }

        Ok(())
    }
}

fn check_readable(path: &Path) -> Result<(), Error> {
    if fs::metadata(path).is_err() {
        return Err(Error::Path(path.to_path_buf()));
    }
    Ok(())
}

fn make_dir(path: &Path) -> Result<(), Error> {
    fs::create_dir_all(path).map_err(|e| Error::Io(path.to_path_buf(), e))
}
