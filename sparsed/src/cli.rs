//! Command line of the training launcher.
//!
//! Flags mirror the job options one to one; integer on/off flags stay
//! integers so launcher scripts can pass `--shuffle_in=0` style
//! values. Everything funnels into a validated [`JobConfig`] before
//! any network startup.

use std::path::PathBuf;

use clap::Parser;

use sparsed_config::{Error, FreqConfig, JobConfig, Role, SubCommand, TsConfig};

/// Distributed trainer for large sparse models.
#[derive(Parser, Debug)]
#[command(name = "sparsed", version)]
pub struct Cli {
    /// train or predict.
    #[arg(long = "sub_command", default_value = "train")]
    pub sub_command: String,

    /// ps or wk.
    #[arg(long, default_value = "ps")]
    pub role: String,

    /// Coordinator server address.
    #[arg(long = "cs_addr", default_value = "127.0.0.1:61000")]
    pub cs_addr: String,

    /// Comma-separated param server addresses.
    #[arg(long = "ps_addrs", default_value = "127.0.0.1:60000")]
    pub ps_addrs: String,

    /// Param server id.
    #[arg(long = "ps_id", default_value_t = 0)]
    pub ps_id: usize,

    /// Number of param server working threads.
    #[arg(long = "ps_thread", default_value_t = 1)]
    pub ps_thread: usize,

    /// Instance reader name.
    #[arg(long = "instance_reader", default_value = "libsvm")]
    pub instance_reader: String,

    /// Instance reader config.
    #[arg(long = "instance_reader_config", default_value = "")]
    pub instance_reader_config: String,

    /// Model name.
    #[arg(long, default_value = "lr")]
    pub model: String,

    /// Model config.
    #[arg(long = "model_config", default_value = "")]
    pub model_config: String,

    /// Optimizer name.
    #[arg(long, default_value = "adagrad")]
    pub optimizer: String,

    /// Optimizer config.
    #[arg(long = "optimizer_config", default_value = "")]
    pub optimizer_config: String,

    /// Number of epochs.
    #[arg(long, default_value_t = 1)]
    pub epoch: usize,

    /// Batch size.
    #[arg(long, default_value_t = 32)]
    pub batch: usize,

    /// Input dir/file of training/testing data.
    #[arg(long = "in")]
    pub input: PathBuf,

    /// Reverse input files.
    #[arg(long = "reverse_in", default_value_t = 0)]
    pub reverse_in: u8,

    /// Shuffle input files for each epoch.
    #[arg(long = "shuffle_in", default_value_t = 1)]
    pub shuffle_in: u8,

    /// Input model dir.
    #[arg(long = "in_model", default_value = "")]
    pub in_model: String,

    /// Warmup model dir.
    #[arg(long = "warmup_model", default_value = "")]
    pub warmup_model: String,

    /// Remove zeros from the output model.
    #[arg(long = "out_model_remove_zeros", default_value_t = 0)]
    pub out_model_remove_zeros: u8,

    /// Output model dir.
    #[arg(long = "out_model", default_value = "")]
    pub out_model: String,

    /// Output text model dir (optional).
    #[arg(long = "out_text_model", default_value = "")]
    pub out_text_model: String,

    /// Output feature kv model dir (optional).
    #[arg(long = "out_feature_kv_model", default_value = "")]
    pub out_feature_kv_model: String,

    /// Output feature kv protocol version.
    #[arg(long = "out_feature_kv_protocol_version", default_value_t = 2)]
    pub out_feature_kv_protocol_version: u32,

    /// Output predict dir (optional).
    #[arg(long = "out_predict", default_value = "")]
    pub out_predict: String,

    /// Verbose level: 0-10.
    #[arg(long, default_value_t = 1)]
    pub verbose: u32,

    /// Seed of the random engine.
    #[arg(long, default_value_t = 9527)]
    pub seed: u64,

    /// Enable timestamps.
    #[arg(long = "ts_enable", default_value_t = 0)]
    pub ts_enable: u8,

    /// Timestamp of now.
    #[arg(long = "ts_now", default_value_t = 0)]
    pub ts_now: u32,

    /// Timestamp expiration threshold.
    #[arg(long = "ts_expire_threshold", default_value_t = 0)]
    pub ts_expire_threshold: u32,

    /// Feature frequency filtering threshold.
    #[arg(long = "freq_filter_threshold", default_value_t = 0)]
    pub freq_filter_threshold: u32,
}

fn optional_path(s: String) -> Option<PathBuf> {
    if s.is_empty() {
        None
    } else {
        Some(PathBuf::from(s))
    }
}

impl Cli {
    /// Map flags into a job config and run the full validation pass.
    pub fn into_config(self) -> Result<JobConfig, Error> {
        let sub_command = match self.sub_command.as_str() {
            "train" => SubCommand::Train,
            "predict" => SubCommand::Predict,
            other => return Err(Error::invalid("sub_command", other)),
        };
        let role = match self.role.as_str() {
            "ps" => Role::Ps,
            "wk" => Role::Wk,
            other => return Err(Error::invalid("role", other)),
        };
        let ps_addrs: Vec<String> = self
            .ps_addrs
            .split(',')
            .map(|a| a.trim().to_string())
            .filter(|a| !a.is_empty())
            .collect();

        let mut config = JobConfig {
            sub_command,
            role,
            cs_addr: self.cs_addr,
            ps_addrs,
            ps_id: self.ps_id,
            ps_thread: self.ps_thread,
            instance_reader: self.instance_reader,
            instance_reader_config: self.instance_reader_config,
            model: self.model,
            model_config: self.model_config,
            optimizer: self.optimizer,
            optimizer_config: self.optimizer_config,
            epoch: self.epoch,
            batch: self.batch,
            input: self.input,
            reverse_in: self.reverse_in != 0,
            shuffle_in: self.shuffle_in != 0,
            in_model: optional_path(self.in_model),
            warmup_model: optional_path(self.warmup_model),
            out_model: optional_path(self.out_model),
            out_text_model: optional_path(self.out_text_model),
            out_feature_kv_model: optional_path(self.out_feature_kv_model),
            out_feature_kv_protocol_version: self.out_feature_kv_protocol_version,
            out_predict: optional_path(self.out_predict),
            out_model_remove_zeros: self.out_model_remove_zeros != 0,
            verbose: self.verbose,
            seed: self.seed,
            ts: TsConfig {
                enable: self.ts_enable != 0,
                now: self.ts_now,
                expire_threshold: self.ts_expire_threshold,
            },
            freq: FreqConfig {
                threshold: self.freq_filter_threshold,
            },
        };
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn base_args(dir: &std::path::Path) -> Vec<String> {
        vec![
            "sparsed".into(),
            "--in".into(),
            dir.join("train.libsvm").display().to_string(),
            "--out_model".into(),
            dir.join("model").display().to_string(),
        ]
    }

    #[test]
    fn test_parse_and_validate() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("train.libsvm"), "1 1:1\n").unwrap();

        let mut args = base_args(dir.path());
        args.extend([
            "--role".into(),
            "wk".into(),
            "--ps_addrs".into(),
            "127.0.0.1:6000,127.0.0.1:6001".into(),
            "--shuffle_in".into(),
            "0".into(),
        ]);
        let cli = Cli::parse_from(args);
        let config = cli.into_config().unwrap();
        assert_eq!(config.role, Role::Wk);
        assert_eq!(config.shard_size(), 2);
        assert!(!config.shuffle_in);
        assert!(config.is_train());
    }

    #[test]
    fn test_bad_role_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("train.libsvm"), "1 1:1\n").unwrap();
        let mut args = base_args(dir.path());
        args.extend(["--role".into(), "cs".into()]);
        assert!(Cli::parse_from(args).into_config().is_err());
    }

    #[test]
    fn test_ps_id_out_of_range_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("train.libsvm"), "1 1:1\n").unwrap();
        let mut args = base_args(dir.path());
        args.extend(["--ps_id".into(), "5".into()]);
        assert!(Cli::parse_from(args).into_config().is_err());
    }
}
