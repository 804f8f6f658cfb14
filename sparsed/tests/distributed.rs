//! End-to-end jobs over loopback TCP: coordinator, param servers and
//! workers wired exactly as the launcher wires them.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::net::TcpListener;

use sparsed::coordinator::{CoordConfig, CoordServer};
use sparsed::model::persist;
use sparsed::ps::run_param_server;
use sparsed::shard::{Shard, DEFAULT_SHARD_FUNC};
use sparsed::tensor::TensorMap;
use sparsed::worker::run_worker;
use sparsed_config::{JobConfig, SubCommand};

async fn free_addr() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    drop(listener);
    addr
}

fn base_config(input: PathBuf, cs_addr: String, ps_addrs: Vec<String>) -> JobConfig {
    JobConfig {
        cs_addr,
        ps_addrs,
        input,
        batch: 10,
        epoch: 1,
        optimizer: "sgd".into(),
        optimizer_config: "alpha=0.1".into(),
        shuffle_in: false,
        verbose: 0,
        ..Default::default()
    }
}

fn write_lr_file(path: &Path, rows: usize) {
    let mut content = String::new();
    for i in 0..rows {
        if i % 2 == 0 {
            content.push_str("1 1:1 3:1\n");
        } else {
            content.push_str("0 2:1 3:1\n");
        }
    }
    std::fs::write(path, content).unwrap();
}

struct Job {
    coordinator: Arc<CoordServer>,
    cs_task: tokio::task::JoinHandle<Result<(), sparsed::coordinator::Error>>,
    ps_tasks: Vec<tokio::task::JoinHandle<Result<(), sparsed::ps::Error>>>,
}

/// Launch the coordinator and one param server per address, like
/// `sparsed --role=ps` processes would.
async fn launch(config: &JobConfig) -> Job {
    let mut ps_tasks = Vec::new();
    for ps_id in 0..config.ps_addrs.len() {
        let mut ps_config = config.clone();
        ps_config.ps_id = ps_id;
        ps_tasks.push(tokio::spawn(
            async move { run_param_server(&ps_config).await },
        ));
    }

    let coordinator = Arc::new(CoordServer::new(CoordConfig::from_job(config).unwrap()));
    let cs = coordinator.clone();
    let cs_task = tokio::spawn(async move { cs.run().await });

    Job {
        coordinator,
        cs_task,
        ps_tasks,
    }
}

impl Job {
    async fn join(self) -> (f64, f64) {
        self.cs_task.await.unwrap().unwrap();
        for task in self.ps_tasks {
            task.await.unwrap().unwrap();
        }
        self.coordinator.epoch_stats()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_single_ps_train_then_predict() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("train.libsvm");
    write_lr_file(&input, 100);
    let out_model = dir.path().join("model");
    std::fs::create_dir(&out_model).unwrap();

    // Train.
    let cs_addr = free_addr().await;
    let ps_addrs = vec![free_addr().await];
    let mut config = base_config(input.clone(), cs_addr, ps_addrs);
    config.out_model = Some(out_model.clone());
    config.seed = 9527;

    let job = launch(&config).await;
    run_worker(&config).await.unwrap();
    let (loss, weight) = job.join().await;
    assert_eq!(weight, 10.0, "10 batches of 10 instances");
    assert!(loss > 0.0 && loss.is_finite());

    // Shard 0 persisted the manifest and its artifacts; the marker
    // comes last.
    assert!(out_model.join("graph.bin").is_file());
    assert!(out_model.join("shard.bin").is_file());
    assert!(out_model.join("model.bin.0").is_file());
    assert!(out_model.join("optimizer.bin.0").is_file());
    assert!(out_model.join("SUCCESS_.0").is_file());

    // Predict on the same input with the saved model.
    let out_predict = dir.path().join("predict");
    std::fs::create_dir(&out_predict).unwrap();
    let cs_addr = free_addr().await;
    let ps_addrs = vec![free_addr().await];
    let mut config = base_config(input.clone(), cs_addr, ps_addrs);
    config.sub_command = SubCommand::Predict;
    config.in_model = Some(out_model.clone());
    config.out_predict = Some(out_predict.clone());

    let job = launch(&config).await;
    run_worker(&config).await.unwrap();
    job.join().await;

    let out_file = out_predict.join("train.libsvm.predict");
    let written = std::fs::read_to_string(&out_file).unwrap();
    let lines: Vec<&str> = written.lines().collect();
    assert_eq!(lines.len(), 100);
    let mut positive_seen = 0.0f64;
    let mut negative_seen = 0.0f64;
    for line in lines {
        let mut parts = line.split_whitespace();
        let label: f64 = parts.next().unwrap().parse().unwrap();
        let prob: f64 = parts.next().unwrap().parse().unwrap();
        assert!(prob > 0.0 && prob < 1.0, "probability out of range: {}", prob);
        if label > 0.5 {
            positive_seen = prob;
        } else {
            negative_seen = prob;
        }
    }
    // One epoch of training separates the toy classes.
    assert!(positive_seen > negative_seen);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_ps_partition_rows_by_hash() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("train.libsvm");
    let mut content = String::new();
    for _ in 0..30 {
        content.push_str("1 1:1 2:1\n0 3:1 4:1\n");
    }
    std::fs::write(&input, content).unwrap();
    let out_model = dir.path().join("model");
    std::fs::create_dir(&out_model).unwrap();

    let cs_addr = free_addr().await;
    let ps_addrs = vec![free_addr().await, free_addr().await];
    let mut config = base_config(input, cs_addr, ps_addrs);
    config.model = "fm".into();
    config.model_config = "k=4".into();
    config.out_model = Some(out_model.clone());

    let job = launch(&config).await;
    run_worker(&config).await.unwrap();
    job.join().await;

    // Each shard file holds exactly the rows whose id hashes to it;
    // the union covers every id.
    let shard = Shard::hash(2, DEFAULT_SHARD_FUNC).unwrap();
    let mut all_ids = std::collections::BTreeSet::new();
    for shard_id in 0..2 {
        let path = persist::model_file(
            &out_model,
            &shard,
            shard_id,
            persist::Layout::Current,
        );
        let mut bytes = persist::read_payload(&path, persist::KIND_MODEL).unwrap();
        let map = TensorMap::decode(&mut bytes).unwrap();
        for name in ["fm/w", "fm/v"] {
            let srm = map.get_srm(name).unwrap();
            for (id, _) in srm.iter() {
                assert_eq!(shard.srm_shard_id(id), shard_id, "{} row {}", name, id);
                all_ids.insert(id);
            }
        }
    }
    assert_eq!(all_ids.into_iter().collect::<Vec<_>>(), vec![1, 2, 3, 4]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_two_workers_aggregate_epoch_loss() {
    let dir = tempfile::tempdir().unwrap();
    let inputs = dir.path().join("inputs");
    std::fs::create_dir(&inputs).unwrap();
    // 4 files of 10 batches each (100 rows at batch 10).
    for i in 0..4 {
        write_lr_file(&inputs.join(format!("part-{}", i)), 100);
    }
    let out_model = dir.path().join("model");
    std::fs::create_dir(&out_model).unwrap();

    let cs_addr = free_addr().await;
    let ps_addrs = vec![free_addr().await];
    let mut config = base_config(inputs, cs_addr, ps_addrs);
    config.out_model = Some(out_model);

    let job = launch(&config).await;
    let worker_a = {
        let config = config.clone();
        tokio::spawn(async move { run_worker(&config).await })
    };
    let worker_b = {
        let config = config.clone();
        tokio::spawn(async move { run_worker(&config).await })
    };
    worker_a.await.unwrap().unwrap();
    worker_b.await.unwrap().unwrap();

    let (loss, weight) = job.join().await;
    // Every batch of the epoch reports weight 1, whichever worker ran
    // it.
    assert_eq!(weight, 40.0);
    let mean = loss / weight;
    assert!(mean > 0.0 && mean.is_finite());
}
