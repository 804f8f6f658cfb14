//! Coordinator server.
//!
//! One process owns the file dispatcher and the epoch lifecycle.
//! Workers ask it for files and report them finished with their loss;
//! at each epoch boundary it broadcasts a save to every param server,
//! and when the job is done it closes worker connections, waits for
//! them to drain, and tells the param servers to terminate.

pub mod dispatcher;

pub use dispatcher::FileDispatcher;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error as ThisError;
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use sparsed_config::JobConfig;

use crate::net::messages::{
    FileFinishAck, FileFinishNotify, FileRequest, FileResponse, FromBytes, ModelSaveAck,
    ModelSaveRequest, TerminationAck, TerminationNotify,
};
use crate::net::{self, Stream};

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("net: {0}")]
    Net(#[from] net::Error),

    #[error("I/O error on \"{path}\": {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no input files under \"{0}\"")]
    NoInputFiles(PathBuf),

    #[error("model save failed: {0}")]
    Save(String),
}

#[derive(Debug, Clone)]
pub struct CoordConfig {
    pub listen: String,
    pub ps_addrs: Vec<String>,
    pub epochs: usize,
    pub files: Vec<String>,
    pub reverse: bool,
    pub shuffle: bool,
    pub timeout: Duration,
    pub dump_model: bool,
    pub seed: u64,
}

impl CoordConfig {
    pub fn from_job(config: &JobConfig) -> Result<Self, Error> {
        let files = list_files(&config.input)?;
        if files.is_empty() {
            return Err(Error::NoInputFiles(config.input.clone()));
        }
        info!(count = files.len(), "input files");
        for file in &files {
            info!("  {}", file);
        }
        let train = config.is_train();
        Ok(Self {
            listen: config.cs_addr.clone(),
            ps_addrs: config.ps_addrs.clone(),
            epochs: if train { config.epoch } else { 1 },
            files,
            reverse: train && config.reverse_in,
            shuffle: train && config.shuffle_in,
            timeout: Duration::ZERO,
            dump_model: train,
            seed: config.seed,
        })
    }
}

struct State {
    epoch: usize,
    dispatcher: FileDispatcher,
    epoch_loss: f64,
    epoch_weight: f64,
    /// Between epoch drain and epoch advance: file requests get an
    /// empty answer while the save broadcast runs.
    saving: bool,
    done: bool,
}

enum NextFile {
    File(u32, String),
    Empty(u32),
    /// Job finished: answer empty once, then close the connection so
    /// the worker exits its poll loop.
    Closing(u32),
}

pub struct CoordServer {
    config: Arc<CoordConfig>,
    state: Arc<Mutex<State>>,
    shutdown: CancellationToken,
    failure: Arc<Mutex<Option<String>>>,
}

impl CoordServer {
    pub fn new(config: CoordConfig) -> Self {
        let mut dispatcher = FileDispatcher::new(
            config.files.clone(),
            config.reverse,
            config.shuffle,
            config.timeout,
            config.seed,
        );
        dispatcher.begin_epoch();
        Self {
            config: Arc::new(config),
            state: Arc::new(Mutex::new(State {
                epoch: 0,
                dispatcher,
                epoch_loss: 0.0,
                epoch_weight: 0.0,
                saving: false,
                done: false,
            })),
            shutdown: CancellationToken::new(),
            failure: Arc::new(Mutex::new(None)),
        }
    }

    /// Accumulated loss and weight of the current (or final) epoch.
    pub fn epoch_stats(&self) -> (f64, f64) {
        let state = self.state.lock();
        (state.epoch_loss, state.epoch_weight)
    }

    pub async fn run(&self) -> Result<(), Error> {
        let listener = TcpListener::bind(&self.config.listen)
            .await
            .map_err(net::Error::from)?;
        info!(addr = %self.config.listen, "coordinator listening");

        let tracker = TaskTracker::new();
        loop {
            select! {
                conn = listener.accept() => {
                    let (stream, addr) = conn.map_err(net::Error::from)?;
                    info!(%addr, "worker connected");
                    let server = self.clone_refs();
                    tracker.spawn(async move {
                        if let Err(err) = server.handle_worker(Stream::new(stream)).await {
                            if !err_is_disconnect(&err) {
                                error!("worker connection failed: {}", err);
                            }
                        }
                    });
                }

                _ = self.shutdown.cancelled() => {
                    break;
                }
            }
        }

        // Wait for every worker to disconnect, then stop the shard
        // set.
        tracker.close();
        tracker.wait().await;
        self.terminate_param_servers().await;

        match self.failure.lock().take() {
            Some(cause) => Err(Error::Save(cause)),
            None => Ok(()),
        }
    }

    fn clone_refs(&self) -> Self {
        Self {
            config: self.config.clone(),
            state: self.state.clone(),
            shutdown: self.shutdown.clone(),
            failure: self.failure.clone(),
        }
    }

    async fn handle_worker(&self, mut stream: Stream) -> Result<(), Error> {
        loop {
            let message = stream.read().await?;
            match message.code() {
                'F' => {
                    FileRequest::from_bytes(message.to_bytes())?;
                    match self.next_file() {
                        NextFile::File(epoch, file) => {
                            stream.send_flush(&FileResponse { epoch, file }).await?;
                        }
                        NextFile::Empty(epoch) => {
                            stream.send_flush(&FileResponse::empty(epoch)).await?;
                        }
                        NextFile::Closing(epoch) => {
                            stream.send_flush(&FileResponse::empty(epoch)).await?;
                            return Ok(());
                        }
                    }
                }
                'D' => {
                    let notify = FileFinishNotify::from_bytes(message.to_bytes())?;
                    self.file_finished(notify).await?;
                    stream.send_flush(&FileFinishAck).await?;
                }
                other => {
                    return Err(net::Error::UnexpectedMessage(other).into());
                }
            }
        }
    }

    fn next_file(&self) -> NextFile {
        let mut state = self.state.lock();
        let epoch = state.epoch as u32;
        if state.done {
            return NextFile::Closing(epoch);
        }
        if state.saving {
            return NextFile::Empty(epoch);
        }
        match state.dispatcher.next() {
            Some(file) => NextFile::File(epoch, file),
            None => NextFile::Empty(epoch),
        }
    }

    async fn file_finished(&self, notify: FileFinishNotify) -> Result<(), Error> {
        let drained_epoch = {
            let mut state = self.state.lock();
            state.epoch_loss += notify.loss;
            state.epoch_weight += notify.loss_weight;
            if !state.dispatcher.finish(&notify.file) {
                warn!(file = %notify.file, "finish for a file not in flight");
            }
            if !state.done && state.dispatcher.epoch_drained() {
                info!(
                    epoch = state.epoch + 1,
                    loss = state.epoch_loss / state.epoch_weight.max(1.0),
                    "epoch drained"
                );
                state.saving = true;
                Some(state.epoch)
            } else {
                None
            }
        };

        if drained_epoch.is_some() {
            if self.config.dump_model {
                if let Err(err) = self.broadcast_save().await {
                    *self.failure.lock() = Some(err.to_string());
                    self.state.lock().done = true;
                    self.shutdown.cancel();
                    return Err(err);
                }
            }

            let mut state = self.state.lock();
            state.saving = false;
            if state.epoch + 1 < self.config.epochs {
                state.epoch += 1;
                state.epoch_loss = 0.0;
                state.epoch_weight = 0.0;
                state.dispatcher.begin_epoch();
            } else {
                state.done = true;
                self.shutdown.cancel();
            }
        }
        Ok(())
    }

    /// Ask every param server to persist its shard. Shard 0 also
    /// writes the graph and shard manifest on its side.
    async fn broadcast_save(&self) -> Result<(), Error> {
        for addr in &self.config.ps_addrs {
            let mut stream = Stream::connect_retry(addr).await?;
            let _: ModelSaveAck = stream.rpc(&ModelSaveRequest).await?;
            info!(%addr, "shard saved");
        }
        Ok(())
    }

    async fn terminate_param_servers(&self) {
        for addr in &self.config.ps_addrs {
            match TcpStream::connect(addr).await {
                Ok(conn) => {
                    let mut stream = Stream::new(conn);
                    match stream.rpc::<TerminationAck>(&TerminationNotify).await {
                        Ok(_) => info!(%addr, "param server terminated"),
                        Err(err) => warn!(%addr, %err, "termination notify failed"),
                    }
                }
                Err(err) => warn!(%addr, %err, "termination connect failed"),
            }
        }
    }
}

fn err_is_disconnect(err: &Error) -> bool {
    matches!(err, Error::Net(net) if net.disconnect())
}

/// Recursively list input files; a plain file lists as itself. Order
/// is deterministic.
pub fn list_files(path: &Path) -> Result<Vec<String>, Error> {
    let meta = fs::metadata(path).map_err(|e| Error::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    let mut files = Vec::new();
    if meta.is_file() {
        files.push(path.display().to_string());
    } else {
        walk(path, &mut files)?;
        files.sort();
    }
    Ok(files)
}

fn walk(dir: &Path, files: &mut Vec<String>) -> Result<(), Error> {
    let entries = fs::read_dir(dir).map_err(|e| Error::Io {
        path: dir.to_path_buf(),
        source: e,
    })?;
    for entry in entries {
        let entry = entry.map_err(|e| Error::Io {
            path: dir.to_path_buf(),
            source: e,
        })?;
        let path = entry.path();
        if path.is_dir() {
            walk(&path, files)?;
        } else {
            files.push(path.display().to_string());
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_list_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("b.txt"), "").unwrap();
        fs::write(dir.path().join("a.txt"), "").unwrap();
        fs::write(dir.path().join("sub/c.txt"), "").unwrap();

        let files = list_files(dir.path()).unwrap();
        assert_eq!(files.len(), 3);
        assert!(files[0].ends_with("a.txt"));
        assert!(files.iter().any(|f| f.ends_with("c.txt")));

        let single = list_files(&dir.path().join("a.txt")).unwrap();
        assert_eq!(single.len(), 1);
    }
}
