use std::{env, fs, path::PathBuf, sync::Arc};

use anyhow::Context;
use clap::Parser;
use log::{info, warn};
use machine_learning::{
    StateDict,
    arch::{Backbone, Classifier, Model, loss::CrossEntropy},
    optimization::Adam,
};
use rand::{SeedableRng, rngs::StdRng};

use trainer::{
    BestModelSelector, CheckpointStore, Controller, DistributedContext, Interrupt, Resumed,
    TrainConfig, TrainingSession,
    data::{CyclicLoader, DataLoader, ImageFolder, ShardSpec},
    resume,
    sync::Group,
    tracker::{MlflowTracker, OfflineTracker, Tracker},
};

/// Trains the image classifier, optionally across several worker processes.
#[derive(Debug, Parser)]
#[command(name = "train", version, about)]
struct Cli {
    /// Name of the model, selects its checkpoint directory.
    model_name: Option<String>,

    /// Accepted for compatibility, resuming is requested with `--resume`.
    #[arg(hide = true)]
    first_run: Option<String>,

    /// Resume from the model's checkpoint.
    #[arg(long)]
    resume: bool,

    /// JSON file overriding the default configuration.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    epochs: Option<usize>,

    #[arg(long)]
    batch_size: Option<usize>,

    #[arg(long)]
    data_dir: Option<PathBuf>,

    #[arg(long)]
    models_dir: Option<PathBuf>,

    /// Wall-clock budget in seconds, checked at epoch boundaries.
    #[arg(long)]
    cutoff: Option<u64>,

    /// Keep the experiment log in memory instead of reporting it.
    #[arg(long)]
    offline: bool,

    /// Skip the per-epoch checkpoint and resume metadata.
    #[arg(long)]
    no_checkpointing: bool,

    /// Assemble batches on a background thread.
    #[arg(long)]
    prefetch: bool,
}

impl Cli {
    /// Layers the config file and the command line over the defaults.
    fn config(&self) -> trainer::Result<TrainConfig> {
        let mut cfg = match &self.config {
            Some(path) => TrainConfig::from_json_file(path)?,
            None => TrainConfig::default(),
        };

        if let Some(model_name) = &self.model_name {
            cfg.model_name = model_name.clone();
        }
        if let Some(epochs) = self.epochs {
            cfg.epochs = epochs;
        }
        if let Some(batch_size) = self.batch_size {
            cfg.batch_size = batch_size;
        }
        if let Some(data_dir) = &self.data_dir {
            cfg.data_dir = data_dir.clone();
        }
        if let Some(models_dir) = &self.models_dir {
            cfg.models_dir = models_dir.clone();
        }
        if self.cutoff.is_some() {
            cfg.train_cutoff = self.cutoff;
        }
        cfg.log_remote &= !self.offline;
        cfg.checkpointing &= !self.no_checkpointing;
        cfg.prefetch |= self.prefetch;

        cfg.validate()?;
        Ok(cfg)
    }
}

fn tracking_credentials() -> Option<(String, String)> {
    let user = env::var("MLFLOW_TRACKING_USERNAME").ok()?;
    let password = env::var("MLFLOW_TRACKING_PASSWORD").ok()?;
    Some((user, password))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    if cli.first_run.is_some() {
        warn!("ignoring the second positional argument, pass --resume to resume a run");
    }

    let cfg = cli.config()?;
    let ctx = DistributedContext::from_env()?;
    info!("rank {} of {}, training {}", ctx.rank, ctx.world_size, cfg.model_name);

    let store = CheckpointStore::new(&cfg.models_dir, &cfg.model_name);
    store.create()?;
    if ctx.is_primary() && cfg.checkpointing && !cli.resume && store.has_metadata() {
        warn!(
            "starting a new run, the checkpoint in {} will be overwritten",
            store.dir().display()
        );
    }

    let interrupt = Interrupt::new();
    interrupt.listen_ctrl_c();

    let sync = Group::init(&ctx).await?;
    let mut tracker = if ctx.is_primary() && cfg.log_remote {
        let credentials = tracking_credentials();
        Tracker::Mlflow(MlflowTracker::new(&cfg.tracking_uri, &cfg.experiment_id, credentials))
    } else {
        Tracker::Offline(OfflineTracker::new())
    };

    let dataset = Arc::new(ImageFolder::open(&cfg.data_dir, &cfg.classes, cfg.image_size)?);
    let shard = ShardSpec::new(ctx.rank, ctx.world_size)?;
    let loader = DataLoader::new(dataset, shard, cfg.batch_size, cfg.seed)?;
    let mut loader = if cfg.prefetch {
        CyclicLoader::prefetching(loader, None, cfg.prefetch_depth)?
    } else {
        CyclicLoader::new(loader, None)
    };

    let backbone = match &cfg.pretrained_path {
        Some(path) => {
            let raw = fs::read(path)
                .with_context(|| format!("reading pre-trained weights {}", path.display()))?;
            Backbone::Pretrained(StateDict::from_safetensors_bytes(&raw)?)
        }
        None => Backbone::Fresh,
    };

    // Same seed on every rank so they all start from the same weights.
    let mut rng = StdRng::seed_from_u64(cfg.seed);
    let mut model = Classifier::new(&cfg.classifier_spec(), backbone, &mut rng)?;
    let mut optimizer = Adam::with_defaults(model.size(), cfg.learning_rate);

    let resumed = if cli.resume {
        resume(&store, &mut tracker, &mut model, &mut optimizer).await?
    } else {
        Resumed {
            epoch: 0,
            run_id: None,
            selector: BestModelSelector::new(0),
        }
    };

    let mut session = TrainingSession::new(model, optimizer, resumed.epoch, cfg.cutoff());
    let mut controller =
        Controller::new(&cfg, sync, tracker, store, interrupt).with_run_id(resumed.run_id);

    let outcome = controller
        .run(&mut session, &mut loader, &CrossEntropy::new(), resumed.selector)
        .await?;

    if let Some(selected) = &outcome.selected {
        info!(
            "done after epoch {:?}, best epoch {} at accuracy {}, resume at {}",
            outcome.final_epoch, selected.best_epoch, selected.best_accuracy, outcome.next_epoch
        );
    }

    let (sync, _) = controller.into_parts();
    sync.shutdown().await?;
    Ok(())
}
