//! teachable - collect, train and predict against a live frame source
//!
//! Stages:
//! 1. Open the frame source and load the feature extractor
//! 2. Collect samples for every `--class` (stub sources show each class its
//!    own synthetic scene)
//! 3. Train a head on the collected samples
//! 4. Predict until `--predict-secs` elapse or Ctrl-C

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use teachable_kernel::config::SessionConfig;
use teachable_kernel::ingest::{open_source, Scene, SceneHandle};
use teachable_kernel::ui;
use teachable_kernel::{
    load_extractor_reporting, ClassLabel, LogFailureSink, PredictionResult, Session, StoreReader,
};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Config file (JSON, or TOML with a .toml extension).
    #[arg(long, env = "TEACHABLE_CONFIG")]
    config: Option<PathBuf>,

    /// Frame source URL; overrides the config file.
    #[arg(long)]
    source: Option<String>,

    /// Class to collect; repeat for each class.
    #[arg(long = "class", value_name = "NAME", default_values = ["left", "right"])]
    classes: Vec<String>,

    /// Samples to collect per class.
    #[arg(long, default_value_t = 10)]
    samples: usize,

    /// Seconds to run live prediction for (0 = until Ctrl-C).
    #[arg(long, default_value_t = 5)]
    predict_secs: u64,

    /// UI mode for stderr progress (auto|plain|pretty).
    #[arg(long, default_value = "auto", value_name = "MODE")]
    ui: String,
}

/// Scene shown to the stub camera while class `index` is collected.
fn scene_for(index: usize) -> Scene {
    const PALETTE: [[u8; 3]; 4] = [[210, 50, 40], [40, 70, 210], [40, 180, 60], [230, 200, 40]];
    match index % 6 {
        4 => Scene::Gradient,
        5 => Scene::Stripes {
            a: [20, 20, 20],
            b: [235, 235, 235],
            period: 8,
        },
        i => Scene::Solid(PALETTE[i]),
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    if args.classes.len() < 2 {
        return Err(anyhow!("at least two --class values are needed to train"));
    }
    if args.samples == 0 {
        return Err(anyhow!("--samples must be >= 1"));
    }

    let is_tty = std::io::stderr().is_terminal();
    let stdout_is_tty = std::io::stdout().is_terminal();
    let ui = ui::Ui::from_args(Some(&args.ui), is_tty, !stdout_is_tty);

    let mut cfg = SessionConfig::load_from(args.config.as_deref())?;
    if let Some(url) = &args.source {
        cfg.source.url = url.clone();
    }

    let opened = {
        let _stage = ui.stage("open frame source");
        open_source(&cfg.source.url, cfg.source.width, cfg.source.height)?
    };
    let extractor = {
        let _stage = ui.stage("load feature extractor");
        load_extractor_reporting(&cfg.model, &LogFailureSink)?
    };
    let mut session = Session::new(
        opened.source,
        extractor,
        cfg.session_settings(),
        Arc::new(LogFailureSink),
    );

    let mut labels = Vec::with_capacity(args.classes.len());
    for (index, name) in args.classes.iter().enumerate() {
        let _stage = ui.stage(&format!("collect {} samples of {}", args.samples, name));
        if let Some(scene) = &opened.scene {
            scene.set(scene_for(index));
        }
        let label = session.add_class(Some(name))?;
        collect(&mut session, label, args.samples, cfg.capture_interval)?;
        labels.push(label);
    }

    {
        let _stage = ui.stage("train");
        let progress = Arc::new(ui.training(cfg.training.epochs));
        let summary = session.train(progress.clone())?.wait()?;
        progress.finish(&summary);
        log::info!(
            "head trained on {} samples, {} classes, final loss {:.4}, accuracy {:.1}%",
            summary.samples,
            summary.num_classes,
            summary.final_loss,
            summary.final_accuracy * 100.0
        );
    }

    let _stage = ui.stage("predict");
    predict(&mut session, &labels, opened.scene.as_ref(), args.predict_secs)?;
    Ok(())
}

/// Arm capture for `label` until it holds `samples` samples.
fn collect(session: &mut Session, label: ClassLabel, samples: usize, interval: Duration) -> Result<()> {
    let store = session.store();
    let budget = interval * (samples as u32).saturating_mul(10) + Duration::from_secs(2);
    let started = Instant::now();

    session.start_capture(label)?;
    while store.sample_count(label)? < samples {
        if started.elapsed() > budget {
            session.stop_capture(label)?;
            return Err(anyhow!(
                "class {} collected only {} of {} samples in {:?}",
                label,
                store.sample_count(label)?,
                samples,
                budget
            ));
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    let summary = session.stop_capture(label)?;
    log::info!(
        "class {}: {} samples ({} failed ticks, {} skipped)",
        label,
        store.sample_count(label)?,
        summary.failed,
        summary.skipped
    );
    Ok(())
}

fn predict(
    session: &mut Session,
    labels: &[ClassLabel],
    scene: Option<&SceneHandle>,
    seconds: u64,
) -> Result<()> {
    let last = Mutex::new(None::<ClassLabel>);
    let sink = move |result: &PredictionResult| {
        let Ok(mut last) = last.lock() else {
            return;
        };
        if *last != Some(result.label) {
            *last = Some(result.label);
            println!("{} ({:.0}%)", result.name, result.confidence * 100.0);
        }
    };
    if !session.start_predicting(Arc::new(sink))? {
        return Err(anyhow!("no trained head to predict with"));
    }

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .context("error setting Ctrl-C handler")?;

    let deadline = (seconds > 0).then(|| Instant::now() + Duration::from_secs(seconds));
    let store: StoreReader = session.store();
    let mut shown = 0usize;
    loop {
        // on stub sources, walk through the class scenes once a second
        if let Some(scene) = scene {
            scene.set(scene_for(shown % labels.len()));
            log::debug!(
                "showing scene of {}",
                store.class_name(labels[shown % labels.len()])?
            );
            shown += 1;
        }
        let wait = match deadline {
            Some(deadline) => {
                let left = deadline.saturating_duration_since(Instant::now());
                if left.is_zero() {
                    break;
                }
                left.min(Duration::from_secs(1))
            }
            None => Duration::from_secs(1),
        };
        match rx.recv_timeout(wait) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                log::info!("shutdown signal received, stopping predictor...");
                break;
            }
        }
    }
    session.stop_predicting();
    Ok(())
}
