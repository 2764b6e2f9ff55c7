use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use inquire::error::InquireResult;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod cli;
mod config;
mod eid;
mod enrollment;
mod errors;
mod face;
mod factory;
mod live;
mod lock;
mod matcher;
mod namespace;
mod rebuild;
mod storage;
mod store;
#[cfg(test)]
mod tests;
mod web;

use cli::{Command, DbAction};
use config::Config;
use factory::{AppFactory, RebuildOverrides};
use rebuild::{RebuildPhase, TriggerSource};

fn main() -> anyhow::Result<()> {
    let args = cli::Args::parse();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let config = Config::load()?;

    match args.command {
        Command::Serve { listen } => {
            let state = AppFactory::serve_state(&config)?;
            let listen = listen.unwrap_or_else(|| config.serve.listen.clone());
            web::run(web::serve::router(state), &listen)
        }

        Command::Admin { listen } => {
            let state = AppFactory::admin_state(&config)?;
            let listen = listen.unwrap_or_else(|| config.admin.listen.clone());
            web::run(web::admin::router(state), &listen)
        }

        Command::CreateDb {
            root,
            kind,
            min_images,
            notify,
        } => {
            let overrides = RebuildOverrides {
                enrollment_root: root,
                kind,
                min_images,
                notify,
            };
            create_db(&config, &overrides)
        }

        Command::Recognize { image, threshold } => recognize(&config, &image, threshold),

        Command::Live {
            frames_dir,
            record,
            looping,
            interval_ms,
        } => {
            let model = AppFactory::face_model(&config)?;
            let store = store::StoreHandle::new(
                store::open(&config.store_spec()).context("failed to load face database")?,
            );
            let verifier = AppFactory::verifier(&config, store, model);

            let stop = Arc::new(AtomicBool::new(false));
            {
                let stop = stop.clone();
                ctrlc::set_handler(move || {
                    log::warn!("stopping live verification");
                    stop.store(true, Ordering::SeqCst);
                })?;
            }

            let mut source = live::DirectoryFrames::new(&frames_dir, looping)
                .with_context(|| format!("failed to read {}", frames_dir.display()))?;
            let mut recorder = record
                .as_deref()
                .map(live::Recorder::create)
                .transpose()
                .context("failed to create recording")?;

            let summary = live::run_live(
                &verifier,
                &mut source,
                recorder.as_mut(),
                &stop,
                Duration::from_millis(interval_ms),
            );
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }

        Command::Db { action } => db(&config, action),
    }
}

fn create_db(config: &Config, overrides: &RebuildOverrides) -> anyhow::Result<()> {
    let model = AppFactory::face_model(config)?;
    let orchestrator = AppFactory::orchestrator(config, model, overrides)?;

    let outcome = orchestrator.trigger(TriggerSource::Cli);
    if !outcome.accepted {
        bail!("{}", outcome.message);
    }

    let bar = ProgressBar::new(100);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}% {msg}")?
            .progress_chars("#>-"),
    );

    let status = loop {
        let status = orchestrator.wait(Duration::from_millis(200));
        bar.set_position(status.progress as u64);
        bar.set_message(status.message.clone());
        if !status.is_rebuilding {
            break status;
        }
    };
    bar.finish_and_clear();

    if let Some((name, _)) = orchestrator.latest_log(0) {
        println!("execution log: {}", config.logs_dir().join(name).display());
    }

    match status.status {
        RebuildPhase::Completed => {
            println!("{}", status.message);
            if let Some(err) = status.last_error {
                log::warn!("reload failed: {err}");
            }
            Ok(())
        }
        _ => bail!("{}", status.message),
    }
}

fn recognize(config: &Config, image: &Path, threshold: Option<f32>) -> anyhow::Result<()> {
    if let Some(threshold) = threshold {
        if !(0.0..=1.0).contains(&threshold) {
            bail!("threshold must be between 0.0 and 1.0, got {threshold}");
        }
    }

    let model = AppFactory::face_model(config)?;
    let store = store::StoreHandle::new(
        store::open(&config.store_spec()).context("failed to load face database")?,
    );
    let verifier = AppFactory::verifier(config, store, model);

    let bytes = std::fs::read(image).with_context(|| format!("failed to read {}", image.display()))?;
    let verification = verifier.verify_bytes(&bytes, threshold)?;

    println!("{}", serde_json::to_string_pretty(&verification)?);
    Ok(())
}

fn confirm(message: String) -> anyhow::Result<bool> {
    match inquire::prompt_confirmation(message) {
        InquireResult::Ok(answer) => Ok(answer),
        InquireResult::Err(err) => bail!("An error occurred: {}", err),
    }
}

fn db(config: &Config, action: DbAction) -> anyhow::Result<()> {
    let spec = config.store_spec();

    match action {
        DbAction::List => {
            let db = store::open(&spec).context("failed to load face database")?;
            for identity in db.identities() {
                println!("{}\t{} images", identity.name, identity.image_count);
            }
            println!("{} identities", db.len());
            Ok(())
        }

        DbAction::Info => {
            let db = store::open(&spec).context("failed to load face database")?;
            let size = std::fs::metadata(&spec.path).map(|m| m.len()).unwrap_or(0);
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "path": spec.path.display().to_string(),
                    "kind": db.kind(),
                    "dimensions": db.dimensions(),
                    "identities": db.len(),
                    "size": size,
                }))?
            );
            Ok(())
        }

        DbAction::Remove { name, yes } => {
            if !yes && !confirm(format!("Remove {name} from the face database?"))? {
                return Ok(());
            }

            let _lock = lock::FileLock::acquire_blocking(&lock_dir(&spec.path))?;
            let mut db = store::open(&spec).context("failed to load face database")?;
            if !db.remove(&name)? {
                bail!("{name} not found");
            }
            db.save()?;
            println!("{name} removed, {} identities left", db.len());
            Ok(())
        }

        DbAction::Clear { yes } => {
            if !yes
                && !confirm("You are about to wipe the entire face database. Are you really sure?".to_string())?
            {
                return Ok(());
            }

            let _lock = lock::FileLock::acquire_blocking(&lock_dir(&spec.path))?;
            let mut db = store::open(&spec).context("failed to load face database")?;
            let count = db.len();
            db.clear();
            db.save()?;
            println!("{count} identities removed");
            Ok(())
        }
    }
}

fn lock_dir(store_path: &Path) -> std::path::PathBuf {
    store_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| std::path::PathBuf::from("."))
}
