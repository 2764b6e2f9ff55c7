use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::store::StoreKind;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the recognition service.
    Serve {
        /// Listen address, overrides serve.listen
        #[clap(long)]
        listen: Option<String>,
    },

    /// Start the enrollment admin service.
    Admin {
        /// Listen address, overrides admin.listen
        #[clap(long)]
        listen: Option<String>,
    },

    /// Rebuild the face database from the enrollment folders.
    CreateDb {
        /// Enrollment root, overrides enrollment_root
        #[clap(long)]
        root: Option<PathBuf>,

        /// Store variant (exact or indexed)
        #[clap(long)]
        kind: Option<StoreKind>,

        /// Minimum usable images per identity
        #[clap(long)]
        min_images: Option<usize>,

        /// Ask the serving process to reload when done
        #[clap(long, default_value = "false")]
        notify: bool,
    },

    /// Verify a single image against the database.
    Recognize {
        image: PathBuf,

        /// Recognition threshold for this call
        #[clap(short, long)]
        threshold: Option<f32>,
    },

    /// Verify every image of a directory as a stream of frames.
    Live {
        frames_dir: PathBuf,

        /// Write one JSON line per verified frame
        #[clap(long)]
        record: Option<PathBuf>,

        /// Start over after the last frame until interrupted
        #[clap(long = "loop", default_value = "false")]
        looping: bool,

        /// Pause between frames
        #[clap(long, default_value = "0")]
        interval_ms: u64,
    },

    /// Inspect or edit the persisted face database.
    Db {
        #[command(subcommand)]
        action: DbAction,
    },
}

#[derive(Subcommand, Debug, Clone)]
pub enum DbAction {
    /// List identities
    List,

    /// Show store details
    Info,

    /// Remove one identity
    Remove {
        name: String,

        /// Auto confirm
        #[clap(short, long, default_value = "false")]
        yes: bool,
    },

    /// Remove every identity
    Clear {
        /// Auto confirm
        #[clap(short, long, default_value = "false")]
        yes: bool,
    },
}
