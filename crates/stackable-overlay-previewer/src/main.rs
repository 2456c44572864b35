//! Loads a runtime definition and a job manifest, applies the job's pod
//! template overrides onto the runtime's pod template and prints the merged
//! collections, without submitting anything to a cluster.

use std::{
    fs,
    path::{Path, PathBuf},
};

use clap::Parser;
use serde_yaml::Value;
use snafu::{Report, ResultExt, Snafu};
use stackable_overlay::{
    document::{self, FieldPath},
    merge::{self, OverlayPolicy},
    yaml::{self, SerializeOptions},
};
use tracing_subscriber::EnvFilter;

const LOG_ENV_VAR: &str = "OVERLAY_PREVIEWER_LOG";

#[derive(Debug, Snafu)]
enum Error {
    #[snafu(display("failed to read {}", file.display()))]
    ReadFile {
        source: std::io::Error,
        file: PathBuf,
    },

    #[snafu(display("failed to parse {} as YAML", file.display()))]
    ParseDocument {
        source: serde_yaml::Error,
        file: PathBuf,
    },

    #[snafu(display("failed to locate the subtree to merge inside {}", file.display()))]
    LocateSubtree {
        source: document::Error,
        file: PathBuf,
    },

    #[snafu(display("failed to merge collection {collection:?}"))]
    MergeCollection {
        source: merge::Error,
        collection: String,
    },

    #[snafu(display("failed to render merged collection {collection:?}"))]
    RenderCollection {
        source: yaml::Error,
        collection: String,
    },
}

/// Previews the effective pod template of a job before submission.
///
/// The base pod template is taken from the runtime definition, the override
/// fragment from the job manifest. The preview applies the same keyed merge
/// the orchestrator performs at deploy time: containers are correlated by
/// name, their env lists by variable name, everything else is overwritten by
/// the override.
#[derive(Debug, Parser)]
#[command(author, version)]
struct Opts {
    /// Runtime definition containing the base pod template.
    #[arg(long)]
    runtime: PathBuf,

    /// Job manifest containing the pod template overrides.
    #[arg(long)]
    job: PathBuf,

    /// Keyed collection to preview, can be passed multiple times.
    #[arg(long = "collection", default_value = "initContainers")]
    collections: Vec<String>,

    /// Where the base pod template lives inside the runtime document.
    #[arg(long, default_value_t = FieldPath::runtime_pod_spec())]
    runtime_path: FieldPath,

    /// Where the override fragment lives inside the job document.
    #[arg(long, default_value_t = FieldPath::job_override_spec())]
    job_path: FieldPath,
}

fn main() -> Report<Error> {
    initialize_logging();

    let opts = Opts::parse();
    Report::capture(|| run(&opts))
}

fn run(opts: &Opts) -> Result<(), Error> {
    let runtime = load_document(&opts.runtime)?;
    let job = load_document(&opts.job)?;

    let base_spec = opts
        .runtime_path
        .locate_mapping(&runtime)
        .with_context(|_| LocateSubtreeSnafu {
            file: opts.runtime.clone(),
        })?;
    let override_spec = opts
        .job_path
        .locate_mapping(&job)
        .with_context(|_| LocateSubtreeSnafu {
            file: opts.job.clone(),
        })?;

    let policy = OverlayPolicy::default();
    for collection in &opts.collections {
        let merged = merge::merge_collection(base_spec, override_spec, collection, &policy)
            .with_context(|_| MergeCollectionSnafu {
                collection: collection.clone(),
            })?;

        let rendered = yaml::to_string(
            &Value::Sequence(merged),
            SerializeOptions {
                explicit_document: false,
            },
        )
        .with_context(|_| RenderCollectionSnafu {
            collection: collection.clone(),
        })?;

        println!("=== Merged {collection} (preview) ===");
        print!("{rendered}");
    }

    Ok(())
}

fn load_document(file: &Path) -> Result<Value, Error> {
    let contents = fs::read_to_string(file).with_context(|_| ReadFileSnafu {
        file: file.to_owned(),
    })?;

    tracing::debug!(file = %file.display(), "loaded document");

    serde_yaml::from_str(&contents).with_context(|_| ParseDocumentSnafu {
        file: file.to_owned(),
    })
}

/// Initializes `tracing` with options from the `OVERLAY_PREVIEWER_LOG`
/// environment variable, defaulting to INFO.
///
/// Log output goes to stderr, stdout is reserved for the preview itself.
fn initialize_logging() {
    let filter = match EnvFilter::try_from_env(LOG_ENV_VAR) {
        Ok(env_filter) => env_filter,
        _ => EnvFilter::try_new(tracing::Level::INFO.to_string())
            .expect("Failed to initialize default tracing level to INFO"),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
