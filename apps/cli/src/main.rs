// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! City-Lite CLI - batch transformations of 3D city-model documents.
//!
//! Every subcommand reads one or more JSON-lines documents, runs the
//! processing engine with the matching options and writes the result under
//! the output directory with the same file name. A failing document is
//! logged and skipped; the exit code is non-zero if any document failed.
//!
//! # Commands
//!
//! - `filter-lods` - keep or remove levels of detail
//! - `subset` - select features by type, id or bounding box
//! - `remove-apps` - remove appearances by theme or kind
//! - `to-local-apps` - move global appearances into the features
//! - `upgrade` - resolve cross-feature and cross-LOD geometry references, or
//!   unlink references into one level of detail

use std::path::Path;
use std::process::ExitCode;

use anyhow::{bail, Context};
use city_lite_model::{Envelope, JsonLinesSource, JsonLinesWriter, Lod};
use city_lite_processing::{
    process_document, AppearanceFilter, BboxMode, CrossLodMode, LodPolicy, LodSet,
    MapConversionProvider, ProcessingOptions, ResourceCopier,
};
use clap::{Parser, Subcommand, ValueEnum};
use rustc_hash::FxHashSet;
use tracing_subscriber::EnvFilter;

mod config;

use config::{CommonArgs, Config};

#[derive(Parser)]
#[command(name = "city-lite")]
#[command(about = "Batch transformations of 3D city-model documents", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Keep or remove levels of detail
    FilterLods {
        #[command(flatten)]
        common: CommonArgs,
        /// How the given levels are applied
        #[arg(long, value_enum, default_value_t = LodMode::Keep)]
        mode: LodMode,
        /// Levels of detail (0-4)
        #[arg(short, long = "lod", required = true, value_parser = clap::value_parser!(u8).range(0..=4))]
        lods: Vec<u8>,
        /// Keep features left without geometry
        #[arg(long)]
        keep_empty: bool,
    },
    /// Select top-level features by type, id or bounding box
    Subset {
        #[command(flatten)]
        common: CommonArgs,
        /// Feature types to keep
        #[arg(long = "type")]
        types: Vec<String>,
        /// Feature ids to keep
        #[arg(long = "id")]
        ids: Vec<String>,
        /// Bounding box as minx,miny,maxx,maxy
        #[arg(long, value_delimiter = ',', allow_negative_numbers = true)]
        bbox: Option<Vec<f64>>,
        /// Reference system of the bounding box (default: the document's)
        #[arg(long, requires = "bbox")]
        bbox_srs: Option<String>,
        #[arg(long, value_enum, default_value_t = BboxArg::Intersects)]
        bbox_mode: BboxArg,
    },
    /// Remove appearances
    RemoveApps {
        #[command(flatten)]
        common: CommonArgs,
        /// Themes to remove (default: all)
        #[arg(long = "theme")]
        themes: Vec<String>,
        /// Also remove appearances without a theme
        #[arg(long)]
        unnamed_theme: bool,
        #[arg(long, conflicts_with = "only_materials")]
        only_textures: bool,
        #[arg(long)]
        only_materials: bool,
    },
    /// Move global appearances into the features they decorate
    ToLocalApps {
        #[command(flatten)]
        common: CommonArgs,
    },
    /// Resolve geometry references
    Upgrade {
        #[command(flatten)]
        common: CommonArgs,
        /// Give every feature its own copy of geometry shared across features
        #[arg(long)]
        cross_feature: bool,
        /// Record relations between features that shared a geometry
        #[arg(long, requires = "cross_feature")]
        relations: bool,
        /// Inline geometry referenced from another level of detail
        #[arg(long, conflicts_with = "unlink_lod")]
        cross_lod: bool,
        /// Drop references from other levels of detail into geometry of this level (0-4)
        #[arg(long, value_parser = clap::value_parser!(u8).range(0..=4))]
        unlink_lod: Option<u8>,
        /// Use LOD 4 geometry as LOD 3
        #[arg(long)]
        lod4_as_lod3: bool,
        /// Declare every template inline once and reference it afterwards
        #[arg(long)]
        templates: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LodMode {
    Keep,
    Remove,
    Minimum,
    Maximum,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum BboxArg {
    Intersects,
    Within,
    Center,
}

impl From<BboxArg> for BboxMode {
    fn from(arg: BboxArg) -> Self {
        match arg {
            BboxArg::Intersects => BboxMode::Intersects,
            BboxArg::Within => BboxMode::Within,
            BboxArg::Center => BboxMode::Center,
        }
    }
}

impl Commands {
    fn into_job(self) -> anyhow::Result<(Config, ProcessingOptions)> {
        let mut options = ProcessingOptions::default();
        let common = match self {
            Commands::FilterLods {
                common,
                mode,
                lods,
                keep_empty,
            } => {
                let set: LodSet = lods.into_iter().filter_map(Lod::new).collect();
                let policy = match mode {
                    LodMode::Keep => LodPolicy::Keep(set),
                    LodMode::Remove => LodPolicy::Remove(set),
                    LodMode::Minimum => LodPolicy::Minimum(set),
                    LodMode::Maximum => LodPolicy::Maximum(set),
                };
                options.lod_filter = Some((policy, keep_empty));
                common
            }
            Commands::Subset {
                common,
                types,
                ids,
                bbox,
                bbox_srs,
                bbox_mode,
            } => {
                if types.is_empty() && ids.is_empty() && bbox.is_none() {
                    bail!("subset needs at least one of --type, --id or --bbox");
                }
                if !types.is_empty() {
                    options.feature_types = Some(types.into_iter().collect::<FxHashSet<_>>());
                }
                if !ids.is_empty() {
                    options.feature_ids = Some(ids.into_iter().collect::<FxHashSet<_>>());
                }
                if let Some(b) = bbox {
                    let &[minx, miny, maxx, maxy] = b.as_slice() else {
                        bail!("--bbox expects four values, got {}", b.len());
                    };
                    let mut envelope = Envelope::new([minx, miny, 0.0], [maxx, maxy, 0.0]);
                    envelope.srs = bbox_srs;
                    options.bbox = Some((envelope, bbox_mode.into()));
                }
                common
            }
            Commands::RemoveApps {
                common,
                themes,
                unnamed_theme,
                only_textures,
                only_materials,
            } => {
                let mut filter = AppearanceFilter::all();
                if !themes.is_empty() || unnamed_theme {
                    let unnamed = unnamed_theme.then_some(None);
                    filter = filter.with_themes(themes.into_iter().map(Some).chain(unnamed));
                }
                filter.only_textures = only_textures;
                filter.only_materials = only_materials;
                options.remove_appearances = Some(filter);
                common
            }
            Commands::ToLocalApps { common } => {
                options.local_appearances = true;
                common
            }
            Commands::Upgrade {
                common,
                cross_feature,
                relations,
                cross_lod,
                unlink_lod,
                lod4_as_lod3,
                templates,
            } => {
                options.resolve_cross_feature = cross_feature;
                options.cross_feature_relations = relations;
                options.cross_lod = match unlink_lod.and_then(Lod::new) {
                    Some(lod) => Some(CrossLodMode::RemoveReferencesTo(lod)),
                    None => cross_lod.then_some(CrossLodMode::Resolve),
                };
                options.use_lod4_as_lod3 = lod4_as_lod3;
                options.resolve_templates = templates;
                common
            }
        };
        Ok((Config::from_args(common), options))
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let (config, options) = match cli.command.into_job() {
        Ok(job) => job,
        Err(e) => {
            tracing::error!(error = %e, "invalid arguments");
            return ExitCode::FAILURE;
        }
    };

    tracing::info!(
        documents = config.inputs.len(),
        output = %config.output_dir.display(),
        copy_resources = config.copy_resources,
        workers = config.copier.workers,
        "starting"
    );

    let mut failed = 0;
    for input in &config.inputs {
        if let Err(e) = process_file(input, &config, &options) {
            tracing::error!(document = %input.display(), error = %format!("{e:#}"), "document failed");
            failed += 1;
        }
    }

    if failed > 0 {
        tracing::error!(failed, total = config.inputs.len(), "finished with failures");
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn process_file(input: &Path, config: &Config, options: &ProcessingOptions) -> anyhow::Result<()> {
    let output = config.output_path(input);
    if output == input {
        bail!("output would overwrite the input document");
    }
    std::fs::create_dir_all(&config.output_dir)
        .with_context(|| format!("creating {}", config.output_dir.display()))?;

    let copier = config.copy_resources.then(|| {
        let base = input.parent().unwrap_or_else(|| Path::new("."));
        ResourceCopier::new(base, &config.output_dir, config.copier)
    });

    let source = JsonLinesSource::new(input);
    let mut writer = JsonLinesWriter::create(&output)
        .with_context(|| format!("creating {}", output.display()))?;
    let crs = MapConversionProvider::new();
    let stats = process_document(&source, &mut writer, options, &crs, copier.as_ref())?;
    drop(writer);

    if let Some(copier) = copier {
        let copied = copier.finish().context("copying resources")?;
        tracing::info!(document = %input.display(), copied, "resources copied");
    }

    if config.json {
        println!("{}", serde_json::to_string(&stats)?);
    } else {
        println!("{}: {stats}", input.display());
    }
    Ok(())
}
