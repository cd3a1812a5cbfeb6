//! Scene analyzer: shot labels for every camera, or the cameras that can
//! see a subject at a given position.
//!
//! Reads a scene JSON (cameras, structures, structural lines or planes) and
//! prints the analysis as JSON.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use multicam_director::camera::Vec3;
use multicam_director::config::Config;
use multicam_director::scene::SceneDocument;
use multicam_director::visibility::VisibilityEngine;

#[derive(Parser, Debug)]
#[command(author, version, about = "Scene shot labels and subject visibility", long_about = None)]
struct Args {
    /// シーンファイル（JSON）
    scene: PathBuf,

    /// 閾値を読む設定ファイル（無ければ既定値）
    #[arg(short, long, default_value = "director.toml")]
    config: PathBuf,

    /// 整形して出力
    #[arg(long)]
    pretty: bool,

    #[command(subcommand)]
    command: Option<Mode>,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// 全カメラのショット分類（既定）
    Scene,
    /// 被写体位置を撮れるカメラ
    Subject {
        /// x,y,z
        #[arg(value_delimiter = ',', num_args = 1.., allow_negative_numbers = true)]
        position: Vec<f64>,
    },
}

fn print_json<T: serde::Serialize>(value: &T, pretty: bool) -> Result<()> {
    let text = if pretty {
        serde_json::to_string_pretty(value)?
    } else {
        serde_json::to_string(value)?
    };
    println!("{text}");
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("multicam_director=info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    let config = Config::load_if_present(&args.config)?;

    let document = SceneDocument::load(&args.scene)?;
    let registry = document.registry().context("invalid camera in scene file")?;
    let scene = document.into_scene();
    info!(
        cameras = registry.len(),
        structures = scene.structures().len(),
        lines = scene.lines().len(),
        "scene loaded"
    );

    match args.command.unwrap_or(Mode::Scene) {
        Mode::Scene => print_json(&scene.analyze_scene(&registry, &config.scene), args.pretty),
        Mode::Subject { position } => {
            let [x, y, z] = position[..] else {
                bail!("position must be x,y,z");
            };
            let engine = VisibilityEngine::new(config.visibility);
            let result = scene.analyze_subject(&registry, &engine, &Vec3::new(x, y, z));
            print_json(&result, args.pretty)
        }
    }
}
