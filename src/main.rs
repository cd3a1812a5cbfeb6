//! Director service: replays recorded per-frame detections through the
//! tracking pipeline and writes broadcast messages to stdout as JSON lines.
//!
//! Client commands (`start_tracking`, `stop_tracking`, `set_active_camera`)
//! are read from stdin, one JSON object per line.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedWrite, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use multicam_director::camera::{CameraRegistry, CaptureSet, Frame};
use multicam_director::config::Config;
use multicam_director::detection::{DetectionFrame, Detections, Detector};
use multicam_director::protocol::{self, ServerMessage};
use multicam_director::service::FrameLoop;
use multicam_director::tracker::TrackState;

#[derive(Parser, Debug)]
#[command(author, version, about = "Multi-camera subject tracking director", long_about = None)]
struct Args {
    /// 設定ファイル
    #[arg(short, long, default_value = "director.toml")]
    config: PathBuf,

    /// 検出結果の記録（JSON Lines, 1行1フレーム）
    replay: PathBuf,

    /// 起動直後から追跡を開始する
    #[arg(long)]
    start: bool,
}

/// 記録済みの検出結果を1行ずつ返す。末尾に達したらループを止める
struct ReplayDetector {
    lines: std::io::Lines<BufReader<File>>,
    line_no: usize,
    done: CancellationToken,
}

impl ReplayDetector {
    fn open(path: &Path, done: CancellationToken) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
        Ok(Self {
            lines: BufReader::new(file).lines(),
            line_no: 0,
            done,
        })
    }
}

impl Detector for ReplayDetector {
    fn detect(&mut self, frame_index: u64, _frames: &[Frame]) -> Result<Detections> {
        loop {
            let Some(line) = self.lines.next() else {
                info!(frame = frame_index, "replay finished");
                self.done.cancel();
                return Ok(Detections::new());
            };
            self.line_no += 1;
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record: DetectionFrame = serde_json::from_str(&line)
                .with_context(|| format!("replay line {}", self.line_no))?;
            return Ok(record.subjects);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("multicam_director=info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    info!("multicam_director {}", env!("GIT_VERSION"));

    let mut config = Config::load_if_present(&args.config).context("invalid configuration")?;
    if args.start {
        config.service.start_running = true;
    }

    let registry = CameraRegistry::from_configs(&config.cameras).context("invalid camera configuration")?;
    if registry.is_empty() {
        bail!("no cameras configured in {}", args.config.display());
    }
    for info in registry.cameras_info() {
        let url = registry.get(&info.id).and_then(|c| c.url()).unwrap_or("-");
        info!(camera_id = %info.id, name = %info.name, url, fov = info.fov, active = info.is_active, "camera");
    }

    let cancel = CancellationToken::new();
    let detector = ReplayDetector::open(&args.replay, cancel.clone())?;
    let tracker = TrackState::new(&config.tracker);

    let (tx, mut rx) = mpsc::channel::<ServerMessage>(64);
    let frame_loop = FrameLoop::new(
        registry,
        CaptureSet::new(),
        Box::new(detector),
        tracker,
        &config.service,
        tx,
    );

    // stdout へ配信
    let writer = tokio::spawn(async move {
        let mut out = FramedWrite::new(tokio::io::stdout(), LinesCodec::new());
        while let Some(message) = rx.recv().await {
            if let Err(e) = protocol::send_message(&mut out, &message).await {
                warn!("failed to write message: {e:#}");
                break;
            }
        }
    });

    // stdin からコマンド受付。ブロッキング読み込みなのでランタイム外のスレッドで行い、
    // 終了時には待たない
    let commands = frame_loop.commands();
    std::thread::Builder::new()
        .name("stdin-commands".into())
        .spawn(move || {
            if let Err(e) = protocol::forward_commands(std::io::stdin().lock(), &commands) {
                warn!("command input closed: {e:#}");
            }
        })
        .context("failed to spawn command reader")?;

    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupted");
            ctrl_c.cancel();
        }
    });

    frame_loop.run(cancel).await?;
    writer.await.context("writer task failed")?;
    Ok(())
}
