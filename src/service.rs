//! Paced frame loop: capture → detect → track → publish.

use anyhow::{anyhow, Context, Result};
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::camera::{CaptureSet, CameraRegistry};
use crate::config::ServiceConfig;
use crate::detection::Detector;
use crate::protocol::{Command, ServerMessage};
use crate::tracker::TrackState;

/// コマンド受付キューの長さ
const COMMAND_QUEUE: usize = 32;

async fn publish(publisher: &mpsc::Sender<ServerMessage>, message: ServerMessage) -> Result<()> {
    publisher
        .send(message)
        .await
        .map_err(|_| anyhow!("publisher closed"))
}

pub struct FrameLoop {
    registry: CameraRegistry,
    capture: CaptureSet,
    detector: Box<dyn Detector>,
    tracker: TrackState,
    publisher: mpsc::Sender<ServerMessage>,
    commands_tx: mpsc::Sender<Command>,
    commands_rx: mpsc::Receiver<Command>,
    frame_interval: Duration,
    error_backoff: Duration,
    start_running: bool,
    frame_index: u64,
}

impl FrameLoop {
    pub fn new(
        registry: CameraRegistry,
        capture: CaptureSet,
        detector: Box<dyn Detector>,
        tracker: TrackState,
        config: &ServiceConfig,
        publisher: mpsc::Sender<ServerMessage>,
    ) -> Self {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_QUEUE);
        Self {
            registry,
            capture,
            detector,
            tracker,
            publisher,
            commands_tx,
            commands_rx,
            frame_interval: Duration::from_millis(config.frame_interval_ms),
            error_backoff: Duration::from_millis(config.error_backoff_ms),
            start_running: config.start_running,
            frame_index: 0,
        }
    }

    /// コマンド送信口。コマンドは次のフレーム境界で適用される
    pub fn commands(&self) -> mpsc::Sender<Command> {
        self.commands_tx.clone()
    }

    pub fn registry(&self) -> &CameraRegistry {
        &self.registry
    }

    pub fn tracker(&self) -> &TrackState {
        &self.tracker
    }

    /// キャプチャを試みたフレーム数
    pub fn frame_index(&self) -> u64 {
        self.frame_index
    }

    async fn apply_command(&mut self, command: Command) -> Result<()> {
        debug!(?command, "command received");
        match command {
            Command::StartTracking => self.tracker.start(),
            Command::StopTracking => self.tracker.stop(),
            Command::SetActiveCamera(camera_id) => {
                if !self.registry.set_active(&camera_id) {
                    warn!(camera_id = %camera_id, "set_active_camera: unknown camera");
                    let ack = ServerMessage::CommandAck {
                        ok: false,
                        error: Some(format!("unknown camera: {camera_id}")),
                    };
                    return publish(&self.publisher, ack).await;
                }
                info!(camera_id = %camera_id, "active camera changed");
                publish(&self.publisher, ServerMessage::CommandAck { ok: true, error: None }).await?;
                let info = ServerMessage::CamerasInfo {
                    cameras: self.registry.cameras_info(),
                };
                return publish(&self.publisher, info).await;
            }
        }
        publish(&self.publisher, ServerMessage::CommandAck { ok: true, error: None }).await
    }

    /// 1フレーム処理して配信した被写体数を返す
    ///
    /// 停止中はキャプチャも行わない。
    pub async fn run_once(&mut self) -> Result<usize> {
        while let Ok(command) = self.commands_rx.try_recv() {
            self.apply_command(command).await?;
        }

        if !self.tracker.is_running() {
            return Ok(0);
        }

        self.frame_index += 1;
        let frame = self.frame_index;

        let frames = self.capture.capture(frame).await;
        if !self.capture.is_empty() && frames.is_empty() {
            debug!(frame, "no frames from any camera");
            return Ok(0);
        }
        for f in &frames {
            self.registry.set_frame_size(&f.camera_id, f.width, f.height);
        }

        let detections = self
            .detector
            .detect(frame, &frames)
            .with_context(|| format!("detection failed at frame {frame}"))?;

        let persons = self.tracker.track(&self.registry, &detections);
        let count = persons.len();
        if count > 0 {
            let message = ServerMessage::Persons {
                timestamp: self.tracker.timestamp_ms(),
                persons,
            };
            publish(&self.publisher, message).await?;
        }
        Ok(count)
    }

    /// キャンセルされるまでフレームループを回す
    ///
    /// 正常時は `frame_interval` 間隔、エラー後は `error_backoff` 待つ。
    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        if self.start_running {
            self.tracker.start();
        }
        let info = ServerMessage::CamerasInfo {
            cameras: self.registry.cameras_info(),
        };
        publish(&self.publisher, info).await?;

        info!(
            cameras = self.registry.len(),
            interval_ms = self.frame_interval.as_millis() as u64,
            "frame loop started"
        );

        let mut fps_timer = Instant::now();
        let mut fps_frames = 0u32;
        let mut fps_subjects = 0usize;

        loop {
            let start = Instant::now();

            let result = tokio::select! {
                _ = cancel.cancelled() => break,
                r = self.run_once() => r,
            };

            let delay = match result {
                Ok(count) => {
                    if self.tracker.is_running() {
                        fps_frames += 1;
                        fps_subjects += count;
                    }
                    self.frame_interval.saturating_sub(start.elapsed())
                }
                Err(e) => {
                    if self.publisher.is_closed() {
                        info!("publisher closed, stopping frame loop");
                        break;
                    }
                    error!(frame = self.frame_index, "frame loop error: {e:#}");
                    self.error_backoff
                }
            };

            if fps_timer.elapsed() >= Duration::from_secs(1) {
                let secs = fps_timer.elapsed().as_secs_f64();
                if fps_frames > 0 {
                    info!(
                        "{:.1} fps, {:.1} subjects/frame",
                        fps_frames as f64 / secs,
                        fps_subjects as f64 / fps_frames as f64
                    );
                }
                fps_frames = 0;
                fps_subjects = 0;
                fps_timer = Instant::now();
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(delay) => {}
            }
        }

        info!(frames = self.frame_index, "frame loop stopped");
        Ok(())
    }
}
