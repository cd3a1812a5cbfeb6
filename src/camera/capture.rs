use anyhow::Result;
use bytes::Bytes;
use tracing::{debug, error, warn};

/// 1台のカメラから取得した生フレーム（中身はデコードしない）
#[derive(Debug, Clone)]
pub struct Frame {
    pub camera_id: String,
    pub width: u32,
    pub height: u32,
    pub data: Bytes,
}

/// カメラ映像の取得元
///
/// `read_frame` はブロッキングでよい（キャプチャ用スレッドで呼ばれる）。
/// `Ok(None)` は「このサイクルはフレーム無し」で、エラーではない。
pub trait FrameSource: Send + 'static {
    fn camera_id(&self) -> &str;

    fn read_frame(&mut self) -> Result<Option<Frame>>;

    /// 取得失敗後に呼ばれる再接続
    fn reconnect(&mut self) -> Result<()>;
}

/// 全カメラの同時キャプチャ
///
/// 各カメラの読み込みは独立したブロッキングタスクで並行に行い、全て揃ってから返す。
/// 1台の失敗は他のカメラに影響せず、そのカメラだけ再接続を試みる。
#[derive(Default)]
pub struct CaptureSet {
    sources: Vec<Box<dyn FrameSource>>,
}

impl CaptureSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, source: Box<dyn FrameSource>) {
        self.sources.push(source);
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub async fn capture(&mut self, frame_index: u64) -> Vec<Frame> {
        let sources = std::mem::take(&mut self.sources);

        let handles: Vec<_> = sources
            .into_iter()
            .map(|mut source| {
                tokio::task::spawn_blocking(move || {
                    let frame = read_or_reconnect(source.as_mut(), frame_index);
                    (source, frame)
                })
            })
            .collect();

        let mut frames = Vec::with_capacity(handles.len());
        for joined in futures::future::join_all(handles).await {
            match joined {
                Ok((source, frame)) => {
                    self.sources.push(source);
                    frames.extend(frame);
                }
                // パニックしたソースは復元できないので外す
                Err(e) => error!(frame = frame_index, "capture task failed, source dropped: {e}"),
            }
        }
        frames
    }
}

fn read_or_reconnect(source: &mut dyn FrameSource, frame_index: u64) -> Option<Frame> {
    match source.read_frame() {
        Ok(Some(frame)) => Some(frame),
        Ok(None) => {
            debug!(camera_id = source.camera_id(), frame = frame_index, "no frame this cycle");
            None
        }
        Err(e) => {
            warn!(
                camera_id = source.camera_id(),
                frame = frame_index,
                "capture failed, reconnecting: {e:#}"
            );
            if let Err(e) = source.reconnect() {
                warn!(camera_id = source.camera_id(), "reconnect failed: {e:#}");
            }
            None
        }
    }
}
