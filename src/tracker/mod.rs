pub mod history;
pub mod motion;
pub mod state;

pub use history::History;
pub use motion::{infer_motion, Activity, Motion};
pub use state::{HistoryEntry, SubjectSize, Track, TrackState, TrackedSubject, TrackerControl};
