mod app;

pub use app::{build_router, AppState, ControlSettings, LogLine, LogQuery, SseUpdate};
