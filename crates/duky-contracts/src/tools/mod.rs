pub mod snapshot;
pub mod state;
pub mod video;

pub use snapshot::SettingsSnapshot;
pub use state::{
    BatchTally, GenerationSlot, HistoricalImage, SlotStatus, Stage, ToolKey, ToolOptions, ToolState,
    HISTORY_LIMIT, MAX_IMAGE_COUNT, MAX_INPUT_IMAGES, MAX_STYLE_PICKS,
};
pub use video::{VideoStatus, VideoTask, VideoTaskBoard};
