use serde::{Deserialize, Serialize};

use crate::tools::state::{ToolKey, ToolState};

pub const ZOOM_STEP: f32 = 0.5;
pub const ZOOM_MIN: f32 = 0.5;
pub const ZOOM_MAX: f32 = 3.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
}

impl MediaKind {
    pub fn infer(src: &str) -> Self {
        let path = src.split(['?', '#']).next().unwrap_or(src).to_ascii_lowercase();
        if path.ends_with(".mp4") || path.ends_with(".webm") {
            Self::Video
        } else {
            Self::Image
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LightboxItem {
    pub src: String,
    #[serde(rename = "type")]
    pub kind: MediaKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_key: Option<ToolKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl LightboxItem {
    pub fn from_src(src: impl Into<String>) -> Self {
        let src = src.into();
        Self {
            kind: MediaKind::infer(&src),
            src,
            prompt: None,
            created_at: None,
            tool_key: None,
            model: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LightboxKey {
    Escape,
    ArrowLeft,
    ArrowRight,
}

/// Read-only viewer over a list of items. It owns the selected index and
/// zoom scale and nothing else.
#[derive(Debug, Clone)]
pub struct Lightbox {
    items: Vec<LightboxItem>,
    selected: Option<usize>,
    scale: f32,
}

impl Lightbox {
    pub fn new(items: Vec<LightboxItem>) -> Self {
        Self {
            items,
            selected: None,
            scale: 1.0,
        }
    }

    /// Inputs first, then every finished slot, in slot order.
    pub fn from_state(state: &ToolState, model: Option<&str>) -> Self {
        let mut items: Vec<LightboxItem> = state
            .inputs
            .iter()
            .map(|src| LightboxItem::from_src(src.as_str()))
            .collect();
        for slot in &state.slots {
            if let Some(url) = slot.url() {
                let mut item = LightboxItem::from_src(url);
                item.prompt = Some(slot.label.clone());
                item.tool_key = Some(state.tool);
                item.model = model.map(str::to_string);
                items.push(item);
            }
        }
        Self::new(items)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn selected(&self) -> Option<usize> {
        self.selected
    }

    pub fn scale(&self) -> f32 {
        self.scale
    }

    pub fn current(&self) -> Option<&LightboxItem> {
        self.selected.and_then(|idx| self.items.get(idx))
    }

    pub fn open(&mut self, index: usize) -> bool {
        if index >= self.items.len() {
            return false;
        }
        self.selected = Some(index);
        self.scale = 1.0;
        true
    }

    pub fn close(&mut self) {
        self.selected = None;
        self.scale = 1.0;
    }

    /// Moves `delta` steps with wraparound in both directions.
    pub fn navigate(&mut self, delta: isize) -> Option<usize> {
        let current = self.selected?;
        let len = self.items.len() as isize;
        if len == 0 {
            return None;
        }
        let next = (current as isize + delta).rem_euclid(len) as usize;
        self.selected = Some(next);
        self.scale = 1.0;
        Some(next)
    }

    /// Returns `false` once the viewer is closed.
    pub fn handle_key(&mut self, key: LightboxKey) -> bool {
        if self.selected.is_none() {
            return false;
        }
        match key {
            LightboxKey::Escape => {
                self.close();
                return false;
            }
            LightboxKey::ArrowLeft if self.items.len() > 1 => {
                self.navigate(-1);
            }
            LightboxKey::ArrowRight if self.items.len() > 1 => {
                self.navigate(1);
            }
            _ => {}
        }
        true
    }

    pub fn zoom_in(&mut self) -> f32 {
        self.scale = (self.scale + ZOOM_STEP).min(ZOOM_MAX);
        self.scale
    }

    pub fn zoom_out(&mut self) -> f32 {
        self.scale = (self.scale - ZOOM_STEP).max(ZOOM_MIN);
        self.scale
    }

    /// Text copied by the "copy prompt" action.
    pub fn current_prompt(&self) -> Option<&str> {
        self.current()
            .and_then(|item| item.prompt.as_deref())
            .filter(|prompt| !prompt.trim().is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lightbox(len: usize) -> Lightbox {
        Lightbox::new(
            (0..len)
                .map(|idx| LightboxItem::from_src(format!("https://cdn/{idx}.png")))
                .collect(),
        )
    }

    #[test]
    fn navigation_wraps_both_ways() {
        for len in 1..=5 {
            let mut viewer = lightbox(len);
            assert!(viewer.open(len - 1));
            assert_eq!(viewer.navigate(1), Some(0));
            assert_eq!(viewer.navigate(-1), Some(len - 1));
        }
    }

    #[test]
    fn keys_drive_navigation_and_close() {
        let mut viewer = lightbox(3);
        viewer.open(0);
        assert!(viewer.handle_key(LightboxKey::ArrowLeft));
        assert_eq!(viewer.selected(), Some(2));
        assert!(viewer.handle_key(LightboxKey::ArrowRight));
        assert_eq!(viewer.selected(), Some(0));
        assert!(!viewer.handle_key(LightboxKey::Escape));
        assert_eq!(viewer.selected(), None);
    }

    #[test]
    fn zoom_is_clamped_and_reset_on_navigation() {
        let mut viewer = lightbox(2);
        viewer.open(0);
        for _ in 0..10 {
            viewer.zoom_in();
        }
        assert_eq!(viewer.scale(), ZOOM_MAX);
        for _ in 0..10 {
            viewer.zoom_out();
        }
        assert_eq!(viewer.scale(), ZOOM_MIN);
        viewer.navigate(1);
        assert_eq!(viewer.scale(), 1.0);
    }

    #[test]
    fn video_kind_is_inferred_from_extension() {
        assert_eq!(MediaKind::infer("https://cdn/clip.MP4?sig=1"), MediaKind::Video);
        assert_eq!(MediaKind::infer("https://cdn/clip.webm"), MediaKind::Video);
        assert_eq!(MediaKind::infer("data:image/png;base64,AAAA"), MediaKind::Image);
    }

    #[test]
    fn projection_skips_unfinished_slots() -> anyhow::Result<()> {
        let mut state = ToolState::new(ToolKey::FreeGeneration);
        let epoch = state.begin_generation(&["mèo".to_string(), "chó".to_string()])?;
        state.resolve_slot(epoch, 1, "https://cdn/dog.png");

        let mut viewer = Lightbox::from_state(&state, Some("gemini-3-pro-image-preview"));
        assert_eq!(viewer.len(), 1);
        viewer.open(0);
        assert_eq!(viewer.current_prompt(), Some("chó"));
        Ok(())
    }
}
