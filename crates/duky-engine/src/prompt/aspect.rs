/// Ratios the image API accepts in `imageConfig.aspectRatio`.
pub const VALID_API_RATIOS: [&str; 10] = [
    "1:1", "2:3", "3:2", "3:4", "4:3", "4:5", "5:4", "9:16", "16:9", "21:9",
];

/// Free generation option that keeps the input image's proportions.
pub const KEEP_ORIGINAL: &str = "Giữ nguyên";

/// Poster option that copies the reference poster's proportions.
pub const KEEP_REFERENCE: &str = "Giữ nguyên theo ảnh tham khảo";

/// Parses a leading `W:H` (as in `"9:16 (Story/Reels)"`) into numbers.
pub fn parse_ratio(label: &str) -> Option<(u32, u32)> {
    let trimmed = label.trim();
    let end = trimmed
        .find(|ch: char| !(ch.is_ascii_digit() || ch == ':'))
        .unwrap_or(trimmed.len());
    let (left, right) = trimmed[..end].split_once(':')?;
    let w = left.parse::<u32>().ok()?;
    let h = right.parse::<u32>().ok()?;
    (w > 0 && h > 0).then_some((w, h))
}

/// Maps an option label to the API ratio, or `None` when the label carries
/// no ratio the API accepts.
pub fn api_aspect_ratio(label: &str) -> Option<String> {
    let (w, h) = parse_ratio(label)?;
    let ratio = format!("{w}:{h}");
    VALID_API_RATIOS
        .contains(&ratio.as_str())
        .then_some(ratio)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_map_to_api_ratios() {
        assert_eq!(api_aspect_ratio("9:16 (Story/Reels)").as_deref(), Some("9:16"));
        assert_eq!(api_aspect_ratio("21:9").as_deref(), Some("21:9"));
        assert_eq!(api_aspect_ratio(KEEP_REFERENCE), None);
        assert_eq!(api_aspect_ratio("7:5"), None);
        assert_eq!(api_aspect_ratio("0:1"), None);
    }

    #[test]
    fn parse_ratio_reads_only_the_prefix() {
        assert_eq!(parse_ratio("4:5 (Dọc - Instagram Post)"), Some((4, 5)));
        assert_eq!(parse_ratio("Vuông"), None);
        assert_eq!(parse_ratio("16:"), None);
    }
}
