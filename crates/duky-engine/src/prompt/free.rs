use super::aspect::{api_aspect_ratio, KEEP_ORIGINAL};

pub const IMAGE_INSTRUCTION: &str =
    "Thực hiện yêu cầu trong prompt để tạo ra một bức ảnh mới dựa trên (các) hình ảnh đã cho.";
pub const WATERMARK_INSTRUCTION: &str =
    "Yêu cầu đặc biệt: Không được có bất kỳ watermark, logo, hay chữ ký nào trên ảnh kết quả.";

/// Style key that turns a drawing or render into a photo.
pub const IMAGE_TO_REAL: &str = "image-to-real";
/// Style key used when the user supplies their own style image.
pub const CUSTOM_REFERENCE: &str = "custom-ref";

pub fn free_prompt(prompt: &str, has_images: bool, remove_watermark: bool) -> String {
    let mut parts = vec![prompt.trim().to_string()];
    if has_images {
        parts.push(IMAGE_INSTRUCTION.to_string());
    }
    if remove_watermark {
        parts.push(WATERMARK_INSTRUCTION.to_string());
    }
    parts.join("\n")
}

/// API ratio for a free generation. "Keep original" with nothing to keep
/// becomes a square.
pub fn free_aspect_ratio(label: &str, has_images: bool) -> Option<String> {
    if label.trim() == KEEP_ORIGINAL {
        return (!has_images).then(|| "1:1".to_string());
    }
    api_aspect_ratio(label)
}

/// Prompt for one swap-style output. The content image always comes first;
/// a custom style image, when used, second.
pub fn swap_style_prompt(style: &str, notes: &str, remove_watermark: bool) -> String {
    let style = style.trim();
    let mut lines = match style {
        IMAGE_TO_REAL => vec![
            "Chuyển bức ảnh đã cho thành ảnh chụp thật, chân thực như ảnh máy ảnh chuyên nghiệp.".to_string(),
            "Giữ nguyên bố cục, nhân vật, tư thế và màu sắc chủ đạo; chỉ thay đổi chất liệu hình ảnh sang ảnh thật.".to_string(),
        ],
        CUSTOM_REFERENCE => vec![
            "Ảnh thứ nhất là ảnh nội dung, ảnh thứ hai là ảnh phong cách.".to_string(),
            "Vẽ lại nội dung của ảnh thứ nhất theo phong cách nghệ thuật của ảnh thứ hai (nét vẽ, bảng màu, chất liệu).".to_string(),
            "Không sao chép nội dung hay nhân vật của ảnh thứ hai.".to_string(),
        ],
        named => vec![
            format!("Vẽ lại bức ảnh đã cho theo phong cách: {named}."),
            "Giữ nguyên bố cục, nhân vật và nội dung chính của ảnh gốc.".to_string(),
        ],
    };
    let notes = notes.trim();
    if !notes.is_empty() {
        lines.push(format!("Yêu cầu bổ sung: {notes}"));
    }
    if remove_watermark {
        lines.push(WATERMARK_INSTRUCTION.to_string());
    }
    lines.join("\n")
}

/// Styles a swap-style batch produces, one output each. Photo conversion
/// and a custom style image each replace the style list with one entry.
pub fn swap_style_items(
    selected_styles: &[String],
    has_style_image: bool,
    convert_to_real: bool,
) -> Vec<String> {
    if convert_to_real {
        return vec![IMAGE_TO_REAL.to_string()];
    }
    if has_style_image {
        return vec![CUSTOM_REFERENCE.to_string()];
    }
    selected_styles
        .iter()
        .map(|style| style.trim())
        .filter(|style| !style.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn free_prompt_joins_instructions_with_newlines() {
        assert_eq!(free_prompt("  con mèo  ", false, false), "con mèo");
        assert_eq!(
            free_prompt("con mèo", true, true),
            format!("con mèo\n{IMAGE_INSTRUCTION}\n{WATERMARK_INSTRUCTION}")
        );
    }

    #[test]
    fn keep_original_without_inputs_is_square() {
        assert_eq!(free_aspect_ratio(KEEP_ORIGINAL, false).as_deref(), Some("1:1"));
        assert_eq!(free_aspect_ratio(KEEP_ORIGINAL, true), None);
        assert_eq!(free_aspect_ratio("16:9", true).as_deref(), Some("16:9"));
        assert_eq!(free_aspect_ratio("7:3", false), None);
    }

    #[test]
    fn swap_items_follow_mode() {
        let styles = vec!["Anime".to_string(), " ".to_string(), "Pixel art".to_string()];
        assert_eq!(swap_style_items(&styles, false, false), vec!["Anime", "Pixel art"]);
        assert_eq!(swap_style_items(&styles, true, false), vec![CUSTOM_REFERENCE]);
        assert_eq!(swap_style_items(&styles, true, true), vec![IMAGE_TO_REAL]);
    }

    #[test]
    fn swap_prompt_names_the_style() {
        let prompt = swap_style_prompt("Anime", "tông ấm", true);
        assert!(prompt.starts_with("Vẽ lại bức ảnh đã cho theo phong cách: Anime."));
        assert!(prompt.contains("Yêu cầu bổ sung: tông ấm"));
        assert!(prompt.ends_with(WATERMARK_INSTRUCTION));
        assert!(swap_style_prompt(CUSTOM_REFERENCE, "", false).contains("ảnh thứ hai"));
    }
}
