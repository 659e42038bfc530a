//! Khmer costume face merge: one person, or a couple with the woman first.

use super::aspect::KEEP_ORIGINAL;

pub struct KhmerTemplate {
    pub key: &'static str,
    pub prompt: &'static str,
}

pub const KHMER_TEMPLATES: [KhmerTemplate; 4] = [
    KhmerTemplate {
        key: "traditional",
        prompt: "Trang phục Khmer truyền thống màu vàng kim, họa tiết tinh xảo, cầm ô truyền thống; phông nền chùa Khmer rực rỡ dưới ánh hoàng hôn ấm áp, tóc búi truyền thống.",
    },
    KhmerTemplate {
        key: "royal",
        prompt: "Trang phục hoàng gia Đông Nam Á với vương miện vàng, trang sức vàng và váy đỏ thêu kim tuyến; đứng trang nghiêm, hai tay chắp trước ngực, bối cảnh nội thất cung điện dát vàng.",
    },
    KhmerTemplate {
        key: "apsara",
        prompt: "Trang phục Apsara bằng lụa vàng đồng và nâu đất, trang sức vàng và hoa cài tóc, tay cầm vòng hoa trắng; toàn thân, góc máy hơi thấp trước đền đá Khmer cổ kính lúc bình minh.",
    },
    KhmerTemplate {
        key: "temple-night",
        prompt: "Sampot và khăn kben cùng trang sức vàng chạm khắc; dáng đứng uy nghi trước đền thờ được chiếu sáng lung linh ban đêm, hiệu ứng bokeh nhẹ và rim light ấm.",
    },
];

pub const DEFAULT_KHMER_TEMPLATE: &str = "traditional";

/// Template text for `key`. Unknown keys are treated as a free-form scene
/// description.
pub fn khmer_template_prompt(key: Option<&str>) -> String {
    let key = key.map(str::trim).filter(|key| !key.is_empty());
    let wanted = key.unwrap_or(DEFAULT_KHMER_TEMPLATE);
    KHMER_TEMPLATES
        .iter()
        .find(|template| template.key == wanted)
        .map(|template| template.prompt.to_string())
        .unwrap_or_else(|| wanted.to_string())
}

fn aspect_line(aspect_label: &str, text: impl Fn(&str) -> String) -> Option<String> {
    let aspect = aspect_label.trim();
    (!aspect.is_empty() && aspect != KEEP_ORIGINAL).then(|| text(aspect))
}

pub fn khmer_prompt(
    template: &str,
    notes: &str,
    aspect_label: &str,
    remove_watermark: bool,
    couple: bool,
) -> String {
    let mut lines: Vec<String> =
        aspect_line(aspect_label, |ratio| format!("Bức ảnh kết quả bắt buộc có tỷ lệ khung hình {ratio}."))
            .into_iter()
            .collect();
    if couple {
        lines.push(format!(
            "**NHIỆM VỤ:** Tạo ảnh cặp đôi từ 2 ảnh đầu vào. Ảnh 1 là nữ, Ảnh 2 là nam. Đổi trang phục và bối cảnh sang phong cách Khmer: \"{template}\"."
        ));
        lines.push("**KHUÔN MẶT (QUAN TRỌNG NHẤT):**".to_string());
        lines.push("1. Nhân vật nữ mang đúng khuôn mặt của Ảnh 1.".to_string());
        lines.push("2. Nhân vật nam mang đúng khuôn mặt của Ảnh 2.".to_string());
        lines.push("3. Giữ nguyên mọi đặc điểm nhận dạng của cả hai người.".to_string());
    } else {
        lines.push(format!(
            "**NHIỆM VỤ:** Tạo ảnh mới từ ảnh gốc, đổi trang phục và bối cảnh sang phong cách Khmer: \"{template}\"."
        ));
        lines.push("**KHUÔN MẶT (QUAN TRỌNG NHẤT):**".to_string());
        lines.push("1. Sao chép chính xác 100% khuôn mặt trong ảnh gốc.".to_string());
        lines.push(
            "2. Giữ nguyên mắt, mũi, miệng, cằm, lông mày, màu da, biểu cảm và góc đầu.".to_string(),
        );
    }
    lines.push(String::new());
    lines.push("**CHỈ ĐƯỢC THAY ĐỔI:** trang phục, bối cảnh, tư thế cơ thể khi mẫu yêu cầu.".to_string());
    lines.push("**KỸ THUẬT:** chất lượng 8K, sắc nét, ánh sáng tự nhiên, màu sắc sống động.".to_string());
    let notes = notes.trim();
    if !notes.is_empty() {
        lines.push(format!("Chi tiết bổ sung: \"{notes}\"."));
    }
    if remove_watermark {
        lines.push("Kết quả không được chứa watermark, logo hay chữ ký nào.".to_string());
    }
    lines.join("\n")
}

/// Shorter face-swap wording, sent when the model answers the main prompt
/// with text.
pub fn khmer_fallback_prompt(
    template: &str,
    notes: &str,
    aspect_label: &str,
    remove_watermark: bool,
    couple: bool,
) -> String {
    let mut text = aspect_line(aspect_label, |ratio| format!("Tỷ lệ {ratio}.\n")).unwrap_or_default();
    if couple {
        text.push_str(&format!(
            "FACE SWAP CẶP ĐÔI: ghép khuôn mặt nữ từ Ảnh 1 và khuôn mặt nam từ Ảnh 2 vào trang phục Khmer. Giữ nguyên 100% nhân dạng. {template}."
        ));
    } else {
        text.push_str(&format!(
            "FACE SWAP: ghép chính xác khuôn mặt trong ảnh gốc vào trang phục Khmer: {template}. Chỉ đổi trang phục và bối cảnh."
        ));
    }
    let notes = notes.trim();
    if !notes.is_empty() {
        text.push_str(&format!(" Bổ sung: \"{notes}\"."));
    }
    if remove_watermark {
        text.push_str(" Không watermark.");
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_lookup_falls_back_to_default_and_free_text() {
        assert_eq!(khmer_template_prompt(None), KHMER_TEMPLATES[0].prompt);
        assert_eq!(khmer_template_prompt(Some("apsara")), KHMER_TEMPLATES[2].prompt);
        assert_eq!(khmer_template_prompt(Some("áo dài xanh")), "áo dài xanh");
    }

    #[test]
    fn couple_prompt_assigns_faces_by_order() {
        let prompt = khmer_prompt("mẫu", "", "9:16", false, true);
        assert!(prompt.starts_with("Bức ảnh kết quả bắt buộc có tỷ lệ khung hình 9:16."));
        assert!(prompt.contains("Ảnh 1 là nữ, Ảnh 2 là nam"));
        assert!(!prompt.contains("watermark"));

        let single = khmer_prompt("mẫu", "cười nhẹ", KEEP_ORIGINAL, true, false);
        assert!(single.starts_with("**NHIỆM VỤ:**"));
        assert!(single.contains("Chi tiết bổ sung: \"cười nhẹ\"."));
        assert!(single.ends_with("chữ ký nào."));
    }

    #[test]
    fn fallback_is_a_single_face_swap_line() {
        let text = khmer_fallback_prompt("mẫu", "", KEEP_ORIGINAL, true, false);
        assert!(text.starts_with("FACE SWAP: "));
        assert!(text.ends_with(" Không watermark."));
        assert!(khmer_fallback_prompt("mẫu", "", "1:1", false, true).starts_with("Tỷ lệ 1:1.\nFACE SWAP CẶP ĐÔI"));
    }
}
