//! Virtual try-on: the model photo wears the outfits from the other inputs.

use super::aspect::KEEP_ORIGINAL;
use super::free::WATERMARK_INSTRUCTION;

/// Outfit images a composition may reference.
pub const MAX_OUTFITS: usize = 3;

/// Prompt for one try-on image. The request sends the outfit images first,
/// numbered `Ảnh 1..=outfit_count`, followed by the model photo.
pub fn outfit_composition_prompt(
    outfit_count: usize,
    notes: &str,
    aspect_label: &str,
    remove_watermark: bool,
) -> String {
    let model_no = outfit_count + 1;
    let outfit_ref = if outfit_count > 1 {
        "các ảnh trang phục"
    } else {
        "Ảnh 1"
    };
    let mut lines = vec![format!(
        "Thử đồ ảo (virtual try-on). Có {model_no} ảnh đầu vào:"
    )];
    for idx in 1..=outfit_count {
        lines.push(format!(
            "- Ảnh {idx}: một bộ trang phục cần thử. Nếu có người đang mặc, bỏ qua người đó; chỉ lấy kiểu dáng, màu sắc, họa tiết và chất liệu."
        ));
    }
    lines.push(format!(
        "- Ảnh {model_no}: ảnh gốc của người mẫu. Khuôn mặt phải giữ nguyên 100%."
    ));
    lines.push(String::new());
    lines.push(format!(
        "**NHIỆM VỤ:** Tạo ảnh mới trong đó người mẫu ở Ảnh {model_no} mặc trang phục từ {outfit_ref}."
    ));
    lines.push(String::new());
    lines.extend(
        [
            "**Nếu ảnh gốc chỉ là chân dung cận mặt hoặc nửa người:**",
            "- Dựng dáng toàn thân tự nhiên để thấy trọn bộ trang phục.",
            "- Giữ nguyên khuôn mặt, biểu cảm, kiểu tóc, trang điểm và màu da.",
            "- Dùng bối cảnh chụp thời trang chuyên nghiệp, tỷ lệ cơ thể cân đối.",
            "",
            "**Nếu ảnh gốc đã có dáng đầy đủ, giữ nguyên:**",
            "- Khuôn mặt, biểu cảm, trang điểm, màu da, kiểu tóc",
            "- Tư thế và hướng nhìn",
            "- Bối cảnh, ánh sáng, góc chụp",
            "- Phụ kiện đang cầm hoặc đeo",
            "",
            "**Chỉ được thay đổi:** quần áo trên người mẫu, mặc vừa vặn tự nhiên, đúng màu sắc và họa tiết của ảnh trang phục.",
            "",
            "**Không được:**",
            "- Thay đổi khuôn mặt người mẫu",
            "- Lấy người, phông nền hay phụ kiện từ ảnh trang phục",
            "- Đổi bộ lọc hay tông màu tổng thể của ảnh",
        ]
        .map(str::to_string),
    );

    let notes = notes.trim();
    if !notes.is_empty() {
        lines.push(String::new());
        lines.push(format!("**GHI CHÚ BỔ SUNG TỪ NGƯỜI DÙNG:** {notes}"));
    }
    let aspect = aspect_label.trim();
    if !aspect.is_empty() && aspect != KEEP_ORIGINAL {
        lines.push(String::new());
        lines.push(format!("**TỶ LỆ KHUNG HÌNH:** Kết quả phải có tỷ lệ {aspect}."));
    }
    lines.push(String::new());
    lines.push(
        "Kết quả: một bức ảnh duy nhất, chất lượng cao, tự nhiên như ảnh chụp thật. Chỉ trả về ảnh."
            .to_string(),
    );
    if remove_watermark {
        lines.push(WATERMARK_INSTRUCTION.to_string());
    }
    lines.join("\n")
}

/// Request image order for a try-on: outfits, then the model photo.
pub fn composition_images(model_photo: &str, outfits: &[String]) -> Vec<String> {
    let mut images = outfits.to_vec();
    images.push(model_photo.to_string());
    images
}
