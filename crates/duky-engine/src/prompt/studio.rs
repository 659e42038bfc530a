use super::aspect::KEEP_ORIGINAL;

/// Face-swap prompt for one studio template. `style` names the studio
/// collection and `scene` is the template's own description.
pub fn studio_prompt(
    style: &str,
    scene: &str,
    notes: &str,
    aspect_label: &str,
    remove_watermark: bool,
    couple: bool,
) -> String {
    let mut text = String::new();
    let aspect = aspect_label.trim();
    if !aspect.is_empty() && aspect != KEEP_ORIGINAL {
        text.push_str(&format!("Aspect ratio: {aspect}. "));
    }
    if couple {
        text.push_str(&format!(
            "DUAL FACE SWAP:\nPhoto 1 (Female): use this face for the woman.\nPhoto 2 (Male): use this face for the man.\nStyle: \"{style}\"\nScene: \"{scene}\"\nKeep both faces exactly as in the input photos. Change only clothing, hair and background."
        ));
    } else {
        text.push_str(&format!(
            "FACE SWAP:\nKeep the exact face from the input photo (eyes, nose, mouth, skin tone).\nStyle: \"{style}\"\nScene: \"{scene}\"\nPhotorealistic, natural lighting, high detail."
        ));
    }
    let notes = notes.trim();
    if !notes.is_empty() {
        text.push_str(&format!(" {notes}."));
    }
    if remove_watermark {
        text.push_str(" No watermark or logo.");
    }
    text
}

pub fn studio_fallback_prompt(
    style: &str,
    scene: &str,
    notes: &str,
    aspect_label: &str,
    remove_watermark: bool,
    couple: bool,
) -> String {
    let mut text = String::new();
    let aspect = aspect_label.trim();
    if !aspect.is_empty() && aspect != KEEP_ORIGINAL {
        text.push_str(&format!("Tỷ lệ {aspect}.\n"));
    }
    if couple {
        text.push_str(&format!(
            "FACE SWAP CẶP ĐÔI:\n1. Ghép mặt nữ từ Ảnh 1 vào nhân vật nữ.\n2. Ghép mặt nam từ Ảnh 2 vào nhân vật nam.\n3. Phong cách: \"{style}\".\n4. Trang phục và bối cảnh: \"{scene}\".\nGiống mặt 100%."
        ));
    } else {
        text.push_str(&format!(
            "FACE SWAP: ghép khuôn mặt từ ảnh gốc vào ảnh mới.\nPhong cách: \"{style}\".\nTrang phục và bối cảnh: \"{scene}\".\nGiữ nguyên khuôn mặt."
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
