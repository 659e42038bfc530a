//! Prompt-from-image: analyze a source picture into a reusable prompt, merge
//! the user's notes into it and fit it to a reference image.

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use super::free::WATERMARK_INSTRUCTION;

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceAnalysis {
    #[serde(default)]
    pub main_prompt: String,
    #[serde(default)]
    pub suggestions: Vec<String>,
}

pub fn analysis_instruction(expert: bool) -> String {
    if expert {
        "Bạn là kỹ sư prompt và chuyên gia phân tích hình ảnh. Hãy đảo ngược bức ảnh này thành một prompt \
         rất chi tiết bằng thuật ngữ nhiếp ảnh và nghệ thuật số: chủ thể, môi trường và bối cảnh, ánh sáng, \
         góc máy, ống kính, khẩu độ, chất liệu, tâm trạng và các từ khóa chất lượng.\n\
         Trả về JSON với hai khóa: \"mainPrompt\" (prompt tiếng Việt, dài và chi tiết) và \"suggestions\" \
         (mảng 2 đến 4 ý tưởng biến tấu táo bạo, ví dụ Cyberpunk, Fantasy, tranh sơn dầu)."
            .to_string()
    } else {
        "Bạn là chuyên gia phân tích hình ảnh. Hãy viết một prompt ngắn gọn để tái tạo bức ảnh này bằng AI \
         tạo ảnh: chủ đề chính, phong cách, màu sắc và bố cục. Bắt đầu trực tiếp bằng mô tả, không dùng từ cảm thán.\n\
         Trả về JSON với hai khóa: \"mainPrompt\" (prompt tiếng Việt) và \"suggestions\" \
         (mảng 2 đến 4 ý tưởng biến tấu sang phong cách khác)."
            .to_string()
    }
}

/// Parses the analysis answer, optionally wrapped in a markdown fence. An
/// empty `mainPrompt` is an error.
pub fn parse_source_analysis(raw: &str) -> Result<SourceAnalysis> {
    let trimmed = raw.trim();
    let unfenced = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .map(|rest| rest.trim_end().trim_end_matches("```").trim())
        .unwrap_or(trimmed);
    let mut analysis: SourceAnalysis =
        serde_json::from_str(unfenced).context("image analysis was not valid JSON")?;
    analysis.main_prompt = analysis.main_prompt.trim().to_string();
    if analysis.main_prompt.is_empty() {
        bail!("image analysis returned an empty mainPrompt");
    }
    analysis.suggestions = analysis
        .suggestions
        .into_iter()
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
        .collect();
    Ok(analysis)
}

/// Merge instruction; the user's notes win over the base prompt.
pub fn interpolate_instruction(base: &str, notes: &str) -> String {
    format!(
        "Bạn tinh chỉnh câu lệnh tạo ảnh. Hãy hợp nhất yêu cầu chỉnh sửa của người dùng vào prompt gốc \
         thành một prompt tiếng Việt mạch lạc.\n\
         - Prompt gốc: \"{base}\"\n\
         - Yêu cầu của người dùng (ưu tiên cao hơn): \"{notes}\"\n\
         Khi hai bên mâu thuẫn, yêu cầu của người dùng ghi đè phần tương ứng của prompt gốc; phần còn lại giữ nguyên ý. \
         Chỉ trả về prompt cuối cùng, không thêm lời dẫn."
    )
}

pub fn adapt_instruction(base: &str) -> String {
    format!(
        "Bạn tinh chỉnh prompt cho AI tạo ảnh. Với ảnh tham chiếu đi kèm, hãy viết lại prompt gốc cho hợp với \
         chủ thể, bối cảnh và phong cách của ảnh đó mà vẫn giữ nguyên sự biến đổi cốt lõi. \
         Ví dụ: ảnh một con chó thật và prompt \"biến thành nhân vật hoạt hình\" thành \
         \"biến con chó trong ảnh thành nhân vật hoạt hình phong cách Pixar\".\n\
         Prompt gốc: \"{base}\". Chỉ trả về prompt mới bằng tiếng Việt."
    )
}

/// Instruction sent with the reference image for the final edit.
pub fn edit_prompt(prompt: &str, remove_watermark: bool) -> String {
    let mut lines = vec![
        format!("Chỉnh sửa bức ảnh đã cho theo yêu cầu sau: {}", prompt.trim()),
        "Giữ nguyên những phần ảnh mà yêu cầu không nhắc tới.".to_string(),
    ];
    if remove_watermark {
        lines.push(WATERMARK_INSTRUCTION.to_string());
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn analysis_answer_shapes() -> anyhow::Result<()> {
        let parsed = parse_source_analysis(
            "```json\n{\"mainPrompt\": \" Chân dung cô gái \", \"suggestions\": [\"Anime\", \" \"]}\n```",
        )?;
        assert_eq!(parsed.main_prompt, "Chân dung cô gái");
        assert_eq!(parsed.suggestions, vec!["Anime".to_string()]);

        assert!(parse_source_analysis("{\"suggestions\": []}").is_err());
        assert!(parse_source_analysis("không phải JSON").is_err());
        Ok(())
    }

    #[test]
    fn expert_mode_asks_for_camera_detail() {
        assert!(analysis_instruction(true).contains("ống kính"));
        assert!(!analysis_instruction(false).contains("ống kính"));
    }

    #[test]
    fn instructions_embed_their_inputs() {
        let merged = interpolate_instruction("tranh màu nước", "tông xanh dương");
        assert!(merged.contains("Prompt gốc: \"tranh màu nước\""));
        assert!(merged.contains("(ưu tiên cao hơn): \"tông xanh dương\""));
        assert!(adapt_instruction("thêm neon").contains("Prompt gốc: \"thêm neon\""));
        let edit = edit_prompt(" đổi nền xanh ", true);
        assert!(edit.starts_with("Chỉnh sửa bức ảnh đã cho theo yêu cầu sau: đổi nền xanh\n"));
        assert!(edit.ends_with(WATERMARK_INSTRUCTION));
    }
}
