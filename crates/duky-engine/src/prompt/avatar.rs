use std::collections::BTreeSet;

use duky_contracts::errors::GenerationError;
use duky_contracts::tools::ToolState;
use rand::Rng;
use serde_json::Value;

use super::free::WATERMARK_INSTRUCTION;

/// Selection marker that expands into ideas picked after image analysis.
pub const RANDOM_CONCEPT: &str = "Ý tưởng ngẫu nhiên";
pub const MAX_IDEAS: usize = 6;
/// Avatar batches run on a small worker pool instead of a full fan-out.
pub const AVATAR_WORKERS: usize = 2;

#[derive(Debug)]
pub struct IdeaCategory {
    pub key: &'static str,
    pub category: &'static str,
    pub ideas: &'static [&'static str],
}

pub const IDEA_CATEGORIES: [IdeaCategory; 6] = [
    IdeaCategory {
        key: "traditional",
        category: "Truyền thống",
        ideas: &[
            "Áo dài trắng bên hồ Gươm",
            "Áo tứ thân giữa cánh đồng lúa",
            "Nón lá và phố cổ Hội An",
            "Áo dài đỏ ngày Tết",
        ],
    },
    IdeaCategory {
        key: "patriotic",
        category: "Tự hào dân tộc",
        ideas: &[
            "Cầm lá cờ đỏ sao vàng tung bay",
            "Áo cờ đỏ cổ vũ bóng đá",
            "Trước lăng Chủ tịch Hồ Chí Minh",
            "Diễu binh ngày Quốc khánh",
        ],
    },
    IdeaCategory {
        key: "professional",
        category: "Chuyên nghiệp",
        ideas: &[
            "Ảnh hồ sơ doanh nhân phông xám",
            "Bác sĩ trong bệnh viện hiện đại",
            "Kỹ sư tại công trường",
            "Giảng viên trên giảng đường",
        ],
    },
    IdeaCategory {
        key: "fantasy",
        category: "Giả tưởng",
        ideas: &[
            "Chiến binh thời Lý Trần",
            "Phi hành gia ngoài không gian",
            "Nhân vật hoạt hình 3D",
            "Pháp sư giữa rừng phép thuật",
        ],
    },
    IdeaCategory {
        key: "lifestyle",
        category: "Phong cách sống",
        ideas: &[
            "Quán cà phê vỉa hè Sài Gòn",
            "Dạo biển lúc hoàng hôn",
            "Leo núi Fansipan",
            "Đạp xe qua phố đi bộ",
        ],
    },
    IdeaCategory {
        key: "art",
        category: "Nghệ thuật",
        ideas: &[
            "Tranh sơn mài",
            "Tranh Đông Hồ",
            "Ký họa chì than",
            "Tranh sơn dầu cổ điển",
        ],
    },
];

pub fn category_names() -> Vec<&'static str> {
    IDEA_CATEGORIES.iter().map(|entry| entry.category).collect()
}

/// Ideas the random marker may draw from. Unknown or empty suggestions fall
/// back to the whole catalogue.
pub fn idea_pool(suggested_categories: &[String]) -> Vec<&'static str> {
    let suggested: Vec<&str> = suggested_categories.iter().map(|name| name.trim()).collect();
    let pool: Vec<&'static str> = IDEA_CATEGORIES
        .iter()
        .filter(|entry| suggested.contains(&entry.category))
        .flat_map(|entry| entry.ideas.iter().copied())
        .collect();
    if !pool.is_empty() {
        return pool;
    }
    IDEA_CATEGORIES
        .iter()
        .flat_map(|entry| entry.ideas.iter().copied())
        .collect()
}

pub fn random_marker_count(selected: &[String]) -> usize {
    selected
        .iter()
        .filter(|idea| idea.as_str() == RANDOM_CONCEPT)
        .count()
}

/// Replaces every random marker with a distinct idea from the pool. Ideas
/// the user already picked are never drawn again, and the result keeps the
/// user's order followed by the drawn ideas.
pub fn expand_random_ideas<R: Rng + ?Sized>(
    selected: &[String],
    suggested_categories: &[String],
    rng: &mut R,
) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut out: Vec<String> = selected
        .iter()
        .filter(|idea| idea.as_str() != RANDOM_CONCEPT)
        .filter(|idea| seen.insert(idea.to_string()))
        .cloned()
        .collect();

    let mut pool: Vec<&str> = idea_pool(suggested_categories)
        .into_iter()
        .filter(|idea| !seen.contains(*idea))
        .collect();
    for _ in 0..random_marker_count(selected) {
        if pool.is_empty() {
            break;
        }
        let idx = rng.gen_range(0..pool.len());
        out.push(pool.swap_remove(idx).to_string());
    }
    out
}

/// Upper bound on the ideas a selection expands to: distinct named ideas
/// plus one per random marker.
pub fn planned_idea_count(selected: &[String]) -> usize {
    let named: BTreeSet<&str> = selected
        .iter()
        .map(String::as_str)
        .filter(|idea| *idea != RANDOM_CONCEPT)
        .collect();
    named.len() + random_marker_count(selected)
}

pub fn validate_selection(selected: &[String]) -> Result<(), GenerationError> {
    if selected.is_empty() {
        return Err(GenerationError::Validation(
            "Vui lòng chọn ít nhất 1 ý tưởng.".to_string(),
        ));
    }
    if planned_idea_count(selected) > MAX_IDEAS {
        return Err(GenerationError::Validation(format!(
            "Chỉ được chọn tối đa {MAX_IDEAS} ý tưởng."
        )));
    }
    Ok(())
}

/// Ideas stored on the tool state under `selected_ideas`.
pub fn selected_ideas(state: &ToolState) -> Vec<String> {
    state
        .options
        .extra
        .get("selected_ideas")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::trim)
                .filter(|idea| !idea.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

pub fn avatar_prompt(idea: &str, additional: &str, remove_watermark: bool) -> String {
    let mut lines = vec![
        format!(
            "Tạo một bức ảnh avatar mới của người trong ảnh đã cho theo chủ đề: \"{}\".",
            idea.trim()
        ),
        "Giữ nguyên khuôn mặt và thần thái để người xem nhận ra ngay đó là cùng một người."
            .to_string(),
        "Trang phục, bối cảnh và ánh sáng phải phù hợp với chủ đề, chất lượng ảnh chụp chuyên nghiệp."
            .to_string(),
    ];
    push_common(&mut lines, additional, remove_watermark);
    lines.join("\n")
}

pub fn style_reference_prompt(additional: &str, remove_watermark: bool) -> String {
    let mut lines = vec![
        "Ảnh thứ nhất là chân dung gốc, ảnh thứ hai là ảnh tham khảo phong cách.".to_string(),
        "Tạo avatar mới của người trong ảnh thứ nhất theo đúng phong cách của ảnh thứ hai: trang phục, bối cảnh, ánh sáng và tông màu.".to_string(),
        "Giữ nguyên khuôn mặt của người trong ảnh thứ nhất; không lấy khuôn mặt từ ảnh thứ hai.".to_string(),
    ];
    push_common(&mut lines, additional, remove_watermark);
    lines.join("\n")
}

fn push_common(lines: &mut Vec<String>, additional: &str, remove_watermark: bool) {
    let additional = additional.trim();
    if !additional.is_empty() {
        lines.push(format!("Yêu cầu bổ sung: {additional}"));
    }
    if remove_watermark {
        lines.push(WATERMARK_INSTRUCTION.to_string());
    }
}
