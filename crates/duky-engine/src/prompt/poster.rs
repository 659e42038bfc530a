//! Poster prompt assembly.
//!
//! Every industry domain carries a list of forbidden prop tokens. Builder
//! owned text (style scenes, background presets, instruction blocks) is
//! scrubbed against that list before the user's own text is filled in, so a
//! cosmetics poster never asks for ice cubes and a tech poster never asks
//! for flower petals. User text is passed through verbatim.

use duky_contracts::tools::ToolState;

use super::aspect::{api_aspect_ratio, KEEP_REFERENCE};

pub const FREE_DOMAIN: &str = "Tự do sáng tạo";
pub const AUTO_COLOR_SCHEME: &str = "Tự động theo ảnh tham khảo";
pub const DEFAULT_STYLE: &str = "studio_professional";

const DEFAULT_DESCRIPTION: &str = "the product in the image";
const DEFAULT_POSTER_TYPE: &str = "professional product poster";
const DEFAULT_BACKGROUND: &str = "professional background";
const DEFAULT_LIGHTING: &str = "professional lighting";
const DEFAULT_ANGLE: &str = "optimal angle";

#[derive(Debug)]
pub struct DomainProfile {
    pub key: &'static str,
    title: &'static str,
    allowed: &'static str,
    avoid: &'static str,
    focus: &'static str,
    pub forbidden: &'static [&'static str],
}

pub const DOMAINS: [DomainProfile; 9] = [
    DomainProfile {
        key: FREE_DOMAIN,
        title: "Creative freedom",
        allowed: "",
        avoid: "",
        focus: "Adapt the style to best fit the product.",
        forbidden: &[],
    },
    DomainProfile {
        key: "F&B (Thực phẩm & Đồ uống)",
        title: "Food & Beverage aesthetics",
        allowed: "If product is COLD (ice cream, soda, beer, juice) → add condensation droplets, frost, ice cubes, fresh fruit slices. If product is HOT (coffee, soup) → add subtle steam, warm lighting.",
        avoid: "Keep every prop inside the food and drink world. Nothing from beauty counters, electronics, apparel or clinics.",
        focus: "Focus on high appetite appeal, fresh ingredients as natural props.",
        forbidden: &[
            "powder puff", "brush", "flower", "petal", "circuit", "screen", "fabric", "medical",
            "cosmetic",
        ],
    },
    DomainProfile {
        key: "Mỹ phẩm & Làm đẹp",
        title: "Beauty & Cosmetics aesthetics",
        allowed: "Flower petals (rose, orchid), marble surfaces, silk ribbons, soft brushes, powder puffs, golden accents, crystal elements, skincare texture.",
        avoid: "Keep every prop inside the beauty world. Nothing borrowed from dining tables, bars or electronics.",
        focus: "Focus on elegance, purity, soft diffused lighting, premium materials (satin glass, silk, marble), pastel or rose gold sophisticated colors.",
        forbidden: &[
            "ice cube", "ice", "condensation", "droplet", "frost", "beverage", "fruit", "steam",
            "circuit", "food", "splash", "drink", "juice", "coffee",
        ],
    },
    DomainProfile {
        key: "Công nghệ",
        title: "Technology aesthetics",
        allowed: "Subtle circuit patterns, metallic reflections, neon accent lights (blue/cyan), geometric shapes, glass surfaces, clean modern lines.",
        avoid: "No organic or edible props, no liquids, no textiles.",
        focus: "Focus on sleek modern lines, cool lighting, high-tech atmosphere, sharp reflections, futuristic elements.",
        forbidden: &[
            "flower", "petal", "leaf", "leaves", "fruit", "ice", "water", "condensation",
            "droplet", "fabric", "food", "powder puff", "steam", "plant", "herb",
        ],
    },
    DomainProfile {
        key: "Thời trang",
        title: "Fashion aesthetics",
        allowed: "Fabric swatches, texture samples, lifestyle elements (magazines, accessories), dramatic shadows, sophisticated surfaces.",
        avoid: "No liquids, no electronics hardware, nothing edible or clinical.",
        focus: "Focus on style, fabric textures, trendy composition, dramatic lighting, high-end magazine look, lifestyle atmosphere.",
        forbidden: &[
            "ice", "water", "condensation", "droplet", "circuit", "food", "medical", "beverage",
            "steam", "fruit",
        ],
    },
    DomainProfile {
        key: "Bất động sản & Nội thất",
        title: "Real Estate & Interior aesthetics",
        allowed: "Architectural elements, potted plants (subtle), soft textiles, wood textures, ambient warm lighting.",
        avoid: "No product-shot props, no electronics hardware, no retail boxes.",
        focus: "Focus on spaciousness, natural lighting, architectural details, comfortable atmosphere, luxury living context.",
        forbidden: &[
            "ice", "cosmetic", "powder puff", "food", "beverage", "circuit", "packaging",
            "droplet", "condensation",
        ],
    },
    DomainProfile {
        key: "Giáo dục",
        title: "Education aesthetics",
        allowed: "Books, notebooks, pencils (subtle), bright clean surfaces, inspiring elements.",
        avoid: "No commercial product props and no dark moody lighting.",
        focus: "Focus on clarity, bright friendly colors, inspiring atmosphere, clean composition, learning-focused environment.",
        forbidden: &[
            "ice", "cosmetic", "beverage", "gadget", "medical", "condensation", "droplet",
            "petal", "powder puff",
        ],
    },
    DomainProfile {
        key: "Du lịch",
        title: "Travel aesthetics",
        allowed: "Natural landscape elements, cultural artifacts (subtle), scenic backgrounds, adventure elements.",
        avoid: "No retail product props. Let the destination carry the image.",
        focus: "Focus on scenic beauty, adventure, cultural elements, vibrant natural colors, inviting landscapes, holiday atmosphere.",
        forbidden: &[
            "packaging", "ice", "beverage", "gadget", "cosmetic", "food", "condensation",
            "powder puff", "circuit",
        ],
    },
    DomainProfile {
        key: "Sức khỏe & Y tế",
        title: "Health & Medical aesthetics",
        allowed: "Clean white or blue surfaces, subtle medical symbols (cross, plus sign), aloe vera plants for natural health, scientific elements.",
        avoid: "No commercial styling props and no dark colours.",
        focus: "Focus on cleanliness, trust (blue/white tones), professional atmosphere, scientific credibility, soft comforting lighting.",
        forbidden: &[
            "ice", "cosmetic", "beverage", "food", "accessory", "accessories", "condensation",
            "powder puff", "splash",
        ],
    },
];

pub fn domain_profile(key: &str) -> &'static DomainProfile {
    DOMAINS
        .iter()
        .find(|domain| domain.key == key.trim())
        .unwrap_or(&DOMAINS[0])
}

#[derive(Debug)]
pub struct StylePreset {
    pub key: &'static str,
    pub name: &'static str,
    pub name_en: &'static str,
    /// Sentences with `{type}`, `{bg}`, `{light}`, `{angle}` and `{elements}`
    /// slots. `{desc}` and `{notes}` are filled from user text.
    sentences: &'static [&'static str],
    elements: &'static [&'static str],
}

pub const STYLE_PRESETS: [StylePreset; 14] = [
    StylePreset {
        key: "studio_professional",
        name: "Studio Chuyên Nghiệp",
        name_en: "Professional Studio",
        sentences: &[
            "CREATE A NEW {type} featuring {desc}.",
            "EXTRACT the product and place it in a completely NEW professional studio environment.",
            "Apply: {bg}.",
            "Use {light}.",
            "Shoot at {angle}.",
            "Add {elements}.",
            "Full HD quality.",
        ],
        elements: &["reflections", "shadows", "professional retouching"],
    },
    StylePreset {
        key: "organic_elegant",
        name: "Hữu cơ & Thanh lịch",
        name_en: "Organic & Elegant",
        sentences: &[
            "CREATE A NEW {type} featuring {desc}.",
            "EXTRACT the product and PLACE it in an elegant organic setting with {elements} surrounding it.",
            "Apply: {bg}.",
            "{light}.",
            "{angle}.",
            "Full HD quality.",
        ],
        elements: &["fresh green leaves", "colorful flowers", "natural elements"],
    },
    StylePreset {
        key: "dynamic_fresh",
        name: "Động lực & Tươi mới",
        name_en: "Dynamic & Fresh",
        sentences: &[
            "CREATE A NEW DYNAMIC {type} featuring {desc}.",
            "GENERATE an exciting scene with {elements}.",
            "Apply: {bg}.",
            "{light}.",
            "{angle}.",
            "High-speed photography look.",
            "Full HD quality.",
        ],
        elements: &[
            "dramatic liquid splash",
            "water droplets frozen in mid-air",
            "ice cubes flying",
            "dynamic motion effects",
        ],
    },
    StylePreset {
        key: "gourmet_dramatic",
        name: "Ẩm thực & Kịch tính",
        name_en: "Gourmet & Dramatic",
        sentences: &[
            "CREATE A NEW professional gourmet photography {type} featuring {desc}.",
            "CONSTRUCT a gourmet scene with {elements}.",
            "Apply dramatic {bg}.",
            "{light}.",
            "{angle}.",
            "Magazine-quality food advertising.",
            "Full HD quality.",
        ],
        elements: &[
            "fresh ingredients",
            "herbs",
            "steam effects",
            "appetizing presentation",
        ],
    },
    StylePreset {
        key: "conceptual_surreal",
        name: "Thế giới thu nhỏ",
        name_en: "Miniature World",
        sentences: &[
            "CREATE A NEW MAGICAL {type} featuring {desc} as the giant centerpiece in a whimsical miniature 3D fantasy world.",
            "ADD {elements}.",
            "{bg}.",
            "{light}.",
            "{angle}.",
            "Dreamlike atmosphere.",
            "Full HD quality.",
        ],
        elements: &[
            "tiny cute cartoon characters interacting with the product",
            "magical particles",
            "fantasy landscape",
        ],
    },
    StylePreset {
        key: "narrative_context",
        name: "Xoáy tròn & Splash",
        name_en: "Swirl & Splash",
        sentences: &[
            "CREATE A NEW ARTISTIC {type} featuring {desc}.",
            "GENERATE {elements}.",
            "{bg}.",
            "{light}.",
            "{angle}.",
            "Abstract artistic advertising style.",
            "Full HD quality.",
        ],
        elements: &[
            "dramatic colorful liquid swirls spiraling around the product in circular motion",
            "paint splashes",
            "smoky effects",
        ],
    },
    StylePreset {
        key: "tech_futuristic",
        name: "Công nghệ Tương lai",
        name_en: "Tech Futuristic",
        sentences: &[
            "CREATE A NEW FUTURISTIC {type} featuring {desc}.",
            "PLACE product in a high-tech environment with {elements}.",
            "{bg}.",
            "{light}.",
            "{angle}.",
            "Sci-fi tech advertising style.",
            "Full HD quality.",
        ],
        elements: &[
            "holographic UI elements",
            "neon blue/purple lighting",
            "digital grid patterns",
            "floating particles",
            "sleek reflective surfaces",
        ],
    },
    StylePreset {
        key: "fashion_editorial",
        name: "Thời trang Biên tập",
        name_en: "Fashion Editorial",
        sentences: &[
            "CREATE A NEW EDITORIAL {type} featuring {desc}.",
            "COMPOSE a sophisticated fashion photography scene with {elements}.",
            "{bg}.",
            "{light}.",
            "{angle}.",
            "Vogue-style fashion advertising.",
            "Full HD quality.",
        ],
        elements: &[
            "elegant minimalist background",
            "dramatic shadows",
            "artistic composition",
            "premium fabric textures",
        ],
    },
    StylePreset {
        key: "beauty_luxury",
        name: "Mỹ phẩm Sang trọng",
        name_en: "Beauty Luxury",
        sentences: &[
            "CREATE A NEW LUXURIOUS {type} featuring {desc}.",
            "DESIGN an elegant beauty scene with {elements}.",
            "{bg}.",
            "{light}.",
            "{angle}.",
            "High-end beauty advertising.",
            "Full HD quality.",
        ],
        elements: &[
            "rose gold accents",
            "delicate rose petals",
            "crystal-clear water droplets",
            "soft silk fabric",
            "marble surface",
            "premium cosmetic presentation",
        ],
    },
    StylePreset {
        key: "lifestyle_minimal",
        name: "Lifestyle Tối giản",
        name_en: "Lifestyle Minimal",
        sentences: &[
            "CREATE A NEW MINIMALIST {type} featuring {desc}.",
            "COMPOSE a clean lifestyle scene with {elements}.",
            "{bg}.",
            "{light}.",
            "{angle}.",
            "Scandinavian minimal lifestyle advertising.",
            "Full HD quality.",
        ],
        elements: &[
            "neutral tones",
            "simple geometric shapes",
            "negative space",
            "natural materials (wood, cotton, ceramics)",
            "soft shadows",
        ],
    },
    StylePreset {
        key: "sports_dynamic",
        name: "Thể thao Năng động",
        name_en: "Sports Dynamic",
        sentences: &[
            "CREATE A NEW DYNAMIC {type} featuring {desc}.",
            "GENERATE an energetic sports scene with {elements}.",
            "{bg}.",
            "{light}.",
            "{angle}.",
            "Nike-style sports advertising.",
            "Full HD quality.",
        ],
        elements: &[
            "motion blur",
            "speed lines",
            "sweat droplets flying",
            "athletic energy",
            "bold contrasting colors",
            "dramatic action freeze-frame",
        ],
    },
    StylePreset {
        key: "automotive_premium",
        name: "Ô tô Cao cấp",
        name_en: "Automotive Premium",
        sentences: &[
            "CREATE A NEW PREMIUM {type} featuring {desc}.",
            "DESIGN a luxury automotive scene with {elements}.",
            "{bg}.",
            "{light}.",
            "{angle}.",
            "Mercedes-Benz style premium advertising.",
            "Full HD quality.",
        ],
        elements: &[
            "perfect chrome reflections",
            "sleek metallic surfaces",
            "dramatic studio lighting",
            "carbon fiber textures",
            "glossy paint finish",
        ],
    },
    StylePreset {
        key: "eco_natural",
        name: "Sinh thái Tự nhiên",
        name_en: "Eco Natural",
        sentences: &[
            "CREATE A NEW ECO-FRIENDLY {type} featuring {desc}.",
            "COMPOSE a natural sustainable scene with {elements}.",
            "{bg}.",
            "{light}.",
            "{angle}.",
            "Sustainable eco advertising.",
            "Full HD quality.",
        ],
        elements: &[
            "lush green plants",
            "bamboo",
            "recycled materials",
            "earth tones",
            "natural sunlight",
            "organic textures",
            "eco-conscious presentation",
        ],
    },
    StylePreset {
        key: "urban_street",
        name: "Đường phố Đô thị",
        name_en: "Urban Street",
        sentences: &[
            "CREATE A NEW URBAN {type} featuring {desc}.",
            "PLACE product in gritty street environment with {elements}.",
            "{bg}.",
            "{light}.",
            "{angle}.",
            "Supreme-style streetwear advertising.",
            "Full HD quality.",
        ],
        elements: &[
            "graffiti wall",
            "concrete textures",
            "urban decay aesthetic",
            "bold typography",
            "street art elements",
            "raw authentic vibe",
        ],
    },
];

pub fn style_preset(key: &str) -> Option<&'static StylePreset> {
    STYLE_PRESETS.iter().find(|preset| preset.key == key.trim())
}

const AUTO_BACKGROUND: &str = "INTELLIGENT BACKGROUND SELECTION: Analyze the product and automatically choose the most harmonious background style based on these rules:
- For TEA/MATCHA/LATTE beverages: Use soft PASTEL tones (mint green, cream, soft pink, lavender) with natural wooden or marble surface
- For ENERGY DRINKS/SPORTS beverages: Use VIBRANT BOLD colors (electric blue, neon green, fiery orange, dynamic gradients) with sleek modern surface
- For COFFEE beverages: Use warm EARTH TONES (deep brown, cream, terracotta) with rustic wooden surface
- For FRUIT JUICES/SMOOTHIES: Use FRESH TROPICAL colors matching the fruit (orange for citrus, berry purple, tropical green) with natural props
- For ALCOHOL/WINE: Use ELEGANT DARK tones (deep burgundy, gold accents, black velvet) with luxury surface
- For MILK/DAIRY: Use CLEAN WHITE/CREAM palette with soft shadows on pure seamless backdrop
- For COSMETICS/BEAUTY: Use SOPHISTICATED neutrals (rose gold, nude pink, marble white) with premium surface
- For FOOD items: Use APPETIZING warm tones that complement the dish, natural ingredients as props
The background color palette MUST harmonize with the product's dominant colors. Surface and props should match the product category. Professional commercial photography quality.";

fn background_prompt(label: &str) -> &'static str {
    match label.trim() {
        "Tự động phân tích" | "Auto analyze" => AUTO_BACKGROUND,
        "Studio chuyên nghiệp" => "professional photography studio setup, seamless backdrop with soft gradient matching product colors",
        "Professional studio" => "professional photography studio setup, seamless backdrop",
        "Thiên nhiên" => "product photographed in natural setting, real wooden surface or stone platform",
        "Nature" => "product photographed in natural setting",
        "Đường phố" => "urban lifestyle photography, product on textured concrete or brick surface",
        "Urban street" => "urban lifestyle photography",
        "Sang trọng" => "luxury product photography, rich marble or velvet surface, gold/metallic accent props",
        "Luxury" => "luxury product photography",
        "Nhà bếp" => "authentic kitchen food photography, wooden cutting board or kitchen counter",
        "Kitchen" => "authentic kitchen food photography",
        "Bãi biển" => "beach product photography, sandy surface with natural shells",
        "Beach" => "beach product photography",
        "Studio tối giản" => "minimalist studio photography, clean single-color seamless backdrop",
        "Minimalist studio" => "minimalist studio photography",
        "Công nghệ" => "tech product photography, sleek reflective surface, subtle neon accent lighting",
        "Tech" => "tech product photography",
        "Cổ điển" => "vintage product photography, antique wooden furniture surface",
        "Vintage" => "vintage product photography",
        _ => DEFAULT_BACKGROUND,
    }
}

fn lighting_prompt(label: &str) -> &'static str {
    match label.trim() {
        "Studio chuyên nghiệp" | "Professional studio" => "professional 3-point studio lighting setup",
        "Ánh sáng tự nhiên" => "soft natural window light from side",
        "Natural light" => "soft natural window light",
        "Golden hour" => "warm golden hour sunlight",
        "Neon glow" => "subtle neon accent lighting, colored gel lights",
        "Dramatic shadow" => "dramatic single-source lighting, deep contrasting shadows",
        "Soft diffused" => "large softbox diffused lighting",
        "Rim light" => "soft volumetric rim/back lighting",
        _ => DEFAULT_LIGHTING,
    }
}

fn angle_prompt(label: &str) -> &'static str {
    match label.trim() {
        "Góc chụp studio chuẩn" | "Standard studio angle" => "professional eye-level studio shot",
        "Góc nhìn trực diện" | "Front view" => "straight-on frontal view",
        "Góc 45 độ" | "45-degree angle" => "three-quarter view at 45-degree angle",
        "Góc nhìn từ trên" => "overhead flat-lay shot, 90-degree top-down view",
        "Top view" => "overhead flat-lay shot",
        "Góc 3/4 cao" | "High 3/4 angle" => "high three-quarter angle",
        "Góc hero shot" | "Hero shot" => "dramatic low-angle hero shot",
        "Góc cận cảnh" | "Close-up detail" => "close-up macro angle",
        _ => DEFAULT_ANGLE,
    }
}

fn poster_type_prompt(label: &str) -> &'static str {
    match label.trim() {
        "Poster quảng cáo sản phẩm" | "Product advertisement poster" => {
            "professional product advertisement poster"
        }
        "Banner social media" => "social media banner, modern digital marketing",
        "Social media banner" => "social media banner",
        "Mockup sản phẩm 3D" => "3D product mockup, realistic rendering",
        "3D product mockup" => "3D product mockup",
        "Poster sự kiện" | "Event poster" => "event promotional poster",
        "Bao bì sản phẩm" | "Product packaging" => "product packaging design",
        "Billboard quảng cáo" => "billboard advertising, large format outdoor ad",
        "Billboard advertising" => "billboard advertising",
        _ => DEFAULT_POSTER_TYPE,
    }
}

/// Emphatic ratio sentence keyed by API ratio.
fn aspect_ratio_prompt(ratio: &str) -> Option<&'static str> {
    Some(match ratio {
        "1:1" => "MUST be EXACTLY 1:1 SQUARE aspect ratio (1024x1024 pixels). The image MUST be perfectly square - equal width and height.",
        "9:16" => "MUST be EXACTLY 9:16 VERTICAL aspect ratio (1080x1920 pixels). This is a TALL NARROW portrait format - the height must be almost TWICE the width. Make the image much TALLER than it is wide.",
        "16:9" => "MUST be EXACTLY 16:9 LANDSCAPE WIDESCREEN aspect ratio (1920x1080 pixels). Wide horizontal format - width almost twice the height.",
        "4:5" => "MUST be EXACTLY 4:5 PORTRAIT aspect ratio (1024x1280 pixels). Vertical Instagram post format - slightly taller than wide.",
        "5:4" => "MUST be EXACTLY 5:4 LANDSCAPE aspect ratio (1280x1024 pixels). Horizontal Instagram format - slightly wider than tall.",
        "3:4" => "MUST be EXACTLY 3:4 PORTRAIT aspect ratio (1152x1536 pixels). Vertical format, taller than wide.",
        "4:3" => "MUST be EXACTLY 4:3 LANDSCAPE aspect ratio (1536x1152 pixels). Horizontal format, wider than tall.",
        "2:3" => "MUST be EXACTLY 2:3 PORTRAIT poster aspect ratio (1024x1536 pixels). Tall vertical poster format - height is 1.5x the width.",
        "3:2" => "MUST be EXACTLY 3:2 LANDSCAPE poster aspect ratio (1536x1024 pixels). Wide horizontal poster format - width is 1.5x the height.",
        "21:9" => "MUST be EXACTLY 21:9 ULTRA-WIDE cinematic aspect ratio (2016x864 pixels). Very wide horizontal banner - width is more than twice the height.",
        _ => return None,
    })
}

const SMART_STYLING: &str = "
**CRITICAL INSTRUCTIONS FOR REALISTIC INTEGRATION:**

1. **SEAMLESS INTEGRATION IS MANDATORY:**
   - The product MUST look like it was ACTUALLY PHOTOGRAPHED in the scene, NOT composited/photoshopped.
   - Match the product's lighting EXACTLY to the environment lighting (direction, color temperature, intensity).
   - Create NATURAL shadows that match the scene's light source (soft/hard, angle, length).
   - Add subtle reflections from the environment onto the product surface.

2. **LIGHTING CONSISTENCY:**
   - If the scene has warm lighting, the product must also have warm color cast.
   - Shadows must fall in the SAME direction as other shadows in the scene.
   - Add ambient occlusion where product meets surfaces.
   - Include subtle rim lighting or edge glow if scene has backlighting.

3. **ENVIRONMENTAL INTERACTION:**
   - Add realistic reflections on glossy product surfaces showing the environment.
   - Create natural shadows underneath and around the product.
   - If there are splashes/particles, they should interact with the product realistically.
   - Add atmospheric effects consistently (fog, mist, bokeh) affecting both product and background.

4. **COLOR HARMONY:**
   - The product's colors should be influenced by the environment's ambient color.
   - Ensure white balance is consistent between product and background.
   - Add subtle color spill from colorful backgrounds onto the product edges.

5. **OUTPUT QUALITY:**
   - Full HD, professional commercial photography quality.
   - Sharp focus on product with appropriate depth of field.
   - The result must be indistinguishable from a real professional photo shoot.
";

const REFERENCE_RATIO_BLOCK: &str = "
**⚠️ CRITICAL - ASPECT RATIO MUST MATCH REFERENCE:**
- Analyze the EXACT dimensions/proportions of the reference image.
- If reference is portrait (tall), output MUST be portrait with same ratio.
- If reference is landscape (wide), output MUST be landscape with same ratio.
- If reference is square, output MUST be square.
- The output image dimensions should match the reference image proportions EXACTLY.
- Do NOT change the aspect ratio - this is mandatory.
";

const MANDATORY_RATIO_BLOCK: &str = "
**⚠️⚠️⚠️ CRITICAL - MANDATORY ASPECT RATIO INSTRUCTION ⚠️⚠️⚠️**
{ratio_prompt}

**THIS IS NON-NEGOTIABLE:**
- The OUTPUT IMAGE dimensions MUST follow this exact aspect ratio.
- For 9:16: The image must be TALL and NARROW (like a phone screen in portrait mode).
- For 16:9: The image must be WIDE and SHORT (like a TV screen).
- For 1:1: The image must be a PERFECT SQUARE.
- Adjust your composition to fit this format - do NOT output a different ratio.
- If you output a wrong aspect ratio, the result will be REJECTED.

";

const REFERENCE_MODE_BLOCK: &str = "
**⚠️ CRITICAL - UNDERSTAND WHICH IMAGE IS WHICH:**
You are given MULTIPLE images. Each has a SPECIFIC purpose:

1. **MY PRODUCT IMAGE(S)** [FIRST IMAGE(S)]: The product I want in the final poster
   - Use this product in the poster
   - This is NOT a layout reference

2. **REFERENCE POSTER IMAGE** [{reference_position} IMAGE]: The poster showing LAYOUT, COMPOSITION, and ASPECT RATIO
   - ⚠️ THIS IS THE SOURCE OF TRUTH FOR: aspect ratio, layout, product position, background style
   - Copy the EXACT aspect ratio (portrait/landscape/square) from this image
   - Copy the EXACT composition and product placement
{text_effect_role}
**⚠️ ASPECT RATIO RULE:**
- The OUTPUT must have the SAME aspect ratio as the REFERENCE POSTER IMAGE
- If reference is PORTRAIT (tall), output MUST be portrait
- If reference is LANDSCAPE (wide), output MUST be landscape
- Do NOT change aspect ratio based on other images

YOUR TASK: Create poster with MY PRODUCT + REFERENCE LAYOUT{text_effect_task}.

**STEP 1 - ANALYZE THE REFERENCE POSTER IMAGE (NOT OTHER IMAGES):**
First, carefully analyze the REFERENCE POSTER image and identify:
- What is the ASPECT RATIO? (portrait/landscape/square)
- Where is the main product/subject positioned? (center, left, right, top, bottom)
- What is the exact background style, colors, and atmosphere?
- Where are any text elements located? (headlines, taglines, CTAs)
- What decorative elements exist? (splashes, leaves, particles, shadows, reflections)
- What is the overall composition and proportions?

**STEP 2 - RECREATE WITH THESE STRICT RULES:**

1. **⚠️ CRITICAL - REPLACE THE REFERENCE PRODUCT WITH MY PRODUCT:**
   - COMPLETELY REMOVE the product shown in the reference image (it's NOT my product)
   - EXTRACT my product from MY uploaded product image (the FIRST image provided)
   - PLACE my product in the EXACT same position, scale, and angle as the original product in the reference
   - The reference product is just a PLACEHOLDER showing where MY product should go
   - My product is: \"{desc}\"

2. **⚠️ COLOR PALETTE - MUST MATCH REFERENCE EXACTLY:**
   - Analyze the EXACT color scheme of the reference image
   - If reference is GREEN (matcha theme) → output MUST be GREEN, NOT orange/brown
   - If reference is ORANGE → output MUST be ORANGE
   - If reference is PINK → output MUST be PINK
   - Copy the EXACT background color, gradients, and color tones
   - The overall color impression must be IDENTICAL to reference
   - Do NOT change colors based on my product - KEEP the reference colors

3. **BACKGROUND & COMPOSITION - COPY EXACTLY:**
   - Copy the EXACT same background style, gradients, and visual atmosphere
   - If reference has a WHITE BOX/PODIUM → use WHITE BOX, not hexagon
   - If reference has a HEXAGON podium → use HEXAGON
   - Copy the EXACT podium/platform shape and color
   - Copy the lighting direction and intensity

4. **PRESERVE MY PRODUCT'S LOGO/BRANDING:** Keep all logos, labels, and branding on MY uploaded product image intact. Do NOT remove anything from my product.

5. **⚠️ CRITICAL - REMOVE ALL TEXT FROM REFERENCE:**
   - REMOVE every single word, letter, and text element from the reference image
   - This includes: \"SUMMER\", \"Lorem ipsum\", brand names, taglines, ALL text
   - The background where text was should be filled with the surrounding background seamlessly
   - Do NOT copy any text from reference - only copy the background and visual elements
   - ONLY add the text that user provides in STEP 3 below

6. **⚠️ CRITICAL - REMOVE ALL LOGOS/WATERMARKS FROM REFERENCE:**
   - COMPLETELY REMOVE any logos, watermarks, brand marks, or company emblems from the reference image
   - This includes logos in corners (company logos, photographer watermarks)
   - Do NOT copy any branding elements from the reference image background
   - The areas where logos/watermarks were should be filled with the surrounding background seamlessly
   - The ONLY branding that should appear is ON my uploaded product itself

7. **⚠️ DECORATIVE ELEMENTS - COPY EXACTLY FROM REFERENCE:**
   - If reference has GREEN TEA LEAVES → add GREEN TEA LEAVES, not star anise
   - If reference has MATCHA POWDER sprinkles → add MATCHA POWDER, not other spices
   - If reference has STAR ANISE → add STAR ANISE
   - If reference has ICE CUBES → add ICE CUBES
   - Copy the EXACT TYPE, COLOR, and POSITION of decorative elements
   - Do NOT substitute with different elements
   - The decorative elements must match the reference EXACTLY in type and style
   - Do NOT add effects that don't exist in reference
";

const TEXT_EFFECT_ROLE: &str = "
3. **TEXT EFFECT IMAGE** [LAST IMAGE]: Shows ONLY the font/text styling I want
   - Use this ONLY for text styling (font, color, effects)
   - Do NOT use this for layout or aspect ratio
   - This image only affects how the text looks, NOT the poster structure
";

const REFERENCE_TEXT_RULES: &str = "
**⚠️ CRITICAL TEXT RULES:**
- ONLY use the text content I provided above (headline, subheadline, CTA)
- YOU MUST INCLUDE ALL text elements I specified - do NOT skip any
- Do NOT add any other text, brand names, or words from the product image
- Do NOT read text from the product packaging/logo and add it as a separate title
- The product's own branding/labels should remain ON the product only
- Text must NOT overlap with the product
- All text should feel like part of the original design

**⚠️⚠️ CRITICAL - VIETNAMESE TEXT ACCURACY (RẤT QUAN TRỌNG):**
The text I provided is in VIETNAMESE with special diacritical marks (dấu). You MUST:
- Copy EVERY character EXACTLY as I wrote it - do NOT guess or change any letter
- Vietnamese has unique diacritics: à, á, ả, ã, ạ, ă, ằ, ắ, ẳ, ẵ, ặ, â, ầ, ấ, ẩ, ẫ, ậ, etc.
- Do NOT substitute similar-looking letters (e.g., \"tràn\" ≠ \"trản\", \"Mua\" ≠ \"Nhặn\")
- If my text says \"{headline}\" - write EXACTLY that, character by character
- If my text says \"{subheadline}\" - write EXACTLY that, character by character
- If my text says \"{cta}\" - write EXACTLY that, character by character
- ANY spelling error in Vietnamese text is UNACCEPTABLE
- Double-check each word before rendering
";

const TEXT_EFFECT_STYLING: &str = "
**TEXT STYLING FROM UPLOADED REFERENCE:**
Apply the EXACT text style from the uploaded text effect image:
- Copy the exact font family and weight
- Copy the exact colors, gradients, or color effects
- Copy all shadow effects (drop shadow, inner shadow, long shadow)
- Copy any glow, outline, or stroke effects
- Copy 3D effects, emboss, bevel if present
- Copy any texture or pattern fills
The text must look like it was styled by the same designer who made the text effect reference.
";

const REFERENCE_TYPOGRAPHY: &str = "
**⚠️ TYPOGRAPHY - MUST MATCH REFERENCE EXACTLY (CRITICAL):**
The text styling must be a PERFECT VISUAL COPY of the reference image's typography.

1. **ANALYZE REFERENCE TEXT CAREFULLY:**
   - What is the EXACT font type? (serif, sans-serif, script, decorative, display?)
   - Is it a SPECIAL decorative font with unique letterforms?
   - What COLOR is the text? (white, green, red, gradient?)
   - Does it have TEXTURE or PATTERN inside the letters?
   - Does it have OUTLINE, STROKE, or BORDER?
   - Does it have SHADOW (drop shadow, inner shadow, 3D effect)?
   - Is it BOLD, LIGHT, ITALIC, or REGULAR?

2. **⚠️ COPY THE EXACT FONT STYLE:**
   - If reference uses a DECORATIVE SCRIPT font → use SAME decorative style
   - If reference uses BOLD SANS-SERIF → use BOLD SANS-SERIF
   - If reference has a unique artistic font → replicate that artistic style
   - Do NOT substitute with generic Arial/Helvetica - match the DESIGN QUALITY
   - The letterforms must LOOK SIMILAR to reference

3. **COPY THE EXACT TEXT EFFECTS:**
   - If reference text is WHITE with no effects → use WHITE with no effects
   - If reference text has GREEN color → use GREEN
   - If reference has a texture on the text → add similar texture
   - If reference has shadow/glow → add shadow/glow
   - If reference has outline/stroke → add outline/stroke

4. **⚠️ THE GOAL:**
   - Someone looking at both posters should think the same designer made them
   - The typography style must be VISUALLY IDENTICAL in feeling
   - Match the artistic level and sophistication of the reference
";

const PROFESSIONAL_TYPOGRAPHY: &str = "
**PROFESSIONAL TYPOGRAPHY DESIGN:**
Since no reference, create DESIGNER-LEVEL typography:

1. **FONT SELECTION:**
   - Choose a sophisticated, premium font that matches the product category
   - For luxury products: elegant serif or refined sans-serif
   - For modern/tech: clean geometric sans-serif
   - For food/beverage: friendly rounded or appetizing display fonts
   - For fashion: stylish high-contrast or editorial fonts
   - AVOID basic/default fonts like Arial or Times New Roman

2. **TYPOGRAPHY HIERARCHY:**
   - Create visual contrast between headline and subheadline
   - Mix font weights (bold headline + light subheadline) or styles (display + serif)
   - Size ratios should be professional (headline 2-3x larger than body)

3. **VISUAL EFFECTS:**
   - Add subtle but impactful effects (soft shadows, slight gradients)
   - Colors should complement or tastefully contrast with the poster
   - Consider decorative elements if appropriate for the brand

4. **DESIGNER MINDSET:**
   - The text should look like it was designed by a professional agency
   - Every detail matters - kerning, spacing, alignment
   - The overall feel should be premium and polished
";

/// Poster inputs collected from a tool state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PosterOptions {
    pub style: String,
    pub domain: String,
    pub background: String,
    pub lighting: String,
    pub angle: String,
    pub poster_type: String,
    pub aspect_ratio: String,
    pub product_description: String,
    pub environment_description: String,
    pub notes: String,
    pub include_text: bool,
    pub headline: String,
    pub subheadline: String,
    pub cta: String,
    pub color_scheme: String,
    pub has_reference_image: bool,
    pub has_text_effect_image: bool,
    pub has_secondary_object_image: bool,
    pub advanced_styling: bool,
}

impl PosterOptions {
    pub fn from_state(state: &ToolState) -> Self {
        let options = &state.options;
        let text = |key: &str| options.extra_str(key).unwrap_or_default().to_string();
        Self {
            style: options
                .style
                .clone()
                .filter(|value| !value.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_STYLE.to_string()),
            domain: options.extra_str("domain").unwrap_or(FREE_DOMAIN).to_string(),
            background: text("background_style"),
            lighting: text("lighting_style"),
            angle: text("product_angle"),
            poster_type: text("poster_type"),
            aspect_ratio: options.aspect_ratio.clone(),
            product_description: text("product_description"),
            environment_description: text("environment_description"),
            notes: options.notes.clone(),
            include_text: options.extra_bool("include_text"),
            headline: text("headline"),
            subheadline: text("subheadline"),
            cta: text("cta"),
            color_scheme: text("color_scheme"),
            has_reference_image: options.extra_str("reference_image").is_some(),
            has_text_effect_image: options.extra_str("text_effect_image").is_some(),
            has_secondary_object_image: options.extra_str("secondary_object_image").is_some(),
            advanced_styling: options.extra_bool("advanced_styling"),
        }
    }

    /// Ratio sent in the API request, `None` when the reference decides.
    pub fn api_aspect_ratio(&self) -> Option<String> {
        api_aspect_ratio(&self.aspect_ratio)
    }
}

/// Images in the order the prompt refers to them: products, secondary
/// object, reference poster, text effect.
pub fn poster_images(state: &ToolState) -> Vec<String> {
    let mut images = state.inputs.clone();
    for key in ["secondary_object_image", "reference_image", "text_effect_image"] {
        if let Some(src) = state.options.extra_str(key) {
            images.push(src.to_string());
        }
    }
    images
}

pub fn build_poster_prompt(opts: &PosterOptions) -> String {
    let domain = domain_profile(&opts.domain);
    let forbidden = domain.forbidden;
    let desc = non_empty_or(&opts.product_description, DEFAULT_DESCRIPTION);
    let env_desc = opts.environment_description.trim();

    let main = if opts.has_reference_image {
        let mut block = fill(
            REFERENCE_MODE_BLOCK,
            &[
                (
                    "{reference_position}",
                    if opts.has_text_effect_image {
                        "SECOND TO LAST"
                    } else {
                        "LAST"
                    },
                ),
                (
                    "{text_effect_role}",
                    if opts.has_text_effect_image {
                        TEXT_EFFECT_ROLE
                    } else {
                        ""
                    },
                ),
                (
                    "{text_effect_task}",
                    if opts.has_text_effect_image {
                        " + TEXT EFFECT STYLING"
                    } else {
                        ""
                    },
                ),
            ],
        );
        if !env_desc.is_empty() {
            block.push_str("\n8. **ADDITIONAL ELEMENTS:** Also include: {env}.\n");
        }
        if opts.has_secondary_object_image {
            block.push_str("9. **SECONDARY OBJECTS:** Incorporate elements from the secondary object image as surrounding props in appropriate positions.\n");
        }
        scrub(&block, forbidden)
    } else {
        let mut environment = String::new();
        if !env_desc.is_empty() {
            environment.push_str("ENVIRONMENT CONTEXT: Place the product with: {env}. ");
        }
        if opts.has_secondary_object_image {
            environment.push_str(
                "Include secondary objects from the uploaded reference as surrounding elements. ",
            );
        }
        let preset = style_preset(&opts.style)
            .or_else(|| style_preset(DEFAULT_STYLE))
            .map(|preset| render_preset(preset, opts, forbidden))
            .unwrap_or_default();
        format!("{environment}{}{preset}", domain_context(domain))
    };

    let text = if opts.include_text {
        scrub(&text_block(opts), forbidden)
    } else {
        String::new()
    };

    let color = opts.color_scheme.trim();
    let color_override =
        if opts.has_reference_image && !color.is_empty() && color != AUTO_COLOR_SCHEME {
            "\nCOLOR ADJUSTMENT: While keeping the layout, adjust the color palette to: {color}.\n"
        } else {
            ""
        };

    let advanced = if opts.advanced_styling {
        scrub(SMART_STYLING, forbidden)
    } else {
        String::new()
    };

    let assembled = format!(
        "{}{main}{text}{color_override}{advanced}",
        aspect_context(opts)
    );
    fill(
        &assembled,
        &[
            ("{desc}", desc),
            ("{env}", env_desc),
            ("{headline}", opts.headline.trim()),
            ("{subheadline}", opts.subheadline.trim()),
            ("{cta}", opts.cta.trim()),
            ("{color}", color),
            ("{notes}", opts.notes.trim()),
        ],
    )
}

fn aspect_context(opts: &PosterOptions) -> String {
    let label = opts.aspect_ratio.trim();
    if label.is_empty() || label == KEEP_REFERENCE {
        return if opts.has_reference_image {
            REFERENCE_RATIO_BLOCK.to_string()
        } else {
            String::new()
        };
    }
    match opts
        .api_aspect_ratio()
        .and_then(|ratio| aspect_ratio_prompt(&ratio))
    {
        Some(ratio_prompt) => fill(MANDATORY_RATIO_BLOCK, &[("{ratio_prompt}", ratio_prompt)]),
        None => String::new(),
    }
}

fn domain_context(domain: &DomainProfile) -> String {
    let mut lines = vec![format!("{}: {}", domain.title, domain.focus)];
    if domain.key != FREE_DOMAIN {
        lines = vec![
            format!("{}:", domain.title),
            format!("ALLOWED PROPS: {}", domain.allowed),
            format!("AVOID: {}", domain.avoid),
            domain.focus.to_string(),
        ];
    }
    let body = scrub(&lines.join("\n"), domain.forbidden);
    format!(
        "\n**DOMAIN/INDUSTRY CONTEXT:**\n{body}\nApply this aesthetic appropriately to the entire image composition.\n"
    )
}

fn render_preset(preset: &StylePreset, opts: &PosterOptions, forbidden: &[&str]) -> String {
    let bg = scrubbed_or(background_prompt(&opts.background), forbidden, DEFAULT_BACKGROUND);
    let light = scrubbed_or(lighting_prompt(&opts.lighting), forbidden, DEFAULT_LIGHTING);
    let angle = scrubbed_or(angle_prompt(&opts.angle), forbidden, DEFAULT_ANGLE);
    let poster_type = scrubbed_or(
        poster_type_prompt(&opts.poster_type),
        forbidden,
        DEFAULT_POSTER_TYPE,
    );
    let elements: Vec<&str> = preset
        .elements
        .iter()
        .copied()
        .filter(|element| !contains_any(element, forbidden))
        .collect();

    let mut sentences: Vec<String> = Vec::with_capacity(preset.sentences.len() + 1);
    for (idx, sentence) in preset.sentences.iter().enumerate() {
        // The opening carries the product and is always kept.
        if idx > 0 && contains_any(sentence, forbidden) {
            continue;
        }
        if sentence.contains("{elements}") && elements.is_empty() {
            continue;
        }
        sentences.push(fill(
            sentence,
            &[
                ("{type}", poster_type.as_str()),
                ("{bg}", bg.as_str()),
                ("{light}", light.as_str()),
                ("{angle}", angle.as_str()),
                ("{elements}", join_list(&elements).as_str()),
            ],
        ));
    }
    sentences.push("{notes}".to_string());
    sentences.join(" ")
}

fn text_block(opts: &PosterOptions) -> String {
    let headline = opts.headline.trim();
    let subheadline = opts.subheadline.trim();
    let cta = opts.cta.trim();
    let mut block = String::new();

    if opts.has_reference_image {
        block.push_str("\n\n**STEP 3 - TEXT REPLACEMENT (MANDATORY):**\nAnalyze where text/titles appear in the reference image and replace with my content.\n⚠️ YOU MUST ADD ALL TEXT ELEMENTS I PROVIDE BELOW - DO NOT SKIP ANY!\n");
        if !headline.is_empty() {
            block.push_str("\n📌 **MAIN HEADLINE:** \"{headline}\"\n   - MUST BE ADDED at the SAME position as the main title in reference\n   - Make it bold, prominent, and eye-catching\n   - Scale to fit the space while maintaining readability\n");
        }
        if !subheadline.is_empty() {
            block.push_str("\n📌 **SUBHEADLINE:** \"{subheadline}\"\n   - MUST BE ADDED below or near the headline as in reference\n   - Slightly smaller than headline but still readable\n");
        }
        if !cta.is_empty() {
            block.push_str("\n📌 **CTA BUTTON (MANDATORY):** \"{cta}\"\n   - ⚠️ THIS IS REQUIRED - YOU MUST ADD THIS CTA BUTTON\n   - Look at the reference image to find the CTA button position (usually bottom area)\n   - Create a button/badge with the text \"{cta}\" at that position\n   - Design style should match the reference CTA style (rounded rectangle, pill shape, etc.)\n   - Colors should HARMONIZE with the overall poster theme\n   - Make it noticeable but natural in the design\n   - If reference has a CTA button, replicate its style and position exactly\n");
        }
        block.push_str(REFERENCE_TEXT_RULES);
    } else {
        block.push_str("\n\n**TEXT ON POSTER:**\n");
        if !headline.is_empty() {
            block.push_str("- Main headline: \"{headline}\" - Make it bold and prominent at top\n");
        }
        if !subheadline.is_empty() {
            block.push_str("- Subheadline: \"{subheadline}\" - Below headline, supporting text\n");
        }
        if !cta.is_empty() {
            block.push_str("- CTA: \"{cta}\" - Design as elegant button that matches poster style, NOT overly bright or flashy\n");
        }
        block.push_str("\n**⚠️ VIETNAMESE TEXT - COPY EXACTLY:**\nThe text is in Vietnamese with diacritical marks. Copy EVERY character EXACTLY as provided - do NOT guess or substitute letters.\n");
    }

    if opts.has_text_effect_image {
        block.push_str(TEXT_EFFECT_STYLING);
    } else if opts.has_reference_image {
        block.push_str(REFERENCE_TYPOGRAPHY);
    } else {
        block.push_str(PROFESSIONAL_TYPOGRAPHY);
    }
    block
}

/// True when `token` occurs in `text` as a whole word, ignoring case and
/// allowing a plural `s`/`es` suffix.
pub fn contains_token(text: &str, token: &str) -> bool {
    let haystack = text.to_lowercase();
    let needle = token.trim().to_lowercase();
    if needle.is_empty() {
        return false;
    }
    let mut from = 0;
    while let Some(pos) = haystack[from..].find(&needle) {
        let start = from + pos;
        let end = start + needle.len();
        let boundary_before = haystack[..start]
            .chars()
            .next_back()
            .map_or(true, |ch| !ch.is_alphanumeric());
        let rest = &haystack[end..];
        let boundary_after = ["", "s", "es"].iter().any(|suffix| {
            rest.strip_prefix(suffix)
                .map_or(false, |tail| tail.chars().next().map_or(true, |ch| !ch.is_alphanumeric()))
        });
        if boundary_before && boundary_after {
            return true;
        }
        from = end;
    }
    false
}

pub fn contains_any(text: &str, tokens: &[&str]) -> bool {
    tokens.iter().any(|token| contains_token(text, token))
}

/// Removes forbidden tokens from builder text. Bullet and heading lines that
/// mention a token are dropped whole; other lines lose only the offending
/// comma-separated clauses.
pub fn scrub(text: &str, forbidden: &[&str]) -> String {
    if forbidden.is_empty() || !contains_any(text, forbidden) {
        return text.to_string();
    }
    let mut out: Vec<String> = Vec::new();
    for line in text.split('\n') {
        if !contains_any(line, forbidden) {
            out.push(line.to_string());
            continue;
        }
        let trimmed = line.trim_start();
        if trimmed.starts_with("- ") || trimmed.starts_with("**") {
            continue;
        }
        let kept: Vec<&str> = line
            .split(", ")
            .filter(|clause| !contains_any(clause, forbidden))
            .collect();
        if !kept.is_empty() {
            out.push(kept.join(", "));
        }
    }
    out.join("\n")
}

fn scrubbed_or(text: &str, forbidden: &[&str], fallback: &str) -> String {
    let cleaned = scrub(text, forbidden);
    if cleaned.trim().is_empty() {
        fallback.to_string()
    } else {
        cleaned
    }
}

fn non_empty_or<'a>(value: &'a str, fallback: &'a str) -> &'a str {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        fallback
    } else {
        trimmed
    }
}

fn join_list(items: &[&str]) -> String {
    match items {
        [] => String::new(),
        [one] => one.to_string(),
        [first, second] => format!("{first} and {second}"),
        [rest @ .., last] => format!("{}, and {last}", rest.join(", ")),
    }
}

/// Single pass placeholder substitution, so user text that happens to
/// contain `{...}` is never expanded again.
fn fill(template: &str, values: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    'scan: while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let candidate = &rest[open..];
        for (key, value) in values {
            if candidate.starts_with(key) {
                out.push_str(value);
                rest = &candidate[key.len()..];
                continue 'scan;
            }
        }
        out.push('{');
        rest = &candidate[1..];
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use duky_contracts::tools::{ToolKey, ToolState};

    use super::*;

    fn options(domain: &str, style: &str) -> PosterOptions {
        PosterOptions {
            style: style.to_string(),
            domain: domain.to_string(),
            aspect_ratio: "1:1 (Vuông - Instagram)".to_string(),
            ..PosterOptions::default()
        }
    }

    fn flag_variants(base: &PosterOptions) -> Vec<PosterOptions> {
        let mut out = Vec::new();
        for reference in [false, true] {
            for text in [false, true] {
                for advanced in [false, true] {
                    let mut opts = base.clone();
                    opts.has_reference_image = reference;
                    opts.include_text = text;
                    opts.advanced_styling = advanced;
                    opts.background = "Tự động phân tích".to_string();
                    out.push(opts);
                }
            }
        }
        out
    }

    #[test]
    fn no_domain_leaks_a_forbidden_token() {
        for domain in &DOMAINS {
            for preset in &STYLE_PRESETS {
                for opts in flag_variants(&options(domain.key, preset.key)) {
                    let prompt = build_poster_prompt(&opts);
                    for token in domain.forbidden {
                        assert!(
                            !contains_token(&prompt, token),
                            "domain {} style {} leaked {token}",
                            domain.key,
                            preset.key
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn tech_studio_poster_has_tech_cues_only() {
        let prompt = build_poster_prompt(&options("Công nghệ", "studio_professional"));
        let lower = prompt.to_lowercase();
        assert!(lower.contains("circuit") || lower.contains("metallic"));
        assert!(!lower.contains("flower petals"));
        assert!(!lower.contains("ice cubes"));
    }

    #[test]
    fn cosmetics_never_gets_fnb_props() {
        for preset in &STYLE_PRESETS {
            let prompt = build_poster_prompt(&options("Mỹ phẩm & Làm đẹp", preset.key));
            let lower = prompt.to_lowercase();
            assert!(!lower.contains("ice cube"), "{}", preset.key);
            assert!(!lower.contains("condensation"), "{}", preset.key);
        }
        let dynamic = build_poster_prompt(&options("Mỹ phẩm & Làm đẹp", "dynamic_fresh"));
        assert!(dynamic.contains("dynamic motion effects"));
    }

    #[test]
    fn aspect_directive_leads_the_prompt() {
        let prompt = build_poster_prompt(&options(FREE_DOMAIN, "urban_street"));
        assert!(prompt
            .trim_start()
            .starts_with("**⚠️⚠️⚠️ CRITICAL - MANDATORY ASPECT RATIO INSTRUCTION"));
        assert!(prompt.contains("MUST be EXACTLY 1:1 SQUARE"));
    }

    #[test]
    fn keep_reference_ratio_only_speaks_in_reference_mode() {
        let mut opts = options(FREE_DOMAIN, DEFAULT_STYLE);
        opts.aspect_ratio = KEEP_REFERENCE.to_string();
        let plain = build_poster_prompt(&opts);
        assert!(!plain.contains("ASPECT RATIO MUST MATCH REFERENCE"));
        assert!(!plain.contains("MANDATORY ASPECT RATIO"));
        assert_eq!(opts.api_aspect_ratio(), None);

        opts.has_reference_image = true;
        let reference = build_poster_prompt(&opts);
        assert!(reference.contains("ASPECT RATIO MUST MATCH REFERENCE"));
        assert!(reference.contains("REPLACE THE REFERENCE PRODUCT WITH MY PRODUCT"));
    }

    #[test]
    fn user_text_and_defaults_are_filled() {
        let mut opts = options(FREE_DOMAIN, DEFAULT_STYLE);
        let defaults = build_poster_prompt(&opts);
        assert!(defaults.contains("CREATE A NEW professional product poster featuring the product in the image."));
        assert!(defaults.contains("Apply: professional background."));
        assert!(defaults.contains("Shoot at optimal angle."));

        opts.product_description = "Trà sữa {notes}".to_string();
        opts.include_text = true;
        opts.headline = "Mua 1 tặng 1".to_string();
        opts.notes = "Nền xanh".to_string();
        let prompt = build_poster_prompt(&opts);
        assert!(prompt.contains("featuring Trà sữa {notes}."));
        assert!(prompt.contains("- Main headline: \"Mua 1 tặng 1\""));
        assert!(prompt.contains("PROFESSIONAL TYPOGRAPHY DESIGN"));
        assert!(prompt.trim_end().ends_with("Nền xanh"));
    }

    #[test]
    fn color_override_needs_reference_and_explicit_scheme() {
        let mut opts = options(FREE_DOMAIN, DEFAULT_STYLE);
        opts.color_scheme = "Pastel nhẹ nhàng".to_string();
        assert!(!build_poster_prompt(&opts).contains("COLOR ADJUSTMENT"));

        opts.has_reference_image = true;
        assert!(build_poster_prompt(&opts)
            .contains("adjust the color palette to: Pastel nhẹ nhàng."));

        opts.color_scheme = AUTO_COLOR_SCHEME.to_string();
        assert!(!build_poster_prompt(&opts).contains("COLOR ADJUSTMENT"));
    }

    #[test]
    fn token_matching_respects_word_boundaries() {
        assert!(contains_token("Add ICE CUBES flying", "ice cube"));
        assert!(contains_token("rose petals", "petal"));
        assert!(contains_token("paint splashes", "splash"));
        assert!(!contains_token("premium device price", "ice"));
        assert!(!contains_token("fresh fruit slices", "ice"));
        assert!(!contains_token("satin frosted glass", "frost"));
    }

    #[test]
    fn scrub_drops_bullets_and_clauses() {
        let text = "intro, ice cubes, marble\n- For FOOD items: warm tones\nkeep";
        assert_eq!(scrub(text, &["ice", "food"]), "intro, marble\nkeep");
    }

    #[test]
    fn state_fields_feed_options_and_image_order() -> anyhow::Result<()> {
        let mut state = ToolState::new(ToolKey::PosterCreator);
        state.add_input("p1.png")?;
        state.options.style = Some("eco_natural".to_string());
        state.options.set_extra("domain", "Du lịch");
        state.options.set_extra("reference_image", "ref.png");
        state.options.set_extra("text_effect_image", "fx.png");
        state.options.set_extra("secondary_object_image", "obj.png");
        state.options.set_extra("include_text", true);

        let opts = PosterOptions::from_state(&state);
        assert_eq!(opts.style, "eco_natural");
        assert_eq!(opts.domain, "Du lịch");
        assert!(opts.has_reference_image && opts.has_text_effect_image && opts.include_text);
        assert_eq!(poster_images(&state), vec!["p1.png", "obj.png", "ref.png", "fx.png"]);

        let prompt = build_poster_prompt(&opts);
        assert!(prompt.contains("[SECOND TO LAST IMAGE]"));
        assert!(prompt.contains("TEXT STYLING FROM UPLOADED REFERENCE"));
        Ok(())
    }

    #[test]
    fn unknown_domain_falls_back_to_free() {
        assert_eq!(domain_profile("Không tồn tại").key, FREE_DOMAIN);
        let prompt = build_poster_prompt(&options("Không tồn tại", "no_such_style"));
        assert!(prompt.contains("Creative freedom: Adapt the style to best fit the product."));
        assert!(prompt.contains("professional retouching"));
    }
}
