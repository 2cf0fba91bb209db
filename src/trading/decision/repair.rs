//! AI响应的JSON修复与提取
//!
//! AI输出的决策数组可能混入零宽字符、全角标点、空字符串数值字段和
//! 千位分隔符。全部修复操作都是幂等的：repair(repair(x)) == repair(x)。
//! 修复后仍找不到JSON数组时，合成一条wait决策兜底，绝不让周期崩溃。

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::warn;

use super::types::Decision;

/// 兜底决策的思维链摘要长度
const FALLBACK_SUMMARY_CHARS: usize = 240;

// 预编译正则，避免每个周期重复编译
static RE_JSON_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)```json\s*(\[\s*\{.*?\}\s*\])\s*```").unwrap());
static RE_JSON_ARRAY: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)\[\s*\{.*?\}\s*\]").unwrap());
static RE_ARRAY_HEAD: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\[\s*\{").unwrap());
static RE_ARRAY_OPEN_SPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\[\s+\{").unwrap());
static RE_INVISIBLE: Lazy<Regex> =
    Lazy::new(|| Regex::new("[\u{200B}\u{200C}\u{200D}\u{FEFF}]").unwrap());
static RE_THOUSAND_SEP: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d+),(\d{3})").unwrap());

/// 空字符串需要改写为null的数值字段
const NUMERIC_FIELDS: [&str; 9] = [
    "leverage",
    "position_size_usd",
    "stop_loss",
    "take_profit",
    "confidence",
    "risk_usd",
    "new_stop_loss",
    "new_take_profit",
    "close_percentage",
];

static RE_EMPTY_NUMERIC: Lazy<Vec<(Regex, String)>> = Lazy::new(|| {
    NUMERIC_FIELDS
        .iter()
        .map(|field| {
            (
                Regex::new(&format!(r#""{}"\s*:\s*"""#, field)).unwrap(),
                format!(r#""{}":null"#, field),
            )
        })
        .collect()
});

/// 去除零宽字符与BOM
pub fn remove_invisible_runes(s: &str) -> String {
    RE_INVISIBLE.replace_all(s, "").into_owned()
}

/// 全角/CJK标点转ASCII（AI在中文上下文里可能输出全角JSON字符）
pub fn fix_full_width(s: &str) -> String {
    let mut out = s.to_string();
    const REPLACEMENTS: [(&str, &str); 14] = [
        ("\u{201C}", "\""),
        ("\u{201D}", "\""),
        ("\u{2018}", "'"),
        ("\u{2019}", "'"),
        ("［", "["),
        ("］", "]"),
        ("｛", "{"),
        ("｝", "}"),
        ("：", ":"),
        ("，", ","),
        ("【", "["),
        ("】", "]"),
        ("、", ","),
        ("\u{3000}", " "),
    ];
    for (from, to) in REPLACEMENTS {
        out = out.replace(from, to);
    }
    out
}

/// 数值字段的空字符串改写为null（wait/hold时AI常输出 "leverage":""）
pub fn fix_empty_string_fields(s: &str) -> String {
    let mut out = s.to_string();
    for (re, replacement) in RE_EMPTY_NUMERIC.iter() {
        out = re.replace_all(&out, replacement.as_str()).into_owned();
    }
    out
}

/// 去掉数字中的千位分隔符（100,500 -> 100500），循环处理多级分隔
pub fn fix_thousand_separators(s: &str) -> String {
    let mut out = s.to_string();
    loop {
        let next = RE_THOUSAND_SEP.replace_all(&out, "$1$2").into_owned();
        if next == out {
            return out;
        }
        out = next;
    }
}

/// 规整开头的 "[ {" 为 "[{"
pub fn compact_array_open(s: &str) -> String {
    RE_ARRAY_OPEN_SPACE
        .replace(s.trim(), "[{")
        .into_owned()
}

/// 完整修复管线（幂等）
pub fn repair(s: &str) -> String {
    let mut out = remove_invisible_runes(s);
    out = out.trim().to_string();
    out = fix_full_width(&out);
    out = fix_empty_string_fields(&out);
    out = fix_thousand_separators(&out);
    out
}

/// 校验JSON决策数组的基本格式
fn validate_json_format(s: &str) -> Result<(), String> {
    let trimmed = s.trim();
    if !RE_ARRAY_HEAD.is_match(trimmed) {
        let head: String = trimmed.chars().take(20).collect();
        return Err(format!("JSON必须以 [{{ 开头，实际: {}", head));
    }
    // AI常见错误：用 ~ 表示数值范围
    if trimmed.contains('~') {
        return Err("JSON中不可包含范围符号 ~，所有数字必须是精确的单一值".to_string());
    }
    Ok(())
}

/// 提取思维链：JSON数组之前的全部文本
pub fn extract_cot_trace(response: &str) -> String {
    match response.find('[') {
        Some(idx) if idx > 0 => response[..idx].trim().to_string(),
        _ => response.trim().to_string(),
    }
}

fn parse_decisions(json_content: &str, full_response: &str) -> Result<Vec<Decision>, String> {
    let mut content = compact_array_open(json_content);
    // 二次修复，防止regex提取后仍有残留
    content = fix_full_width(&content);
    content = fix_empty_string_fields(&content);
    content = fix_thousand_separators(&content);
    validate_json_format(&content)?;
    serde_json::from_str::<Vec<Decision>>(&content).map_err(|e| {
        format!(
            "JSON解析失败: {}\nJSON内容: {}\n完整响应:\n{}",
            e, content, full_response
        )
    })
}

/// 从AI响应中提取决策列表
///
/// 优先取```json代码块，其次全文搜索首个对象数组；仍找不到时返回单条
/// wait兜底决策，理由中引用原始文本的前240个字符。
pub fn extract_decisions(response: &str) -> Result<Vec<Decision>, String> {
    let s = repair(response);

    if let Some(captures) = RE_JSON_FENCE.captures(&s) {
        if let Some(m) = captures.get(1) {
            return parse_decisions(m.as_str().trim(), response);
        }
    }

    let found = RE_JSON_ARRAY.find(&s).map(|m| m.as_str().trim().to_string());
    match found {
        Some(json_content) if !json_content.is_empty() => {
            parse_decisions(&json_content, response)
        }
        _ => {
            // 安全兜底：AI只输出了思维链没有JSON时进入等待，避免周期崩溃
            warn!("AI未输出JSON决策，进入安全等待模式");
            let mut summary: String = s.chars().take(FALLBACK_SUMMARY_CHARS).collect();
            if s.chars().count() > FALLBACK_SUMMARY_CHARS {
                summary.push_str("...");
            }
            Ok(vec![Decision {
                symbol: "ALL".to_string(),
                action: "wait".to_string(),
                reasoning: format!("模型未输出结构化JSON决策，进入安全等待；摘要：{}", summary),
                ..Decision::default()
            }])
        }
    }
}
