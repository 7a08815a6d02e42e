use crate::VocabularyError;
use log::warn;
use std::collections::HashSet;
use wordquiz_core::VocabularyEntry;

/// 标题行中可识别的"单词"列标记
const WORD_MARKERS: [&str; 2] = ["word", "生词"];
/// 标题行中可识别的"翻译"列标记
const TRANSLATION_MARKERS: [&str; 2] = ["translation", "翻译"];

/// 被丢弃的数据行
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedRow {
    /// 原文件中的行号（从 1 开始，标题行为第 1 行）
    pub line: usize,
    pub reason: String,
}

/// 解析结果，尚未替换到 store 中
#[derive(Debug, Clone, Default)]
pub struct ParsedVocabulary {
    pub entries: Vec<VocabularyEntry>,
    pub skipped: Vec<SkippedRow>,
}

/// 格式预检结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatCheck {
    pub data_lines: usize,
}

/// 把单行拆成字段。字段可被双引号包裹，引号内 `""` 表示一个字面引号，
/// 引号内的逗号不作为分隔符。
pub fn split_fields(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '"' if in_quotes && chars.peek() == Some(&'"') => {
                current.push('"');
                chars.next();
            }
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => fields.push(std::mem::take(&mut current)),
            _ => current.push(ch),
        }
    }
    fields.push(current);
    fields
}

fn optional(field: Option<&String>) -> Option<String> {
    field
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// 解析整个词汇文本到新缓冲区
pub fn parse_vocabulary(text: &str) -> Result<ParsedVocabulary, VocabularyError> {
    let lines: Vec<&str> = text.trim().lines().collect();
    if lines.len() < 2 {
        return Err(VocabularyError::Parse(
            "expected a header row and at least one data row".to_string(),
        ));
    }

    let mut parsed = ParsedVocabulary::default();
    let mut seen = HashSet::new();

    // 跳过标题行
    for (idx, raw) in lines.iter().enumerate().skip(1) {
        let line_no = idx + 1;
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }

        let fields = split_fields(line);
        let word = fields.first().map(|s| s.trim()).unwrap_or_default();
        let translation = fields.get(1).map(|s| s.trim()).unwrap_or_default();

        let reason = if word.is_empty() || translation.is_empty() {
            Some("missing word or translation".to_string())
        } else if !seen.insert(word.to_string()) {
            Some(format!("duplicate word '{}'", word))
        } else {
            None
        };

        if let Some(reason) = reason {
            warn!("第 {} 行已跳过: {}", line_no, reason);
            parsed.skipped.push(SkippedRow {
                line: line_no,
                reason,
            });
            continue;
        }

        parsed.entries.push(VocabularyEntry {
            word: word.to_string(),
            translation: translation.to_string(),
            sentence: optional(fields.get(2)),
            notes: optional(fields.get(3)),
        });
    }

    if parsed.entries.is_empty() {
        return Err(VocabularyError::Parse("no valid vocabulary rows".to_string()));
    }

    Ok(parsed)
}

/// 导入前的格式预检：标题行需要同时包含单词列和翻译列标记，
/// 且至少有一行前两个字段都非空的数据。
pub fn validate_format(text: &str) -> Result<FormatCheck, VocabularyError> {
    let lines: Vec<&str> = text.trim().lines().collect();
    if lines.len() < 2 {
        return Err(VocabularyError::InvalidFormat(
            "a header row and at least one data row are required".to_string(),
        ));
    }

    let header = lines[0].to_lowercase();
    let has_word = WORD_MARKERS.iter().any(|m| header.contains(m));
    let has_translation = TRANSLATION_MARKERS.iter().any(|m| header.contains(m));
    if !has_word || !has_translation {
        return Err(VocabularyError::InvalidFormat(
            "header must name a word column and a translation column".to_string(),
        ));
    }

    let data_lines = lines[1..]
        .iter()
        .map(|l| l.trim())
        .filter(|l| !l.is_empty())
        .filter(|l| {
            let fields = split_fields(l);
            fields.len() >= 2 && !fields[0].trim().is_empty() && !fields[1].trim().is_empty()
        })
        .count();

    if data_lines == 0 {
        return Err(VocabularyError::InvalidFormat(
            "no valid data rows found".to_string(),
        ));
    }

    Ok(FormatCheck { data_lines })
}
