mod parser;

pub use parser::{split_fields, validate_format, FormatCheck, SkippedRow};

use log::{debug, info};
use rand::seq::{IteratorRandom, SliceRandom};
use rust_embed::RustEmbed;
use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use wordquiz_core::VocabularyEntry;

/// 默认词汇文件名
pub const DEFAULT_VOCABULARY_FILE: &str = "Vocabulary_List.csv";

/// 嵌入式默认词汇表
#[derive(RustEmbed)]
#[folder = "../../vocabulary"]
#[include = "*.csv"]
struct EmbeddedVocabulary;

#[derive(Error, Debug)]
pub enum VocabularyError {
    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid vocabulary format: {0}")]
    InvalidFormat(String),

    #[error("No vocabulary entries left to sample")]
    EmptyPool,

    #[error("Need {needed} distinct distractors but only {available} are available")]
    InsufficientPool { needed: usize, available: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// 一次加载的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadReport {
    pub loaded: usize,
    pub skipped: Vec<SkippedRow>,
}

/// 词汇统计
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VocabularyStats {
    pub total_words: usize,
    pub with_sentence: usize,
    pub with_notes: usize,
    pub is_loaded: bool,
}

/// 内存中的词汇库。只在成功解析后整体替换，不做持久化。
#[derive(Debug, Default)]
pub struct VocabularyStore {
    entries: Vec<VocabularyEntry>,
    loaded: bool,
}

impl VocabularyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 解析词汇文本。失败时保留之前已加载的内容。
    pub fn load(&mut self, text: &str) -> Result<LoadReport, VocabularyError> {
        let parsed = parser::parse_vocabulary(text)?;
        let report = LoadReport {
            loaded: parsed.entries.len(),
            skipped: parsed.skipped,
        };

        self.entries = parsed.entries;
        self.loaded = true;
        info!(
            "词汇库已加载: {} 个单词, 跳过 {} 行",
            report.loaded,
            report.skipped.len()
        );
        Ok(report)
    }

    /// 从文件加载
    pub fn load_file<P: AsRef<Path>>(&mut self, path: P) -> Result<LoadReport, VocabularyError> {
        let path = path.as_ref();
        debug!("📂 读取词汇文件: {:?}", path);
        let text = fs::read_to_string(path)?;
        self.load(&text)
    }

    /// 加载默认词汇表（用户目录中的文件覆盖内置资源）
    pub fn load_default(&mut self) -> Result<LoadReport, VocabularyError> {
        if let Some(path) = Self::user_vocabulary_path().filter(|p| p.exists()) {
            debug!("使用用户词汇文件: {:?}", path);
            return self.load_file(path);
        }

        let file = EmbeddedVocabulary::get(DEFAULT_VOCABULARY_FILE).ok_or_else(|| {
            VocabularyError::InvalidFormat(format!("{} is not embedded", DEFAULT_VOCABULARY_FILE))
        })?;
        let text = std::str::from_utf8(&file.data)
            .map_err(|e| VocabularyError::Parse(format!("embedded list is not UTF-8: {}", e)))?;
        self.load(text)
    }

    /// 用户词汇文件路径
    pub fn user_vocabulary_path() -> Option<PathBuf> {
        dirs::data_local_dir().map(|base| base.join("WordQuiz").join(DEFAULT_VOCABULARY_FILE))
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[VocabularyEntry] {
        &self.entries
    }

    /// 随机抽取一个不在 `excluding` 中的单词
    pub fn sample(&self, excluding: &HashSet<String>) -> Result<&VocabularyEntry, VocabularyError> {
        self.entries
            .iter()
            .filter(|e| !excluding.contains(&e.word))
            .choose(&mut rand::thread_rng())
            .ok_or(VocabularyError::EmptyPool)
    }

    /// 随机取 `n` 个不同于正确答案且互不重复的翻译
    pub fn distractors(&self, correct: &str, n: usize) -> Result<Vec<String>, VocabularyError> {
        pick_distractors(self.entries.iter().map(|e| e.translation.as_str()), correct, n)
    }

    pub fn stats(&self) -> VocabularyStats {
        VocabularyStats {
            total_words: self.entries.len(),
            with_sentence: self.entries.iter().filter(|e| e.sentence.is_some()).count(),
            with_notes: self.entries.iter().filter(|e| e.notes.is_some()).count(),
            is_loaded: self.loaded,
        }
    }

    /// 按单词或翻译模糊搜索（不区分大小写）
    pub fn search(&self, query: &str) -> Vec<&VocabularyEntry> {
        let query = query.to_lowercase();
        self.entries
            .iter()
            .filter(|e| {
                e.word.to_lowercase().contains(&query)
                    || e.translation.to_lowercase().contains(&query)
            })
            .collect()
    }

    /// 按单词精确查找（不区分大小写）
    pub fn find(&self, word: &str) -> Option<&VocabularyEntry> {
        let word = word.to_lowercase();
        self.entries.iter().find(|e| e.word.to_lowercase() == word)
    }
}

/// 从候选翻译中无放回地取 `n` 个干扰项，排除正确答案并去重
pub fn pick_distractors<'a>(
    candidates: impl IntoIterator<Item = &'a str>,
    correct: &str,
    n: usize,
) -> Result<Vec<String>, VocabularyError> {
    let pool: Vec<&str> = candidates
        .into_iter()
        .filter(|t| *t != correct)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();

    if pool.len() < n {
        return Err(VocabularyError::InsufficientPool {
            needed: n,
            available: pool.len(),
        });
    }

    Ok(pool
        .choose_multiple(&mut rand::thread_rng(), n)
        .map(|s| s.to_string())
        .collect())
}
