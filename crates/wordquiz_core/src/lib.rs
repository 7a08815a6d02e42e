use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;

/// 每题得分
pub const POINTS_PER_QUESTION: u32 = 5;

/// 默认每次测试题目数
pub const DEFAULT_QUESTIONS_PER_TEST: usize = 20;

/// 每题选项数（1 个正确答案 + 干扰项）
pub const OPTIONS_PER_QUESTION: usize = 3;

/// 设置表：键 -> 任意 JSON 值
pub type SettingsMap = BTreeMap<String, Value>;

/// 默认设置。未写入数据库的键始终回落到这里的值。
pub fn default_settings() -> SettingsMap {
    let mut map = SettingsMap::new();
    map.insert("questionsPerTest".into(), json!(DEFAULT_QUESTIONS_PER_TEST));
    map.insert("showHints".into(), json!(true));
    map.insert("autoNextQuestion".into(), json!(false));
    map.insert("soundEnabled".into(), json!(true));
    map.insert("theme".into(), json!("cute"));
    map.insert("difficulty".into(), json!("normal"));
    map.insert("playBGM".into(), json!(true));
    map.insert("playSoundEffects".into(), json!(true));
    map
}

/// 词汇条目
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VocabularyEntry {
    pub word: String,
    pub translation: String,
    pub sentence: Option<String>,
    pub notes: Option<String>,
}

impl VocabularyEntry {
    pub fn new(word: impl Into<String>, translation: impl Into<String>) -> Self {
        Self {
            word: word.into(),
            translation: translation.into(),
            sentence: None,
            notes: None,
        }
    }

    pub fn with_sentence(mut self, sentence: impl Into<String>) -> Self {
        self.sentence = Some(sentence.into());
        self
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }
}

/// 单次答错的快照，存入测试记录和错题池
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WrongAnswer {
    pub word: String,
    pub correct_answer: String,
    pub user_answer: String,
    pub sentence: String,
    pub notes: String,
}

/// 已保存的测试记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestRecord {
    pub id: String,
    /// 毫秒时间戳
    pub timestamp: i64,
    pub iso_date: String,
    pub score: u32,
    pub max_score: u32,
    pub correct_answers: u32,
    pub total_questions: u32,
    pub time_taken_seconds: i64,
    pub percentage: u32,
    pub wrong_answers: Vec<WrongAnswer>,
}

impl TestRecord {
    pub fn time_formatted(&self) -> String {
        format_time(self.time_taken_seconds)
    }
}

/// 待保存的测试记录，缺省的 id / 时间由存储层生成
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestRecordDraft {
    pub id: Option<String>,
    pub timestamp: Option<i64>,
    pub iso_date: Option<String>,
    pub score: u32,
    pub max_score: u32,
    pub correct_answers: u32,
    pub total_questions: u32,
    pub time_taken_seconds: i64,
    pub percentage: u32,
    pub wrong_answers: Vec<WrongAnswer>,
}

/// 错题池条目（每个单词最多一行）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MistakePoolEntry {
    pub word: String,
    pub correct_answer: String,
    pub user_answer: String,
    pub sentence: String,
    pub notes: String,
    /// 最近一次答错的毫秒时间戳
    pub timestamp: i64,
    pub error_count: u32,
}

/// 错题抽取策略
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MistakeStrategy {
    /// 错误次数多的优先，其次最近的
    #[default]
    Default,
    Random,
    /// 最久未错的优先
    OldestErrors,
    /// 错误次数少的优先
    LeastFrequentErrors,
}

impl MistakeStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            MistakeStrategy::Default => "default",
            MistakeStrategy::Random => "random",
            MistakeStrategy::OldestErrors => "oldestErrors",
            MistakeStrategy::LeastFrequentErrors => "leastFrequentErrors",
        }
    }

    /// 未知名称回落到 `Default`，同时接受旧版的 snake_case 写法
    pub fn from_str(s: &str) -> Self {
        match s {
            "random" => MistakeStrategy::Random,
            "oldestErrors" | "oldest_errors" => MistakeStrategy::OldestErrors,
            "leastFrequentErrors" | "least_frequent_errors" => {
                MistakeStrategy::LeastFrequentErrors
            }
            _ => MistakeStrategy::Default,
        }
    }
}

/// 成绩趋势
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    #[default]
    None,
    Improving,
    Declining,
    Stable,
}

/// 测试记录汇总统计
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestStats {
    pub total_tests: usize,
    pub average_score: u32,
    pub average_percentage: u32,
    pub best_score: u32,
    pub best_percentage: u32,
    /// "MM:SS"
    pub average_time: String,
    /// "MM:SS"，没有有效用时则为 "N/A"
    pub best_time: String,
    pub total_correct_answers: u32,
    pub total_questions: u32,
    pub overall_accuracy: u32,
    pub improvement_trend: Trend,
    pub recent_records: Vec<TestRecord>,
}

impl Default for TestStats {
    fn default() -> Self {
        Self {
            total_tests: 0,
            average_score: 0,
            average_percentage: 0,
            best_score: 0,
            best_percentage: 0,
            average_time: format_time(0),
            best_time: "N/A".to_string(),
            total_correct_answers: 0,
            total_questions: 0,
            overall_accuracy: 0,
            improvement_trend: Trend::None,
            recent_records: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WordCount {
    pub word: String,
    pub count: u32,
}

/// 错题池统计
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MistakeStats {
    pub total_wrong: usize,
    pub most_frequent: Option<WordCount>,
    pub least_frequent: Option<WordCount>,
    pub average_error_count: u32,
}

/// 所有测试记录中错题的汇总
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WrongAnswerSummary {
    pub total_wrong_answers: usize,
    pub unique_wrong_words: usize,
    pub most_wrong_words: Vec<WordCount>,
    /// 保留一位小数
    pub average_wrong_per_test: f64,
}

/// 测试模式
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuizMode {
    #[default]
    Normal,
    /// 错题回顾
    Review,
}

/// 一道选择题
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Question {
    pub word: String,
    pub correct_answer: String,
    pub options: Vec<String>,
    pub sentence: String,
    pub notes: String,
}

impl Question {
    pub fn correct_index(&self) -> Option<usize> {
        self.options.iter().position(|o| *o == self.correct_answer)
    }
}

/// 提交答案的结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerOutcome {
    pub is_correct: bool,
    pub correct_answer: String,
    pub user_answer: String,
    pub word: String,
    pub sentence: String,
    pub notes: String,
    pub running_score: u32,
    pub question_number: usize,
    pub total_questions: usize,
}

/// 测试结束后的结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuizResult {
    pub score: u32,
    pub max_score: u32,
    pub correct_answers: u32,
    pub total_questions: u32,
    pub wrong_answers: Vec<WrongAnswer>,
    pub time_taken: i64,
    pub percentage: u32,
    pub mode: QuizMode,
}

impl QuizResult {
    pub fn time_formatted(&self) -> String {
        format_time(self.time_taken)
    }
}

/// 当前进度
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuizProgress {
    pub current: usize,
    pub total: usize,
    pub percentage: u32,
    pub score: u32,
    pub correct_answers: u32,
}

/// 会话事件（用于 UI 反馈）
#[derive(Debug, Clone, PartialEq)]
pub enum QuizEvent {
    Started { mode: QuizMode, total_questions: usize },
    QuestionReady { number: usize, word: String },
    Answered { correct: bool, running_score: u32 },
    Tick { elapsed_secs: i64 },
    Paused,
    Resumed,
    Completed { result: QuizResult },
}

/// 整数百分比，分母为 0 时为 0
pub fn percentage(part: u32, whole: u32) -> u32 {
    if whole == 0 {
        0
    } else {
        (f64::from(part) / f64::from(whole) * 100.0).round() as u32
    }
}

/// 秒数格式化为 "MM:SS"
pub fn format_time(seconds: i64) -> String {
    if seconds <= 0 {
        return "00:00".to_string();
    }
    format!("{:02}:{:02}", seconds / 60, seconds % 60)
}

/// 解析 "MM:SS"，格式不对或溢出返回 0
pub fn parse_time_to_seconds(s: &str) -> i64 {
    let parts: Vec<&str> = s.trim().split(':').collect();
    if parts.len() != 2 {
        return 0;
    }
    let minutes = parts[0].trim().parse::<i64>().unwrap_or(0);
    let seconds = parts[1].trim().parse::<i64>().unwrap_or(0);
    minutes
        .checked_mul(60)
        .and_then(|m| m.checked_add(seconds))
        .unwrap_or(0)
}
