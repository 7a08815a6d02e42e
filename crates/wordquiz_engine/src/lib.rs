mod timer;

pub use timer::{Stopwatch, Ticker};

use log::{debug, error, info, warn};
use parking_lot::RwLock;
use rand::seq::SliceRandom;
use std::collections::{BTreeMap, HashSet};
use std::sync::mpsc;
use std::sync::Arc;
use thiserror::Error;
use wordquiz_core::*;
use wordquiz_data::{pick_distractors, VocabularyError, VocabularyStore};
use wordquiz_persistence::{PersistenceError, QuizStore};

/// 共享的词汇库
pub type SharedVocabulary = Arc<RwLock<VocabularyStore>>;

/// 共享的数据存储
pub type SharedStore = Arc<tokio::sync::Mutex<QuizStore>>;

/// 跳过的题目记录的用户答案
pub const SKIPPED_ANSWER: &str = "(skipped)";

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Vocabulary is not loaded")]
    NotLoaded,

    #[error("Mistake pool is empty, nothing to review")]
    EmptyMistakePool,

    #[error("Quiz is not active or has no current question")]
    NotActive,

    #[error("Current question was already answered")]
    AlreadyAnswered,

    #[error(transparent)]
    Vocabulary(#[from] VocabularyError),

    #[error(transparent)]
    Store(#[from] PersistenceError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SessionState {
    #[default]
    Idle,
    Running,
    Paused,
    Ended,
}

/// 当前题目的提示
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hint {
    pub first_letter: Option<char>,
    pub length: usize,
    pub sentence: Option<String>,
    pub notes: Option<String>,
}

/// 本次测试错题的分布
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WrongAnswerBreakdown {
    pub total: usize,
    pub by_first_letter: BTreeMap<char, usize>,
    pub by_length: BTreeMap<usize, usize>,
    pub with_sentence: usize,
    pub with_notes: usize,
}

/// 一次测验会话。同一时间只有一组题目在进行。
pub struct QuizSession {
    vocabulary: SharedVocabulary,
    store: SharedStore,

    // 会话状态
    state: SessionState,
    mode: QuizMode,
    total_questions: usize,
    current_index: usize,
    current_question: Option<Question>,
    awaiting_answer: bool,
    used_words: HashSet<String>,
    review_pool: Vec<MistakePoolEntry>,

    // 计分
    score: u32,
    correct_answers: u32,
    wrong_answers: Vec<WrongAnswer>,
    result: Option<QuizResult>,

    // 计时
    stopwatch: Stopwatch,
    ticker: Ticker,

    // 事件发布
    event_tx: Option<mpsc::Sender<QuizEvent>>,
}

impl QuizSession {
    pub fn new(
        vocabulary: SharedVocabulary,
        store: SharedStore,
        event_tx: Option<mpsc::Sender<QuizEvent>>,
    ) -> Self {
        Self {
            vocabulary,
            store,
            state: SessionState::Idle,
            mode: QuizMode::Normal,
            total_questions: DEFAULT_QUESTIONS_PER_TEST,
            current_index: 0,
            current_question: None,
            awaiting_answer: false,
            used_words: HashSet::new(),
            review_pool: Vec::new(),
            score: 0,
            correct_answers: 0,
            wrong_answers: Vec::new(),
            result: None,
            stopwatch: Stopwatch::new(),
            ticker: Ticker::new(),
            event_tx,
        }
    }

    /// 开始新的测试，返回第一题。
    ///
    /// 回顾模式优先使用传入的错题，否则从错题池中按默认策略抽取；
    /// 题目数不超过可用的题量。
    pub async fn start(
        &mut self,
        total: Option<usize>,
        mode: QuizMode,
        review_pool: Option<Vec<MistakePoolEntry>>,
    ) -> Result<Question, SessionError> {
        self.reset();
        if let Some(total) = total.filter(|&t| t > 0) {
            self.total_questions = total;
        }

        match mode {
            QuizMode::Review => {
                let pool = match review_pool.filter(|p| !p.is_empty()) {
                    Some(pool) => pool,
                    None => self
                        .store
                        .lock()
                        .await
                        .get_mistakes_for_quiz(self.total_questions, MistakeStrategy::Default)?,
                };
                if pool.is_empty() {
                    return Err(SessionError::EmptyMistakePool);
                }
                self.total_questions = self.total_questions.min(pool.len());
                self.review_pool = pool;
            }
            QuizMode::Normal => {
                let available = self.vocabulary_size().ok_or(SessionError::NotLoaded)?;
                if self.total_questions > available {
                    warn!(
                        "题目数 {} 超过词汇量 {}，按词汇量出题",
                        self.total_questions, available
                    );
                    self.total_questions = available;
                }
            }
        }

        self.mode = mode;
        self.state = SessionState::Running;
        self.stopwatch.start();
        self.ticker
            .start(self.stopwatch.clone(), self.event_tx.clone());
        info!(
            "🚀 测试开始: {:?} 模式, 共 {} 题",
            mode, self.total_questions
        );
        self.send_event(QuizEvent::Started {
            mode,
            total_questions: self.total_questions,
        });

        match self.next_question().await {
            Ok(Some(question)) => Ok(question),
            Ok(None) => {
                self.reset();
                Err(VocabularyError::EmptyPool.into())
            }
            Err(e) => {
                self.reset();
                Err(e)
            }
        }
    }

    /// 出下一题。题目出完时结束测试并返回 `None`，结果通过 [`QuizSession::result`] 读取。
    ///
    /// 当前题目还没作答时返回同一道题。
    pub async fn next_question(&mut self) -> Result<Option<Question>, SessionError> {
        match self.state {
            SessionState::Running => {}
            SessionState::Ended => return Ok(None),
            _ => return Err(SessionError::NotActive),
        }
        if self.awaiting_answer {
            return Ok(self.current_question.clone());
        }

        let exhausted = self.current_index >= self.total_questions
            || (self.mode == QuizMode::Review && self.current_index >= self.review_pool.len());
        if exhausted {
            self.end().await?;
            return Ok(None);
        }

        let question = match self.mode {
            QuizMode::Review => self.review_question()?,
            QuizMode::Normal => self.normal_question()?,
        };

        self.current_index += 1;
        self.awaiting_answer = true;
        self.current_question = Some(question.clone());
        debug!("第 {} 题: {}", self.current_index, question.word);
        self.send_event(QuizEvent::QuestionReady {
            number: self.current_index,
            word: question.word.clone(),
        });
        Ok(Some(question))
    }

    fn normal_question(&mut self) -> Result<Question, SessionError> {
        let vocabulary = self.vocabulary.read();
        let entry = vocabulary.sample(&self.used_words)?;
        let distractors = vocabulary.distractors(&entry.translation, OPTIONS_PER_QUESTION - 1)?;
        let question = build_question(
            &entry.word,
            &entry.translation,
            distractors,
            entry.sentence.as_deref(),
            entry.notes.as_deref(),
        );
        drop(vocabulary);

        self.used_words.insert(question.word.clone());
        Ok(question)
    }

    fn review_question(&self) -> Result<Question, SessionError> {
        let mistake = self
            .review_pool
            .get(self.current_index)
            .ok_or(SessionError::EmptyMistakePool)?;
        let distractors = self.review_distractors(&mistake.correct_answer)?;
        Ok(build_question(
            &mistake.word,
            &mistake.correct_answer,
            distractors,
            Some(&mistake.sentence),
            Some(&mistake.notes),
        ))
    }

    /// 优先从词汇库取干扰项，不够时退回错题池里的其他答案
    fn review_distractors(&self, correct: &str) -> Result<Vec<String>, SessionError> {
        let wanted = OPTIONS_PER_QUESTION - 1;
        if let Ok(picked) = self.vocabulary.read().distractors(correct, wanted) {
            return Ok(picked);
        }

        let others = || self.review_pool.iter().map(|m| m.correct_answer.as_str());
        match pick_distractors(others(), correct, wanted) {
            Err(VocabularyError::InsufficientPool { available, .. }) => {
                debug!("干扰项不足，只生成 {} 个", available);
                Ok(pick_distractors(others(), correct, available)?)
            }
            other => Ok(other?),
        }
    }

    /// 提交答案。答错的题目同时写入错题池，写入失败只记日志。
    pub async fn submit_answer(&mut self, option: &str) -> Result<AnswerOutcome, SessionError> {
        if self.state != SessionState::Running {
            return Err(SessionError::NotActive);
        }
        let question = self
            .current_question
            .clone()
            .ok_or(SessionError::NotActive)?;
        if !self.awaiting_answer {
            return Err(SessionError::AlreadyAnswered);
        }
        self.awaiting_answer = false;

        let is_correct = option == question.correct_answer;
        if is_correct {
            self.correct_answers += 1;
            self.score += POINTS_PER_QUESTION;
        } else {
            let wrong = WrongAnswer {
                word: question.word.clone(),
                correct_answer: question.correct_answer.clone(),
                user_answer: option.to_string(),
                sentence: question.sentence.clone(),
                notes: question.notes.clone(),
            };
            if let Err(e) = self.store.lock().await.add_mistake(&wrong).await {
                error!("保存错题到错题池失败: {}", e);
            }
            self.wrong_answers.push(wrong);
        }

        debug!(
            "答题 {}: {} ({})",
            self.current_index,
            question.word,
            if is_correct { "✓" } else { "✗" }
        );
        self.send_event(QuizEvent::Answered {
            correct: is_correct,
            running_score: self.score,
        });

        Ok(AnswerOutcome {
            is_correct,
            correct_answer: question.correct_answer,
            user_answer: option.to_string(),
            word: question.word,
            sentence: question.sentence,
            notes: question.notes,
            running_score: self.score,
            question_number: self.current_index,
            total_questions: self.total_questions,
        })
    }

    /// 跳过当前题目：记为错题（不进错题池）并出下一题
    pub async fn skip_question(&mut self) -> Result<Option<Question>, SessionError> {
        if self.state != SessionState::Running {
            return Err(SessionError::NotActive);
        }
        let question = self
            .current_question
            .as_ref()
            .ok_or(SessionError::NotActive)?;

        if self.awaiting_answer {
            self.wrong_answers.push(WrongAnswer {
                word: question.word.clone(),
                correct_answer: question.correct_answer.clone(),
                user_answer: SKIPPED_ANSWER.to_string(),
                sentence: question.sentence.clone(),
                notes: question.notes.clone(),
            });
            self.awaiting_answer = false;
            debug!("跳过第 {} 题", self.current_index);
        }
        self.next_question().await
    }

    /// 结束测试。正常模式保存测试记录，回顾模式不保存。
    ///
    /// 重复调用返回同一结果，不会再次保存。
    pub async fn end(&mut self) -> Result<QuizResult, SessionError> {
        if let Some(result) = &self.result {
            return Ok(result.clone());
        }
        if self.state == SessionState::Idle {
            return Err(SessionError::NotActive);
        }

        self.ticker.stop();
        self.stopwatch.pause();
        self.state = SessionState::Ended;
        self.current_question = None;
        self.awaiting_answer = false;

        let total = u32::try_from(self.total_questions).unwrap_or(u32::MAX);
        let result = QuizResult {
            score: self.score,
            max_score: total * POINTS_PER_QUESTION,
            correct_answers: self.correct_answers,
            total_questions: total,
            wrong_answers: self.wrong_answers.clone(),
            time_taken: self.stopwatch.elapsed_secs(),
            percentage: percentage(self.correct_answers, total),
            mode: self.mode,
        };
        self.result = Some(result.clone());
        info!(
            "🏁 测试结束: {}/{} ({}%), 用时 {}",
            result.score,
            result.max_score,
            result.percentage,
            result.time_formatted()
        );
        self.send_event(QuizEvent::Completed {
            result: result.clone(),
        });

        if self.mode == QuizMode::Normal {
            let draft = TestRecordDraft {
                score: result.score,
                max_score: result.max_score,
                correct_answers: result.correct_answers,
                total_questions: result.total_questions,
                time_taken_seconds: result.time_taken,
                percentage: result.percentage,
                wrong_answers: result.wrong_answers.clone(),
                ..Default::default()
            };
            self.store.lock().await.save_test_record(draft).await?;
        }
        Ok(result)
    }

    pub fn pause(&mut self) -> bool {
        if self.state != SessionState::Running {
            return false;
        }
        self.stopwatch.pause();
        self.ticker.stop();
        self.state = SessionState::Paused;
        debug!("⏸ 测试暂停");
        self.send_event(QuizEvent::Paused);
        true
    }

    pub fn resume(&mut self) -> bool {
        if self.state != SessionState::Paused || self.current_question.is_none() {
            return false;
        }
        self.stopwatch.resume();
        self.ticker
            .start(self.stopwatch.clone(), self.event_tx.clone());
        self.state = SessionState::Running;
        debug!("▶ 测试继续");
        self.send_event(QuizEvent::Resumed);
        true
    }

    /// 回到空闲状态。题目数设置保留。
    pub fn reset(&mut self) {
        self.ticker.stop();
        self.stopwatch.reset();
        self.state = SessionState::Idle;
        self.mode = QuizMode::Normal;
        self.current_index = 0;
        self.current_question = None;
        self.awaiting_answer = false;
        self.used_words.clear();
        self.review_pool.clear();
        self.score = 0;
        self.correct_answers = 0;
        self.wrong_answers.clear();
        self.result = None;
    }

    /// 设置题目数。正常模式下不能超过词汇量。
    pub fn set_total_questions(&mut self, count: usize) -> bool {
        if count == 0 {
            return false;
        }
        let fits = self.mode == QuizMode::Review
            || self.vocabulary.read().len() >= count;
        if fits {
            self.total_questions = count;
        }
        fits
    }

    pub fn hint(&self) -> Option<Hint> {
        let question = self.current_question.as_ref()?;
        let non_empty = |s: &str| (!s.is_empty()).then(|| s.to_string());
        Some(Hint {
            first_letter: question.word.chars().next().map(|c| c.to_ascii_uppercase()),
            length: question.word.chars().count(),
            sentence: non_empty(&question.sentence),
            notes: non_empty(&question.notes),
        })
    }

    pub fn progress(&self) -> QuizProgress {
        let total = u32::try_from(self.total_questions).unwrap_or(u32::MAX);
        let current = u32::try_from(self.current_index).unwrap_or(u32::MAX);
        QuizProgress {
            current: self.current_index,
            total: self.total_questions,
            percentage: percentage(current, total),
            score: self.score,
            correct_answers: self.correct_answers,
        }
    }

    pub fn wrong_answer_breakdown(&self) -> WrongAnswerBreakdown {
        let mut breakdown = WrongAnswerBreakdown {
            total: self.wrong_answers.len(),
            ..Default::default()
        };
        for wrong in &self.wrong_answers {
            if let Some(first) = wrong.word.chars().next() {
                *breakdown
                    .by_first_letter
                    .entry(first.to_ascii_lowercase())
                    .or_default() += 1;
            }
            *breakdown
                .by_length
                .entry(wrong.word.chars().count())
                .or_default() += 1;
            if !wrong.sentence.is_empty() {
                breakdown.with_sentence += 1;
            }
            if !wrong.notes.is_empty() {
                breakdown.with_notes += 1;
            }
        }
        breakdown
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn mode(&self) -> QuizMode {
        self.mode
    }

    pub fn is_active(&self) -> bool {
        self.state == SessionState::Running
    }

    pub fn total_questions(&self) -> usize {
        self.total_questions
    }

    pub fn current_question(&self) -> Option<&Question> {
        self.current_question.as_ref()
    }

    pub fn wrong_answers(&self) -> &[WrongAnswer] {
        &self.wrong_answers
    }

    pub fn score(&self) -> u32 {
        self.score
    }

    pub fn correct_answers(&self) -> u32 {
        self.correct_answers
    }

    /// 已用秒数（暂停时间不计）
    pub fn elapsed_seconds(&self) -> i64 {
        self.stopwatch.elapsed_secs()
    }

    /// 最近一次结束的结果
    pub fn result(&self) -> Option<&QuizResult> {
        self.result.as_ref()
    }

    /// 已加载的词汇量，未加载时为 `None`
    fn vocabulary_size(&self) -> Option<usize> {
        let vocabulary = self.vocabulary.read();
        vocabulary.is_loaded().then(|| vocabulary.len())
    }

    fn send_event(&self, event: QuizEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event);
        }
    }
}

fn build_question(
    word: &str,
    correct: &str,
    distractors: Vec<String>,
    sentence: Option<&str>,
    notes: Option<&str>,
) -> Question {
    let mut options = Vec::with_capacity(distractors.len() + 1);
    options.push(correct.to_string());
    options.extend(distractors);
    options.shuffle(&mut rand::thread_rng());

    Question {
        word: word.to_string(),
        correct_answer: correct.to_string(),
        options,
        sentence: sentence.unwrap_or_default().to_string(),
        notes: notes.unwrap_or_default().to_string(),
    }
}
