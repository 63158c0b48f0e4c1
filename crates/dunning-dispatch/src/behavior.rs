//! Behavior synthesizer — pacing delays and composing simulation.
//!
//! Everything here is pure planning: it returns durations and event plans
//! and never sleeps or touches a transport. Given a seed, output is
//! deterministic.

use std::collections::VecDeque;
use std::time::Duration;

use dunning_core::config::BehaviorConfig;
use dunning_core::types::TypingEvent;
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};

/// Plans inter-message delays and typing sessions.
pub struct BehaviorSynthesizer {
    config: BehaviorConfig,
    rng: StdRng,
    /// Messages to send before the next long pause.
    batch_target: u32,
    sent_in_batch: u32,
}

impl BehaviorSynthesizer {
    /// Seeded from `config.seed` when set, from entropy otherwise.
    pub fn new(config: BehaviorConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self::with_rng(config, rng)
    }

    pub fn with_seed(config: BehaviorConfig, seed: u64) -> Self {
        Self::with_rng(config, StdRng::seed_from_u64(seed))
    }

    fn with_rng(config: BehaviorConfig, mut rng: StdRng) -> Self {
        let batch_target = draw_batch_size(&config, &mut rng);
        Self {
            config,
            rng,
            batch_target,
            sent_in_batch: 0,
        }
    }

    /// Wait before the next dispatch. Every `batch_target` messages the short
    /// gap is replaced by a long batch pause and a new batch size is drawn.
    pub fn plan_delay(&mut self) -> Duration {
        if !self.config.enabled {
            return Duration::ZERO;
        }
        self.sent_in_batch += 1;
        if self.sent_in_batch >= self.batch_target {
            self.sent_in_batch = 0;
            self.batch_target = draw_batch_size(&self.config, &mut self.rng);
            let secs = self
                .rng
                .gen_range(self.config.batch_pause_min_secs..=self.config.batch_pause_max_secs);
            tracing::debug!("☕ Batch pause: {}s (next batch: {})", secs, self.batch_target);
            Duration::from_secs(secs)
        } else {
            let secs = self
                .rng
                .gen_range(self.config.message_gap_min_secs..=self.config.message_gap_max_secs);
            Duration::from_secs(secs)
        }
    }

    /// Typing plan for `text`. The plan carries its own seed, so it can be
    /// iterated any number of times with identical results.
    pub fn plan_typing(&mut self, text: &str) -> TypingPlan {
        TypingPlan {
            text: text.to_string(),
            seed: self.rng.next_u64(),
            params: TypingParams::from(&self.config),
            enabled: self.config.enabled,
        }
    }
}

fn draw_batch_size(config: &BehaviorConfig, rng: &mut StdRng) -> u32 {
    rng.gen_range(config.batch_size_min..=config.batch_size_max).max(1)
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct TypingParams {
    keystroke_ms: (u64, u64),
    word_pause_ms: (u64, u64),
    punctuation_pause_ms: (u64, u64),
    typo_probability: f64,
}

impl From<&BehaviorConfig> for TypingParams {
    fn from(c: &BehaviorConfig) -> Self {
        Self {
            keystroke_ms: (c.keystroke_min_ms, c.keystroke_max_ms),
            word_pause_ms: (c.word_pause_min_ms, c.word_pause_max_ms),
            punctuation_pause_ms: (c.punctuation_pause_min_ms, c.punctuation_pause_max_ms),
            typo_probability: c.typo_probability,
        }
    }
}

/// A finite, restartable typing session for one message.
#[derive(Debug, Clone, PartialEq)]
pub struct TypingPlan {
    text: String,
    seed: u64,
    params: TypingParams,
    enabled: bool,
}

impl TypingPlan {
    /// The message this plan types.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Lazily generated events; each call starts from the beginning.
    pub fn events(&self) -> TypingEvents<'_> {
        TypingEvents {
            chars: if self.enabled { self.text.chars() } else { "".chars() },
            rng: StdRng::seed_from_u64(self.seed),
            params: self.params,
            buffer: VecDeque::new(),
        }
    }

    /// Sum of all waits in the plan.
    pub fn total_duration(&self) -> Duration {
        self.events().map(|e| e.wait()).sum()
    }
}

impl<'a> IntoIterator for &'a TypingPlan {
    type Item = TypingEvent;
    type IntoIter = TypingEvents<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.events()
    }
}

/// Iterator over a plan's events.
pub struct TypingEvents<'a> {
    chars: std::str::Chars<'a>,
    rng: StdRng,
    params: TypingParams,
    buffer: VecDeque<TypingEvent>,
}

impl TypingEvents<'_> {
    fn ms(&mut self, (min, max): (u64, u64)) -> Duration {
        Duration::from_millis(self.rng.gen_range(min..=max))
    }

    fn key(&mut self, ch: char) -> TypingEvent {
        let delay = self.ms(self.params.keystroke_ms);
        TypingEvent::Key { ch, delay }
    }

    fn expand(&mut self, ch: char) {
        let typo = ch.is_alphanumeric() && self.rng.gen_bool(self.params.typo_probability);
        if typo {
            let wrong = neighbor_key(ch);
            let k = self.key(wrong);
            self.buffer.push_back(k);
            // Notice the mistake, then fix it.
            let noticed = self.ms(self.params.word_pause_ms);
            self.buffer.push_back(TypingEvent::Pause { duration: noticed });
            let delay = self.ms(self.params.keystroke_ms);
            self.buffer.push_back(TypingEvent::Backspace { delay });
        }
        let k = self.key(ch);
        self.buffer.push_back(k);

        if ch.is_whitespace() {
            let duration = self.ms(self.params.word_pause_ms);
            self.buffer.push_back(TypingEvent::Pause { duration });
        } else if matches!(ch, '.' | ',' | '!' | '?' | ';' | ':') {
            let duration = self.ms(self.params.punctuation_pause_ms);
            self.buffer.push_back(TypingEvent::Pause { duration });
        }
    }
}

impl Iterator for TypingEvents<'_> {
    type Item = TypingEvent;

    fn next(&mut self) -> Option<TypingEvent> {
        if let Some(event) = self.buffer.pop_front() {
            return Some(event);
        }
        let ch = self.chars.next()?;
        self.expand(ch);
        self.buffer.pop_front()
    }
}

const KEY_ROWS: [&str; 4] = ["1234567890", "qwertyuiop", "asdfghjkl", "zxcvbnm"];

/// A key physically next to `ch` on a QWERTY layout, preserving case.
fn neighbor_key(ch: char) -> char {
    let lower = ch.to_ascii_lowercase();
    for row in KEY_ROWS {
        let keys: Vec<char> = row.chars().collect();
        if let Some(i) = keys.iter().position(|k| *k == lower) {
            let j = if i + 1 < keys.len() { i + 1 } else { i - 1 };
            let n = keys[j];
            return if ch.is_ascii_uppercase() { n.to_ascii_uppercase() } else { n };
        }
    }
    // Accented and other letters: fall back to a common slip.
    if ch.is_uppercase() { 'S' } else { 's' }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BehaviorConfig {
        BehaviorConfig::default()
    }

    #[test]
    fn test_message_gaps_and_batch_pause() {
        let mut cfg = config();
        cfg.batch_size_min = 3;
        cfg.batch_size_max = 3;
        let mut synth = BehaviorSynthesizer::with_seed(cfg, 11);

        let delays: Vec<Duration> = (0..6).map(|_| synth.plan_delay()).collect();
        for (i, d) in delays.iter().enumerate() {
            if (i + 1) % 3 == 0 {
                assert!(*d >= Duration::from_secs(120) && *d <= Duration::from_secs(300));
            } else {
                assert!(*d >= Duration::from_secs(15) && *d <= Duration::from_secs(45));
            }
        }
    }

    #[test]
    fn test_disabled_is_instant() {
        let mut cfg = config();
        cfg.enabled = false;
        let mut synth = BehaviorSynthesizer::with_seed(cfg, 1);
        assert_eq!(synth.plan_delay(), Duration::ZERO);
        let plan = synth.plan_typing("Olá Maria");
        assert_eq!(plan.events().count(), 0);
        assert_eq!(plan.text(), "Olá Maria");
    }

    #[test]
    fn test_seed_determinism() {
        let mut a = BehaviorSynthesizer::with_seed(config(), 42);
        let mut b = BehaviorSynthesizer::with_seed(config(), 42);
        let da: Vec<_> = (0..20).map(|_| a.plan_delay()).collect();
        let db: Vec<_> = (0..20).map(|_| b.plan_delay()).collect();
        assert_eq!(da, db);

        let pa: Vec<_> = a.plan_typing("Olá, tudo bem?").events().collect();
        let pb: Vec<_> = b.plan_typing("Olá, tudo bem?").events().collect();
        assert_eq!(pa, pb);
    }

    #[test]
    fn test_plan_is_restartable() {
        let mut synth = BehaviorSynthesizer::with_seed(config(), 5);
        let plan = synth.plan_typing("Segue a fatura, obrigado.");
        let first: Vec<_> = plan.events().collect();
        let second: Vec<_> = (&plan).into_iter().collect();
        assert_eq!(first, second);
        assert_eq!(plan.total_duration(), first.iter().map(|e| e.wait()).sum());
    }

    #[test]
    fn test_typed_text_matches_message() {
        let mut cfg = config();
        cfg.typo_probability = 0.5;
        let mut synth = BehaviorSynthesizer::with_seed(cfg, 99);
        let text = "Pagamento pendente de R$ 150,00.";
        let plan = synth.plan_typing(text);

        // Replaying keys and backspaces reproduces the message exactly.
        let mut typed = String::new();
        let mut typos = 0;
        for event in plan.events() {
            match event {
                TypingEvent::Key { ch, delay } => {
                    assert!(delay >= Duration::from_millis(50) && delay <= Duration::from_millis(150));
                    typed.push(ch);
                }
                TypingEvent::Backspace { .. } => {
                    typos += 1;
                    typed.pop();
                }
                TypingEvent::Pause { .. } => {}
            }
        }
        assert_eq!(typed, text);
        assert!(typos > 0);
    }

    #[test]
    fn test_pauses_at_word_and_punctuation() {
        let mut cfg = config();
        cfg.typo_probability = 0.0;
        let mut synth = BehaviorSynthesizer::with_seed(cfg, 3);
        let events: Vec<_> = synth.plan_typing("Oi, ok").events().collect();
        // O i , <pause> ␠ <pause> o k
        assert_eq!(events.len(), 8);
        match events[3] {
            TypingEvent::Pause { duration } => {
                assert!(duration >= Duration::from_millis(300) && duration <= Duration::from_millis(900))
            }
            other => panic!("expected punctuation pause, got {other:?}"),
        }
        match events[5] {
            TypingEvent::Pause { duration } => {
                assert!(duration >= Duration::from_millis(200) && duration <= Duration::from_millis(600))
            }
            other => panic!("expected word pause, got {other:?}"),
        }
    }

    #[test]
    fn test_neighbor_key() {
        assert_eq!(neighbor_key('a'), 's');
        assert_eq!(neighbor_key('P'), 'O');
        assert_eq!(neighbor_key('0'), '9');
        assert_ne!(neighbor_key('ç'), 'ç');
    }
}
