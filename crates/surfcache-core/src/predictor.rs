//! Write/flush predictor.
//!
//! For every (range, format, context) the predictor records how many GPU writes happened
//! between consecutive flushes. When the history shows a stable pattern and the entry has earned
//! enough confidence, [`Predictor::predict`] reports that the next flush is imminent so the cache
//! can read the data back before the guest faults on it.

use std::collections::VecDeque;

use hashbrown::HashMap;
use surfcache_mem::AddressRange;

use crate::config::PredictorConfig;
use crate::section::CachedSection;
use crate::types::UploadContext;

/// Stop searching for longer patterns once one repeats this many times.
const PATTERN_EARLY_EXIT: usize = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PredictorKey {
    pub range: AddressRange,
    pub format: u32,
    pub context: UploadContext,
}

impl PredictorKey {
    pub fn for_section<I: Copy>(section: &CachedSection<I>) -> Self {
        Self {
            range: section.section_range(),
            format: section.format().code,
            context: section.context(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PredictorEntry {
    history: VecDeque<u32>,
    writes_since_flush: u32,
    confidence: u8,
    guess: Option<u32>,
    last_frame: u64,
}

impl PredictorEntry {
    fn new(config: &PredictorConfig, frame: u64) -> Self {
        Self {
            history: VecDeque::with_capacity(config.history_len),
            writes_since_flush: 0,
            confidence: config.starting_confidence,
            guess: None,
            last_frame: frame,
        }
    }

    pub fn confidence(&self) -> u8 {
        self.confidence
    }

    pub fn guess(&self) -> Option<u32> {
        self.guess
    }

    pub fn writes_since_flush(&self) -> u32 {
        self.writes_since_flush
    }

    pub fn history(&self) -> impl Iterator<Item = u32> + '_ {
        self.history.iter().copied()
    }

    fn raise(&mut self, by: u8, config: &PredictorConfig) {
        self.confidence = self.confidence.saturating_add(by).min(config.max_confidence);
    }

    fn lower(&mut self, by: u8) {
        self.confidence = self.confidence.saturating_sub(by);
    }

    fn on_write(&mut self, mispredict: bool, config: &PredictorConfig) {
        if mispredict {
            self.lower(config.misprediction_penalty);
        } else if let Some(guess) = self.guess {
            if self.writes_since_flush == guess {
                // A flush was expected here.
                self.lower(config.wrong_guess_penalty);
            } else {
                self.raise(config.correct_write_bonus, config);
            }
        }
        self.writes_since_flush += 1;
    }

    fn on_flush(&mut self, config: &PredictorConfig) {
        if let Some(guess) = self.guess {
            if self.writes_since_flush >= guess {
                self.raise(config.correct_flush_bonus, config);
            } else {
                self.lower(config.wrong_guess_penalty);
            }
        }

        if self.history.len() == config.history_len {
            self.history.pop_front();
        }
        self.history.push_back(self.writes_since_flush);
        self.writes_since_flush = 0;
        self.guess = Self::compute_guess(&self.history);
    }

    /// Longest-confirmed repeating period wins; otherwise the last sample.
    fn compute_guess(history: &VecDeque<u32>) -> Option<u32> {
        let n = history.len();
        match n {
            0 => return None,
            1 => return history.back().copied(),
            _ => {}
        }

        let mut best: Option<(usize, u32)> = None;
        for period in 1..=n / 2 {
            let mut matches = 0;
            while matches + period < n && history[n - 1 - matches] == history[n - 1 - matches - period]
            {
                matches += 1;
            }
            if matches < period {
                continue;
            }
            // The next sample repeats the one a full period back from the next slot.
            let next = history[n - period];
            if best.map_or(true, |(m, _)| matches > m) {
                best = Some((matches, next));
            }
            if matches / period >= PATTERN_EARLY_EXIT {
                break;
            }
        }

        best.map(|(_, next)| next).or_else(|| history.back().copied())
    }

    fn predict(&self, config: &PredictorConfig) -> bool {
        self.confidence >= config.confident_threshold
            && self.guess.is_some_and(|guess| self.writes_since_flush >= guess)
    }
}

#[derive(Debug)]
pub struct Predictor {
    config: PredictorConfig,
    entries: HashMap<PredictorKey, PredictorEntry>,
    frame: u64,
}

impl Predictor {
    pub fn new(config: PredictorConfig) -> Self {
        Self {
            config,
            entries: HashMap::new(),
            frame: 0,
        }
    }

    pub fn config(&self) -> &PredictorConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &PredictorKey) -> Option<&PredictorEntry> {
        self.entries.get(key)
    }

    fn entry_mut(&mut self, key: PredictorKey) -> (&mut PredictorEntry, &PredictorConfig) {
        let frame = self.frame;
        let config = &self.config;
        let entry = self
            .entries
            .entry(key)
            .or_insert_with(|| PredictorEntry::new(config, frame));
        entry.last_frame = frame;
        (entry, config)
    }

    /// A GPU write landed on the keyed resource. `mispredict` marks a write to a section that
    /// had been flushed speculatively.
    pub fn on_write(&mut self, key: PredictorKey, mispredict: bool) {
        let (entry, config) = self.entry_mut(key);
        entry.on_write(mispredict, config);
    }

    pub fn on_flush(&mut self, key: PredictorKey) {
        let (entry, config) = self.entry_mut(key);
        entry.on_flush(config);
    }

    pub fn predict(&self, key: &PredictorKey) -> bool {
        self.entries
            .get(key)
            .is_some_and(|entry| entry.predict(&self.config))
    }

    /// Advances the frame counter and drops entries that went quiet.
    pub fn on_frame_end(&mut self) {
        self.frame += 1;
        let frame = self.frame;
        let stale_after = self.config.stale_after_frames;
        self.entries
            .retain(|_, entry| frame.saturating_sub(entry.last_frame) <= stale_after);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> PredictorKey {
        PredictorKey {
            range: AddressRange::start_length(0x10_0000, 0x1000),
            format: 0x85,
            context: UploadContext::Framebuffer,
        }
    }

    #[test]
    fn guess_prefers_repeating_patterns() {
        let history: VecDeque<u32> = [1, 3, 1, 3, 1, 3].into_iter().collect();
        assert_eq!(PredictorEntry::compute_guess(&history), Some(1));

        let history: VecDeque<u32> = [5, 2, 7].into_iter().collect();
        assert_eq!(PredictorEntry::compute_guess(&history), Some(7));

        let history: VecDeque<u32> = [4].into_iter().collect();
        assert_eq!(PredictorEntry::compute_guess(&history), Some(4));
        assert_eq!(PredictorEntry::compute_guess(&VecDeque::new()), None);
    }

    #[test]
    fn confidence_rises_on_stable_pattern() {
        let mut p = Predictor::new(PredictorConfig::default());
        let k = key();
        assert!(!p.predict(&k));

        for _ in 0..2 {
            p.on_write(k, false);
            p.on_write(k, false);
            p.on_flush(k);
        }
        // First repetition seeds the guess, second earns +1, +1, +2.
        assert_eq!(p.get(&k).unwrap().confidence(), 7);
        assert_eq!(p.get(&k).unwrap().guess(), Some(2));
    }

    #[test]
    fn write_write_flush_pattern_predicts_flush_after_two_writes() {
        let mut p = Predictor::new(PredictorConfig::default());
        let threshold = p.config().confident_threshold;
        let k = key();

        for rep in 0..10 {
            p.on_write(k, false);
            assert!(!p.predict(&k), "one write into repetition {rep}");
            p.on_write(k, false);
            if rep >= 5 {
                assert!(p.predict(&k), "two writes into repetition {rep}");
                assert!(p.get(&k).unwrap().confidence() > threshold);
            }
            p.on_flush(k);
        }
        assert_eq!(p.get(&k).unwrap().guess(), Some(2));
    }

    #[test]
    fn misprediction_costs_confidence() {
        let mut p = Predictor::new(PredictorConfig::default());
        let k = key();
        for _ in 0..4 {
            p.on_write(k, false);
            p.on_flush(k);
        }
        let before = p.get(&k).unwrap().confidence();
        p.on_write(k, true);
        assert_eq!(p.get(&k).unwrap().confidence(), before - 4);
    }

    #[test]
    fn stale_entries_are_dropped() {
        let mut p = Predictor::new(PredictorConfig {
            stale_after_frames: 2,
            ..Default::default()
        });
        p.on_write(key(), false);
        p.on_frame_end();
        p.on_frame_end();
        assert_eq!(p.len(), 1);
        p.on_frame_end();
        assert!(p.is_empty());
    }
}
