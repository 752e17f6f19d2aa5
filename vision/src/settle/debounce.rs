/// Counts consecutive below-threshold scores.
///
/// A score above the threshold resets the count. A score of exactly zero
/// leaves it unchanged: every real sensor shows some noise, so a zero
/// usually means the device handed out the same frame twice.
#[derive(Debug, Clone)]
pub struct Debouncer {
    threshold: f64,
    debounce: u32,
    count: u32,
}

impl Debouncer {
    pub fn new(threshold: f64, debounce: u32) -> Self {
        Self {
            threshold,
            debounce,
            count: 0,
        }
    }

    /// Register a score, returns `true` once more than `debounce` still
    /// scores were seen in a row.
    pub fn observe(&mut self, score: f64) -> bool {
        if score > self.threshold {
            self.count = 0;
        } else if score > 0.0 {
            self.count += 1;
        }
        self.is_settled()
    }

    pub fn is_settled(&self) -> bool {
        self.count > self.debounce
    }

    pub fn count(&self) -> u32 {
        self.count
    }
}
