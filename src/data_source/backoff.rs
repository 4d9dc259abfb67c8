use std::time::{Duration, Instant};

use crate::config::BackoffSettings;

/// Delays between loads when a source keeps returning empty pages that it says aren't
/// the end of the results.
///
/// The delay grows by `exponent` each time up to `max`, and starts over once no empty
/// page has been seen for `cooldown`.
#[derive(Debug, Clone)]
pub struct EmptyPageBackoff {
    settings: BackoffSettings,
    current: Option<Duration>,
    last_backoff: Option<Instant>,
}

impl EmptyPageBackoff {
    pub fn new(settings: BackoffSettings) -> Self {
        EmptyPageBackoff {
            settings,
            current: None,
            last_backoff: None,
        }
    }

    pub fn next_delay(&mut self, now: Instant) -> Duration {
        let cooled_down = self
            .last_backoff
            .is_some_and(|last| now.saturating_duration_since(last) >= self.settings.cooldown());
        if cooled_down {
            self.current = None;
        }

        let delay = match self.current {
            None => self.settings.initial(),
            Some(previous) => previous.mul_f64(self.settings.exponent.max(1.0)),
        }
        .min(self.settings.max());

        self.current = Some(delay);
        self.last_backoff = Some(now);
        delay
    }
}
