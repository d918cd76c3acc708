//! Degeneration watchdog for token streams.
//!
//! Small local models sometimes fall into loops, emitting the same token or
//! the same short phrase until the output cap. The guard watches the stream
//! as it arrives so the session can stop early instead of waiting for the
//! cap and then failing to parse the result.

use std::collections::VecDeque;
use std::fmt;

/// Thresholds for the watchdog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamGuardConfig {
    /// Same token N times in a row → abort.
    pub max_consecutive_identical: usize,
    /// Length of the token window compared for phrase loops.
    pub sequence_length: usize,
    /// Same window repeated M times back to back → abort.
    pub max_sequence_repeats: usize,
}

impl Default for StreamGuardConfig {
    fn default() -> Self {
        Self {
            max_consecutive_identical: 20,
            sequence_length: 10,
            max_sequence_repeats: 5,
        }
    }
}

/// Why the stream was judged degenerate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Degeneration {
    TokenRepeat { token: String, count: usize },
    SequenceRepeat { preview: String, repeats: usize },
}

impl fmt::Display for Degeneration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TokenRepeat { token, count } => {
                write!(f, "token {:?} repeated {} times", truncate(token, 40), count)
            }
            Self::SequenceRepeat { preview, repeats } => {
                write!(f, "phrase {:?} repeated {} times", truncate(preview, 80), repeats)
            }
        }
    }
}

/// Per-stream watchdog. Create one per generation.
#[derive(Debug)]
pub struct StreamGuard {
    config: StreamGuardConfig,
    /// The last `sequence_length` tokens.
    window: VecDeque<String>,
    last_token: Option<String>,
    consecutive: usize,
    /// How many recent tokens equal the token `sequence_length` earlier.
    periodic_run: usize,
}

impl StreamGuard {
    pub fn new(config: StreamGuardConfig) -> Self {
        let window = VecDeque::with_capacity(config.sequence_length);
        Self {
            config,
            window,
            last_token: None,
            consecutive: 0,
            periodic_run: 0,
        }
    }

    /// Check the next token. `Err` means the caller should stop the stream.
    pub fn feed(&mut self, token: &str) -> Result<(), Degeneration> {
        if self.last_token.as_deref() == Some(token) {
            self.consecutive += 1;
        } else {
            self.consecutive = 1;
            self.last_token = Some(token.to_string());
        }
        if self.consecutive >= self.config.max_consecutive_identical {
            return Err(Degeneration::TokenRepeat {
                token: token.to_string(),
                count: self.consecutive,
            });
        }

        let k = self.config.sequence_length;
        if k == 0 {
            return Ok(());
        }

        if self.window.len() == k {
            let matches_period = self.window.front().map(String::as_str) == Some(token);
            self.periodic_run = if matches_period { self.periodic_run + 1 } else { 0 };
            self.window.pop_front();
        }
        self.window.push_back(token.to_string());

        // A run of k*(m-1) periodic tokens means the window occurred m times.
        let needed = k * self.config.max_sequence_repeats.saturating_sub(1);
        if needed > 0 && self.periodic_run >= needed {
            return Err(Degeneration::SequenceRepeat {
                preview: self.window.iter().map(String::as_str).collect(),
                repeats: self.periodic_run / k + 1,
            });
        }

        Ok(())
    }
}

fn truncate(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((end, _)) => &s[..end],
        None => s,
    }
}
