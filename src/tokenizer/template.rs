//! Turn-level prompt assembly and budget enforcement shared by all families

use serde::{Deserialize, Serialize};
use tracing::debug;

/// How a rendered conversation is cut down when it exceeds its budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TruncationPolicy {
    /// Drop whole turns, oldest first, never the leading system turn or the
    /// final turn; then cut tokens from the front of what remains.
    #[default]
    DropOldestTurns,
    /// Keep the family prefix and cut tokens from the front of the
    /// conversation, ignoring turn boundaries.
    SlidingWindow,
}

/// Token ids of one rendered conversation turn.
#[derive(Debug, Clone, Default)]
pub(crate) struct RenderedTurn {
    pub ids: Vec<u32>,
    /// Positions occupied beyond `ids`, e.g. image embedding slots
    pub extra_positions: usize,
    pub pinned: bool,
}

impl RenderedTurn {
    pub fn new(ids: Vec<u32>) -> Self {
        Self {
            ids,
            ..Default::default()
        }
    }

    fn cost(&self) -> usize {
        self.ids.len() + self.extra_positions
    }
}

/// A conversation rendered into `prefix + turns + suffix`.
#[derive(Debug, Clone, Default)]
pub(crate) struct RenderedPrompt {
    pub prefix: Vec<u32>,
    pub turns: Vec<RenderedTurn>,
    pub suffix: Vec<u32>,
}

impl RenderedPrompt {
    pub fn cost(&self) -> usize {
        self.prefix.len() + self.suffix.len() + self.turns.iter().map(RenderedTurn::cost).sum::<usize>()
    }

    /// Marks the leading system turn (if any) and the final turn as pinned.
    pub fn pin_system_and_last(&mut self, first_is_system: bool) {
        if first_is_system {
            if let Some(first) = self.turns.first_mut() {
                first.pinned = true;
            }
        }
        if let Some(last) = self.turns.last_mut() {
            last.pinned = true;
        }
    }

    /// Flattens the prompt into at most `max_length` positions.
    pub fn fit(self, max_length: usize, policy: TruncationPolicy) -> Vec<u32> {
        let RenderedPrompt {
            prefix,
            mut turns,
            suffix,
        } = self;

        let fixed = prefix.len() + suffix.len();
        let mut cost = fixed + turns.iter().map(RenderedTurn::cost).sum::<usize>();

        if policy == TruncationPolicy::DropOldestTurns {
            while cost > max_length {
                let Some(index) = turns.iter().position(|turn| !turn.pinned) else {
                    break;
                };
                let dropped = turns.remove(index);
                cost -= dropped.cost();
                debug!(
                    dropped_ids = dropped.ids.len(),
                    remaining_turns = turns.len(),
                    "Dropped oldest turn to fit context budget"
                );
            }
        }

        let extra: usize = turns.iter().map(|turn| turn.extra_positions).sum();
        let mut body: Vec<u32> = turns.into_iter().flat_map(|turn| turn.ids).collect();

        if cost > max_length {
            let keep = max_length.saturating_sub(fixed + extra);
            let cut = body.len().saturating_sub(keep);
            debug!(cut, keep, "Truncating prompt from the front");
            body.drain(..cut);
        }

        let mut ids = prefix;
        ids.extend(body);
        ids.extend(suffix);
        if ids.len() > max_length {
            // budget smaller than the fixed markers
            let cut = ids.len() - max_length;
            ids.drain(..cut);
        }
        ids
    }
}

/// Truncates `ids` to `max_length`, keeping the first `prefix_len` ids and
/// the most recent remainder.
pub(crate) fn truncate_keep_prefix(mut ids: Vec<u32>, prefix_len: usize, max_length: usize) -> Vec<u32> {
    if ids.len() <= max_length {
        return ids;
    }
    if max_length < prefix_len || ids.len() < prefix_len {
        let cut = ids.len() - max_length;
        ids.drain(..cut);
        return ids;
    }
    let cut = ids.len() - max_length;
    ids.drain(prefix_len..prefix_len + cut);
    ids
}

/// Truncates `ids` to its last `max_length` entries.
pub(crate) fn truncate_keep_tail(mut ids: Vec<u32>, max_length: usize) -> Vec<u32> {
    if ids.len() > max_length {
        let cut = ids.len() - max_length;
        ids.drain(..cut);
    }
    ids
}
