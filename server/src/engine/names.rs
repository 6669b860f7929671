use std::collections::HashSet;

use rand::Rng;
use rand::seq::SliceRandom;

use super::validation::MAX_USER_NAME_LENGTH;

/// Words appended to a taken display name to make it unique within a room.
pub const NAME_SUFFIXES: [&str; 40] = [
    "banana", "ninja", "potato", "wizard", "dragon", "penguin", "taco", "rocket", "unicorn",
    "pirate", "cookie", "phoenix", "legend", "chaos", "turbo", "waffle", "pickle", "noodle",
    "muffin", "pancake", "thunder", "shadow", "cosmic", "pixel", "cyber", "mega", "ultra",
    "super", "hyper", "epic", "doodle", "wobble", "sparkle", "zigzag", "zoom", "blaster",
    "champion", "warrior", "hunter", "raider",
];

/// Numeric fallback range once the word attempts are used up.
const NUMERIC_SUFFIX_MAX: u32 = 10_000;

/// Resolves display-name collisions within a single room.
#[derive(Debug, Clone, Copy, Default)]
pub struct NameGenerator;

impl NameGenerator {
    pub fn new() -> Self {
        Self
    }

    /// Return `base` if nobody in `taken` uses it, otherwise `base_<word>`,
    /// falling back to `base_<number>` after `2 × word count` misses.
    pub fn unique_name(&self, base: &str, taken: &HashSet<String>) -> String {
        if !taken.contains(base) {
            return base.to_string();
        }

        let mut rng = rand::thread_rng();
        let max_attempts = NAME_SUFFIXES.len() * 2;
        for _ in 0..max_attempts {
            let Some(suffix) = NAME_SUFFIXES.choose(&mut rng) else {
                break;
            };
            let candidate = with_suffix(base, suffix);
            if !taken.contains(&candidate) {
                return candidate;
            }
        }

        // Random numeric suffixes can still collide in a crowded room; retry a few.
        for _ in 0..max_attempts {
            let candidate = with_suffix(base, &rng.gen_range(0..NUMERIC_SUFFIX_MAX).to_string());
            if !taken.contains(&candidate) {
                return candidate;
            }
        }
        let tail = uuid::Uuid::new_v4().simple().to_string();
        with_suffix(base, &tail[..12])
    }
}

/// `base_suffix`, with `base` cut short so the result stays within the
/// display-name limit.
fn with_suffix(base: &str, suffix: &str) -> String {
    let room = MAX_USER_NAME_LENGTH.saturating_sub(suffix.chars().count() + 1);
    let base: String = base.chars().take(room).collect();
    format!("{base}_{suffix}")
}
