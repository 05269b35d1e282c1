//! Human-readable identifiers for loop runs and injected messages.
//!
//! Codenames only label a run for display; they are not secrets and collisions
//! are harmless. A fresh codename per run keeps the agent from latching onto a
//! literal it saw in an earlier loop.

use rand::distributions::Alphanumeric;
use rand::seq::SliceRandom;
use rand::Rng;

const ADJECTIVES: &[&str] = &[
    "AMBER", "BOLD", "BRISK", "CALM", "CRIMSON", "DARING", "EAGER", "FROSTED", "GENTLE", "GILDED",
    "HIDDEN", "IRON", "JADE", "LUCID", "MIGHTY", "NIMBLE", "OBSIDIAN", "PATIENT", "QUIET", "RAPID",
    "SILENT", "SOLAR", "STEADY", "TIDAL", "VELVET", "VIVID", "WANDERING", "WILD",
];

const NOUNS: &[&str] = &[
    "ANCHOR", "BEACON", "CANYON", "COMET", "CROW", "DELTA", "EMBER", "FALCON", "FORGE", "GLACIER",
    "HARBOR", "HERON", "LANTERN", "MERIDIAN", "NEBULA", "ORCHARD", "OTTER", "PRISM", "QUARRY",
    "RIVER", "SUMMIT", "THICKET", "TUNDRA", "VALLEY", "WILLOW", "ZEPHYR",
];

/// Generate a two-word codename such as `SILENT_HARBOR`.
pub fn generate_codename() -> String {
    generate_codename_with(&mut rand::thread_rng())
}

pub fn generate_codename_with<R: Rng + ?Sized>(rng: &mut R) -> String {
    let adjective = ADJECTIVES.choose(rng).copied().unwrap_or("STEADY");
    let noun = NOUNS.choose(rng).copied().unwrap_or("BEACON");
    format!("{adjective}_{noun}")
}

/// Generate an opaque marker for a self-injected message.
pub fn generate_marker(prefix: &str) -> String {
    let mut rng = rand::thread_rng();
    let suffix = std::iter::repeat_with(|| rng.sample(Alphanumeric))
        .map(char::from)
        .take(10)
        .collect::<String>()
        .to_lowercase();
    format!("{prefix}-{suffix}")
}
