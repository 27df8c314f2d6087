use rand::rngs::OsRng;
use rand::Rng;

/// Vocabulary for human-communicable session tokens.
///
/// 256 short, visually distinct lowercase words. Selection is uniform and
/// independent, so repeated words within one token are possible and fine.
pub const WORDS: [&str; 256] = [
    "ocean", "forest", "mountain", "river", "desert", "valley", "island", "canyon",
    "tiger", "eagle", "dolphin", "wolf", "bear", "fox", "owl", "shark",
    "piano", "guitar", "violin", "drums", "flute", "trumpet", "harp", "saxophone",
    "ruby", "emerald", "diamond", "sapphire", "pearl", "crystal", "amber", "jade",
    "storm", "thunder", "lightning", "rainbow", "sunset", "sunrise", "aurora", "comet",
    "castle", "bridge", "tower", "garden", "temple", "palace", "fortress", "lighthouse",
    "voyage", "quest", "journey", "adventure", "discovery", "expedition", "exploration", "mission",
    "wisdom", "courage", "honor", "justice", "freedom", "peace", "harmony", "unity",
    "crimson", "azure", "golden", "silver", "violet", "topaz", "scarlet", "indigo",
    "mystic", "ancient", "eternal", "infinite", "divine", "sacred", "blessed", "noble",
    "warrior", "guardian", "sentinel", "champion", "defender", "protector", "knight", "hero",
    "phoenix", "dragon", "griffin", "unicorn", "pegasus", "sphinx", "chimera", "hydra",
    "whisper", "echo", "melody", "rhythm", "cadence", "symphony", "chorus", "ballad",
    "summit", "peak", "cliff", "ridge", "slope", "plateau", "gorge", "ravine",
    "stream", "brook", "creek", "waterfall", "rapid", "cascade", "spring", "pond",
    "meadow", "prairie", "field", "grove", "thicket", "woodland", "clearing", "glade",
    "dawn", "dusk", "twilight", "midnight", "moonlight", "starlight", "daybreak", "nightfall",
    "breeze", "gale", "hurricane", "tornado", "cyclone", "tempest", "blizzard", "typhoon",
    "ember", "flame", "spark", "blaze", "inferno", "pyre", "beacon", "torch",
    "frost", "ice", "snow", "hail", "glacier", "icicle", "quartz", "winter",
    "bloom", "blossom", "petal", "nectar", "pollen", "fragrance", "bouquet", "garland",
    "orbit", "galaxy", "nebula", "constellation", "planet", "asteroid", "meteor", "cosmos",
    "treasure", "fortune", "riches", "bounty", "prize", "reward", "jewel", "crown",
    "legend", "myth", "tale", "saga", "epic", "chronicle", "story", "fable",
    "magic", "spell", "charm", "enchantment", "sorcery", "wizardry", "alchemy", "potion",
    "anchor", "compass", "rudder", "sail", "mast", "harbor", "marina", "wharf",
    "falcon", "raven", "heron", "sparrow", "condor", "osprey", "kestrel", "swift",
    "cedar", "willow", "maple", "aspen", "birch", "juniper", "sequoia", "cypress",
    "copper", "cobalt", "nickel", "platinum", "mercury", "titanium", "bronze", "iron",
    "lantern", "candle", "prism", "mirror", "marble", "granite", "basalt", "slate",
    "tundra", "savanna", "jungle", "lagoon", "fjord", "delta", "estuary", "reef",
    "zephyr", "monsoon", "drizzle", "squall", "mist", "haze", "vapor", "dew",
];

/// Generate a `word-word` session token using the platform CSPRNG.
pub fn generate_token() -> String {
    let first = WORDS[OsRng.gen_range(0..WORDS.len())];
    let second = WORDS[OsRng.gen_range(0..WORDS.len())];
    format!("{}-{}", first, second)
}

/// Check a candidate token against the `word-word` shape (`^[a-z]+-[a-z]+$`).
pub fn is_valid_token(token: &str) -> bool {
    let mut parts = token.split('-');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(a), Some(b), None) => {
            !a.is_empty()
                && !b.is_empty()
                && a.chars().all(|c| c.is_ascii_lowercase())
                && b.chars().all(|c| c.is_ascii_lowercase())
        }
        _ => false,
    }
}
