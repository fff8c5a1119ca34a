use serde::{Deserialize, Serialize};

/// Granularity of the viseme set used by a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    /// Nine easy-to-record mouth shapes.
    #[default]
    Simple,
    /// The fourteen-shape legacy set (`V1`..`V14`).
    Detailed,
}

/// A single mouth-shape category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisemeDefinition {
    pub id: String,
    pub label: String,
    pub phonemes: Vec<String>,
    pub color: String,
}

/// Immutable mapping of viseme ids to their definitions, in declaration order.
#[derive(Debug, Clone)]
pub struct VisemeTaxonomy {
    complexity: Complexity,
    visemes: Vec<VisemeDefinition>,
}

type RawViseme = (&'static str, &'static str, &'static [&'static str], &'static str);

const SIMPLE: &[RawViseme] = &[
    ("Baa", "Baa (Closed)", &["m", "b", "p", "sil"], "hsl(260, 75%, 62%)"),
    ("Mee", "Mee (Smile)", &["iy", "ih", "ix", "ae", "i"], "hsl(142, 70%, 45%)"),
    ("Foe", "Foe (Teeth)", &["f", "v"], "hsl(35, 85%, 55%)"),
    ("Tie", "Tie (Tongue)", &["t", "d", "n", "s", "z", "th", "dh"], "hsl(200, 70%, 55%)"),
    ("Loo", "Loo (Round)", &["uw", "uh", "ux", "ow", "u", "oo"], "hsl(320, 65%, 58%)"),
    ("Wuh", "Wuh (Glide)", &["w", "r", "l", "y", "er", "hh"], "hsl(180, 60%, 50%)"),
    ("Shhh", "Shhh (Hiss)", &["sh", "zh", "ch", "jh"], "hsl(280, 65%, 60%)"),
    ("Ohh", "Ohh (Open)", &["aa", "ah", "ao", "ax", "aw", "a", "o"], "hsl(40, 75%, 55%)"),
    ("Ayy", "Ayy (Mid)", &["eh", "ey", "ay", "k", "g", "ng"], "hsl(15, 85%, 60%)"),
];

const DETAILED: &[RawViseme] = &[
    ("V1", "Closed", &["m", "b", "p"], "hsl(260, 75%, 62%)"),
    ("V2", "Rest/Neutral", &["sil"], "hsl(220, 10%, 50%)"),
    ("V3", "AA/AH", &["aa", "ah", "ao"], "hsl(142, 70%, 45%)"),
    ("V4", "AE", &["ae"], "hsl(35, 85%, 55%)"),
    ("V5", "EH/AY", &["eh", "ey"], "hsl(200, 70%, 55%)"),
    ("V6", "IY/IX", &["iy", "ih", "ix"], "hsl(320, 65%, 58%)"),
    ("V7", "OW", &["ow"], "hsl(180, 60%, 50%)"),
    ("V8", "UW", &["uw"], "hsl(280, 65%, 60%)"),
    ("V9", "AO/OO", &["uh", "ux"], "hsl(40, 75%, 55%)"),
    ("V10", "F/V", &["f", "v"], "hsl(15, 85%, 60%)"),
    ("V11", "TH/DH", &["th", "dh"], "hsl(100, 60%, 50%)"),
    ("V12", "S/Z/SH", &["s", "z", "sh", "zh", "jh", "ch"], "hsl(220, 75%, 60%)"),
    ("V13", "R/L", &["r", "l"], "hsl(300, 65%, 55%)"),
    ("V14", "T/D/K/G/N", &["t", "d", "k", "g", "n"], "hsl(0, 70%, 58%)"),
];

/// Phoneme marking silence; its viseme is the neutral mouth shape.
pub const SILENCE_PHONEME: &str = "sil";

impl VisemeTaxonomy {
    pub fn new(complexity: Complexity) -> Self {
        let raw = match complexity {
            Complexity::Simple => SIMPLE,
            Complexity::Detailed => DETAILED,
        };
        let visemes = raw
            .iter()
            .map(|(id, label, phonemes, color)| VisemeDefinition {
                id: (*id).to_string(),
                label: (*label).to_string(),
                phonemes: phonemes.iter().map(|p| (*p).to_string()).collect(),
                color: (*color).to_string(),
            })
            .collect();
        Self { complexity, visemes }
    }

    /// Builds a taxonomy from externally supplied definitions.
    pub fn custom(visemes: Vec<VisemeDefinition>) -> Self {
        Self {
            complexity: Complexity::Simple,
            visemes,
        }
    }

    pub fn complexity(&self) -> Complexity {
        self.complexity
    }

    pub fn get(&self, id: &str) -> Option<&VisemeDefinition> {
        self.visemes.iter().find(|v| v.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.visemes.iter().map(|v| v.id.as_str())
    }

    pub fn visemes(&self) -> &[VisemeDefinition] {
        &self.visemes
    }

    /// Returns the viseme whose phoneme set contains `phoneme` (case-insensitive).
    pub fn viseme_for_phoneme(&self, phoneme: &str) -> Option<&str> {
        let phoneme = phoneme.to_ascii_lowercase();
        self.visemes
            .iter()
            .find(|v| v.phonemes.iter().any(|p| *p == phoneme))
            .map(|v| v.id.as_str())
    }

    /// The default/neutral viseme used when resolving the rest position.
    pub fn neutral_id(&self) -> Option<&str> {
        self.viseme_for_phoneme(SILENCE_PHONEME)
            .or_else(|| self.visemes.first().map(|v| v.id.as_str()))
    }
}

impl Default for VisemeTaxonomy {
    fn default() -> Self {
        Self::new(Complexity::Simple)
    }
}
