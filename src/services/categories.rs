//! Coarse category aggregation.
//!
//! Fine-grained classifier labels are folded into a handful of semantic
//! buckets by exact keyword membership. A label listed under several
//! categories contributes its probability to each of them.

use std::collections::HashSet;

use crate::models::prediction::{finite_or_zero, CategoryScore, DecodedPrediction};

pub const ANIMAL: &str = "Animal (category)";
pub const SPORTS: &str = "Sports (category)";
pub const MACHINE: &str = "Machine (category)";
pub const LANDSCAPE: &str = "Landscape (category)";
pub const HUMAN: &str = "Human (category)";

const ANIMAL_KEYWORDS: &[&str] = &[
    "tench", "goldfish", "great_white_shark", "tiger_shark", "hammerhead", "electric_ray",
    "stingray", "cock", "hen", "ostrich", "brambling", "goldfinch", "house_finch", "junco",
    "indigo_bunting", "robin", "bulbul", "jay", "magpie", "chickadee", "water_ouzel", "kite",
    "bald_eagle", "vulture", "great_grey_owl", "loggerhead", "leatherback_turtle", "box_turtle",
    "common_iguana", "african_chameleon", "komodo_dragon", "african_crocodile", "king_snake",
    "tarantula", "peacock", "flamingo", "pelican", "king_penguin", "albatross", "grey_whale",
    "killer_whale", "dugong", "sea_lion", "chihuahua", "maltese_dog", "beagle", "basset",
    "golden_retriever", "labrador_retriever", "german_shepherd", "siberian_husky", "pug",
    "samoyed", "pomeranian", "toy_poodle", "standard_poodle", "timber_wolf", "red_fox",
    "arctic_fox", "tabby", "tiger_cat", "persian_cat", "siamese_cat", "egyptian_cat", "cougar",
    "lynx", "leopard", "snow_leopard", "jaguar", "lion", "tiger", "cheetah", "brown_bear",
    "american_black_bear", "ice_bear", "sloth_bear", "meerkat", "ladybug", "bee", "ant",
    "grasshopper", "monarch", "hare", "hamster", "porcupine", "zebra", "hog", "ox",
    "water_buffalo", "bison", "ram", "bighorn", "llama", "otter", "skunk", "badger",
    "armadillo", "orangutan", "gorilla", "chimpanzee", "gibbon", "baboon", "giant_panda",
    "lesser_panda", "koala", "african_elephant", "indian_elephant", "sorrel", "goose",
    "drake", "hummingbird", "jellyfish", "sea_anemone", "starfish", "snail", "slug",
];

const SPORTS_KEYWORDS: &[&str] = &[
    "ballplayer", "baseball", "basketball", "soccer_ball", "football_helmet", "rugby_ball",
    "tennis_ball", "golf_ball", "golfcart", "ping-pong_ball", "volleyball", "croquet_ball",
    "puck", "racket", "parallel_bars", "balance_beam", "horizontal_bar", "dumbbell",
    "barbell", "punching_bag", "ski", "ski_mask", "snowmobile", "bobsled", "dogsled",
    "canoe", "paddle", "speedboat", "surfboard", "scuba_diver", "swimming_trunks",
    "bathing_cap", "maillot", "sweatshirt", "jersey", "running_shoe", "knee_pad",
    "mountain_bike", "bicycle-built-for-two", "unicycle", "tricycle", "go-kart",
    "racer", "sports_car", "stopwatch", "scoreboard", "rifle", "bow",
];

const MACHINE_KEYWORDS: &[&str] = &[
    "airliner", "warplane", "airship", "space_shuttle", "missile", "projectile",
    "ambulance", "beach_wagon", "cab", "convertible", "jeep", "limousine", "minivan",
    "model_t", "racer", "sports_car", "pickup", "police_van", "moving_van", "trailer_truck",
    "tow_truck", "garbage_truck", "fire_engine", "forklift", "tractor", "harvester",
    "thresher", "steam_locomotive", "electric_locomotive", "bullet_train", "passenger_car",
    "freight_car", "streetcar", "trolleybus", "school_bus", "minibus", "moped", "motor_scooter",
    "go-kart", "snowplow", "crane", "container_ship", "liner", "fireboat", "submarine",
    "aircraft_carrier", "desktop_computer", "laptop", "notebook", "monitor", "screen",
    "computer_keyboard", "mouse", "printer", "hard_disc", "cellular_telephone", "dial_telephone",
    "ipod", "joystick", "modem", "oscilloscope", "radio", "television", "projector",
    "tape_player", "cassette_player", "cd_player", "digital_clock", "digital_watch",
    "washer", "dishwasher", "microwave", "refrigerator", "vacuum", "sewing_machine",
    "espresso_maker", "toaster", "chain_saw", "lawn_mower", "power_drill", "slot",
    "vending_machine", "cash_machine", "gas_pump", "reflex_camera", "polaroid_camera",
    "robot",
];

const LANDSCAPE_KEYWORDS: &[&str] = &[
    "alp", "cliff", "coral_reef", "geyser", "lakeside", "promontory", "sandbar", "seashore",
    "valley", "volcano", "bubble", "boathouse", "breakwater", "dam", "dock", "pier",
    "suspension_bridge", "steel_arch_bridge", "viaduct", "lighthouse", "beacon", "castle",
    "palace", "monastery", "church", "mosque", "stupa", "obelisk", "megalith", "triumphal_arch",
    "cliff_dwelling", "yurt", "mobile_home", "boathouse", "barn", "greenhouse", "planetarium",
    "water_tower", "fountain", "maze", "park_bench", "patio", "picket_fence", "worm_fence",
    "stone_wall", "rapeseed", "daisy", "yellow_lady's_slipper", "corn", "hay", "mushroom",
    "hen-of-the-woods", "acorn", "buckeye", "cornet", "snowmobile", "dogsled", "parachute",
];

const HUMAN_KEYWORDS: &[&str] = &[
    "person", "human", "groom", "scuba_diver", "ballplayer", "vestment", "academic_gown",
    "bathing_cap", "cloak", "book_jacket", "neck_brace", "pickelhaube", "wig", "wool",
    "mortarboard", "flute", "mask", "microphone", "stole", "fur_coat", "shower_cap", "panpipe",
    "bonnet", "abaya", "bow_tie", "accordion", "trombone", "bath_towel", "bearskin", "velvet",
    "kimono", "poncho", "jean", "miniskirt", "overskirt", "hoopskirt", "sarong", "suit",
    "trench_coat", "lab_coat", "cardigan", "sweatshirt", "jersey", "brassiere", "bikini",
    "swimming_trunks", "military_uniform", "sombrero", "cowboy_hat", "lipstick", "sunglasses",
    "sunglass", "hair_spray", "face_powder", "windsor_tie", "apron", "gown", "cowboy_boot",
];

/// The built-in category table, in declaration order.
pub const BUILTIN_CATEGORIES: &[(&str, &[&str])] = &[
    (ANIMAL, ANIMAL_KEYWORDS),
    (SPORTS, SPORTS_KEYWORDS),
    (MACHINE, MACHINE_KEYWORDS),
    (LANDSCAPE, LANDSCAPE_KEYWORDS),
    (HUMAN, HUMAN_KEYWORDS),
];

/// Static category → keyword-set table.
#[derive(Debug, Clone)]
pub struct CategoryTable {
    categories: Vec<(&'static str, HashSet<String>)>,
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum CategoryTableError {
    #[error("Category table is empty")]
    Empty,

    #[error("Category {0} has no keywords")]
    NoKeywords(&'static str),

    #[error("Category {0} is declared twice")]
    Duplicate(&'static str),
}

impl CategoryTable {
    pub fn new(entries: &[(&'static str, &[&str])]) -> Result<Self, CategoryTableError> {
        if entries.is_empty() {
            return Err(CategoryTableError::Empty);
        }

        let mut categories: Vec<(&'static str, HashSet<String>)> = Vec::with_capacity(entries.len());
        for &(name, keywords) in entries {
            if keywords.is_empty() {
                return Err(CategoryTableError::NoKeywords(name));
            }
            if categories.iter().any(|(existing, _)| *existing == name) {
                return Err(CategoryTableError::Duplicate(name));
            }
            let set = keywords.iter().map(|k| k.to_lowercase()).collect();
            categories.push((name, set));
        }

        Ok(Self { categories })
    }

    pub fn builtin() -> Result<Self, CategoryTableError> {
        Self::new(BUILTIN_CATEGORIES)
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.categories.iter().map(|(name, _)| *name)
    }

    /// Categories whose keyword set contains the case-folded label.
    pub fn categories_for(&self, label: &str) -> Vec<&'static str> {
        let folded = label.to_lowercase();
        self.categories
            .iter()
            .filter(|(_, keywords)| keywords.contains(&folded))
            .map(|(name, _)| *name)
            .collect()
    }

    /// Score every category over the decoded labels.
    ///
    /// All categories start at 0.0 and each matching label adds its
    /// probability. The ranking is sorted by descending score; equal scores
    /// keep declaration order.
    pub fn aggregate(&self, decoded: &[DecodedPrediction]) -> Vec<CategoryScore> {
        let mut ranking: Vec<CategoryScore> = self
            .categories
            .iter()
            .map(|(name, keywords)| {
                let score = decoded
                    .iter()
                    .filter(|p| keywords.contains(&p.label.to_lowercase()))
                    .fold(0.0, |acc, p| acc + finite_or_zero(p.probability as f64));
                CategoryScore {
                    category: *name,
                    score,
                }
            })
            .collect();

        // sort_by is stable, so ties stay in declaration order
        ranking.sort_by(|a, b| b.score.total_cmp(&a.score));
        ranking
    }
}
