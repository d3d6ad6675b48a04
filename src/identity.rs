//! Display identity for a participant: a friendly name and a cursor color.

use crate::awareness::{COLOR, FieldValue, Fields, NAME};
use rand::Rng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

const ADJECTIVES: &[&str] = &[
    "calm", "brave", "smart", "rapid", "eager", "gentle", "bold", "mighty",
];
const ANIMALS: &[&str] = &[
    "tiger", "eagle", "panda", "otter", "orca", "lynx", "koala", "dolphin",
];
pub const PALETTE: &[&str] = &[
    "#10b981", "#14b8a6", "#0ea5e9", "#f59e0b", "#ef4444", "#8b5cf6", "#22c55e", "#a3e635",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub name: String,
    pub color: String,
}

impl Participant {
    pub fn new(name: impl Into<String>, color: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            color: color.into(),
        }
    }

    /// An `adjective-animal` name with a palette color.
    pub fn random() -> Self {
        Self::random_with(&mut rand::thread_rng())
    }

    pub fn random_with<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let adjective = ADJECTIVES.choose(rng).copied().unwrap_or("calm");
        let animal = ANIMALS.choose(rng).copied().unwrap_or("otter");
        let color = PALETTE.choose(rng).copied().unwrap_or(PALETTE[0]);
        Self {
            name: format!("{adjective}-{animal}"),
            color: color.to_string(),
        }
    }

    /// The awareness fields announcing this participant.
    pub fn fields(&self) -> Fields {
        Fields::from([
            (NAME.to_string(), FieldValue::from(self.name.as_str())),
            (COLOR.to_string(), FieldValue::from(self.color.as_str())),
        ])
    }
}
