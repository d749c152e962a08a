use serde::{Deserialize, Serialize};

/// A field authored either as a single value or as a list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    Many(Vec<T>),
    One(T),
}

/// Expansion axis: every listed value becomes a candidate of the cross-product.
pub type Candidates<T> = OneOrMany<T>;

impl<T: Clone> OneOrMany<T> {
    pub fn one(value: T) -> Self {
        OneOrMany::One(value)
    }

    pub fn many(values: Vec<T>) -> Self {
        OneOrMany::Many(values)
    }

    pub fn to_vec(&self) -> Vec<T> {
        match self {
            OneOrMany::Many(values) => values.clone(),
            OneOrMany::One(value) => vec![value.clone()],
        }
    }
}

impl<T> Default for OneOrMany<T> {
    fn default() -> Self {
        OneOrMany::Many(Vec::new())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BothMarker {
    Both,
}

/// Tri-state boolean: `true`, `false` or `"both"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Toggle {
    Flag(bool),
    Both(BothMarker),
}

impl Toggle {
    pub fn both() -> Self {
        Toggle::Both(BothMarker::Both)
    }
}

/// Seed axis: a number, a list, or an inclusive `"first-last"` range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SeedSpec {
    Many(Vec<i64>),
    One(i64),
    Range(String),
}
