//! Serialize u64 as JSON string (for JS safe integer range); deserialize from string or number.

use serde::{Deserialize, Deserializer, Serialize, Serializer};

#[derive(Deserialize)]
#[serde(untagged)]
enum StringOrNumber {
    Str(String),
    Num(u64),
}

impl StringOrNumber {
    fn into_u64<E: serde::de::Error>(self) -> Result<u64, E> {
        match self {
            StringOrNumber::Str(s) => s.trim().parse().map_err(E::custom),
            StringOrNumber::Num(n) => Ok(n),
        }
    }
}

pub fn serialize<S>(value: &u64, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    value.to_string().serialize(serializer)
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    StringOrNumber::deserialize(deserializer)?.into_u64()
}

/// `Vec<u64>` where each element may be a string or a number; `null` reads as empty.
pub mod seq {
    use super::StringOrNumber;
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u64>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let items = Option::<Vec<StringOrNumber>>::deserialize(deserializer)?;
        items
            .unwrap_or_default()
            .into_iter()
            .map(StringOrNumber::into_u64::<D::Error>)
            .collect()
    }
}
