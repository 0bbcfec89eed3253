//! `#[serde(with = "serde_addr")]` for addresses stored as `usize`. They are
//! written as `"0x..."` strings, which is how every other part of the tracer
//! prints them, and read back from the same form (a bare integer is accepted
//! too).

use std::fmt;

use serde::{de::Visitor, Deserializer, Serializer};

pub fn serialize<S>(value: &usize, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.collect_str(&format_args!("{:#x}", value))
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<usize, D::Error>
where
    D: Deserializer<'de>,
{
    struct V;

    impl<'de> Visitor<'de> for V {
        type Value = usize;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("an address such as \"0x7f00dead0000\"")
        }

        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            let digits = v
                .strip_prefix("0x")
                .or_else(|| v.strip_prefix("0X"))
                .ok_or_else(|| E::invalid_value(serde::de::Unexpected::Str(v), &self))?;
            usize::from_str_radix(digits, 16)
                .map_err(|_| E::invalid_value(serde::de::Unexpected::Str(v), &self))
        }

        fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            usize::try_from(v).map_err(|_| E::invalid_value(serde::de::Unexpected::Unsigned(v), &self))
        }
    }

    deserializer.deserialize_any(V)
}
