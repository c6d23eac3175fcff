//! Shorthand forms in YAML documents.

use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;

use serde::de::{self, value::MapAccessDeserializer, MapAccess, Visitor};
use serde::{Deserialize, Deserializer};
use void::{ResultVoidExt, Void};

/// A `T` written either in full as a mapping, or as a bare string that
/// `T::from_str` expands. `- make test` reads the same as `- run: make test`.
pub struct Shorthand<T>(pub T);

impl<'de, T> Deserialize<'de> for Shorthand<T>
where
    T: Deserialize<'de> + FromStr<Err = Void>,
{
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(ShorthandVisitor(PhantomData))
    }
}

struct ShorthandVisitor<T>(PhantomData<fn() -> T>);

impl<'de, T> Visitor<'de> for ShorthandVisitor<T>
where
    T: Deserialize<'de> + FromStr<Err = Void>,
{
    type Value = Shorthand<T>;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a command string or a step mapping")
    }

    fn visit_str<E: de::Error>(self, value: &str) -> Result<Self::Value, E> {
        Ok(Shorthand(value.parse().void_unwrap()))
    }

    fn visit_map<M: MapAccess<'de>>(self, map: M) -> Result<Self::Value, M::Error> {
        T::deserialize(MapAccessDeserializer::new(map)).map(Shorthand)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::Step;

    #[test]
    fn test_bare_string_and_mapping_agree() {
        let bare: Shorthand<Step> = serde_yaml::from_str("make test").unwrap();
        let full: Shorthand<Step> = serde_yaml::from_str("run: make test").unwrap();
        assert_eq!(bare.0, full.0);
        assert_eq!(bare.0.label(), "make test");
    }

    #[test]
    fn test_other_shapes_are_rejected() {
        let err = serde_yaml::from_str::<Shorthand<Step>>("- a\n- b").err().unwrap();
        assert!(err.to_string().contains("a command string or a step mapping"));
    }
}
